//! MDL abstract syntax tree, produced by [`crate::parse`] and lowered into
//! descriptors by [`crate::lower`].

use crate::ir::{BinaryOp, UnaryOp};
use crate::source::Location;

/// A parsed MDL file.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleAst {
    pub uri: String,
    /// The dialect name out of the `syntax` directive.
    pub syntax: String,
    pub comment: Option<String>,
    pub statements: Vec<Statement>,
}

/// `uid`, annotation application, and comment block trailing a declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    pub uid: Option<u64>,
    pub annotations: Vec<AnnotationApplicationAst>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    ModuleMeta(ModuleMetaStmt),
    Import(ImportStmt),
    AnnotationDecl(AnnotationDeclStmt),
    Const(ConstStmt),
    Enum(EnumStmt),
    Struct(StructStmt),
    Api(ApiStmt),
    Sdk(SdkStmt),
    Impl(ImplStmt),
}

/// `module = @uid` with optional annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleMetaStmt {
    pub uid: u64,
    pub annotations: Vec<AnnotationApplicationAst>,
    pub comment: Option<String>,
    pub loc: Location,
}

/// `import "<uri>" as <alias>`; a `.` alias is a dot-import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportStmt {
    pub uri: String,
    pub alias: String,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationDeclStmt {
    pub name: String,
    /// Scope names as written; `*` is spelled out as a star entry.
    pub scopes: Vec<String>,
    pub ty: TypeSpecifierAst,
    pub uid: Option<u64>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstStmt {
    pub name: String,
    pub ty: TypeSpecifierAst,
    pub value: ValueAst,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumStmt {
    pub name: String,
    pub enumerants: Vec<EnumerantAst>,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumerantAst {
    pub name: String,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructStmt {
    pub name: TypeNameAst,
    pub elements: Vec<StructElement>,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructElement {
    Field(FieldAst),
    Union(UnionAst),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldAst {
    pub name: String,
    pub ty: TypeSpecifierAst,
    pub default: Option<ValueAst>,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionAst {
    pub name: String,
    pub fields: Vec<FieldAst>,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiStmt {
    pub name: TypeNameAst,
    pub extends: Vec<TypeSpecifierAst>,
    pub methods: Vec<ApiMethodAst>,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiMethodAst {
    pub name: String,
    pub input: TypeSpecifierAst,
    pub output: TypeSpecifierAst,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdkStmt {
    pub name: TypeNameAst,
    pub extends: Vec<TypeSpecifierAst>,
    pub methods: Vec<SdkMethodAst>,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdkMethodAst {
    pub name: String,
    pub inputs: Vec<SdkInputAst>,
    pub output: Option<TypeSpecifierAst>,
    pub nothrows: bool,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdkInputAst {
    pub name: String,
    pub ty: TypeSpecifierAst,
    pub loc: Location,
}

/// `impl` blocks are grammar-checked but carry no descriptor counterpart;
/// method bodies are consumed as balanced token trees and not retained.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplStmt {
    pub name: TypeNameAst,
    pub as_types: Vec<TypeSpecifierAst>,
    pub requirements: Vec<SdkInputAst>,
    pub methods: Vec<ImplMethodAst>,
    pub metadata: Metadata,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImplMethodAst {
    pub name: String,
    pub inputs: Vec<SdkInputAst>,
    pub output: Option<TypeSpecifierAst>,
    pub nothrows: bool,
    pub loc: Location,
}

/// `[Qualifier.]Name<params>` at a type use-site.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpecifierAst {
    pub qualifier: Option<String>,
    pub name: TypeNameAst,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeNameAst {
    pub name: String,
    pub parameters: Vec<TypeSpecifierAst>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationApplicationAst {
    pub qualifier: Option<String>,
    pub name: String,
    pub value: ValueAst,
    pub loc: Location,
}

/// A constant expression as written. Numeric literals keep their raw text
/// (base prefix and `_` separators included); lowering parses them.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueAst {
    Unary {
        op: UnaryOp,
        operand: Box<ValueAst>,
        loc: Location,
    },
    Binary {
        op: BinaryOp,
        left: Box<ValueAst>,
        right: Box<ValueAst>,
        loc: Location,
    },
    Identifier {
        names: Vec<String>,
        loc: Location,
    },
    Bool {
        value: bool,
        loc: Location,
    },
    Int {
        text: String,
        loc: Location,
    },
    Float {
        text: String,
        loc: Location,
    },
    Text {
        value: String,
        loc: Location,
    },
    Prose {
        value: String,
        loc: Location,
    },
    Data {
        text: String,
        loc: Location,
    },
    List {
        items: Vec<ValueAst>,
        loc: Location,
    },
    Struct {
        fields: Vec<(String, ValueAst, Location)>,
        loc: Location,
    },
}

impl ValueAst {
    #[must_use]
    pub fn loc(&self) -> Location {
        match self {
            ValueAst::Unary { loc, .. }
            | ValueAst::Binary { loc, .. }
            | ValueAst::Identifier { loc, .. }
            | ValueAst::Bool { loc, .. }
            | ValueAst::Int { loc, .. }
            | ValueAst::Float { loc, .. }
            | ValueAst::Text { loc, .. }
            | ValueAst::Prose { loc, .. }
            | ValueAst::Data { loc, .. }
            | ValueAst::List { loc, .. }
            | ValueAst::Struct { loc, .. } => *loc,
        }
    }
}
