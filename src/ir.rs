use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::source::Location;

/// Identity of a top-level declaration across the whole image.
///
/// Zero is the sentinel for "unassigned"; UID completion replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TypeReference {
    pub module_uid: u64,
    pub type_uid: u64,
}

/// Identity of a declaration nested one level under a type: a field, an
/// enumerant, or a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AttributeReference {
    pub module_uid: u64,
    pub type_uid: u64,
    pub attribute_uid: u64,
}

/// Identity of a single SDK method input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SdkInputReference {
    pub module_uid: u64,
    pub type_uid: u64,
    pub attribute_uid: u64,
    pub input_uid: u64,
}

impl AttributeReference {
    #[must_use]
    pub fn type_reference(&self) -> TypeReference {
        TypeReference {
            module_uid: self.module_uid,
            type_uid: self.type_uid,
        }
    }
}

/// Built-in types, fixed at `module_uid = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u64)]
pub enum BuiltinType {
    Bool = 1,
    Text = 2,
    Data = 3,
    Int8 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    UInt8 = 8,
    UInt16 = 9,
    UInt32 = 10,
    UInt64 = 11,
    Float32 = 12,
    Float64 = 13,
    Presence = 14,
    List = 15,
    Map = 16,
}

impl BuiltinType {
    pub const ALL: [BuiltinType; 16] = [
        BuiltinType::Bool,
        BuiltinType::Text,
        BuiltinType::Data,
        BuiltinType::Int8,
        BuiltinType::Int16,
        BuiltinType::Int32,
        BuiltinType::Int64,
        BuiltinType::UInt8,
        BuiltinType::UInt16,
        BuiltinType::UInt32,
        BuiltinType::UInt64,
        BuiltinType::Float32,
        BuiltinType::Float64,
        BuiltinType::Presence,
        BuiltinType::List,
        BuiltinType::Map,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        use BuiltinType::*;

        match self {
            Bool => "Bool",
            Text => "Text",
            Data => "Data",
            Int8 => "Int8",
            Int16 => "Int16",
            Int32 => "Int32",
            Int64 => "Int64",
            UInt8 => "UInt8",
            UInt16 => "UInt16",
            UInt32 => "UInt32",
            UInt64 => "UInt64",
            Float32 => "Float32",
            Float64 => "Float64",
            Presence => "Presence",
            List => "List",
            Map => "Map",
        }
    }

    #[must_use]
    pub fn reference(self) -> TypeReference {
        TypeReference {
            module_uid: 0,
            type_uid: self as u64,
        }
    }

    /// The built-in a fully linked reference points at, if any.
    #[must_use]
    pub fn from_reference(reference: TypeReference) -> Option<Self> {
        if reference.module_uid != 0 {
            return None;
        }
        Self::try_from(reference.type_uid).ok()
    }
}

bitflags! {
    /// Declaration sites an annotation may be applied to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AnnotationScope: u16 {
        const MODULE = 1 << 0;
        const UNION = 1 << 1;
        const STRUCT = 1 << 2;
        const FIELD = 1 << 3;
        const ENUMERANT = 1 << 4;
        const ENUM = 1 << 5;
        const API = 1 << 6;
        const API_METHOD = 1 << 7;
        const SDK = 1 << 8;
        const SDK_METHOD = 1 << 9;
        const CONST = 1 << 10;
        const IMPL = 1 << 11;
    }
}

/// A type name at its declaration site, with generic parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypeName {
    pub name: String,
    pub parameters: Vec<TypeSpecifier>,
}

impl TypeName {
    #[must_use]
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.parameters.is_empty() {
            f.write_str("<")?;
            for (i, p) in self.parameters.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{p}")?;
            }
            f.write_str(">")?;
        }
        Ok(())
    }
}

/// An unresolved use-site name, as written in one of the two dialects.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardReference {
    /// MDL: optional import qualifier plus a (possibly parameterized) name.
    Microglot {
        qualifier: String,
        name: TypeName,
        loc: Location,
    },
    /// PDL: a dotted name resolved by protobuf's multi-scope search.
    Protobuf { name: String, loc: Location },
}

impl fmt::Display for ForwardReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Microglot {
                qualifier, name, ..
            } if !qualifier.is_empty() => write!(f, "{qualifier}.{name}"),
            Self::Microglot { name, .. } => name.fmt(f),
            Self::Protobuf { name, .. } => f.write_str(name),
        }
    }
}

/// The use-site of a type: a forward name before linking, a resolved
/// reference after.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpecifier {
    Forward(ForwardReference),
    Resolved {
        reference: TypeReference,
        parameters: Vec<TypeSpecifier>,
    },
}

impl TypeSpecifier {
    #[must_use]
    pub fn builtin(builtin: BuiltinType) -> Self {
        Self::Resolved {
            reference: builtin.reference(),
            parameters: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    /// The resolved reference, if linking has replaced the forward name.
    #[must_use]
    pub fn reference(&self) -> Option<TypeReference> {
        match self {
            Self::Resolved { reference, .. } => Some(*reference),
            Self::Forward(_) => None,
        }
    }
}

impl fmt::Display for TypeSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward(fwd) => fwd.fmt(f),
            Self::Resolved { reference, .. } => {
                write!(f, "<{}:{}>", reference.module_uid, reference.type_uid)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `+` — identity.
    Pos,
    /// `-` — numeric negation.
    Neg,
    /// `!` — boolean negation.
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// Recognized but never folded.
    BitOr,
    /// Recognized but never folded.
    BitAnd,
    /// Recognized but never folded.
    BitXor,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use BinaryOp::*;

        f.write_str(match self {
            Or => "||",
            And => "&&",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            BitOr => "|",
            BitAnd => "&",
            BitXor => "^",
        })
    }
}

/// A dotted-name expression evaluated against the symbol table.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueIdentifier {
    pub names: Vec<String>,
    pub reference: Option<ValueRef>,
    pub loc: Location,
}

impl ValueIdentifier {
    #[must_use]
    pub fn dotted(&self) -> String {
        self.names.join(".")
    }
}

/// What a [`ValueIdentifier`] resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef {
    /// A constant declaration.
    Type(TypeReference),
    /// A sub-declaration, e.g. an enumerant.
    Attribute(AttributeReference),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryValue {
    pub op: UnaryOp,
    pub operand: Box<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryValue {
    pub op: BinaryOp,
    pub left: Box<Value>,
    pub right: Box<Value>,
}

/// One `name: value` entry of a struct literal.
#[derive(Debug, Clone, PartialEq)]
pub struct StructFieldValue {
    pub name: String,
    pub value: Value,
    pub loc: Location,
}

/// A constant expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unary(UnaryValue),
    Binary(BinaryValue),
    Identifier(ValueIdentifier),
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Data(Vec<u8>),
    List(Vec<Value>),
    Struct(Vec<StructFieldValue>),
}

impl Value {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        use Value::*;

        match self {
            Unary(_) => "unary expression",
            Binary(_) => "binary expression",
            Identifier(_) => "identifier",
            Bool(_) => "Bool",
            Int8(_) => "Int8",
            Int16(_) => "Int16",
            Int32(_) => "Int32",
            Int64(_) => "Int64",
            UInt8(_) => "UInt8",
            UInt16(_) => "UInt16",
            UInt32(_) => "UInt32",
            UInt64(_) => "UInt64",
            Float32(_) => "Float32",
            Float64(_) => "Float64",
            Text(_) => "Text",
            Data(_) => "Data",
            List(_) => "List",
            Struct(_) => "struct literal",
        }
    }

    /// Applies `f` to this node and every nested value, children first.
    pub fn visit(&self, f: &mut impl FnMut(&Value)) {
        match self {
            Value::Unary(u) => u.operand.visit(f),
            Value::Binary(b) => {
                b.left.visit(f);
                b.right.visit(f);
            }
            Value::List(items) => {
                for item in items {
                    item.visit(f);
                }
            }
            Value::Struct(fields) => {
                for field in fields {
                    field.value.visit(f);
                }
            }
            _ => {}
        }
        f(self);
    }

    /// Mutable flavor of [`Value::visit`], children first.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Value)) {
        match self {
            Value::Unary(u) => u.operand.visit_mut(f),
            Value::Binary(b) => {
                b.left.visit_mut(f);
                b.right.visit_mut(f);
            }
            Value::List(items) => {
                for item in items {
                    item.visit_mut(f);
                }
            }
            Value::Struct(fields) => {
                for field in fields {
                    field.value.visit_mut(f);
                }
            }
            _ => {}
        }
        f(self);
    }
}

/// An annotation applied to a declaration: `$(Qualifier.Name(value))`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationApplication {
    pub annotation: TypeSpecifier,
    pub value: Value,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub uri: String,
    /// Alias qualifier; `.` marks a dot-import.
    pub alias: String,
    pub loc: Location,
    pub comment: Option<String>,
}

impl Import {
    #[must_use]
    pub fn is_dot_import(&self) -> bool {
        self.alias == "."
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub reference: AttributeReference,
    pub name: String,
    pub ty: TypeSpecifier,
    pub default: Option<Value>,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Union {
    pub reference: AttributeReference,
    pub name: String,
    pub fields: Vec<Field>,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Struct {
    pub reference: TypeReference,
    pub name: TypeName,
    pub fields: Vec<Field>,
    pub unions: Vec<Union>,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enumerant {
    pub reference: AttributeReference,
    pub name: String,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enum {
    pub reference: TypeReference,
    pub name: String,
    pub enumerants: Vec<Enumerant>,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiMethod {
    pub reference: AttributeReference,
    pub name: String,
    pub input: TypeSpecifier,
    pub output: TypeSpecifier,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Api {
    pub reference: TypeReference,
    pub name: TypeName,
    pub extends: Vec<TypeSpecifier>,
    pub methods: Vec<ApiMethod>,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdkInput {
    pub reference: SdkInputReference,
    pub name: String,
    pub ty: TypeSpecifier,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdkMethod {
    pub reference: AttributeReference,
    pub name: String,
    pub inputs: Vec<SdkInput>,
    pub output: Option<TypeSpecifier>,
    pub nothrows: bool,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sdk {
    pub reference: TypeReference,
    pub name: TypeName,
    pub extends: Vec<TypeSpecifier>,
    pub methods: Vec<SdkMethod>,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationDecl {
    pub reference: TypeReference,
    pub name: String,
    pub scopes: AnnotationScope,
    pub ty: TypeSpecifier,
    pub comment: Option<String>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub reference: TypeReference,
    pub name: String,
    pub ty: TypeSpecifier,
    pub value: Value,
    pub annotations: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    pub loc: Location,
}

/// A fully parsed module descriptor; the unit the pipeline carries from
/// parsing through linking into the final image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub uri: String,
    pub uid: u64,
    pub protobuf_package: Option<String>,
    pub imports: Vec<Import>,
    pub structs: Vec<Struct>,
    pub enums: Vec<Enum>,
    pub apis: Vec<Api>,
    pub sdks: Vec<Sdk>,
    pub constants: Vec<Constant>,
    pub annotations: Vec<AnnotationDecl>,
    /// Module-level annotation applications from the `module = …` statement.
    pub annotation_applications: Vec<AnnotationApplication>,
    pub comment: Option<String>,
    /// Nested-type rewrites recorded during PDL promotion: promoted struct
    /// name → original short name of a nested type → its promoted name.
    pub pdl_rewrites: HashMap<String, HashMap<String, String>>,
    /// Promoted type name → its original dotted name (package excluded),
    /// recorded during PDL promotion.
    pub pdl_original_names: HashMap<String, String>,
}

impl Module {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Applies `f` to every type specifier in the module, including generic
    /// parameters nested inside forward names.
    pub fn visit_type_specifiers_mut(&mut self, f: &mut impl FnMut(&mut TypeSpecifier)) {
        fn walk(ts: &mut TypeSpecifier, f: &mut impl FnMut(&mut TypeSpecifier)) {
            match ts {
                TypeSpecifier::Forward(ForwardReference::Microglot { name, .. }) => {
                    for p in &mut name.parameters {
                        walk(p, f);
                    }
                }
                TypeSpecifier::Resolved { parameters, .. } => {
                    for p in parameters {
                        walk(p, f);
                    }
                }
                TypeSpecifier::Forward(ForwardReference::Protobuf { .. }) => {}
            }
            f(ts);
        }

        let mut apply = |ts: &mut TypeSpecifier| walk(ts, f);
        for st in &mut self.structs {
            for p in &mut st.name.parameters {
                apply(p);
            }
            for field in &mut st.fields {
                apply(&mut field.ty);
                for ann in &mut field.annotations {
                    apply(&mut ann.annotation);
                }
            }
            for union in &mut st.unions {
                for field in &mut union.fields {
                    apply(&mut field.ty);
                    for ann in &mut field.annotations {
                        apply(&mut ann.annotation);
                    }
                }
                for ann in &mut union.annotations {
                    apply(&mut ann.annotation);
                }
            }
            for ann in &mut st.annotations {
                apply(&mut ann.annotation);
            }
        }
        for en in &mut self.enums {
            for e in &mut en.enumerants {
                for ann in &mut e.annotations {
                    apply(&mut ann.annotation);
                }
            }
            for ann in &mut en.annotations {
                apply(&mut ann.annotation);
            }
        }
        for api in &mut self.apis {
            for ext in &mut api.extends {
                apply(ext);
            }
            for m in &mut api.methods {
                apply(&mut m.input);
                apply(&mut m.output);
                for ann in &mut m.annotations {
                    apply(&mut ann.annotation);
                }
            }
            for ann in &mut api.annotations {
                apply(&mut ann.annotation);
            }
        }
        for sdk in &mut self.sdks {
            for ext in &mut sdk.extends {
                apply(ext);
            }
            for m in &mut sdk.methods {
                for input in &mut m.inputs {
                    apply(&mut input.ty);
                }
                if let Some(output) = &mut m.output {
                    apply(output);
                }
                for ann in &mut m.annotations {
                    apply(&mut ann.annotation);
                }
            }
            for ann in &mut sdk.annotations {
                apply(&mut ann.annotation);
            }
        }
        for c in &mut self.constants {
            apply(&mut c.ty);
            for ann in &mut c.annotations {
                apply(&mut ann.annotation);
            }
        }
        for ann in &mut self.annotations {
            apply(&mut ann.ty);
        }
        for ann in &mut self.annotation_applications {
            apply(&mut ann.annotation);
        }
    }

    /// Applies `f` bottom-up to every value tree in the module: constant
    /// values, field defaults, and annotation arguments.
    pub fn visit_values_mut(&mut self, f: &mut impl FnMut(&mut Value)) {
        for c in &mut self.constants {
            c.value.visit_mut(f);
            for ann in &mut c.annotations {
                ann.value.visit_mut(f);
            }
        }
        for st in &mut self.structs {
            for field in &mut st.fields {
                if let Some(default) = &mut field.default {
                    default.visit_mut(f);
                }
                for ann in &mut field.annotations {
                    ann.value.visit_mut(f);
                }
            }
            for union in &mut st.unions {
                for field in &mut union.fields {
                    if let Some(default) = &mut field.default {
                        default.visit_mut(f);
                    }
                    for ann in &mut field.annotations {
                        ann.value.visit_mut(f);
                    }
                }
                for ann in &mut union.annotations {
                    ann.value.visit_mut(f);
                }
            }
            for ann in &mut st.annotations {
                ann.value.visit_mut(f);
            }
        }
        for en in &mut self.enums {
            for e in &mut en.enumerants {
                for ann in &mut e.annotations {
                    ann.value.visit_mut(f);
                }
            }
            for ann in &mut en.annotations {
                ann.value.visit_mut(f);
            }
        }
        for api in &mut self.apis {
            for m in &mut api.methods {
                for ann in &mut m.annotations {
                    ann.value.visit_mut(f);
                }
            }
            for ann in &mut api.annotations {
                ann.value.visit_mut(f);
            }
        }
        for sdk in &mut self.sdks {
            for m in &mut sdk.methods {
                for ann in &mut m.annotations {
                    ann.value.visit_mut(f);
                }
            }
            for ann in &mut sdk.annotations {
                ann.value.visit_mut(f);
            }
        }
        for ann in &mut self.annotation_applications {
            ann.value.visit_mut(f);
        }
    }
}

/// The end product of compilation: fully linked module descriptors, at most
/// one per URI, in driver insertion order.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub modules: Vec<Module>,
}

impl Image {
    #[must_use]
    pub fn module(&self, uri: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.uri == uri)
    }
}
