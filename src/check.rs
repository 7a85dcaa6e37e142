use std::collections::HashMap;

use num_bigint::BigInt;

use crate::fold;
use crate::ir::{
    AnnotationApplication, BuiltinType, Image, Module, TypeReference, TypeSpecifier, Value,
    ValueRef,
};
use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::source::Location;

/// What a resolved type reference declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclKind {
    Struct,
    Enum,
    Api,
    Sdk,
    Annotation,
    Constant,
    Builtin(BuiltinType),
}

impl DeclKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Struct => "a struct",
            Self::Enum => "an enum",
            Self::Api => "an api",
            Self::Sdk => "an sdk",
            Self::Annotation => "an annotation",
            Self::Constant => "a constant",
            Self::Builtin(_) => "a built-in type",
        }
    }
}

/// Declaration kinds and struct shapes across the whole image.
struct DeclIndex {
    kinds: HashMap<TypeReference, DeclKind>,
    struct_fields: HashMap<TypeReference, HashMap<String, TypeSpecifier>>,
}

impl DeclIndex {
    fn build(image: &Image) -> Self {
        let mut kinds = HashMap::new();
        let mut struct_fields: HashMap<TypeReference, HashMap<String, TypeSpecifier>> =
            HashMap::new();
        for builtin in BuiltinType::ALL {
            kinds.insert(builtin.reference(), DeclKind::Builtin(builtin));
        }
        for module in &image.modules {
            for st in &module.structs {
                kinds.insert(st.reference, DeclKind::Struct);
                let fields = struct_fields.entry(st.reference).or_default();
                for field in &st.fields {
                    fields.insert(field.name.clone(), field.ty.clone());
                }
                for union in &st.unions {
                    for field in &union.fields {
                        fields.insert(field.name.clone(), field.ty.clone());
                    }
                }
            }
            for en in &module.enums {
                kinds.insert(en.reference, DeclKind::Enum);
            }
            for api in &module.apis {
                kinds.insert(api.reference, DeclKind::Api);
            }
            for sdk in &module.sdks {
                kinds.insert(sdk.reference, DeclKind::Sdk);
            }
            for ann in &module.annotations {
                kinds.insert(ann.reference, DeclKind::Annotation);
            }
            for c in &module.constants {
                kinds.insert(c.reference, DeclKind::Constant);
            }
        }
        Self {
            kinds,
            struct_fields,
        }
    }

    fn kind_of(&self, reference: TypeReference) -> Option<DeclKind> {
        self.kinds.get(&reference).copied()
    }
}

/// Static semantic checks over the linked, folded image.
///
/// Every violation is reported; the checker never aborts early.
pub fn check(image: &Image, reporter: &Reporter) {
    let index = DeclIndex::build(image);
    for module in &image.modules {
        let checker = Checker {
            index: &index,
            uri: &module.uri,
            reporter,
        };
        checker.check_module(module);
    }
}

struct Checker<'a> {
    index: &'a DeclIndex,
    uri: &'a str,
    reporter: &'a Reporter,
}

impl Checker<'_> {
    fn report(&self, code: ErrorCode, message: String, at: Location) {
        // report-and-continue; the fatality policy is the caller's business
        let _ = self
            .reporter
            .report(Diagnostic::new(code, message).at(self.uri.to_string(), at));
    }

    fn check_module(&self, module: &Module) {
        for c in &module.constants {
            self.check_type_use(&c.ty, c.loc, &format!("const `{}`", c.name));
            self.check_constant_value(&c.value, c.loc, &format!("const `{}`", c.name));
            self.check_value(&c.ty, &c.value, c.loc, &format!("const `{}`", c.name));
            self.check_annotations(&c.annotations);
        }
        for st in &module.structs {
            for field in st.fields.iter().chain(st.unions.iter().flat_map(|u| &u.fields)) {
                let what = format!("field `{}.{}`", st.name.name, field.name);
                self.check_type_use(&field.ty, field.loc, &what);
                if let Some(default) = &field.default {
                    self.check_constant_value(default, field.loc, &what);
                    self.check_value(&field.ty, default, field.loc, &what);
                }
                self.check_annotations(&field.annotations);
            }
            for union in &st.unions {
                self.check_annotations(&union.annotations);
            }
            self.check_annotations(&st.annotations);
        }
        for en in &module.enums {
            for e in &en.enumerants {
                self.check_annotations(&e.annotations);
            }
            self.check_annotations(&en.annotations);
        }
        for api in &module.apis {
            for ext in &api.extends {
                self.check_extends(ext, DeclKind::Api, &api.name.name, api.loc);
            }
            for m in &api.methods {
                self.check_annotations(&m.annotations);
            }
            self.check_annotations(&api.annotations);
        }
        for sdk in &module.sdks {
            for ext in &sdk.extends {
                self.check_extends(ext, DeclKind::Sdk, &sdk.name.name, sdk.loc);
            }
            for m in &sdk.methods {
                self.check_annotations(&m.annotations);
            }
            self.check_annotations(&sdk.annotations);
        }
        for ann in &module.annotations {
            self.check_type_use(&ann.ty, ann.loc, &format!("annotation `{}`", ann.name));
        }
        self.check_annotations(&module.annotation_applications);
    }

    /// A type used as a field, const, or annotation type must name a struct,
    /// enum, or built-in; anything else is the wrong kind of declaration.
    fn check_type_use(&self, ty: &TypeSpecifier, loc: Location, what: &str) {
        let TypeSpecifier::Resolved { reference, parameters } = ty else {
            // unresolved uses were already reported by the linker
            return;
        };
        match self.index.kind_of(*reference) {
            Some(DeclKind::Struct | DeclKind::Enum | DeclKind::Builtin(_)) | None => {}
            Some(kind) => {
                self.report(
                    ErrorCode::WrongTypeKind,
                    format!("{what} uses {} as a type", kind.describe()),
                    loc,
                );
            }
        }
        for parameter in parameters {
            self.check_type_use(parameter, loc, what);
        }
    }

    fn check_extends(&self, ty: &TypeSpecifier, want: DeclKind, name: &str, loc: Location) {
        let TypeSpecifier::Resolved { reference, .. } = ty else {
            return;
        };
        match self.index.kind_of(*reference) {
            Some(kind) if kind == want => {}
            Some(kind) => {
                self.report(
                    ErrorCode::WrongTypeForApi,
                    format!("`{name}` extends {}, expected {}", kind.describe(), want.describe()),
                    loc,
                );
            }
            None => {}
        }
    }

    /// Annotation applications: the target must be an annotation declaration
    /// and the argument must be fully constant.
    fn check_annotations(&self, annotations: &[AnnotationApplication]) {
        for ann in annotations {
            if let TypeSpecifier::Resolved { reference, .. } = &ann.annotation {
                match self.index.kind_of(*reference) {
                    Some(DeclKind::Annotation) | None => {}
                    Some(kind) => {
                        self.report(
                            ErrorCode::WrongTypeKind,
                            format!("annotation application targets {}", kind.describe()),
                            ann.loc,
                        );
                    }
                }
            }
            self.check_constant_value(&ann.value, ann.loc, "annotation argument");
        }
    }

    /// Fully constant means: literals, folded expressions over literals, and
    /// identifiers that resolved somewhere. Unresolved identifiers make the
    /// value unusable at compile time.
    fn check_constant_value(&self, value: &Value, loc: Location, what: &str) {
        let mut unresolved: Option<String> = None;
        value.visit(&mut |v| {
            if let Value::Identifier(id) = v {
                if id.reference.is_none() && unresolved.is_none() {
                    unresolved = Some(id.dotted());
                }
            }
        });
        if let Some(name) = unresolved {
            self.report(
                ErrorCode::WrongTypeValue,
                format!("{what} is not constant: `{name}` is unresolved"),
                loc,
            );
        }
    }

    /// Declared type versus the folded value's computed type.
    fn check_value(&self, ty: &TypeSpecifier, value: &Value, loc: Location, what: &str) {
        let TypeSpecifier::Resolved { reference, parameters } = ty else {
            return;
        };
        // residual expression trees have no computed kind to compare
        if matches!(value, Value::Unary(_) | Value::Binary(_)) {
            return;
        }
        let Some(kind) = self.index.kind_of(*reference) else {
            return;
        };
        match kind {
            DeclKind::Builtin(builtin) => {
                self.check_builtin_value(builtin, parameters, value, loc, what);
            }
            DeclKind::Enum => {
                let matches = matches!(
                    value,
                    Value::Identifier(id)
                        if matches!(
                            id.reference,
                            Some(ValueRef::Attribute(attr))
                                if attr.type_reference() == *reference
                        )
                );
                if !matches {
                    self.report(
                        ErrorCode::WrongTypeValue,
                        format!("{what} wants an enumerant of its declared enum"),
                        loc,
                    );
                }
            }
            DeclKind::Struct => self.check_struct_literal(*reference, value, loc, what),
            DeclKind::Api | DeclKind::Sdk | DeclKind::Annotation | DeclKind::Constant => {
                // wrong kind of declared type; reported by check_type_use
            }
        }
    }

    fn check_builtin_value(
        &self,
        builtin: BuiltinType,
        parameters: &[TypeSpecifier],
        value: &Value,
        loc: Location,
        what: &str,
    ) {
        // identifiers that resolved to attributes (enumerants) have no
        // literal kind here; mismatches surface on the declared-enum path
        if matches!(value, Value::Identifier(_)) {
            return;
        }
        let ok = match builtin {
            BuiltinType::Bool => matches!(value, Value::Bool(_)),
            BuiltinType::Text => matches!(value, Value::Text(_)),
            BuiltinType::Data => matches!(value, Value::Data(_)),
            BuiltinType::Int8 => int_fits(value, i8::MIN.into(), i8::MAX.into()),
            BuiltinType::Int16 => int_fits(value, i16::MIN.into(), i16::MAX.into()),
            BuiltinType::Int32 => int_fits(value, i32::MIN.into(), i32::MAX.into()),
            BuiltinType::Int64 => int_fits(value, i64::MIN.into(), i64::MAX.into()),
            BuiltinType::UInt8 => int_fits(value, 0.into(), u8::MAX.into()),
            BuiltinType::UInt16 => int_fits(value, 0.into(), u16::MAX.into()),
            BuiltinType::UInt32 => int_fits(value, 0.into(), u32::MAX.into()),
            BuiltinType::UInt64 => int_fits(value, 0.into(), u64::MAX.into()),
            BuiltinType::Float32 => matches!(value, Value::Float32(_)),
            BuiltinType::Float64 => matches!(value, Value::Float32(_) | Value::Float64(_)),
            BuiltinType::List => {
                if let Value::List(items) = value {
                    if let Some(element) = parameters.first() {
                        for item in items {
                            self.check_value(element, item, loc, what);
                        }
                    }
                    true
                } else {
                    false
                }
            }
            BuiltinType::Presence => {
                if let Some(inner) = parameters.first() {
                    self.check_value(inner, value, loc, what);
                }
                true
            }
            // map literals are not checked structurally
            BuiltinType::Map => true,
        };
        if !ok {
            self.report(
                ErrorCode::WrongTypeValue,
                format!(
                    "{what} declares {} but its value is {}",
                    builtin.name(),
                    value.kind_name()
                ),
                loc,
            );
        }
    }

    fn check_struct_literal(
        &self,
        reference: TypeReference,
        value: &Value,
        loc: Location,
        what: &str,
    ) {
        let Value::Struct(fields) = value else {
            if !matches!(value, Value::Identifier(_)) {
                self.report(
                    ErrorCode::WrongTypeValue,
                    format!("{what} wants a struct literal, got {}", value.kind_name()),
                    loc,
                );
            }
            return;
        };
        let Some(declared) = self.index.struct_fields.get(&reference) else {
            return;
        };
        for field in fields {
            match declared.get(&field.name) {
                Some(field_ty) => {
                    self.check_value(field_ty, &field.value, field.loc, what);
                }
                None => {
                    self.report(
                        ErrorCode::UnknownFieldInStructLiteral,
                        format!("{what} sets unknown field `{}`", field.name),
                        field.loc,
                    );
                }
            }
        }
    }
}

fn int_fits(value: &Value, min: BigInt, max: BigInt) -> bool {
    match fold::value_as_int(value) {
        Some(v) => v >= min && v <= max,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::lower;
    use crate::parse;
    use crate::symbol::GlobalSymbols;
    use crate::uid;

    fn checked(sources: &[(&str, &str)]) -> Vec<ErrorCode> {
        let table = GlobalSymbols::new();
        let reporter = Reporter::new();
        let mut modules = Vec::new();
        for (uri, src) in sources {
            let ast = parse::parse(uri, src.as_bytes(), &reporter).unwrap();
            let mut module = lower::lower(&ast, &reporter).unwrap();
            uid::complete_uids(&mut module).unwrap();
            table.collect(&module, &reporter).unwrap();
            modules.push(module);
        }
        for module in &mut modules {
            link::link(module, &table, &reporter);
        }
        assert!(reporter.is_empty(), "{:?}", reporter.diagnostics());
        let mut image = Image { modules };
        fold::optimize(&mut image);
        check(&image, &reporter);
        let mut codes: Vec<_> = reporter.diagnostics().iter().map(|d| d.code).collect();
        codes.sort();
        codes
    }

    #[test]
    fn test_clean_module_passes() {
        let codes = checked(&[(
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             const Foo :Int32 = 32\n\
             const Bar :Int32 = (Foo + Foo)\n\
             const Name :Text = \"x\"\n\
             enum Color { Red Green }\n\
             const Favorite :Color = Color.Red\n\
             struct Thing {\n  a :Bool = true\n  xs :List<:Int32> = [1, 2]\n}\n",
        )]);
        assert!(codes.is_empty(), "{codes:?}");
    }

    #[test]
    fn test_const_type_mismatch() {
        let codes = checked(&[(
            "/a.mgdl",
            "syntax = \"microglot0\"\nconst Foo :Int8 = 1000\nconst Bar :Text = 5\n",
        )]);
        assert_eq!(codes, vec![ErrorCode::WrongTypeValue, ErrorCode::WrongTypeValue]);
    }

    #[test]
    fn test_annotation_as_field_type_is_wrong_kind() {
        let codes = checked(&[(
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             annotation Version(struct) :Text\n\
             struct Foo {\n  bar :Version\n}\n",
        )]);
        assert_eq!(codes, vec![ErrorCode::WrongTypeKind]);
    }

    #[test]
    fn test_extends_wrong_kind() {
        let codes = checked(&[(
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             struct NotAnApi {\n  a :Bool\n}\n\
             api Service extends (:NotAnApi) {\n  Go(:NotAnApi) returns (:NotAnApi)\n}\n",
        )]);
        assert_eq!(codes, vec![ErrorCode::WrongTypeForApi]);
    }

    #[test]
    fn test_unknown_field_in_struct_literal() {
        let codes = checked(&[(
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             struct Point {\n  x :Int32\n  y :Int32\n}\n\
             const Origin :Point = { x: 0, z: 0 }\n",
        )]);
        assert_eq!(codes, vec![ErrorCode::UnknownFieldInStructLiteral]);
    }

    #[test]
    fn test_empty_list_for_scalar_type() {
        let codes = checked(&[(
            "/a.mgdl",
            "syntax = \"microglot0\"\nconst N :Int32 = []\n",
        )]);
        assert_eq!(codes, vec![ErrorCode::WrongTypeValue]);
    }

    #[test]
    fn test_wrong_enumerant_for_enum() {
        let codes = checked(&[(
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             enum Color { Red }\n\
             enum Shape { Square }\n\
             const C :Color = Shape.Square\n",
        )]);
        assert_eq!(codes, vec![ErrorCode::WrongTypeValue]);
    }
}
