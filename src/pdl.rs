use sha2::{Digest, Sha256};

use crate::ir::{
    AnnotationApplication, AttributeReference, BuiltinType, Enum, Enumerant, Field,
    ForwardReference, Import, Module, Struct, TypeName, TypeReference, TypeSpecifier, Union, Value,
};
use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::source::Location;
use crate::uid;

/// Parse failure inside the external PDL parser.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PdlParseError {
    pub message: String,
    pub location: Option<Location>,
}

/// The external PDL parser, wrapped behind one call.
pub trait PdlParser: Send + Sync {
    fn parse_pdl(&self, path: &str, bytes: &[u8]) -> Result<RawModule, PdlParseError>;
}

/// Raw shape of a parsed PDL file, as lifted from the external parser.
#[derive(Debug, Clone, Default)]
pub struct RawModule {
    pub package: Option<String>,
    pub imports: Vec<String>,
    pub messages: Vec<RawMessage>,
    pub enums: Vec<RawEnum>,
}

#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub name: String,
    pub fields: Vec<RawField>,
    pub oneofs: Vec<RawOneof>,
    /// Nested declarations, promoted to module level during conversion.
    pub messages: Vec<RawMessage>,
    pub enums: Vec<RawEnum>,
}

#[derive(Debug, Clone, Default)]
pub struct RawField {
    pub name: String,
    pub number: u32,
    /// A PDL scalar type name or a (possibly dotted, possibly absolute)
    /// message/enum reference.
    pub type_name: String,
    pub repeated: bool,
    pub optional: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RawOneof {
    pub name: String,
    pub fields: Vec<RawField>,
}

#[derive(Debug, Clone, Default)]
pub struct RawEnum {
    pub name: String,
    pub values: Vec<RawEnumValue>,
}

#[derive(Debug, Clone, Default)]
pub struct RawEnumValue {
    pub name: String,
    pub number: i32,
}

/// Module UID of a PDL file: the low 64 bits, little-endian, of
/// `SHA256(package_name || file_name)`.
#[must_use]
pub fn module_uid(package: &str, file_name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(package.as_bytes());
    hasher.update(file_name.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Converts a raw PDL parse into a module descriptor: nested messages and
/// enums are promoted to module level under `Outer_Inner` names, field
/// numbers become attribute UIDs, and the original package and nesting are
/// recorded as `Protobuf` annotations.
pub fn convert(raw: &RawModule, uri: &str, reporter: &Reporter) -> Result<Module, Diagnostic> {
    let mut module = Module::new(uri);
    module.uid = module_uid(raw.package.as_deref().unwrap_or(""), uri);
    module.protobuf_package = raw.package.clone();

    for import in &raw.imports {
        module.imports.push(Import {
            uri: import.clone(),
            // PDL has no aliasing; imported names arrive unqualified
            alias: ".".to_string(),
            loc: Location::default(),
            comment: None,
        });
    }
    if let Some(package) = &raw.package {
        module.annotation_applications.push(protobuf_annotation(
            "Package",
            Value::Text(package.clone()),
        ));
    }

    let converter = Converter { uri, reporter };
    for message in &raw.messages {
        converter.convert_message(&mut module, message, &[])?;
    }
    for en in &raw.enums {
        converter.convert_enum(&mut module, en, &[]);
    }
    Ok(module)
}

struct Converter<'a> {
    uri: &'a str,
    reporter: &'a Reporter,
}

impl Converter<'_> {
    fn convert_message(
        &self,
        module: &mut Module,
        message: &RawMessage,
        scope: &[&str],
    ) -> Result<(), Diagnostic> {
        let promoted = promoted_name(scope, &message.name);
        let original = original_name(scope, &message.name);

        let mut st = Struct {
            reference: TypeReference::default(),
            name: TypeName::plain(promoted.clone()),
            fields: Vec::new(),
            unions: Vec::new(),
            annotations: Vec::new(),
            comment: None,
            loc: Location::default(),
        };
        if !scope.is_empty() {
            st.annotations.push(protobuf_annotation(
                "NestedTypeInfo",
                Value::Text(original.clone()),
            ));
            module.pdl_original_names.insert(promoted.clone(), original);
        }
        for field in &message.fields {
            st.fields.push(self.convert_field(field)?);
        }
        for oneof in &message.oneofs {
            let mut fields = Vec::with_capacity(oneof.fields.len());
            for field in &oneof.fields {
                fields.push(self.convert_field(field)?);
            }
            st.unions.push(Union {
                reference: AttributeReference::default(),
                name: oneof.name.clone(),
                fields,
                annotations: Vec::new(),
                comment: None,
                loc: Location::default(),
            });
        }
        module.structs.push(st);

        let child_scope: Vec<&str> = scope
            .iter()
            .copied()
            .chain(std::iter::once(message.name.as_str()))
            .collect();
        for nested in &message.messages {
            let nested_promoted = promoted_name(&child_scope, &nested.name);
            module
                .pdl_rewrites
                .entry(promoted.clone())
                .or_default()
                .insert(nested.name.clone(), nested_promoted);
            self.convert_message(module, nested, &child_scope)?;
        }
        for nested in &message.enums {
            let nested_promoted = promoted_name(&child_scope, &nested.name);
            module
                .pdl_rewrites
                .entry(promoted.clone())
                .or_default()
                .insert(nested.name.clone(), nested_promoted);
            self.convert_enum(module, nested, &child_scope);
        }
        Ok(())
    }

    fn convert_field(&self, field: &RawField) -> Result<Field, Diagnostic> {
        let number = u64::from(field.number) & uid::MAX_ATTRIBUTE_UID;
        if uid::RESERVED_RANGE.contains(&number) {
            let diagnostic = Diagnostic::new(
                ErrorCode::ProtobufParseError,
                format!(
                    "field `{}` uses number {} inside the reserved range 19000-19999",
                    field.name, field.number
                ),
            )
            .in_file(self.uri.to_string());
            let _ = self.reporter.report(diagnostic.clone());
            return Err(diagnostic);
        }

        let mut ty = scalar_type(&field.type_name).unwrap_or_else(|| {
            TypeSpecifier::Forward(ForwardReference::Protobuf {
                name: field.type_name.clone(),
                loc: Location::default(),
            })
        });
        if field.repeated {
            ty = TypeSpecifier::Resolved {
                reference: BuiltinType::List.reference(),
                parameters: vec![ty],
            };
        } else if field.optional {
            ty = TypeSpecifier::Resolved {
                reference: BuiltinType::Presence.reference(),
                parameters: vec![ty],
            };
        }
        Ok(Field {
            reference: AttributeReference {
                module_uid: 0,
                type_uid: 0,
                attribute_uid: number,
            },
            name: field.name.clone(),
            ty,
            default: None,
            annotations: vec![protobuf_annotation(
                "FieldNumber",
                Value::UInt64(u64::from(field.number)),
            )],
            comment: None,
            loc: Location::default(),
        })
    }

    fn convert_enum(&self, module: &mut Module, en: &RawEnum, scope: &[&str]) {
        let promoted = promoted_name(scope, &en.name);
        let mut lowered = Enum {
            reference: TypeReference::default(),
            name: promoted.clone(),
            enumerants: Vec::new(),
            annotations: Vec::new(),
            comment: None,
            loc: Location::default(),
        };
        if !scope.is_empty() {
            let original = original_name(scope, &en.name);
            lowered.annotations.push(protobuf_annotation(
                "NestedTypeInfo",
                Value::Text(original.clone()),
            ));
            module.pdl_original_names.insert(promoted, original);
        }
        for value in &en.values {
            lowered.enumerants.push(Enumerant {
                // enumerant UIDs are hashed at completion; the wire number
                // can be zero or negative and rides along as an annotation
                reference: AttributeReference::default(),
                name: value.name.clone(),
                annotations: vec![protobuf_annotation(
                    "EnumerantNumber",
                    Value::Int64(i64::from(value.number)),
                )],
                comment: None,
                loc: Location::default(),
            });
        }
        module.enums.push(lowered);
    }
}

fn promoted_name(scope: &[&str], name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}_{name}", scope.join("_"))
    }
}

fn original_name(scope: &[&str], name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}.{name}", scope.join("."))
    }
}

fn protobuf_annotation(name: &str, value: Value) -> AnnotationApplication {
    AnnotationApplication {
        annotation: TypeSpecifier::Forward(ForwardReference::Microglot {
            qualifier: "Protobuf".to_string(),
            name: TypeName::plain(name),
            loc: Location::default(),
        }),
        value,
        loc: Location::default(),
    }
}

fn scalar_type(name: &str) -> Option<TypeSpecifier> {
    let builtin = match name {
        "double" => BuiltinType::Float64,
        "float" => BuiltinType::Float32,
        "int32" | "sint32" | "sfixed32" => BuiltinType::Int32,
        "int64" | "sint64" | "sfixed64" => BuiltinType::Int64,
        "uint32" | "fixed32" => BuiltinType::UInt32,
        "uint64" | "fixed64" => BuiltinType::UInt64,
        "bool" => BuiltinType::Bool,
        "string" => BuiltinType::Text,
        "bytes" => BuiltinType::Data,
        _ => return None,
    };
    Some(TypeSpecifier::builtin(builtin))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_fixture() -> RawModule {
        RawModule {
            package: Some("pkg".to_string()),
            imports: vec!["other.proto".to_string()],
            messages: vec![RawMessage {
                name: "Outer".to_string(),
                fields: vec![
                    RawField {
                        name: "inner".to_string(),
                        number: 1,
                        type_name: "Inner".to_string(),
                        ..RawField::default()
                    },
                    RawField {
                        name: "tags".to_string(),
                        number: 2,
                        type_name: "string".to_string(),
                        repeated: true,
                        ..RawField::default()
                    },
                ],
                oneofs: vec![RawOneof {
                    name: "choice".to_string(),
                    fields: vec![RawField {
                        name: "flag".to_string(),
                        number: 3,
                        type_name: "bool".to_string(),
                        ..RawField::default()
                    }],
                }],
                messages: vec![RawMessage {
                    name: "Inner".to_string(),
                    fields: vec![RawField {
                        name: "value".to_string(),
                        number: 1,
                        type_name: "int32".to_string(),
                        ..RawField::default()
                    }],
                    ..RawMessage::default()
                }],
                enums: vec![RawEnum {
                    name: "Kind".to_string(),
                    values: vec![RawEnumValue {
                        name: "KIND_UNSPECIFIED".to_string(),
                        number: 0,
                    }],
                }],
            }],
            enums: Vec::new(),
        }
    }

    #[test]
    fn test_convert_promotes_nested_types() {
        let reporter = Reporter::new();
        let module = convert(&raw_fixture(), "/p.proto", &reporter).unwrap();
        let names: Vec<&str> = module.structs.iter().map(|s| s.name.name.as_str()).collect();
        assert_eq!(names, vec!["Outer", "Outer_Inner"]);
        assert_eq!(module.enums[0].name, "Outer_Kind");
        assert_eq!(
            module.pdl_rewrites["Outer"]["Inner"],
            "Outer_Inner"
        );
        assert_eq!(module.pdl_original_names["Outer_Inner"], "Outer.Inner");
        assert_eq!(module.protobuf_package.as_deref(), Some("pkg"));
        // nesting is recorded as an annotation on the promoted type
        assert!(!module.structs[1].annotations.is_empty());
    }

    #[test]
    fn test_convert_field_shapes() {
        let reporter = Reporter::new();
        let module = convert(&raw_fixture(), "/p.proto", &reporter).unwrap();
        let outer = &module.structs[0];
        // field numbers become attribute uids
        assert_eq!(outer.fields[0].reference.attribute_uid, 1);
        // repeated wraps in List
        let TypeSpecifier::Resolved { reference, parameters } = &outer.fields[1].ty else {
            panic!("expected resolved list");
        };
        assert_eq!(*reference, BuiltinType::List.reference());
        assert_eq!(parameters[0].reference(), Some(BuiltinType::Text.reference()));
        // oneof becomes a union
        assert_eq!(outer.unions[0].name, "choice");
        assert_eq!(outer.unions[0].fields[0].reference.attribute_uid, 3);
        // imports arrive as dot-imports
        assert!(module.imports[0].is_dot_import());
    }

    #[test]
    fn test_convert_module_uid_is_deterministic() {
        assert_eq!(module_uid("pkg", "/p.proto"), module_uid("pkg", "/p.proto"));
        assert_ne!(module_uid("pkg", "/p.proto"), module_uid("other", "/p.proto"));
        assert_ne!(module_uid("pkg", "/p.proto"), module_uid("pkg", "/q.proto"));
    }

    #[test]
    fn test_reserved_field_number_rejected() {
        let mut raw = raw_fixture();
        raw.messages[0].fields[0].number = 19001;
        let reporter = Reporter::new();
        let err = convert(&raw, "/p.proto", &reporter).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtobufParseError);
        assert_eq!(reporter.len(), 1);
    }
}
