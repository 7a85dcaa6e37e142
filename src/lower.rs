use num_bigint::BigInt;

use crate::ast::*;
use crate::fold;
use crate::ir::{self, AnnotationScope, AttributeReference, SdkInputReference, TypeReference};
use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::source::Location;

/// Lifts a parsed AST into the shared descriptor model.
///
/// All references start unassigned (zero) except UIDs written explicitly in
/// source. Bad literals are reported and abort the file.
pub fn lower(ast: &ModuleAst, reporter: &Reporter) -> Option<ir::Module> {
    Lowerer {
        uri: &ast.uri,
        reporter,
    }
    .lower_module(ast)
    .ok()
}

struct Lowerer<'a> {
    uri: &'a str,
    reporter: &'a Reporter,
}

type Fail = ();

impl Lowerer<'_> {
    fn report(&self, code: ErrorCode, message: String, at: Location) -> Fail {
        let _ = self
            .reporter
            .report(Diagnostic::new(code, message).at(self.uri.to_string(), at));
    }

    fn lower_module(&self, ast: &ModuleAst) -> Result<ir::Module, Fail> {
        let mut module = ir::Module::new(ast.uri.clone());
        module.comment = ast.comment.clone();

        for statement in &ast.statements {
            match statement {
                Statement::ModuleMeta(meta) => {
                    if module.uid != 0 {
                        log::warn!("{}: repeated module statement ignored", self.uri);
                        continue;
                    }
                    module.uid = meta.uid;
                    module.annotation_applications =
                        self.lower_annotation_applications(&meta.annotations)?;
                    if module.comment.is_none() {
                        module.comment = meta.comment.clone();
                    }
                }
                Statement::Import(import) => module.imports.push(ir::Import {
                    uri: import.uri.clone(),
                    alias: import.alias.clone(),
                    loc: import.loc,
                    comment: import.comment.clone(),
                }),
                Statement::AnnotationDecl(decl) => {
                    let annotation = self.lower_annotation_decl(decl)?;
                    module.annotations.push(annotation);
                }
                Statement::Const(c) => {
                    let constant = self.lower_const(c)?;
                    module.constants.push(constant);
                }
                Statement::Enum(en) => {
                    let lowered = self.lower_enum(en)?;
                    module.enums.push(lowered);
                }
                Statement::Struct(st) => {
                    let lowered = self.lower_struct(st)?;
                    module.structs.push(lowered);
                }
                Statement::Api(api) => {
                    let lowered = self.lower_api(api)?;
                    module.apis.push(lowered);
                }
                Statement::Sdk(sdk) => {
                    let lowered = self.lower_sdk(sdk)?;
                    module.sdks.push(lowered);
                }
                Statement::Impl(im) => {
                    // no descriptor counterpart; procedures are not executed
                    log::debug!("{}: dropping impl {}", self.uri, im.name.name);
                }
            }
        }
        Ok(module)
    }

    fn lower_annotation_decl(&self, decl: &AnnotationDeclStmt) -> Result<ir::AnnotationDecl, Fail> {
        let mut scopes = AnnotationScope::empty();
        for scope in &decl.scopes {
            scopes |= match scope.as_str() {
                "module" => AnnotationScope::MODULE,
                "union" => AnnotationScope::UNION,
                "struct" => AnnotationScope::STRUCT,
                "field" => AnnotationScope::FIELD,
                "enumerant" => AnnotationScope::ENUMERANT,
                "enum" => AnnotationScope::ENUM,
                "api" => AnnotationScope::API,
                "apimethod" => AnnotationScope::API_METHOD,
                "sdk" => AnnotationScope::SDK,
                "sdkmethod" => AnnotationScope::SDK_METHOD,
                "const" => AnnotationScope::CONST,
                "impl" => AnnotationScope::IMPL,
                "*" => AnnotationScope::all(),
                other => {
                    return Err(self.report(
                        ErrorCode::InvalidLiteral,
                        format!("unknown annotation scope `{other}`"),
                        decl.loc,
                    ));
                }
            };
        }
        Ok(ir::AnnotationDecl {
            reference: TypeReference {
                module_uid: 0,
                type_uid: decl.uid.unwrap_or(0),
            },
            name: decl.name.clone(),
            scopes,
            ty: self.lower_type_specifier(&decl.ty)?,
            comment: decl.comment.clone(),
            loc: decl.loc,
        })
    }

    fn lower_const(&self, c: &ConstStmt) -> Result<ir::Constant, Fail> {
        Ok(ir::Constant {
            reference: TypeReference {
                module_uid: 0,
                type_uid: c.metadata.uid.unwrap_or(0),
            },
            name: c.name.clone(),
            ty: self.lower_type_specifier(&c.ty)?,
            value: self.lower_value(&c.value)?,
            annotations: self.lower_annotation_applications(&c.metadata.annotations)?,
            comment: c.metadata.comment.clone(),
            loc: c.loc,
        })
    }

    fn lower_enum(&self, en: &EnumStmt) -> Result<ir::Enum, Fail> {
        let mut enumerants = Vec::with_capacity(en.enumerants.len());
        for e in &en.enumerants {
            enumerants.push(ir::Enumerant {
                reference: AttributeReference {
                    module_uid: 0,
                    type_uid: 0,
                    attribute_uid: e.metadata.uid.unwrap_or(0),
                },
                name: e.name.clone(),
                annotations: self.lower_annotation_applications(&e.metadata.annotations)?,
                comment: e.metadata.comment.clone(),
                loc: e.loc,
            });
        }
        Ok(ir::Enum {
            reference: TypeReference {
                module_uid: 0,
                type_uid: en.metadata.uid.unwrap_or(0),
            },
            name: en.name.clone(),
            enumerants,
            annotations: self.lower_annotation_applications(&en.metadata.annotations)?,
            comment: en.metadata.comment.clone(),
            loc: en.loc,
        })
    }

    fn lower_struct(&self, st: &StructStmt) -> Result<ir::Struct, Fail> {
        let mut fields = Vec::new();
        let mut unions = Vec::new();
        for element in &st.elements {
            match element {
                StructElement::Field(f) => fields.push(self.lower_field(f)?),
                StructElement::Union(u) => {
                    let mut union_fields = Vec::with_capacity(u.fields.len());
                    for f in &u.fields {
                        union_fields.push(self.lower_field(f)?);
                    }
                    unions.push(ir::Union {
                        reference: AttributeReference {
                            module_uid: 0,
                            type_uid: 0,
                            attribute_uid: u.metadata.uid.unwrap_or(0),
                        },
                        name: u.name.clone(),
                        fields: union_fields,
                        annotations: self.lower_annotation_applications(&u.metadata.annotations)?,
                        comment: u.metadata.comment.clone(),
                        loc: u.loc,
                    });
                }
            }
        }
        Ok(ir::Struct {
            reference: TypeReference {
                module_uid: 0,
                type_uid: st.metadata.uid.unwrap_or(0),
            },
            name: self.lower_type_name(&st.name)?,
            fields,
            unions,
            annotations: self.lower_annotation_applications(&st.metadata.annotations)?,
            comment: st.metadata.comment.clone(),
            loc: st.loc,
        })
    }

    fn lower_field(&self, f: &FieldAst) -> Result<ir::Field, Fail> {
        let default = match &f.default {
            Some(value) => Some(self.lower_value(value)?),
            None => None,
        };
        Ok(ir::Field {
            reference: AttributeReference {
                module_uid: 0,
                type_uid: 0,
                attribute_uid: f.metadata.uid.unwrap_or(0),
            },
            name: f.name.clone(),
            ty: self.lower_type_specifier(&f.ty)?,
            default,
            annotations: self.lower_annotation_applications(&f.metadata.annotations)?,
            comment: f.metadata.comment.clone(),
            loc: f.loc,
        })
    }

    fn lower_api(&self, api: &ApiStmt) -> Result<ir::Api, Fail> {
        let mut methods = Vec::with_capacity(api.methods.len());
        for m in &api.methods {
            methods.push(ir::ApiMethod {
                reference: AttributeReference {
                    module_uid: 0,
                    type_uid: 0,
                    attribute_uid: m.metadata.uid.unwrap_or(0),
                },
                name: m.name.clone(),
                input: self.lower_type_specifier(&m.input)?,
                output: self.lower_type_specifier(&m.output)?,
                annotations: self.lower_annotation_applications(&m.metadata.annotations)?,
                comment: m.metadata.comment.clone(),
                loc: m.loc,
            });
        }
        Ok(ir::Api {
            reference: TypeReference {
                module_uid: 0,
                type_uid: api.metadata.uid.unwrap_or(0),
            },
            name: self.lower_type_name(&api.name)?,
            extends: self.lower_type_specifiers(&api.extends)?,
            methods,
            annotations: self.lower_annotation_applications(&api.metadata.annotations)?,
            comment: api.metadata.comment.clone(),
            loc: api.loc,
        })
    }

    fn lower_sdk(&self, sdk: &SdkStmt) -> Result<ir::Sdk, Fail> {
        let mut methods = Vec::with_capacity(sdk.methods.len());
        for m in &sdk.methods {
            let mut inputs = Vec::with_capacity(m.inputs.len());
            for input in &m.inputs {
                inputs.push(ir::SdkInput {
                    reference: SdkInputReference::default(),
                    name: input.name.clone(),
                    ty: self.lower_type_specifier(&input.ty)?,
                    loc: input.loc,
                });
            }
            let output = match &m.output {
                Some(ts) => Some(self.lower_type_specifier(ts)?),
                None => None,
            };
            methods.push(ir::SdkMethod {
                reference: AttributeReference {
                    module_uid: 0,
                    type_uid: 0,
                    attribute_uid: m.metadata.uid.unwrap_or(0),
                },
                name: m.name.clone(),
                inputs,
                output,
                nothrows: m.nothrows,
                annotations: self.lower_annotation_applications(&m.metadata.annotations)?,
                comment: m.metadata.comment.clone(),
                loc: m.loc,
            });
        }
        Ok(ir::Sdk {
            reference: TypeReference {
                module_uid: 0,
                type_uid: sdk.metadata.uid.unwrap_or(0),
            },
            name: self.lower_type_name(&sdk.name)?,
            extends: self.lower_type_specifiers(&sdk.extends)?,
            methods,
            annotations: self.lower_annotation_applications(&sdk.metadata.annotations)?,
            comment: sdk.metadata.comment.clone(),
            loc: sdk.loc,
        })
    }

    fn lower_type_specifiers(
        &self,
        specs: &[TypeSpecifierAst],
    ) -> Result<Vec<ir::TypeSpecifier>, Fail> {
        specs.iter().map(|ts| self.lower_type_specifier(ts)).collect()
    }

    fn lower_type_specifier(&self, ts: &TypeSpecifierAst) -> Result<ir::TypeSpecifier, Fail> {
        Ok(ir::TypeSpecifier::Forward(ir::ForwardReference::Microglot {
            qualifier: ts.qualifier.clone().unwrap_or_default(),
            name: self.lower_type_name(&ts.name)?,
            loc: ts.loc,
        }))
    }

    fn lower_type_name(&self, name: &TypeNameAst) -> Result<ir::TypeName, Fail> {
        Ok(ir::TypeName {
            name: name.name.clone(),
            parameters: self.lower_type_specifiers(&name.parameters)?,
        })
    }

    fn lower_annotation_applications(
        &self,
        annotations: &[AnnotationApplicationAst],
    ) -> Result<Vec<ir::AnnotationApplication>, Fail> {
        annotations
            .iter()
            .map(|ann| {
                Ok(ir::AnnotationApplication {
                    annotation: ir::TypeSpecifier::Forward(ir::ForwardReference::Microglot {
                        qualifier: ann.qualifier.clone().unwrap_or_default(),
                        name: ir::TypeName::plain(ann.name.clone()),
                        loc: ann.loc,
                    }),
                    value: self.lower_value(&ann.value)?,
                    loc: ann.loc,
                })
            })
            .collect()
    }

    fn lower_value(&self, value: &ValueAst) -> Result<ir::Value, Fail> {
        Ok(match value {
            ValueAst::Unary { op, operand, .. } => ir::Value::Unary(ir::UnaryValue {
                op: *op,
                operand: Box::new(self.lower_value(operand)?),
            }),
            ValueAst::Binary { op, left, right, .. } => ir::Value::Binary(ir::BinaryValue {
                op: *op,
                left: Box::new(self.lower_value(left)?),
                right: Box::new(self.lower_value(right)?),
            }),
            ValueAst::Identifier { names, loc } => ir::Value::Identifier(ir::ValueIdentifier {
                names: names.clone(),
                reference: None,
                loc: *loc,
            }),
            ValueAst::Bool { value, .. } => ir::Value::Bool(*value),
            ValueAst::Int { text, loc } => {
                let parsed = parse_integer_literal(text).and_then(|v| fold::narrow_int(&v));
                match parsed {
                    Some(value) => value,
                    None => {
                        return Err(self.report(
                            ErrorCode::InvalidNumber,
                            format!("integer literal `{text}` is out of range"),
                            *loc,
                        ));
                    }
                }
            }
            ValueAst::Float { text, loc } => match parse_float_literal(text) {
                Some(value) => fold::narrow_float(value),
                None => {
                    return Err(self.report(
                        ErrorCode::InvalidNumber,
                        format!("malformed float literal `{text}`"),
                        *loc,
                    ));
                }
            },
            ValueAst::Text { value, .. } | ValueAst::Prose { value, .. } => {
                ir::Value::Text(value.clone())
            }
            ValueAst::Data { text, loc } => match parse_data_literal(text) {
                Some(bytes) => ir::Value::Data(bytes),
                None => {
                    return Err(self.report(
                        ErrorCode::InvalidLiteral,
                        format!("malformed data literal `{text}`"),
                        *loc,
                    ));
                }
            },
            ValueAst::List { items, .. } => {
                let mut lowered = Vec::with_capacity(items.len());
                for item in items {
                    lowered.push(self.lower_value(item)?);
                }
                ir::Value::List(lowered)
            }
            ValueAst::Struct { fields, .. } => {
                let mut lowered = Vec::with_capacity(fields.len());
                for (name, value, loc) in fields {
                    lowered.push(ir::StructFieldValue {
                        name: name.clone(),
                        value: self.lower_value(value)?,
                        loc: *loc,
                    });
                }
                ir::Value::Struct(lowered)
            }
        })
    }
}

/// Parses an integer literal as retained by the lexer (base prefix and `_`
/// separators included) into an arbitrary-precision integer.
pub(crate) fn parse_integer_literal(text: &str) -> Option<BigInt> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let (digits, radix) = if let Some(rest) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        (rest, 16)
    } else if let Some(rest) = cleaned
        .strip_prefix("0b")
        .or_else(|| cleaned.strip_prefix("0B"))
    {
        (rest, 2)
    } else if let Some(rest) = cleaned
        .strip_prefix("0o")
        .or_else(|| cleaned.strip_prefix("0O"))
    {
        (rest, 8)
    } else if cleaned.len() > 1 && cleaned.starts_with('0') {
        // leading-zero octal compatibility form
        (&cleaned[1..], 8)
    } else {
        (cleaned.as_str(), 10)
    };
    if digits.is_empty() {
        return None;
    }
    BigInt::parse_bytes(digits.as_bytes(), radix)
}

/// Parses a float literal, covering the decimal and `0x…p…` hex forms.
pub(crate) fn parse_float_literal(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    if let Some(rest) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        let (mantissa, exponent) = rest.split_once(['p', 'P'])?;
        let exponent: i32 = exponent.parse().ok()?;
        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        let mut value = 0f64;
        for d in int_part.chars() {
            value = value * 16.0 + f64::from(d.to_digit(16)?);
        }
        let mut scale = 1.0 / 16.0;
        for d in frac_part.chars() {
            value += f64::from(d.to_digit(16)?) * scale;
            scale /= 16.0;
        }
        Some(value * 2f64.powi(exponent))
    } else {
        cleaned.parse().ok()
    }
}

/// Decodes the hex payload of a `0x"…"` data literal; interior whitespace is
/// permitted between byte pairs.
pub(crate) fn parse_data_literal(text: &str) -> Option<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return None;
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&compact[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Value;
    use crate::parse;

    fn lower_src(src: &str) -> ir::Module {
        let reporter = Reporter::new();
        let ast = parse::parse("/test.mgdl", src.as_bytes(), &reporter).unwrap();
        let module = lower(&ast, &reporter).unwrap();
        assert!(reporter.is_empty(), "{:?}", reporter.diagnostics());
        module
    }

    #[test]
    fn test_parse_integer_literal_bases() {
        assert_eq!(parse_integer_literal("0"), Some(BigInt::from(0)));
        assert_eq!(parse_integer_literal("1_000"), Some(BigInt::from(1000)));
        assert_eq!(parse_integer_literal("0xFF"), Some(BigInt::from(255)));
        assert_eq!(parse_integer_literal("0o755"), Some(BigInt::from(0o755)));
        assert_eq!(parse_integer_literal("0755"), Some(BigInt::from(0o755)));
        assert_eq!(parse_integer_literal("0b1010"), Some(BigInt::from(10)));
        assert_eq!(parse_integer_literal("0x"), None);
    }

    #[test]
    fn test_parse_float_literal_forms() {
        assert_eq!(parse_float_literal("1.5"), Some(1.5));
        assert_eq!(parse_float_literal(".25"), Some(0.25));
        assert_eq!(parse_float_literal("2e3"), Some(2000.0));
        assert_eq!(parse_float_literal("0x1.8p1"), Some(3.0));
        assert_eq!(parse_float_literal("0x1Fp0"), Some(31.0));
        assert_eq!(parse_float_literal("0x1p-1"), Some(0.5));
    }

    #[test]
    fn test_parse_data_literal() {
        assert_eq!(parse_data_literal("DEADBEEF"), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_data_literal("de ad"), Some(vec![0xde, 0xad]));
        assert_eq!(parse_data_literal("abc"), None);
        assert_eq!(parse_data_literal("zz"), None);
    }

    #[test]
    fn test_lower_const_narrows_literals() {
        let module = lower_src(
            "syntax = \"microglot0\"\nconst A :Int32 = 32\nconst B :Int32 = 256\nconst C :Int32 = -1\n",
        );
        assert_eq!(module.constants[0].value, Value::UInt8(32));
        assert_eq!(module.constants[1].value, Value::UInt16(256));
        // the sign is an unfolded unary at this stage
        assert!(matches!(module.constants[2].value, Value::Unary(_)));
    }

    #[test]
    fn test_lower_module_meta() {
        let module = lower_src("syntax = \"microglot0\"\nmodule = @42\nstruct Foo { a :Bool }\n");
        assert_eq!(module.uid, 42);
        assert_eq!(module.structs.len(), 1);
        assert_eq!(module.structs[0].fields[0].reference.attribute_uid, 0);
    }

    #[test]
    fn test_lower_impl_dropped() {
        let module = lower_src(
            "syntax = \"microglot0\"\nimpl Thing as (:Bool) { Run() { } }\n",
        );
        assert!(module.structs.is_empty());
        assert!(module.sdks.is_empty());
    }
}
