use std::collections::{HashMap, HashSet};

use crate::fs;
use crate::ir::{
    AttributeReference, BuiltinType, ForwardReference, Module, TypeReference, TypeSpecifier,
    ValueIdentifier, ValueRef,
};
use crate::report::{Diagnostic, ErrorCode, Reporter};
use crate::source::Location;
use crate::symbol::{GlobalSymbols, ModuleSymbols};

/// URI of the embedded bootstrap module, aliased as `Protobuf` in every
/// module's local table.
pub const PROTOBUF_BOOTSTRAP_URI: &str = "/protobuf.mgdl";

/// Per-module name index built from the global table before resolution.
#[derive(Default)]
struct LocalSymbols {
    /// qualifier → declaration name → reference.
    types: HashMap<String, HashMap<String, TypeReference>>,
    /// qualifier → `Type.attr` → reference.
    attributes: HashMap<String, HashMap<String, AttributeReference>>,
    /// Protobuf fully-qualified name → reference.
    protobuf: HashMap<String, TypeReference>,
}

impl LocalSymbols {
    /// First writer wins; the seeding order makes built-ins and the module's
    /// own declarations shadow-proof.
    fn alias(&mut self, qualifier: &str, symbols: &ModuleSymbols) {
        let types = self.types.entry(qualifier.to_string()).or_default();
        for (name, reference) in &symbols.types {
            types.entry(name.clone()).or_insert(*reference);
        }
        let attributes = self.attributes.entry(qualifier.to_string()).or_default();
        for (type_name, attrs) in &symbols.attributes {
            for (attr, reference) in attrs {
                attributes
                    .entry(format!("{type_name}.{attr}"))
                    .or_insert(*reference);
            }
        }
        for (fqn, reference) in &symbols.protobuf_names {
            self.protobuf.entry(fqn.clone()).or_insert(*reference);
        }
    }

    fn lookup_type(&self, qualifier: &str, name: &str) -> Option<TypeReference> {
        self.types.get(qualifier)?.get(name).copied()
    }

    fn lookup_attribute(&self, qualifier: &str, key: &str) -> Option<AttributeReference> {
        self.attributes.get(qualifier)?.get(key).copied()
    }
}

/// Resolves every `TypeSpecifier` and `ValueIdentifier` in `module` against
/// the global table.
///
/// Purely additive: unknown imports, types, and identifiers are reported and
/// linking continues, so downstream users see every unresolved name at once.
pub fn link(module: &mut Module, table: &GlobalSymbols, reporter: &Reporter) {
    let mut local = LocalSymbols::default();

    let builtins = local.types.entry(String::new()).or_default();
    for builtin in BuiltinType::ALL {
        builtins.insert(builtin.name().to_string(), builtin.reference());
    }

    match table.snapshot(&module.uri) {
        Some(own) => local.alias("", &own),
        None => log::warn!("{}: linking a module that was never collected", module.uri),
    }
    match table.snapshot(PROTOBUF_BOOTSTRAP_URI) {
        Some(bootstrap) => local.alias("Protobuf", &bootstrap),
        None => log::warn!("{}: bootstrap module is unavailable", module.uri),
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    for import in &module.imports {
        let normalized = fs::normalize_uri(&import.uri);
        if normalized == module.uri {
            log::debug!("{}: ignoring self import", module.uri);
            continue;
        }
        if !seen.insert((import.alias.clone(), normalized.clone())) {
            log::debug!("{}: ignoring duplicate import of {normalized}", module.uri);
            continue;
        }
        match table.snapshot(&normalized) {
            Some(symbols) => {
                let qualifier = if import.is_dot_import() { "" } else { &import.alias };
                local.alias(qualifier, &symbols);
            }
            None => {
                let _ = reporter.report(
                    Diagnostic::new(
                        ErrorCode::UnknownImport,
                        format!("import `{}` is not part of this compilation", import.uri),
                    )
                    .at(module.uri.clone(), import.loc),
                );
            }
        }
    }

    let linker = Linker {
        local,
        uri: module.uri.clone(),
        package: module.protobuf_package.clone(),
        rewrites: module.pdl_rewrites.clone(),
        original_names: module.pdl_original_names.clone(),
        reporter,
    };

    // struct fields first: protobuf scope search needs the surrounding
    // struct as context
    for st in &mut module.structs {
        let context = st.name.name.clone();
        for field in &mut st.fields {
            linker.resolve_deep(&mut field.ty, Some(&context));
        }
        for union in &mut st.unions {
            for field in &mut union.fields {
                linker.resolve_deep(&mut field.ty, Some(&context));
            }
        }
    }
    module.visit_type_specifiers_mut(&mut |ts| linker.resolve(ts, None));
    module.visit_values_mut(&mut |value| {
        if let crate::ir::Value::Identifier(id) = value {
            linker.resolve_identifier(id);
        }
    });
}

struct Linker<'a> {
    local: LocalSymbols,
    uri: String,
    package: Option<String>,
    rewrites: HashMap<String, HashMap<String, String>>,
    original_names: HashMap<String, String>,
    reporter: &'a Reporter,
}

impl Linker<'_> {
    fn report(&self, code: ErrorCode, message: String, at: Location) {
        // the module keeps linking whatever the fatality policy says
        let _ = self
            .reporter
            .report(Diagnostic::new(code, message).at(self.uri.clone(), at));
    }

    /// Resolves `ts` and every nested parameter.
    fn resolve_deep(&self, ts: &mut TypeSpecifier, context: Option<&str>) {
        match ts {
            TypeSpecifier::Forward(ForwardReference::Microglot { name, .. }) => {
                for parameter in &mut name.parameters {
                    self.resolve_deep(parameter, context);
                }
            }
            TypeSpecifier::Resolved { parameters, .. } => {
                for parameter in parameters {
                    self.resolve_deep(parameter, context);
                }
                return;
            }
            TypeSpecifier::Forward(ForwardReference::Protobuf { .. }) => {}
        }
        self.resolve(ts, context);
    }

    /// Replaces a forward name with its resolved reference; parameters must
    /// already be resolved.
    fn resolve(&self, ts: &mut TypeSpecifier, context: Option<&str>) {
        let TypeSpecifier::Forward(forward) = ts else {
            return;
        };
        match forward {
            ForwardReference::Microglot {
                qualifier,
                name,
                loc,
            } => {
                let Some(reference) = self.local.lookup_type(qualifier, &name.name) else {
                    let shown = if qualifier.is_empty() {
                        name.name.clone()
                    } else {
                        format!("{qualifier}.{}", name.name)
                    };
                    self.report(
                        ErrorCode::UnknownType,
                        format!("unknown type `{shown}`"),
                        *loc,
                    );
                    return;
                };
                let parameters = std::mem::take(&mut name.parameters);
                self.check_parameter_arity(reference, parameters.len(), &name.name, *loc);
                *ts = TypeSpecifier::Resolved {
                    reference,
                    parameters,
                };
            }
            ForwardReference::Protobuf { name, loc } => {
                let Some(reference) = self.scope_search(name, context) else {
                    self.report(
                        ErrorCode::UnknownType,
                        format!("unknown type `{name}`"),
                        *loc,
                    );
                    return;
                };
                *ts = TypeSpecifier::Resolved {
                    reference,
                    parameters: Vec::new(),
                };
            }
        }
    }

    fn check_parameter_arity(
        &self,
        reference: TypeReference,
        supplied: usize,
        name: &str,
        loc: Location,
    ) {
        let expected = match BuiltinType::from_reference(reference) {
            Some(BuiltinType::List) => 1,
            Some(BuiltinType::Map) => 2,
            // the presence wrapper accepts zero or one
            Some(BuiltinType::Presence) => return,
            Some(_) => 0,
            None => return,
        };
        if supplied != expected {
            self.report(
                ErrorCode::TypeParameterError,
                format!("`{name}` takes {expected} type parameter(s), got {supplied}"),
                loc,
            );
        }
    }

    /// Protobuf multi-scope lookup: absolute names go straight to the
    /// qualified map; relative names try the surrounding struct's promotion
    /// rewrites, enclosing scope prefixes innermost-first, the package, the
    /// name as given, and finally (dot-free names only) the unqualified
    /// local table.
    fn scope_search(&self, name: &str, context: Option<&str>) -> Option<TypeReference> {
        if let Some(absolute) = name.strip_prefix('.') {
            return self.local.protobuf.get(absolute).copied();
        }
        if !name.contains('.') {
            if let Some(promoted) = context
                .and_then(|ctx| self.rewrites.get(ctx))
                .and_then(|rewrites| rewrites.get(name))
            {
                if let Some(reference) = self.local.lookup_type("", promoted) {
                    return Some(reference);
                }
            }
        }
        if let Some(ctx) = context {
            let original = self
                .original_names
                .get(ctx)
                .cloned()
                .unwrap_or_else(|| ctx.to_string());
            let mut scope: Vec<&str> = original.split('.').collect();
            while !scope.is_empty() {
                let mut candidate = String::new();
                if let Some(package) = &self.package {
                    candidate.push_str(package);
                    candidate.push('.');
                }
                candidate.push_str(&scope.join("."));
                candidate.push('.');
                candidate.push_str(name);
                if let Some(reference) = self.local.protobuf.get(&candidate) {
                    return Some(*reference);
                }
                scope.pop();
            }
        }
        if let Some(package) = &self.package {
            if let Some(reference) = self.local.protobuf.get(&format!("{package}.{name}")) {
                return Some(*reference);
            }
        }
        if let Some(reference) = self.local.protobuf.get(name) {
            return Some(*reference);
        }
        if !name.contains('.') {
            return self.local.lookup_type("", name);
        }
        None
    }

    /// Two interpretations, first hit wins: the whole dotted name as a
    /// type/constant or a `Type.attr` attribute under the empty qualifier,
    /// then (two or more names) the head as an import qualifier.
    fn resolve_identifier(&self, id: &mut ValueIdentifier) {
        if id.reference.is_some() {
            return;
        }
        let dotted = id.dotted();
        if let Some(reference) = self.local.lookup_type("", &dotted) {
            id.reference = Some(ValueRef::Type(reference));
            return;
        }
        if let Some(reference) = self.local.lookup_attribute("", &dotted) {
            id.reference = Some(ValueRef::Attribute(reference));
            return;
        }
        if id.names.len() >= 2 {
            let rest = id.names[1..].join(".");
            if let Some(reference) = self.local.lookup_type(&id.names[0], &rest) {
                id.reference = Some(ValueRef::Type(reference));
                return;
            }
            if let Some(reference) = self.local.lookup_attribute(&id.names[0], &rest) {
                id.reference = Some(ValueRef::Attribute(reference));
                return;
            }
        }
        self.report(
            ErrorCode::UnknownIdentifier,
            format!("unknown identifier `{dotted}`"),
            id.loc,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Value;
    use crate::lower;
    use crate::parse;
    use crate::uid;

    fn compile_into(table: &GlobalSymbols, uri: &str, src: &str) -> Module {
        let reporter = Reporter::new();
        let ast = parse::parse(uri, src.as_bytes(), &reporter).unwrap();
        let mut module = lower::lower(&ast, &reporter).unwrap();
        uid::complete_uids(&mut module).unwrap();
        table.collect(&module, &reporter).unwrap();
        assert!(reporter.is_empty(), "{:?}", reporter.diagnostics());
        module
    }

    #[test]
    fn test_link_resolves_builtins_and_locals() {
        let table = GlobalSymbols::new();
        let mut module = compile_into(
            &table,
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             struct Foo {\n  a :Bool\n  b :Foo\n  c :List<:Text>\n}\n",
        );
        let reporter = Reporter::new();
        link(&mut module, &table, &reporter);
        assert!(reporter.is_empty(), "{:?}", reporter.diagnostics());

        let fields = &module.structs[0].fields;
        assert_eq!(fields[0].ty.reference(), Some(BuiltinType::Bool.reference()));
        assert_eq!(fields[1].ty.reference(), Some(module.structs[0].reference));
        let TypeSpecifier::Resolved { reference, parameters } = &fields[2].ty else {
            panic!("expected resolved list");
        };
        assert_eq!(*reference, BuiltinType::List.reference());
        assert_eq!(parameters[0].reference(), Some(BuiltinType::Text.reference()));
    }

    #[test]
    fn test_link_imports_and_dot_imports() {
        let table = GlobalSymbols::new();
        let mut lib = compile_into(
            &table,
            "/lib.mgdl",
            "syntax = \"microglot0\"\nstruct Widget {\n  a :Bool\n}\nconst Limit :Int32 = 5\n",
        );
        let mut module = compile_into(
            &table,
            "/app.mgdl",
            "syntax = \"microglot0\"\n\
             import \"/lib.mgdl\" as lib\n\
             import \"/lib.mgdl\" as .\n\
             struct App {\n  w :lib.Widget\n  v :Widget\n}\n\
             const Copy :Int32 = lib.Limit\n",
        );
        let reporter = Reporter::new();
        link(&mut lib, &table, &reporter);
        link(&mut module, &table, &reporter);
        assert!(reporter.is_empty(), "{:?}", reporter.diagnostics());

        let widget = lib.structs[0].reference;
        assert_eq!(module.structs[0].fields[0].ty.reference(), Some(widget));
        assert_eq!(module.structs[0].fields[1].ty.reference(), Some(widget));
        let Value::Identifier(id) = &module.constants[0].value else {
            panic!("expected identifier");
        };
        assert_eq!(id.reference, Some(ValueRef::Type(lib.constants[0].reference)));
    }

    #[test]
    fn test_link_enumerant_identifier() {
        let table = GlobalSymbols::new();
        let mut module = compile_into(
            &table,
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             enum Color { Red Green }\n\
             struct Conf {\n  c :Color = Color.Red\n}\n",
        );
        let reporter = Reporter::new();
        link(&mut module, &table, &reporter);
        assert!(reporter.is_empty(), "{:?}", reporter.diagnostics());
        let Some(Value::Identifier(id)) = &module.structs[0].fields[0].default else {
            panic!("expected identifier default");
        };
        assert_eq!(
            id.reference,
            Some(ValueRef::Attribute(module.enums[0].enumerants[0].reference))
        );
    }

    #[test]
    fn test_link_unknowns_are_reported_and_linking_continues() {
        let table = GlobalSymbols::new();
        let mut module = compile_into(
            &table,
            "/a.mgdl",
            "syntax = \"microglot0\"\n\
             import \"/nonexistent.mgdl\" as n\n\
             struct Foo {\n  a :Missing\n  b :Bool\n}\n\
             const C :Int32 = missing_name\n",
        );
        let reporter = Reporter::new();
        link(&mut module, &table, &reporter);
        let mut codes: Vec<_> = reporter.diagnostics().iter().map(|d| d.code).collect();
        codes.sort();
        assert_eq!(
            codes,
            vec![
                ErrorCode::UnknownImport,
                ErrorCode::UnknownType,
                ErrorCode::UnknownIdentifier
            ]
        );
        // the rest of the module still linked
        assert_eq!(
            module.structs[0].fields[1].ty.reference(),
            Some(BuiltinType::Bool.reference())
        );
    }

    #[test]
    fn test_link_list_arity_error() {
        let table = GlobalSymbols::new();
        let mut module = compile_into(
            &table,
            "/a.mgdl",
            "syntax = \"microglot0\"\nstruct Foo {\n  xs :List\n}\n",
        );
        let reporter = Reporter::new();
        link(&mut module, &table, &reporter);
        assert_eq!(reporter.diagnostics()[0].code, ErrorCode::TypeParameterError);
        // resolved regardless so downstream passes see the reference
        assert!(module.structs[0].fields[0].ty.is_resolved());
    }

    #[test]
    fn test_protobuf_scope_search() {
        let table = GlobalSymbols::new();
        // hand-build a promoted PDL module: package pkg, Outer with nested
        // Inner promoted to Outer_Inner
        let reporter = Reporter::new();
        let ast = parse::parse(
            "/p.proto.mgdl",
            b"syntax = \"microglot0\"\n\
              struct Outer {\n  a :Bool\n}\n\
              struct Outer_Inner {\n  b :Bool\n}\n",
            &reporter,
        )
        .unwrap();
        let mut module = lower::lower(&ast, &reporter).unwrap();
        module.protobuf_package = Some("pkg".to_string());
        module
            .pdl_rewrites
            .entry("Outer".to_string())
            .or_default()
            .insert("Inner".to_string(), "Outer_Inner".to_string());
        module
            .pdl_original_names
            .insert("Outer_Inner".to_string(), "Outer.Inner".to_string());
        // Outer.a references nested Inner the protobuf way
        module.structs[0].fields[0].ty =
            TypeSpecifier::Forward(ForwardReference::Protobuf {
                name: "Inner".to_string(),
                loc: Location::default(),
            });
        // Outer_Inner.b references Outer through the package
        module.structs[1].fields[0].ty =
            TypeSpecifier::Forward(ForwardReference::Protobuf {
                name: "pkg.Outer".to_string(),
                loc: Location::default(),
            });
        uid::complete_uids(&mut module).unwrap();
        table.collect(&module, &reporter).unwrap();

        link(&mut module, &table, &reporter);
        assert!(reporter.is_empty(), "{:?}", reporter.diagnostics());
        assert_eq!(
            module.structs[0].fields[0].ty.reference(),
            Some(module.structs[1].reference)
        );
        assert_eq!(
            module.structs[1].fields[0].ty.reference(),
            Some(module.structs[0].reference)
        );
    }
}
