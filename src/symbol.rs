use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::ir::{AttributeReference, Module, SdkInputReference, TypeReference};
use crate::report::{Diagnostic, ErrorCode, Reporter};

/// Per-module slice of the global table, as handed to the linker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModuleSymbols {
    pub module_uid: u64,
    /// Declaration name → reference.
    pub types: HashMap<String, TypeReference>,
    /// Type name → attribute name → reference.
    pub attributes: HashMap<String, HashMap<String, AttributeReference>>,
    /// SDK name → method name → input name → reference.
    pub inputs: HashMap<String, HashMap<String, HashMap<String, SdkInputReference>>>,
    /// Protobuf fully-qualified name → reference, for modules carrying a
    /// protobuf package. Promoted types appear under both spellings.
    pub protobuf_names: HashMap<String, TypeReference>,
}

#[derive(Debug, Default)]
struct Tables {
    /// uri → module UID.
    modules: HashMap<String, u64>,
    /// module UID → uri, for cross-module collision detection.
    module_uids: HashMap<u64, String>,
    symbols: HashMap<String, ModuleSymbols>,
}

/// Cross-module symbol index with collision detection.
///
/// One mutex guards all maps; it is held for the whole `collect` or
/// `snapshot` call and never across I/O.
#[derive(Debug, Default)]
pub struct GlobalSymbols {
    inner: Mutex<Tables>,
}

impl GlobalSymbols {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every declaration of `module`.
    ///
    /// All collisions are fatal at the file level: the table is left
    /// untouched and the first collision is returned after being reported.
    /// A repeat call for an already-collected URI is an error.
    pub fn collect(&self, module: &Module, reporter: &Reporter) -> Result<(), Diagnostic> {
        let staged = match stage(module) {
            Ok(staged) => staged,
            Err(diagnostic) => {
                let _ = reporter.report(diagnostic.clone());
                return Err(diagnostic);
            }
        };

        let mut tables = self.inner.lock();
        if tables.modules.contains_key(&module.uri) {
            let diagnostic = Diagnostic::new(
                ErrorCode::UidCollision,
                format!("module `{}` was already collected", module.uri),
            )
            .in_file(module.uri.clone());
            let _ = reporter.report(diagnostic.clone());
            return Err(diagnostic);
        }
        if let Some(existing) = tables.module_uids.get(&module.uid) {
            let diagnostic = Diagnostic::new(
                ErrorCode::UidCollision,
                format!(
                    "module UID collision: `{}` and `{existing}` share uid @{}",
                    module.uri, module.uid
                ),
            )
            .in_file(module.uri.clone());
            let _ = reporter.report(diagnostic.clone());
            return Err(diagnostic);
        }

        tables.modules.insert(module.uri.clone(), module.uid);
        tables.module_uids.insert(module.uid, module.uri.clone());
        tables.symbols.insert(module.uri.clone(), staged);
        Ok(())
    }

    /// UID of an already-collected module.
    #[must_use]
    pub fn module_uid(&self, uri: &str) -> Option<u64> {
        self.inner.lock().modules.get(uri).copied()
    }

    /// Clone of a module's symbol maps; `None` when the URI was never
    /// collected.
    #[must_use]
    pub fn snapshot(&self, uri: &str) -> Option<ModuleSymbols> {
        self.inner.lock().symbols.get(uri).cloned()
    }
}

/// Builds the module's symbol maps up front so a collision commits nothing.
fn stage(module: &Module) -> Result<ModuleSymbols, Diagnostic> {
    let mut staged = ModuleSymbols {
        module_uid: module.uid,
        ..ModuleSymbols::default()
    };
    let mut type_uids: HashSet<u64> = HashSet::new();

    let mut insert_type = |staged: &mut ModuleSymbols,
                           type_uids: &mut HashSet<u64>,
                           name: &str,
                           reference: TypeReference|
     -> Result<(), Diagnostic> {
        if staged.types.contains_key(name) {
            return Err(Diagnostic::new(
                ErrorCode::NameCollision,
                format!("`{name}` is declared more than once in `{}`", module.uri),
            )
            .in_file(module.uri.clone()));
        }
        if !type_uids.insert(reference.type_uid) {
            return Err(Diagnostic::new(
                ErrorCode::UidCollision,
                format!("uid @{} is used more than once in `{}`", reference.type_uid, module.uri),
            )
            .in_file(module.uri.clone()));
        }
        staged.types.insert(name.to_string(), reference);
        Ok(())
    };

    fn insert_attribute(
        uri: &str,
        attrs: &mut HashMap<String, AttributeReference>,
        attr_uids: &mut HashSet<u64>,
        type_name: &str,
        name: &str,
        reference: AttributeReference,
    ) -> Result<(), Diagnostic> {
        if attrs.contains_key(name) {
            return Err(Diagnostic::new(
                ErrorCode::NameCollision,
                format!("`{type_name}.{name}` is declared more than once in `{uri}`"),
            )
            .in_file(uri.to_string()));
        }
        if !attr_uids.insert(reference.attribute_uid) {
            return Err(Diagnostic::new(
                ErrorCode::UidCollision,
                format!(
                    "uid @{} is used more than once in `{type_name}` in `{uri}`",
                    reference.attribute_uid
                ),
            )
            .in_file(uri.to_string()));
        }
        attrs.insert(name.to_string(), reference);
        Ok(())
    }

    for st in &module.structs {
        insert_type(&mut staged, &mut type_uids, &st.name.name, st.reference)?;
        let mut attrs = HashMap::new();
        let mut attr_uids = HashSet::new();
        for field in &st.fields {
            insert_attribute(
                &module.uri,
                &mut attrs,
                &mut attr_uids,
                &st.name.name,
                &field.name,
                field.reference,
            )?;
        }
        for union in &st.unions {
            insert_attribute(
                &module.uri,
                &mut attrs,
                &mut attr_uids,
                &st.name.name,
                &union.name,
                union.reference,
            )?;
            for field in &union.fields {
                insert_attribute(
                    &module.uri,
                    &mut attrs,
                    &mut attr_uids,
                    &st.name.name,
                    &field.name,
                    field.reference,
                )?;
            }
        }
        staged.attributes.insert(st.name.name.clone(), attrs);
    }

    for en in &module.enums {
        insert_type(&mut staged, &mut type_uids, &en.name, en.reference)?;
        let mut attrs = HashMap::new();
        let mut attr_uids = HashSet::new();
        for e in &en.enumerants {
            insert_attribute(
                &module.uri,
                &mut attrs,
                &mut attr_uids,
                &en.name,
                &e.name,
                e.reference,
            )?;
        }
        staged.attributes.insert(en.name.clone(), attrs);
    }

    for api in &module.apis {
        insert_type(&mut staged, &mut type_uids, &api.name.name, api.reference)?;
        let mut attrs = HashMap::new();
        let mut attr_uids = HashSet::new();
        for m in &api.methods {
            insert_attribute(
                &module.uri,
                &mut attrs,
                &mut attr_uids,
                &api.name.name,
                &m.name,
                m.reference,
            )?;
        }
        staged.attributes.insert(api.name.name.clone(), attrs);
    }

    for sdk in &module.sdks {
        insert_type(&mut staged, &mut type_uids, &sdk.name.name, sdk.reference)?;
        let mut attrs = HashMap::new();
        let mut attr_uids = HashSet::new();
        let mut methods = HashMap::new();
        for m in &sdk.methods {
            insert_attribute(
                &module.uri,
                &mut attrs,
                &mut attr_uids,
                &sdk.name.name,
                &m.name,
                m.reference,
            )?;
            let mut inputs = HashMap::new();
            for input in &m.inputs {
                if inputs.insert(input.name.clone(), input.reference).is_some() {
                    return Err(Diagnostic::new(
                        ErrorCode::NameCollision,
                        format!(
                            "input `{}` of `{}.{}` is declared more than once in `{}`",
                            input.name, sdk.name.name, m.name, module.uri
                        ),
                    )
                    .in_file(module.uri.clone()));
                }
            }
            methods.insert(m.name.clone(), inputs);
        }
        staged.attributes.insert(sdk.name.name.clone(), attrs);
        staged.inputs.insert(sdk.name.name.clone(), methods);
    }

    for c in &module.constants {
        insert_type(&mut staged, &mut type_uids, &c.name, c.reference)?;
    }

    for ann in &module.annotations {
        insert_type(&mut staged, &mut type_uids, &ann.name, ann.reference)?;
    }

    if let Some(package) = &module.protobuf_package {
        let names: Vec<(String, TypeReference)> = staged
            .types
            .iter()
            .map(|(name, reference)| (name.clone(), *reference))
            .collect();
        for (name, reference) in names {
            staged
                .protobuf_names
                .insert(qualify(package, &name), reference);
            if let Some(original) = module.pdl_original_names.get(&name) {
                staged
                    .protobuf_names
                    .insert(qualify(package, original), reference);
            }
        }
    }

    Ok(staged)
}

fn qualify(package: &str, name: &str) -> String {
    if package.is_empty() {
        name.to_string()
    } else {
        format!("{package}.{name}")
    }
}
