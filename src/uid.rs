use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::ir::Module;

/// Widest attribute UID: the reserved PDL-compatible field-number width.
pub const MAX_ATTRIBUTE_UID: u64 = 0x1FFF_FFFF;

/// Field numbers reserved by PDL; generated attribute UIDs re-hash past it
/// and explicit ones are rejected.
pub const RESERVED_RANGE: std::ops::RangeInclusive<u64> = 19000..=19999;

/// A corrupted descriptor surfaced during UID completion. Never recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UidError {
    #[error("explicit uid @{uid} on `{name}` does not fit the 29-bit attribute width")]
    AttributeUidTooWide { name: String, uid: u64 },
    #[error("explicit uid @{uid} on `{name}` falls in the reserved range 19000-19999")]
    AttributeUidReserved { name: String, uid: u64 },
    #[error("uid @{uid} on `{name}` is already in use in the same scope")]
    DuplicateUid { name: String, uid: u64 },
}

/// `low64(SHA256(parent_uid_le || name_utf8))`, re-hashed while zero.
#[must_use]
pub fn declaration_uid(parent_uid: u64, name: &str) -> u64 {
    let mut digest = hash(parent_uid, name);
    loop {
        let uid = low64(&digest);
        if uid != 0 {
            return uid;
        }
        digest = Sha256::digest(digest);
    }
}

/// Attribute flavor of [`declaration_uid`]: masked to 29 bits and re-hashed
/// while zero or inside the reserved PDL range.
#[must_use]
pub fn attribute_uid(parent_uid: u64, name: &str) -> u64 {
    let mut digest = hash(parent_uid, name);
    loop {
        let uid = low64(&digest) & MAX_ATTRIBUTE_UID;
        if uid != 0 && !RESERVED_RANGE.contains(&uid) {
            return uid;
        }
        digest = Sha256::digest(digest);
    }
}

fn hash(parent_uid: u64, name: &str) -> sha2::digest::Output<Sha256> {
    let mut hasher = Sha256::new();
    hasher.update(parent_uid.to_le_bytes());
    hasher.update(name.as_bytes());
    hasher.finalize()
}

fn low64(digest: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Tracks UIDs handed out within one scope.
struct Scope {
    used: HashSet<u64>,
}

impl Scope {
    fn new() -> Self {
        Self {
            used: HashSet::new(),
        }
    }

    /// Pre-assigned duplicates are a corrupted descriptor; generated
    /// duplicates stem from duplicate names and are left for the symbol
    /// collector to report as name collisions.
    fn claim(&mut self, name: &str, uid: u64, explicit: bool) -> Result<u64, UidError> {
        if !self.used.insert(uid) && explicit {
            return Err(UidError::DuplicateUid {
                name: name.to_string(),
                uid,
            });
        }
        Ok(uid)
    }

    fn type_uid(&mut self, parent: u64, name: &str, explicit: u64) -> Result<u64, UidError> {
        if explicit != 0 {
            self.claim(name, explicit, true)
        } else {
            self.claim(name, declaration_uid(parent, name), false)
        }
    }

    fn attr_uid(&mut self, parent: u64, name: &str, explicit: u64) -> Result<u64, UidError> {
        if explicit != 0 {
            if explicit > MAX_ATTRIBUTE_UID {
                return Err(UidError::AttributeUidTooWide {
                    name: name.to_string(),
                    uid: explicit,
                });
            }
            if RESERVED_RANGE.contains(&explicit) {
                return Err(UidError::AttributeUidReserved {
                    name: name.to_string(),
                    uid: explicit,
                });
            }
            self.claim(name, explicit, true)
        } else {
            self.claim(name, attribute_uid(parent, name), false)
        }
    }
}

/// Stamps every unassigned (zero) reference in `module` with a deterministic
/// UID derived from its parent UID and name. Explicitly provided UIDs are
/// preserved and validated.
pub fn complete_uids(module: &mut Module) -> Result<(), UidError> {
    if module.uid == 0 {
        module.uid = declaration_uid(0, &module.uri);
    }
    let module_uid = module.uid;
    let mut types = Scope::new();

    for st in &mut module.structs {
        st.reference.module_uid = module_uid;
        st.reference.type_uid =
            types.type_uid(module_uid, &st.name.name, st.reference.type_uid)?;
        let type_uid = st.reference.type_uid;
        let mut attrs = Scope::new();
        for field in &mut st.fields {
            field.reference.module_uid = module_uid;
            field.reference.type_uid = type_uid;
            field.reference.attribute_uid =
                attrs.attr_uid(type_uid, &field.name, field.reference.attribute_uid)?;
        }
        for union in &mut st.unions {
            union.reference.module_uid = module_uid;
            union.reference.type_uid = type_uid;
            union.reference.attribute_uid =
                attrs.attr_uid(type_uid, &union.name, union.reference.attribute_uid)?;
            for field in &mut union.fields {
                field.reference.module_uid = module_uid;
                field.reference.type_uid = type_uid;
                field.reference.attribute_uid =
                    attrs.attr_uid(type_uid, &field.name, field.reference.attribute_uid)?;
            }
        }
    }

    for en in &mut module.enums {
        en.reference.module_uid = module_uid;
        en.reference.type_uid = types.type_uid(module_uid, &en.name, en.reference.type_uid)?;
        let type_uid = en.reference.type_uid;
        let mut attrs = Scope::new();
        for e in &mut en.enumerants {
            e.reference.module_uid = module_uid;
            e.reference.type_uid = type_uid;
            e.reference.attribute_uid =
                attrs.attr_uid(type_uid, &e.name, e.reference.attribute_uid)?;
        }
    }

    for api in &mut module.apis {
        api.reference.module_uid = module_uid;
        api.reference.type_uid =
            types.type_uid(module_uid, &api.name.name, api.reference.type_uid)?;
        let type_uid = api.reference.type_uid;
        let mut attrs = Scope::new();
        for m in &mut api.methods {
            m.reference.module_uid = module_uid;
            m.reference.type_uid = type_uid;
            m.reference.attribute_uid =
                attrs.attr_uid(type_uid, &m.name, m.reference.attribute_uid)?;
        }
    }

    for sdk in &mut module.sdks {
        sdk.reference.module_uid = module_uid;
        sdk.reference.type_uid =
            types.type_uid(module_uid, &sdk.name.name, sdk.reference.type_uid)?;
        let type_uid = sdk.reference.type_uid;
        let mut attrs = Scope::new();
        for m in &mut sdk.methods {
            m.reference.module_uid = module_uid;
            m.reference.type_uid = type_uid;
            m.reference.attribute_uid =
                attrs.attr_uid(type_uid, &m.name, m.reference.attribute_uid)?;
            let attr_uid = m.reference.attribute_uid;
            let mut inputs = Scope::new();
            for input in &mut m.inputs {
                input.reference.module_uid = module_uid;
                input.reference.type_uid = type_uid;
                input.reference.attribute_uid = attr_uid;
                input.reference.input_uid = if input.reference.input_uid != 0 {
                    inputs.claim(&input.name, input.reference.input_uid, true)?
                } else {
                    inputs.claim(&input.name, declaration_uid(attr_uid, &input.name), false)?
                };
            }
        }
    }

    for c in &mut module.constants {
        c.reference.module_uid = module_uid;
        c.reference.type_uid = types.type_uid(module_uid, &c.name, c.reference.type_uid)?;
    }

    for ann in &mut module.annotations {
        ann.reference.module_uid = module_uid;
        ann.reference.type_uid = types.type_uid(module_uid, &ann.name, ann.reference.type_uid)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower;
    use crate::parse;
    use crate::report::Reporter;

    fn completed(src: &str) -> Module {
        let reporter = Reporter::new();
        let ast = parse::parse("/test.mgdl", src.as_bytes(), &reporter).unwrap();
        let mut module = lower::lower(&ast, &reporter).unwrap();
        complete_uids(&mut module).unwrap();
        module
    }

    #[test]
    fn test_deterministic_uids() {
        let src = "syntax = \"microglot0\"\n\
                   struct Foo {\n  a :Bool\n  b :Text\n}\n\
                   enum Color { Red Green }\n\
                   const N :Int32 = 1\n";
        let first = completed(src);
        let second = completed(src);
        assert_eq!(first, second);
        assert_ne!(first.uid, 0);
        assert_ne!(first.structs[0].reference.type_uid, 0);
        assert_ne!(first.structs[0].fields[0].reference.attribute_uid, 0);
        assert_eq!(first.structs[0].fields[0].reference.module_uid, first.uid);
    }

    #[test]
    fn test_explicit_uids_preserved() {
        let module = completed(
            "syntax = \"microglot0\"\nmodule = @77\nstruct Foo {\n  a :Bool @5\n} @9\n",
        );
        assert_eq!(module.uid, 77);
        assert_eq!(module.structs[0].reference.type_uid, 9);
        assert_eq!(module.structs[0].fields[0].reference.attribute_uid, 5);
    }

    #[test]
    fn test_attribute_uids_fit_29_bits_and_avoid_reserved() {
        for name in ["a", "b", "field_name", "x1", "y2", "zz_top", "value", "other"] {
            let uid = attribute_uid(12345, name);
            assert!(uid > 0 && uid <= MAX_ATTRIBUTE_UID);
            assert!(!RESERVED_RANGE.contains(&uid));
        }
    }

    #[test]
    fn test_distinct_parents_distinct_uids() {
        assert_ne!(declaration_uid(1, "Foo"), declaration_uid(2, "Foo"));
        assert_ne!(declaration_uid(1, "Foo"), declaration_uid(1, "Bar"));
    }

    #[test]
    fn test_explicit_reserved_attribute_uid_rejected() {
        let reporter = Reporter::new();
        let ast = parse::parse(
            "/test.mgdl",
            b"syntax = \"microglot0\"\nstruct Foo {\n  a :Bool @19500\n}\n",
            &reporter,
        )
        .unwrap();
        let mut module = lower::lower(&ast, &reporter).unwrap();
        let err = complete_uids(&mut module).unwrap_err();
        assert!(matches!(err, UidError::AttributeUidReserved { uid: 19500, .. }));
    }

    #[test]
    fn test_duplicate_explicit_uid_rejected() {
        let reporter = Reporter::new();
        let ast = parse::parse(
            "/test.mgdl",
            b"syntax = \"microglot0\"\nstruct Foo {\n  a :Bool @3\n  b :Bool @3\n}\n",
            &reporter,
        )
        .unwrap();
        let mut module = lower::lower(&ast, &reporter).unwrap();
        let err = complete_uids(&mut module).unwrap_err();
        assert!(matches!(err, UidError::DuplicateUid { uid: 3, .. }));
    }
}
