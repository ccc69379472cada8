//! Content-addressed keys for environment definitions.
//!
//! A definition is encoded into a canonical, type-tagged, length-prefixed
//! byte string and hashed with SHA-256. Configuration maps are already
//! sorted, so key insertion order never matters. `Int(1)` and `Float(1.0)`
//! encode differently; `-0.0` encodes as `0.0`. Non-finite floats are
//! rejected.

use sha2::{Digest, Sha256};

use vessel_types::{ConfigValue, EnvironmentDefinition, EnvironmentKey, VesselError};

const MAGIC: &[u8; 4] = b"VSEK";
const FORMAT_VERSION: u16 = 1;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_LIST: u8 = 5;

/// Key of a single definition. Used by the environment cache.
pub fn definition_key(definition: &EnvironmentDefinition) -> Result<EnvironmentKey, VesselError> {
    composed_key(std::slice::from_ref(definition))
}

/// Key of an ordered sequence of definitions. Used by the bridge pool.
///
/// Order matters: later definitions are layered on top of earlier ones.
pub fn composed_key(definitions: &[EnvironmentDefinition]) -> Result<EnvironmentKey, VesselError> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    write_u64(&mut buf, definitions.len() as u64);
    for definition in definitions {
        write_str(&mut buf, definition.kind());
        write_u64(&mut buf, definition.configuration().len() as u64);
        for (key, value) in definition.configuration() {
            write_str(&mut buf, key);
            write_value(&mut buf, key, value)?;
        }
    }
    Ok(hash_bytes(&buf))
}

fn hash_bytes(bytes: &[u8]) -> EnvironmentKey {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    EnvironmentKey(hasher.finalize().into())
}

fn write_u64(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(&n.to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u64(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn write_value(buf: &mut Vec<u8>, key: &str, value: &ConfigValue) -> Result<(), VesselError> {
    match value {
        ConfigValue::Null => buf.push(TAG_NULL),
        ConfigValue::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        ConfigValue::Int(n) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        ConfigValue::Float(f) => {
            if !f.is_finite() {
                return Err(VesselError::config(
                    key,
                    format!("value for '{key}' must be a finite number"),
                ));
            }
            // -0.0 and 0.0 compare equal and must hash equal.
            let normalized = if *f == 0.0 { 0.0f64 } else { *f };
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&normalized.to_bits().to_le_bytes());
        }
        ConfigValue::String(s) => {
            buf.push(TAG_STRING);
            write_str(buf, s);
        }
        ConfigValue::List(items) => {
            buf.push(TAG_LIST);
            write_u64(buf, items.len() as u64);
            for item in items {
                write_value(buf, key, item)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_types::Configuration;

    fn venv(requirements: &[&str]) -> EnvironmentDefinition {
        EnvironmentDefinition::new("virtualenv", Configuration::new())
            .with("requirements", requirements.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_equal_definitions_share_key() {
        let a = definition_key(&venv(&["numpy"])).unwrap();
        let b = definition_key(&venv(&["numpy"])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_insertion_order_is_irrelevant() {
        let a = EnvironmentDefinition::new("virtualenv", Configuration::new())
            .with("python_version", "3.12")
            .with("requirements", vec!["a"]);
        let b = EnvironmentDefinition::new("virtualenv", Configuration::new())
            .with("requirements", vec!["a"])
            .with("python_version", "3.12");
        assert_eq!(definition_key(&a).unwrap(), definition_key(&b).unwrap());
    }

    #[test]
    fn test_different_values_differ() {
        assert_ne!(
            definition_key(&venv(&["numpy"])).unwrap(),
            definition_key(&venv(&["pandas"])).unwrap()
        );
        assert_ne!(
            definition_key(&venv(&["a", "b"])).unwrap(),
            definition_key(&venv(&["b", "a"])).unwrap()
        );
    }

    #[test]
    fn test_kind_participates() {
        let a = EnvironmentDefinition::new("virtualenv", Configuration::new());
        let b = EnvironmentDefinition::new("conda", Configuration::new());
        assert_ne!(definition_key(&a).unwrap(), definition_key(&b).unwrap());
    }

    #[test]
    fn test_int_and_float_are_distinct() {
        let int = EnvironmentDefinition::new("local", Configuration::new()).with("n", 1i64);
        let float = EnvironmentDefinition::new("local", Configuration::new())
            .with("n", ConfigValue::Float(1.0));
        assert_ne!(definition_key(&int).unwrap(), definition_key(&float).unwrap());
    }

    #[test]
    fn test_negative_zero_normalized() {
        let pos = EnvironmentDefinition::new("local", Configuration::new())
            .with("x", ConfigValue::Float(0.0));
        let neg = EnvironmentDefinition::new("local", Configuration::new())
            .with("x", ConfigValue::Float(-0.0));
        assert_eq!(definition_key(&pos).unwrap(), definition_key(&neg).unwrap());
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let def = EnvironmentDefinition::new("local", Configuration::new())
            .with("x", ConfigValue::Float(f64::NAN));
        let err = definition_key(&def).unwrap_err();
        assert!(matches!(err, VesselError::Config { ref key, .. } if key == "x"));
    }

    #[test]
    fn test_composition_order_matters() {
        let a = venv(&["a"]);
        let b = EnvironmentDefinition::new("conda", Configuration::new());
        let ab = composed_key(&[a.clone(), b.clone()]).unwrap();
        let ba = composed_key(&[b, a]).unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_string_boundaries_are_unambiguous() {
        let a = EnvironmentDefinition::new("local", Configuration::new()).with("ab", "c");
        let b = EnvironmentDefinition::new("local", Configuration::new()).with("a", "bc");
        assert_ne!(definition_key(&a).unwrap(), definition_key(&b).unwrap());
    }
}
