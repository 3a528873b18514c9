//! Canonical string forms for values written by unencrypted store generations.
//!
//! Older generations stored numbers, booleans and string sets natively. The
//! encrypted layout only holds strings, so each legacy value is converted
//! once, during migration:
//!
//! | stored      | canonical string                         |
//! |-------------|------------------------------------------|
//! | `Text`      | unchanged                                |
//! | `Integer`   | decimal (`-12`)                          |
//! | `Float`     | shortest round-trip decimal (`2.5`, `3`) |
//! | `Boolean`   | `true` / `false`                         |
//! | `TextSet`   | JSON array of the sorted members         |
//!
//! Sets are JSON-encoded rather than joined with a delimiter so members that
//! contain commas (or any other character) survive unchanged; use
//! [`decode_text_set`] to get the members back.

use std::collections::BTreeSet;

use cellar_core::storage::StoredValue;

use crate::upgrade::MigrationError;

/// Canonical string form of a legacy value stored under `key`.
pub fn canonicalize(key: &str, value: &StoredValue) -> Result<String, MigrationError> {
    match value {
        StoredValue::Text(text) => Ok(text.clone()),
        StoredValue::Integer(n) => Ok(n.to_string()),
        StoredValue::Float(f) if f.is_finite() => Ok(f.to_string()),
        StoredValue::Float(_) => Err(MigrationError::Coerce {
            key: key.to_string(),
            reason: "non-finite float".to_string(),
        }),
        StoredValue::Boolean(b) => Ok(b.to_string()),
        StoredValue::TextSet(members) => {
            serde_json::to_string(members).map_err(|e| MigrationError::Coerce {
                key: key.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Members of a string set migrated by [`canonicalize`].
pub fn decode_text_set(canonical: &str) -> Result<BTreeSet<String>, serde_json::Error> {
    serde_json::from_str(canonical)
}
