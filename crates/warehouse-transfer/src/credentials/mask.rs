//! Secret masking for credential maps.

use serde_json::Value;

use super::CredentialMap;

/// Replacement text for masked values.
pub const MASK: &str = "****";

const SECRET_MARKERS: [&str; 4] = ["password", "key", "token", "secret"];

/// Whether a credential key names a secret.
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SECRET_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Copy of `map` with every secret value replaced by [`MASK`].
///
/// Nested objects and arrays are masked recursively; a secret key whose value
/// is itself an object or array is masked as a whole.
pub fn mask_credentials(map: &CredentialMap) -> CredentialMap {
    map.iter()
        .map(|(key, value)| {
            let masked = if is_secret_key(key) {
                Value::String(MASK.to_string())
            } else {
                mask_value(value)
            };
            (key.clone(), masked)
        })
        .collect()
}

fn mask_value(value: &Value) -> Value {
    match value {
        Value::Object(inner) => Value::Object(mask_credentials(inner)),
        Value::Array(items) => Value::Array(items.iter().map(mask_value).collect()),
        other => other.clone(),
    }
}
