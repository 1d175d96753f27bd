//! Environment-variable readers shared by the `from_env` constructors.
//!
//! Unparseable values fall back to the default with a warning rather than
//! failing startup; `require` is for the few settings that have no default.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read and parse `key`, falling back to `default` when unset or invalid.
pub fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment value");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a boolean flag. Anything other than `false`/`0` counts as true.
pub fn flag_or(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| {
            let s = s.trim().to_lowercase();
            s != "false" && s != "0"
        })
        .unwrap_or(default)
}

/// Read a string, falling back to `default`.
pub fn string_or(key: &str, default: impl Into<String>) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

/// Read a required string.
pub fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingRequired {
        field: key.to_string(),
    })
}
