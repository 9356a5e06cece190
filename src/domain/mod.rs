//! Domain types for Tollbooth
//!
//! Validated identifiers, integer money, the hydrated gateway configuration
//! and the inbound request model. Nothing here performs I/O except loading
//! the config file.

pub mod gateway_config;
pub mod identifiers;
pub mod money;
pub mod request;

pub use gateway_config::*;
pub use identifiers::*;
pub use money::*;
pub use request::*;

use serde_json::Value;
use std::time::Duration;

/// Whole milliseconds of a duration, saturating at `u64::MAX`
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serialize a JSON value with object keys sorted at every level.
///
/// Used wherever a byte-stable form is hashed: config checksums and cache keys.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
