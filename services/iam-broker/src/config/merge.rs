//! Deep merge of YAML configuration documents.
//!
//! Later documents overlay earlier ones: maps merge recursively, sequences
//! concatenate (overlay appended to base), scalars overlay-win. A key whose
//! base and overlay values differ in kind fails the load with the dotted
//! path to the collision.

use serde_yaml::Value;

use crate::config::ConfigError;

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "?".to_string()),
    }
}

/// Merge `overlay` into `base`, returning the combined tree.
pub fn deep_merge(base: Value, overlay: Value) -> Result<Value, ConfigError> {
    merge_at(base, overlay, String::new())
}

fn merge_at(base: Value, overlay: Value, path: String) -> Result<Value, ConfigError> {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let label = key_label(&key);
                let child_path = if path.is_empty() {
                    label
                } else {
                    format!("{path}.{label}")
                };
                match base_map.remove(&key) {
                    Some(base_value) => {
                        let merged = merge_at(base_value, overlay_value, child_path)?;
                        base_map.insert(key, merged);
                    }
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
            Ok(Value::Mapping(base_map))
        }
        (Value::Sequence(mut base_seq), Value::Sequence(overlay_seq)) => {
            base_seq.extend(overlay_seq);
            Ok(Value::Sequence(base_seq))
        }
        (base, overlay) => {
            let base_kind = kind_of(&base);
            let overlay_kind = kind_of(&overlay);
            if base_kind == overlay_kind {
                return Ok(overlay);
            }
            Err(ConfigError::MergeConflict {
                path: if path.is_empty() {
                    "<root>".to_string()
                } else {
                    path
                },
                base_kind,
                overlay_kind,
            })
        }
    }
}
