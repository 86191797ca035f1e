//! ent-config
//!
//! Layered YAML configuration: documents are merged in order (later
//! overrides earlier), converted to JSON, canonicalised and hashed so a
//! running store can report exactly which configuration it booted with.

use std::fs;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

mod consumption;
mod secrets;
mod store_config;

pub use consumption::{report_unused_keys, UnusedKeyPolicy, UnusedKeyReport, CONSUMED_POINTERS};
pub use store_config::{CatalogEntry, StoreConfig};

/// The effective configuration after merging every layer.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Hex SHA-256 of `canonical_json`.
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    pub fn store_config(&self) -> Result<StoreConfig> {
        StoreConfig::from_config_json(&self.config_json)
    }
}

/// Read each path and merge them base first.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|path| fs::read_to_string(path).with_context(|| format!("read config layer {path}")))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Map::new());
    for (idx, doc) in yaml_docs.iter().enumerate() {
        let layer = parse_layer(doc).with_context(|| format!("config layer #{idx}"))?;
        // An empty document parses as null and contributes nothing.
        if !layer.is_null() {
            overlay(&mut merged, layer);
        }
    }

    secrets::reject_secret_literals(&merged)?;

    // serde_json's default map keeps keys sorted, so the compact form is
    // canonical regardless of the order keys appeared in the YAML.
    let canonical_json = serde_json::to_string(&merged).context("serialize merged config")?;
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));

    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn parse_layer(doc: &str) -> Result<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(doc).context("invalid yaml")?;
    serde_json::to_value(yaml).context("yaml is not representable as json")
}

/// Objects merge key by key; anything else in `top` replaces `base`.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base_map), Value::Object(top_map)) => {
            for (key, value) in top_map {
                match base_map.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Every scalar in `v` with its JSON pointer. Empty containers have none.
pub(crate) fn leaves(v: &Value) -> Vec<(String, &Value)> {
    fn walk<'a>(v: &'a Value, ptr: String, out: &mut Vec<(String, &'a Value)>) {
        match v {
            Value::Object(map) => {
                for (key, child) in map {
                    let token = key.replace('~', "~0").replace('/', "~1");
                    walk(child, format!("{ptr}/{token}"), out);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    walk(child, format!("{ptr}/{i}"), out);
                }
            }
            _ => out.push((if ptr.is_empty() { "/".to_string() } else { ptr }, v)),
        }
    }

    let mut out = Vec::new();
    walk(v, String::new(), &mut out);
    out
}
