use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ent_reconcile::SelectionPolicy;
use ent_schemas::Product;

/// Typed view over the effective config.
///
/// ```yaml
/// store:
///   product_ids: ["pro.annual", "pro.monthly"]
///   selection_policy: first_in_snapshot
/// cache:
///   path: ./data/entitlements.json
/// anomalies:
///   log_path: ./data/anomalies.jsonl
///   hash_chain: true
/// daemon:
///   addr: 127.0.0.1:8898
/// catalog:
///   - { id: pro.annual, display_name: Pro Annual, price_micros: 49990000, currency: USD, period_days: 365 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreConfig {
    pub product_ids: Vec<String>,
    pub selection_policy: SelectionPolicy,
    pub cache_path: String,
    pub anomaly_log_path: String,
    pub hash_chain: bool,
    pub daemon_addr: String,
    /// Seed catalog for the paper provider.
    pub catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub price_micros: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Subscription length granted by a purchase; absent = never expires.
    #[serde(default)]
    pub period_days: Option<i64>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl CatalogEntry {
    pub fn to_product(&self) -> Product {
        let mut product = Product::new(
            self.id.clone(),
            self.display_name.clone(),
            self.price_micros,
            self.currency.clone(),
        );
        product.description = self.description.clone();
        product
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            product_ids: vec!["pro.annual".to_string(), "pro.monthly".to_string()],
            selection_policy: SelectionPolicy::FirstInSnapshot,
            cache_path: "./data/entitlements.json".to_string(),
            anomaly_log_path: "./data/anomalies.jsonl".to_string(),
            hash_chain: true,
            daemon_addr: "127.0.0.1:8898".to_string(),
            catalog: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Extract from the merged config JSON. Missing keys fall back to
    /// [`StoreConfig::default`]; present keys with the wrong type are errors.
    pub fn from_config_json(v: &Value) -> Result<Self> {
        let mut cfg = StoreConfig::default();

        if let Some(ids) = v.pointer("/store/product_ids") {
            let ids: Vec<String> = serde_json::from_value(ids.clone())
                .context("/store/product_ids must be a list of strings")?;
            if ids.is_empty() {
                return Err(anyhow!("/store/product_ids must not be empty"));
            }
            cfg.product_ids = ids;
        }

        if let Some(p) = v.pointer("/store/selection_policy") {
            let raw = p
                .as_str()
                .ok_or_else(|| anyhow!("/store/selection_policy must be a string"))?;
            cfg.selection_policy = SelectionPolicy::parse(raw).ok_or_else(|| {
                anyhow!(
                    "invalid /store/selection_policy '{}'. expected one of: \
                     first_in_snapshot | latest_expiring | soonest_expiring",
                    raw
                )
            })?;
        }

        if let Some(s) = read_str(v, "/cache/path")? {
            cfg.cache_path = s;
        }
        if let Some(s) = read_str(v, "/anomalies/log_path")? {
            cfg.anomaly_log_path = s;
        }
        if let Some(b) = v.pointer("/anomalies/hash_chain") {
            cfg.hash_chain = b
                .as_bool()
                .ok_or_else(|| anyhow!("/anomalies/hash_chain must be a bool"))?;
        }
        if let Some(s) = read_str(v, "/daemon/addr")? {
            cfg.daemon_addr = s;
        }

        if let Some(c) = v.pointer("/catalog") {
            cfg.catalog = serde_json::from_value(c.clone())
                .context("/catalog must be a list of catalog entries")?;
        }

        Ok(cfg)
    }
}

fn read_str(v: &Value, ptr: &str) -> Result<Option<String>> {
    match v.pointer(ptr) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(anyhow!("{ptr} must be a string")),
    }
}
