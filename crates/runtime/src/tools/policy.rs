//! Layered tool policies loaded from a JSON file.
//!
//! File shape:
//! `{default:{options}, tenants:{<tenant>:{default:{options}|options,
//! tools:{<type>:{options, names:{<name>:{options}}}}}}}`.
//! Merge order per invocation: global → tenant → tool-type → tool-name →
//! request options, later layers overriding earlier ones.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};

const POLICY_TTL: Duration = Duration::from_secs(15);

/// Per-layer options plus the merged result, as exposed by the preview
/// endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PolicyLayers {
    pub global: Map<String, Value>,
    pub tenant: Map<String, Value>,
    #[serde(rename = "type")]
    pub tool_type: Map<String, Value>,
    pub name: Map<String, Value>,
    pub request: Map<String, Value>,
    pub merged: Map<String, Value>,
}

pub struct PolicyStore {
    path: PathBuf,
    cache: Mutex<(Option<Instant>, Value)>,
}

fn options_of(node: Option<&Value>) -> Map<String, Value> {
    node.and_then(|n| n.get("options"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn merge_into(base: &mut Map<String, Value>, layer: &Map<String, Value>) {
    for (k, v) in layer {
        base.insert(k.clone(), v.clone());
    }
}

impl PolicyStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new((None, Value::Object(Map::new()))),
        }
    }

    /// Load the policy document, honoring the short in-process TTL. A missing
    /// or malformed file yields an empty policy.
    fn load(&self, force: bool) -> Value {
        let mut cache = self.cache.lock();
        if !force {
            if let Some(loaded_at) = cache.0 {
                if loaded_at.elapsed() < POLICY_TTL {
                    return cache.1.clone();
                }
            }
        }
        let data = match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %self.path.display(), "policy file is not a JSON object");
                    Value::Object(Map::new())
                }
            },
            Err(_) => Value::Object(Map::new()),
        };
        *cache = (Some(Instant::now()), data.clone());
        data
    }

    /// Drop the TTL cache so the next lookup re-reads the file.
    pub fn force_reload(&self) {
        self.load(true);
    }

    pub fn layers(
        &self,
        tenant: &str,
        tool_type: &str,
        tool_name: &str,
        request_options: &Map<String, Value>,
    ) -> PolicyLayers {
        let policy = self.load(false);

        let global = options_of(policy.get("default"));

        let tenant_node = policy.get("tenants").and_then(|t| t.get(tenant));
        // A tenant node may carry its options directly or nest them under
        // "default".
        let tenant_opts = match tenant_node.and_then(|n| n.get("default")) {
            Some(default_node) => options_of(Some(default_node)),
            None => options_of(tenant_node),
        };

        let type_node = tenant_node
            .and_then(|n| n.get("tools"))
            .and_then(|tools| tools.get(tool_type));
        let type_opts = options_of(type_node);

        let name_node = type_node
            .and_then(|n| n.get("names"))
            .and_then(|names| names.get(tool_name));
        let name_opts = options_of(name_node);

        let mut merged = Map::new();
        merge_into(&mut merged, &global);
        merge_into(&mut merged, &tenant_opts);
        merge_into(&mut merged, &type_opts);
        merge_into(&mut merged, &name_opts);
        merge_into(&mut merged, request_options);

        PolicyLayers {
            global,
            tenant: tenant_opts,
            tool_type: type_opts,
            name: name_opts,
            request: request_options.clone(),
            merged,
        }
    }

    pub fn merged_options(
        &self,
        tenant: &str,
        tool_type: &str,
        tool_name: &str,
        request_options: &Map<String, Value>,
    ) -> Map<String, Value> {
        self.layers(tenant, tool_type, tool_name, request_options).merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn store_with(policy: Value) -> (tempfile::TempDir, PolicyStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools_policies.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(policy.to_string().as_bytes()).unwrap();
        (dir, PolicyStore::new(path))
    }

    #[test]
    fn merge_precedence_follows_layer_order() {
        let (_dir, store) = store_with(json!({
            "default": {"options": {"resp_max_chars": 100, "timeout_ms": 1000}},
            "tenants": {
                "acme": {
                    "default": {"options": {"resp_max_chars": 200}},
                    "tools": {
                        "http_get": {
                            "options": {"resp_max_chars": 300},
                            "names": {
                                "simple": {"options": {"resp_max_chars": 4096}}
                            }
                        }
                    }
                }
            }
        }));

        let merged = store.merged_options("acme", "http_get", "simple", &Map::new());
        assert_eq!(merged["resp_max_chars"], 4096);
        assert_eq!(merged["timeout_ms"], 1000);

        // Request options override everything.
        let mut request = Map::new();
        request.insert("resp_max_chars".into(), json!(1000));
        let merged = store.merged_options("acme", "http_get", "simple", &request);
        assert_eq!(merged["resp_max_chars"], 1000);

        // Other tenants only see the global layer.
        let merged = store.merged_options("other", "http_get", "simple", &Map::new());
        assert_eq!(merged["resp_max_chars"], 100);
    }

    #[test]
    fn tenant_options_without_default_node() {
        let (_dir, store) = store_with(json!({
            "tenants": {"acme": {"options": {"retry_max": 2}}}
        }));
        let merged = store.merged_options("acme", "http_get", "simple", &Map::new());
        assert_eq!(merged["retry_max"], 2);
    }

    #[test]
    fn missing_file_yields_empty_policy() {
        let store = PolicyStore::new(PathBuf::from("/nonexistent/policies.json"));
        let layers = store.layers("t", "http_get", "simple", &Map::new());
        assert!(layers.merged.is_empty());
    }

    #[test]
    fn force_reload_bypasses_ttl_cache() {
        let (dir, store) = store_with(json!({
            "default": {"options": {"retry_max": 1}}
        }));
        assert_eq!(store.merged_options("t", "x", "y", &Map::new())["retry_max"], 1);

        let path = dir.path().join("tools_policies.json");
        std::fs::write(&path, json!({"default": {"options": {"retry_max": 9}}}).to_string())
            .unwrap();

        // Within the TTL the cached value still wins.
        assert_eq!(store.merged_options("t", "x", "y", &Map::new())["retry_max"], 1);
        store.force_reload();
        assert_eq!(store.merged_options("t", "x", "y", &Map::new())["retry_max"], 9);
    }
}
