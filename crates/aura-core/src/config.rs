//! Layered configuration
//!
//! Lookup precedence, highest first:
//! 1. Environment variables prefixed `AURA_` (`AURA_DATABASE_USER` becomes
//!    `database.user`)
//! 2. The global `config.yaml` at the project root
//! 3. Per-plugin `config.yaml` files, deep-merged in load order
//!
//! `get("a.b.c")` walks nested maps. Values are untyped `serde_json::Value`;
//! callers coerce.

use std::path::Path;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Errors raised while loading configuration files
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid YAML
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// File parsed but is not a mapping
    #[error("config file {0} must contain a top-level mapping")]
    NotAMapping(String),
}

const ENV_PREFIX: &str = "AURA_";

#[derive(Default)]
struct Layers {
    /// From `AURA_*` environment variables (highest precedence)
    env: Map<String, Value>,
    /// From the project-root `config.yaml`
    global: Map<String, Value>,
    /// Merged per-plugin defaults (lowest precedence)
    plans: Map<String, Value>,
}

/// Layered configuration store, cheap to clone and share
#[derive(Clone, Default)]
pub struct Config {
    layers: std::sync::Arc<RwLock<Layers>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the environment layer and the global `config.yaml` (if present).
    ///
    /// Called once at startup and again on plan reload.
    pub fn load_environment(&self, base_path: &Path) -> Result<(), ConfigError> {
        let mut env_layer = Map::new();
        for (key, value) in std::env::vars() {
            let upper = key.to_uppercase();
            if let Some(rest) = upper.strip_prefix(ENV_PREFIX) {
                let dotted = rest.to_lowercase().replace('_', ".");
                let parts: Vec<&str> = dotted.split('.').collect();
                set_nested(&mut env_layer, &parts, Value::String(value));
            }
        }
        if !env_layer.is_empty() {
            debug!(count = env_layer.len(), "loaded environment overrides");
        }

        let mut global = Map::new();
        let global_path = base_path.join("config.yaml");
        if global_path.is_file() {
            global = load_yaml_mapping(&global_path)?;
            info!(path = %global_path.display(), "loaded global config");
        }

        let mut layers = self.layers.write();
        layers.env = env_layer;
        layers.global = global;
        Ok(())
    }

    /// Merge a plugin's default config into the lowest layer.
    pub fn register_plan_config(&self, plan_name: &str, data: Map<String, Value>) {
        let mut layers = self.layers.write();
        for (key, value) in data {
            deep_merge(&mut layers.plans, key, value);
        }
        debug!(plan = plan_name, "registered plan config defaults");
    }

    /// Drop all plugin-layer defaults (used on reload).
    pub fn clear_plan_configs(&self) {
        self.layers.write().plans.clear();
    }

    /// Look up a dot-separated path across all layers.
    pub fn get(&self, key_path: &str) -> Option<Value> {
        let layers = self.layers.read();
        for layer in [&layers.env, &layers.global, &layers.plans] {
            if let Some(found) = get_nested(layer, key_path) {
                return Some(found);
            }
        }
        None
    }

    /// Look up a path, falling back to `default` when absent.
    pub fn get_or(&self, key_path: &str, default: Value) -> Value {
        self.get(key_path).unwrap_or(default)
    }
}

fn load_yaml_mapping(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(ConfigError::NotAMapping(path.display().to_string())),
    }
}

/// Read a plugin `config.yaml` into the shape `register_plan_config` expects.
pub fn load_plan_config(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    load_yaml_mapping(path)
}

fn set_nested(map: &mut Map<String, Value>, parts: &[&str], value: Value) {
    match parts {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                set_nested(inner, rest, value);
            }
        }
    }
}

fn get_nested(map: &Map<String, Value>, dotted: &str) -> Option<Value> {
    let mut parts = dotted.split('.');
    let first = parts.next()?;
    let mut current = map.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current.clone())
}

fn deep_merge(dest: &mut Map<String, Value>, key: String, value: Value) {
    match (dest.get_mut(&key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                deep_merge(existing, k, v);
            }
        }
        (_, value) => {
            dest.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(data: Value) -> Map<String, Value> {
        match data {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn test_dot_path_lookup() {
        let config = Config::new();
        config.register_plan_config("p", as_map(json!({"a": {"b": {"c": 3}}})));

        assert_eq!(config.get("a.b.c"), Some(json!(3)));
        assert_eq!(config.get("a.b"), Some(json!({"c": 3})));
        assert_eq!(config.get("a.missing"), None);
        assert_eq!(config.get_or("a.missing", json!("x")), json!("x"));
    }

    #[test]
    fn test_plan_configs_deep_merge() {
        let config = Config::new();
        config.register_plan_config("p1", as_map(json!({"db": {"host": "a", "port": 1}})));
        config.register_plan_config("p2", as_map(json!({"db": {"port": 2}})));

        assert_eq!(config.get("db.host"), Some(json!("a")));
        assert_eq!(config.get("db.port"), Some(json!(2)));
    }

    #[test]
    fn test_global_overrides_plan_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "db:\n  host: global\n").unwrap();

        let config = Config::new();
        config.load_environment(dir.path()).unwrap();
        config.register_plan_config("p", as_map(json!({"db": {"host": "plan"}})));

        assert_eq!(config.get("db.host"), Some(json!("global")));
    }

    #[test]
    fn test_env_layer_wins() {
        std::env::set_var("AURA_CFGTEST_NESTED_KEY", "from-env");
        let dir = tempfile::tempdir().unwrap();

        let config = Config::new();
        config.load_environment(dir.path()).unwrap();

        assert_eq!(config.get("cfgtest.nested.key"), Some(json!("from-env")));
        std::env::remove_var("AURA_CFGTEST_NESTED_KEY");
    }

    #[test]
    fn test_missing_global_config_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new();
        config.load_environment(dir.path()).unwrap();
        assert_eq!(config.get("anything"), None);
    }
}
