//! File-backed persistent context
//!
//! A JSON document bound to a file path. Mutations stage in memory; `save`
//! writes the whole document atomically (temp file + rename) on the async
//! runtime. The initial load is synchronous because it happens during plan
//! setup, before the run starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

/// Errors from persistent-context file I/O
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A plan's long-term key-value state, bound to `persistent_context.json`
pub struct PersistentContext {
    path: PathBuf,
    data: RwLock<BTreeMap<String, Value>>,
}

impl PersistentContext {
    /// Bind to a file and load whatever is there. A missing file starts
    /// empty; a corrupt file starts empty with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match Self::read_file(&path) {
            Ok(data) => data,
            Err(PersistenceError::Read { .. }) => BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), %err, "persistent context unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            path,
            data: RwLock::new(data),
        }
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, Value>, PersistenceError> {
        let text = std::fs::read_to_string(path).map_err(|source| PersistenceError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| PersistenceError::Malformed {
            path: path.display().to_string(),
            source,
        })
    }

    /// Re-read the file from disk, replacing staged state.
    pub async fn load(&self) -> Result<(), PersistenceError> {
        let path = self.path.clone();
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PersistenceError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let parsed: BTreeMap<String, Value> =
            serde_json::from_str(&text).map_err(|source| PersistenceError::Malformed {
                path: path.display().to_string(),
                source,
            })?;
        *self.data.write() = parsed;
        Ok(())
    }

    /// Persist the staged state atomically.
    pub async fn save(&self) -> Result<(), PersistenceError> {
        let snapshot = self.data.read().clone();
        let text = serde_json::to_string_pretty(&snapshot).map_err(|source| {
            PersistenceError::Malformed {
                path: self.path.display().to_string(),
                source,
            }
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PersistenceError::Write {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|source| PersistenceError::Write {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| PersistenceError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        debug!(path = %self.path.display(), "persistent context saved");
        Ok(())
    }

    /// Stage a value in memory; not written until `save`.
    pub fn set(&self, key: &str, value: Value) {
        self.data.write().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.data.write().remove(key).is_some()
    }

    /// Copy of everything staged.
    pub fn all(&self) -> BTreeMap<String, Value> {
        self.data.read().clone()
    }

    /// Replace the staged document wholesale.
    pub fn replace(&self, data: BTreeMap<String, Value>) {
        *self.data.write() = data;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistent_context.json");

        let pc = PersistentContext::open(&path);
        pc.set("counter", json!(42));
        pc.set("nested", json!({"a": [1, 2, 3]}));
        pc.save().await.unwrap();

        let reloaded = PersistentContext::open(&path);
        assert_eq!(reloaded.get("counter"), Some(json!(42)));
        assert_eq!(reloaded.get("nested"), Some(json!({"a": [1, 2, 3]})));
        assert_eq!(reloaded.all(), pc.all());
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pc = PersistentContext::open(dir.path().join("nope.json"));
        assert!(pc.all().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistent_context.json");
        std::fs::write(&path, "{not json").unwrap();

        let pc = PersistentContext::open(&path);
        assert!(pc.all().is_empty());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistent_context.json");

        let pc = PersistentContext::open(&path);
        pc.set("k", json!("v"));
        pc.save().await.unwrap();

        assert!(path.is_file());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
