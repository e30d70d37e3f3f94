//! Plugin manifest (`plugin.yaml`)
//!
//! Identity is `{author, name, version}` under an `identity` key; the
//! canonical id is `author/name`. Dependencies name other plugins by
//! canonical id. `extends` and `overrides` drive the service container's
//! collision rules.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Where a plugin was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    /// Under `plans/` — gets an orchestrator
    Plan,
    /// Under `packages/` — services and actions only
    Core,
}

/// `{service, from}` pair in an `extends` declaration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtendDecl {
    pub service: String,
    #[serde(rename = "from")]
    pub from_plugin: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Identity {
    author: String,
    name: String,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct RawManifest {
    identity: Identity,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    extends: Vec<ExtendDecl>,
    #[serde(default)]
    overrides: Vec<String>,
}

/// A parsed, located plugin definition
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub author: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Canonical id of each required plugin, with a version requirement
    pub dependencies: BTreeMap<String, String>,
    pub extends: Vec<ExtendDecl>,
    pub overrides: Vec<String>,
    pub path: PathBuf,
    pub plugin_type: PluginType,
}

/// Manifest parse failures
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid plugin.yaml at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl PluginManifest {
    /// Canonical id, `author/name`.
    pub fn canonical_id(&self) -> String {
        format!("{}/{}", self.author, self.name)
    }

    /// The plan name is the plugin's directory name.
    pub fn plan_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Parse `plugin.yaml` from a plugin directory.
    pub fn load(plugin_dir: &Path, plugin_type: PluginType) -> Result<Self, ManifestError> {
        let manifest_path = plugin_dir.join("plugin.yaml");
        let text =
            std::fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Io {
                path: manifest_path.display().to_string(),
                source,
            })?;
        let raw: RawManifest =
            serde_yaml::from_str(&text).map_err(|source| ManifestError::Parse {
                path: manifest_path.display().to_string(),
                source,
            })?;
        Ok(Self {
            author: raw.identity.author,
            name: raw.identity.name,
            version: raw.identity.version,
            description: raw.description,
            dependencies: raw.dependencies,
            extends: raw.extends,
            overrides: raw.overrides,
            path: plugin_dir.to_path_buf(),
            plugin_type,
        })
    }

    /// Bare manifest for unit tests.
    pub fn for_tests(author: &str, name: &str) -> Self {
        Self {
            author: author.to_string(),
            name: name.to_string(),
            version: "0.0.0".to_string(),
            description: String::new(),
            dependencies: BTreeMap::new(),
            extends: Vec::new(),
            overrides: Vec::new(),
            path: PathBuf::new(),
            plugin_type: PluginType::Core,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.yaml"),
            r#"
identity:
  author: aura
  name: base
  version: 1.2.0
description: base services
dependencies:
  aura/other: ">=1.0"
extends:
  - service: store
    from: aura/other
overrides:
  - aura/other/legacy
"#,
        )
        .unwrap();

        let manifest = PluginManifest::load(dir.path(), PluginType::Plan).unwrap();
        assert_eq!(manifest.canonical_id(), "aura/base");
        assert_eq!(manifest.version, "1.2.0");
        assert_eq!(manifest.dependencies.len(), 1);
        assert_eq!(manifest.extends[0].service, "store");
        assert_eq!(manifest.extends[0].from_plugin, "aura/other");
        assert_eq!(manifest.overrides, vec!["aura/other/legacy"]);
    }

    #[test]
    fn test_missing_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plugin.yaml"), "description: x\n").unwrap();
        assert!(matches!(
            PluginManifest::load(dir.path(), PluginType::Core),
            Err(ManifestError::Parse { .. })
        ));
    }
}
