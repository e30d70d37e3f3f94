//! Plugin loading
//!
//! Walks `plans/*` and `packages/*` for `plugin.yaml`, resolves the load
//! order topologically, and registers each plugin's exports. A plugin's
//! `api.yaml` is its compiled interface: when missing, it is built
//! deterministically from the plugin's `services/*.yaml` and
//! `actions/*.yaml` descriptor files plus its task entry points. Exports
//! name providers resolved against the compiled-in catalogs; `hooks.yaml`
//! entries bind hook points to actions.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aura_core::config::load_plan_config;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::manifest::{ManifestError, PluginManifest, PluginType};
use crate::actions::ActionDefinition;
use crate::container::{RegistryError, ServiceDefinition, ServiceFactory};
use crate::env::RuntimeEnv;
use crate::hooks::HookManager;
use crate::injector::ActionInjector;
use crate::orchestrator::Orchestrator;
use crate::state::SharedState;

pub const API_FILE_NAME: &str = "api.yaml";

/// Loading failures; all fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("plugin identity conflict: '{id}' is declared by both {first} and {second}")]
    IdentityConflict {
        id: String,
        first: String,
        second: String,
    },

    #[error("plugin '{plugin}' depends on unknown plugin '{dependency}'")]
    MissingDependency { plugin: String, dependency: String },

    #[error("plugin dependency cycle involving '{0}'")]
    DependencyCycle(String),

    #[error("plugin '{plugin}' exports unknown service provider '{provider}'")]
    UnknownServiceProvider { plugin: String, provider: String },

    #[error("plugin '{plugin}' exports unknown action provider '{provider}'")]
    UnknownActionProvider { plugin: String, provider: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid file {path}: {detail}")]
    Parse { path: String, detail: String },
}

/// Compiled-in providers plugins can export from
#[derive(Default)]
pub struct ProviderCatalog {
    pub services: HashMap<String, ServiceFactory>,
    pub actions: HashMap<String, ActionDefinition>,
}

impl ProviderCatalog {
    /// The builtin action and core service providers.
    pub fn with_builtins(env: &RuntimeEnv) -> Self {
        let mut catalog = Self::default();
        for def in crate::actions::builtin::builtin_actions() {
            catalog.actions.insert(def.name.clone(), def);
        }

        let config = env.config.clone();
        catalog.services.insert(
            "config".to_string(),
            ServiceFactory::leaf(move || {
                Arc::new(crate::actions::builtin::ConfigService::new(config.clone()))
            }),
        );
        let store = Arc::clone(&env.state_store);
        catalog.services.insert(
            "state_store".to_string(),
            ServiceFactory::leaf(move || {
                Arc::new(crate::actions::builtin::StateStoreService::new(Arc::clone(
                    &store,
                )))
            }),
        );
        let bus = Arc::clone(&env.bus);
        catalog.services.insert(
            "event_bus".to_string(),
            ServiceFactory::leaf(move || {
                Arc::new(crate::actions::builtin::EventBusService::new(Arc::clone(
                    &bus,
                )))
            }),
        );
        catalog
    }
}

// --- api.yaml shape -------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
struct ApiFile {
    aura_version: String,
    package_identity: String,
    #[serde(default)]
    exports: ApiExports,
    #[serde(default)]
    entry_points: ApiEntryPoints,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ApiExports {
    #[serde(default)]
    services: Vec<ServiceExport>,
    #[serde(default)]
    actions: Vec<ActionExport>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ApiEntryPoints {
    #[serde(default)]
    tasks: Vec<TaskEntryPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceExport {
    alias: String,
    provider: String,
    #[serde(default = "default_true")]
    public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionExport {
    name: String,
    provider: String,
    #[serde(default)]
    read_only: Option<bool>,
    #[serde(default = "default_true")]
    public: bool,
    #[serde(default)]
    required_services: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEntryPoint {
    title: String,
    #[serde(default)]
    description: String,
    file: String,
}

#[derive(Debug, Deserialize)]
struct HooksFile {
    #[serde(default)]
    hooks: Vec<HookBinding>,
}

#[derive(Debug, Clone, Deserialize)]
struct HookBinding {
    hook: String,
    action: String,
    #[serde(default)]
    params: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Discovers, orders, and loads all plugins
pub struct PluginManager {
    base_path: PathBuf,
    registry: HashMap<String, PluginManifest>,
}

impl PluginManager {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            registry: HashMap::new(),
        }
    }

    /// Canonical ids and manifests of everything discovered.
    pub fn manifests(&self) -> &HashMap<String, PluginManifest> {
        &self.registry
    }

    /// Full load pipeline. Fatal on any structural error.
    pub async fn load_all(
        &mut self,
        env: &Arc<RuntimeEnv>,
        shared: &Arc<SharedState>,
        hooks: &Arc<HookManager>,
        catalog: &ProviderCatalog,
    ) -> Result<(), PluginError> {
        info!("======= plugin loading started =======");
        self.registry.clear();
        shared.plans.write().await.clear();
        shared.plan_plugin_ids.write().await.clear();

        self.discover()?;
        let order = self.load_order()?;
        info!(order = ?order, "plugin load order resolved");

        for id in &order {
            let manifest = self
                .registry
                .get(id)
                .cloned()
                .ok_or_else(|| PluginError::DependencyCycle(id.clone()))?;
            self.load_plugin(&manifest, env, shared, hooks, catalog)
                .await?;
        }
        info!(count = order.len(), "======= plugin loading finished =======");
        Ok(())
    }

    /// Walk `plans/*` and `packages/*` and parse every `plugin.yaml`.
    fn discover(&mut self) -> Result<(), PluginError> {
        for (root, plugin_type) in [
            (self.base_path.join("plans"), PluginType::Plan),
            (self.base_path.join("packages"), PluginType::Core),
        ] {
            let Ok(entries) = std::fs::read_dir(&root) else {
                debug!(root = %root.display(), "plugin root does not exist, skipped");
                continue;
            };
            let mut dirs: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir() && p.join("plugin.yaml").is_file())
                .collect();
            dirs.sort();

            for dir in dirs {
                let manifest = PluginManifest::load(&dir, plugin_type)?;
                let id = manifest.canonical_id();
                if let Some(existing) = self.registry.get(&id) {
                    return Err(PluginError::IdentityConflict {
                        id,
                        first: existing.path.display().to_string(),
                        second: dir.display().to_string(),
                    });
                }
                debug!(id = %id, path = %dir.display(), "plugin discovered");
                self.registry.insert(id, manifest);
            }
        }
        Ok(())
    }

    /// Topological order over the dependency graph; cycles are fatal.
    fn load_order(&self) -> Result<Vec<String>, PluginError> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        let mut ids: Vec<&String> = self.registry.keys().collect();
        ids.sort();
        for id in &ids {
            let index = graph.add_node((*id).clone());
            nodes.insert((*id).clone(), index);
        }

        for (id, manifest) in &self.registry {
            for dependency in manifest.dependencies.keys() {
                let Some(&dep_node) = nodes.get(dependency) else {
                    return Err(PluginError::MissingDependency {
                        plugin: id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(dep_node, nodes[id], ());
            }
        }

        match toposort(&graph, None) {
            Ok(sorted) => Ok(sorted.into_iter().map(|idx| graph[idx].clone()).collect()),
            Err(cycle) => Err(PluginError::DependencyCycle(
                graph[cycle.node_id()].clone(),
            )),
        }
    }

    async fn load_plugin(
        &self,
        manifest: &PluginManifest,
        env: &Arc<RuntimeEnv>,
        shared: &Arc<SharedState>,
        hooks: &Arc<HookManager>,
        catalog: &ProviderCatalog,
    ) -> Result<(), PluginError> {
        let id = manifest.canonical_id();
        let api_path = manifest.path.join(API_FILE_NAME);
        if !api_path.is_file() {
            build_api_from_source(manifest)?;
        }
        let api = read_api_file(&api_path)?;

        for export in &api.exports.services {
            let factory = catalog.services.get(&export.provider).cloned().ok_or_else(
                || PluginError::UnknownServiceProvider {
                    plugin: id.clone(),
                    provider: export.provider.clone(),
                },
            )?;
            env.services.register(
                ServiceDefinition {
                    alias: export.alias.clone(),
                    fqid: format!("{id}/{}", export.alias),
                    public: export.public,
                    plugin: Some(id.clone()),
                    factory: Some(factory),
                },
                Some(manifest),
            )?;
        }

        for export in &api.exports.actions {
            let template = catalog.actions.get(&export.provider).cloned().ok_or_else(
                || PluginError::UnknownActionProvider {
                    plugin: id.clone(),
                    provider: export.provider.clone(),
                },
            )?;
            let mut def = template;
            def.name = export.name.to_lowercase();
            def.fqid = format!("{id}/{}", export.name);
            def.public = export.public;
            if let Some(read_only) = export.read_only {
                def.read_only = read_only;
            }
            for (alias, service_id) in &export.required_services {
                def.service_deps.insert(alias.clone(), service_id.clone());
            }
            env.actions.register(def);
        }

        self.load_hooks(manifest, env, hooks).await;

        if manifest.plugin_type == PluginType::Plan {
            let plan_name = manifest.plan_name();
            let config_path = manifest.path.join("config.yaml");
            let plan_config = if config_path.is_file() {
                match load_plan_config(&config_path) {
                    Ok(map) => {
                        env.config.register_plan_config(&plan_name, map.clone());
                        map
                    }
                    Err(err) => {
                        error!(plan = %plan_name, %err, "plan config unreadable, using empty");
                        Map::new()
                    }
                }
            } else {
                Map::new()
            };

            info!(plan = %plan_name, "orchestrator created");
            let orchestrator = Arc::new(Orchestrator::new(
                plan_name.clone(),
                &manifest.path,
                Arc::clone(env),
                plan_config,
            ));
            shared
                .plans
                .write()
                .await
                .insert(plan_name.clone(), orchestrator);
            shared
                .plan_plugin_ids
                .write()
                .await
                .insert(plan_name, id.clone());
        }

        debug!(plugin = %id, "plugin loaded");
        Ok(())
    }

    /// Bind `hooks.yaml` entries to actions through a bare-context injector.
    async fn load_hooks(
        &self,
        manifest: &PluginManifest,
        env: &Arc<RuntimeEnv>,
        hooks: &Arc<HookManager>,
    ) {
        let hooks_path = manifest.path.join("hooks.yaml");
        if !hooks_path.is_file() {
            return;
        }
        let parsed: HooksFile = match std::fs::read_to_string(&hooks_path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_yaml::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(path = %hooks_path.display(), %err, "hooks.yaml unreadable, skipped");
                return;
            }
        };

        for binding in parsed.hooks {
            let env = Arc::clone(env);
            let plugin = manifest.canonical_id();
            let binding_clone = binding.clone();
            hooks
                .register(
                    &binding.hook,
                    HookManager::callback(move |payload| {
                        let env = Arc::clone(&env);
                        let binding = binding_clone.clone();
                        let plugin = plugin.clone();
                        async move {
                            let context = aura_core::Context::new();
                            context.set("hook_payload", payload);
                            let injector = ActionInjector::new(
                                env,
                                context,
                                format!("{plugin}/hook/{}", binding.hook),
                            );
                            injector
                                .execute(&binding.action, &binding.params)
                                .await
                                .map(|_| ())
                                .map_err(|err| anyhow::anyhow!(err.to_string()))
                        }
                    }),
                )
                .await;
            debug!(hook = %binding.hook, action = %binding.action, "hook bound");
        }
    }
}

fn read_api_file(path: &Path) -> Result<ApiFile, PluginError> {
    let text = std::fs::read_to_string(path).map_err(|source| PluginError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|err| PluginError::Parse {
        path: path.display().to_string(),
        detail: err.to_string(),
    })
}

/// Build `api.yaml` from the plugin's descriptor files. Deterministic:
/// directory walks are sorted and the output field order is fixed.
fn build_api_from_source(manifest: &PluginManifest) -> Result<(), PluginError> {
    debug!(plugin = %manifest.canonical_id(), "building api.yaml from source");
    let mut api = ApiFile {
        aura_version: "3.0".to_string(),
        package_identity: manifest.canonical_id(),
        exports: ApiExports::default(),
        entry_points: ApiEntryPoints::default(),
    };

    for path in sorted_yaml_files(&manifest.path.join("services")) {
        match read_descriptors::<ServiceExport>(&path) {
            Ok(mut exports) => api.exports.services.append(&mut exports),
            Err(err) => warn!(path = %path.display(), %err, "bad service descriptor, skipped"),
        }
    }
    for path in sorted_yaml_files(&manifest.path.join("actions")) {
        match read_descriptors::<ActionExport>(&path) {
            Ok(mut exports) => api.exports.actions.append(&mut exports),
            Err(err) => warn!(path = %path.display(), %err, "bad action descriptor, skipped"),
        }
    }
    api.exports.services.sort_by(|a, b| a.alias.cmp(&b.alias));
    api.exports.actions.sort_by(|a, b| a.name.cmp(&b.name));

    api.entry_points.tasks = scan_task_entry_points(&manifest.path);

    let api_path = manifest.path.join(API_FILE_NAME);
    let text = serde_yaml::to_string(&api).map_err(|err| PluginError::Parse {
        path: api_path.display().to_string(),
        detail: err.to_string(),
    })?;
    std::fs::write(&api_path, text).map_err(|source| PluginError::Io {
        path: api_path.display().to_string(),
        source,
    })?;
    info!(plugin = %manifest.canonical_id(), path = %api_path.display(), "api file generated");
    Ok(())
}

/// A descriptor file holds one export or a list of them.
fn read_descriptors<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| e.to_string())?;
    match value {
        serde_yaml::Value::Sequence(items) => items
            .into_iter()
            .map(|item| serde_yaml::from_value(item).map_err(|e| e.to_string()))
            .collect(),
        single => Ok(vec![
            serde_yaml::from_value(single).map_err(|e| e.to_string())?
        ]),
    }
}

/// Tasks whose `meta.entry_point` is true become public entry points.
fn scan_task_entry_points(plugin_path: &Path) -> Vec<TaskEntryPoint> {
    let tasks_dir = plugin_path.join("tasks");
    let mut out = Vec::new();
    for path in sorted_yaml_files_recursive(&tasks_dir) {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(data) = serde_yaml::from_str::<BTreeMap<String, Value>>(&text) else {
            continue;
        };
        for (key, task) in data {
            let Some(meta) = task.get("meta").and_then(Value::as_object) else {
                continue;
            };
            if meta.get("entry_point").and_then(Value::as_bool) != Some(true) {
                continue;
            }
            let file = path
                .strip_prefix(plugin_path)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push(TaskEntryPoint {
                title: meta
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or(&key)
                    .to_string(),
                description: meta
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                file,
            });
        }
    }
    out
}

fn sorted_yaml_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("yaml"))
        .collect();
    files.sort();
    files
}

fn sorted_yaml_files_recursive(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            out.extend(sorted_yaml_files_recursive(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            out.push(path);
        }
    }
    out
}
