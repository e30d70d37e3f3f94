//! Service container
//!
//! Registration is ordered by plugin load order. A short-name collision is
//! rejected unless the newcomer's plugin declares `extends` (the old
//! definition is wrapped by the new one through an inheritance proxy) or
//! `overrides` (hard replacement); declaring both for one alias is an
//! error. Resolution happens on first `get`: dependencies are declared
//! explicitly on the factory (no runtime introspection), cycles are
//! detected with a per-resolution chain, and failures poison the definition
//! so every dependent fails the same way.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::plugin::manifest::PluginManifest;
use crate::service::{ExtensionProxy, Service};

/// Errors from registration and resolution
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two definitions claimed the same FQID
    #[error("service FQID conflict: '{0}' is already registered")]
    FqidConflict(String),

    /// Short-name collision without extends/overrides
    #[error(
        "service name conflict: '{alias}' is already provided by '{existing}'; \
         declare 'extends' or 'overrides' in the plugin manifest to replace it"
    )]
    AliasConflict { alias: String, existing: String },

    /// A plugin declared both extends and overrides for one alias
    #[error("plugin '{plugin}' cannot both extend and override service '{alias}'")]
    ExtendAndOverride { plugin: String, alias: String },

    /// Unknown service id
    #[error("no service registered under '{0}'")]
    NotFound(String),

    /// Constructor dependencies form a cycle
    #[error("service dependency cycle: {0}")]
    Cycle(String),

    /// A previous resolution attempt failed; dependents fail the same way
    #[error("service '{0}' failed to resolve in an earlier attempt")]
    Poisoned(String),

    /// Re-entrant resolution of the same definition
    #[error("service '{0}' is already resolving")]
    Resolving(String),

    /// The factory itself reported a failure
    #[error("service '{fqid}' construction failed: {detail}")]
    BuildFailed { fqid: String, detail: String },
}

/// Lifecycle of a service definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Defined,
    Resolving,
    Resolved,
    Failed,
}

/// Dependencies handed to a factory, resolved by alias
pub struct ResolvedDeps {
    deps: HashMap<String, Arc<dyn Service>>,
    /// Present only for extension services
    pub parent: Option<Arc<dyn Service>>,
}

impl ResolvedDeps {
    /// Fetch a dependency declared in the factory's `deps` list.
    pub fn get(&self, alias: &str) -> Result<Arc<dyn Service>, RegistryError> {
        self.deps
            .get(alias)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(alias.to_string()))
    }
}

type BuildFn = Arc<dyn Fn(ResolvedDeps) -> Result<Arc<dyn Service>, RegistryError> + Send + Sync>;

/// How to construct a service: explicit dependency aliases + a build closure
#[derive(Clone)]
pub struct ServiceFactory {
    /// Aliases (or FQIDs) resolved before construction
    pub deps: Vec<String>,
    pub build: BuildFn,
}

impl ServiceFactory {
    pub fn new<F>(deps: Vec<String>, build: F) -> Self
    where
        F: Fn(ResolvedDeps) -> Result<Arc<dyn Service>, RegistryError> + Send + Sync + 'static,
    {
        Self {
            deps,
            build: Arc::new(build),
        }
    }

    /// Factory with no dependencies.
    pub fn leaf<F>(build: F) -> Self
    where
        F: Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    {
        Self::new(Vec::new(), move |_| Ok(build()))
    }
}

/// One registered definition
pub struct ServiceDefinition {
    pub alias: String,
    pub fqid: String,
    pub public: bool,
    pub plugin: Option<String>,
    pub factory: Option<ServiceFactory>,
}

struct Entry {
    alias: String,
    fqid: String,
    public: bool,
    plugin: Option<String>,
    status: ServiceStatus,
    is_extension: bool,
    parent_fqid: Option<String>,
    factory: Option<ServiceFactory>,
    instance: Option<Arc<dyn Service>>,
}

/// Snapshot of one definition for status listings
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceInfo {
    pub fqid: String,
    pub alias: String,
    pub public: bool,
    pub plugin: Option<String>,
    pub status: String,
    pub is_extension: bool,
    pub parent_fqid: Option<String>,
}

#[derive(Default)]
struct Inner {
    by_fqid: HashMap<String, Entry>,
    short_names: HashMap<String, String>,
}

/// The container
#[derive(Default)]
pub struct ServiceRegistry {
    inner: Mutex<Inner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-built instance (core services).
    pub fn register_instance(
        &self,
        alias: &str,
        fqid: &str,
        instance: Arc<dyn Service>,
        public: bool,
    ) {
        let mut inner = self.inner.lock();
        if inner.by_fqid.contains_key(fqid) {
            warn!(fqid, "service instance is being re-registered");
        }
        if let Some(existing) = inner.short_names.get(alias) {
            if existing != fqid {
                warn!(alias, existing, fqid, "service alias re-pointed");
            }
        }
        inner.by_fqid.insert(
            fqid.to_string(),
            Entry {
                alias: alias.to_string(),
                fqid: fqid.to_string(),
                public,
                plugin: None,
                status: ServiceStatus::Resolved,
                is_extension: false,
                parent_fqid: None,
                factory: None,
                instance: Some(instance),
            },
        );
        inner
            .short_names
            .insert(alias.to_string(), fqid.to_string());
        info!(fqid, alias, "core service instance registered");
    }

    /// Register a plugin-provided definition, applying the extends/overrides
    /// rules against whatever currently owns the short name.
    pub fn register(
        &self,
        def: ServiceDefinition,
        manifest: Option<&PluginManifest>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.by_fqid.contains_key(&def.fqid) {
            return Err(RegistryError::FqidConflict(def.fqid));
        }

        let mut is_extension = false;
        let mut parent_fqid = None;

        if let Some(existing_fqid) = inner.short_names.get(&def.alias).cloned() {
            let existing_plugin = inner
                .by_fqid
                .get(&existing_fqid)
                .and_then(|e| e.plugin.clone())
                .unwrap_or_else(|| "core".to_string());

            let extends = manifest.is_some_and(|m| {
                m.extends
                    .iter()
                    .any(|ext| ext.service == def.alias && ext.from_plugin == existing_plugin)
            });
            let overrides = manifest.is_some_and(|m| m.overrides.contains(&existing_fqid));

            if extends && overrides {
                return Err(RegistryError::ExtendAndOverride {
                    plugin: def.plugin.clone().unwrap_or_default(),
                    alias: def.alias,
                });
            }
            if extends {
                info!(fqid = %def.fqid, parent = %existing_fqid, "service extension registered");
                is_extension = true;
                parent_fqid = Some(existing_fqid);
            } else if overrides {
                warn!(fqid = %def.fqid, replaced = %existing_fqid, "service override registered");
            } else {
                return Err(RegistryError::AliasConflict {
                    alias: def.alias,
                    existing: existing_fqid,
                });
            }
        }

        inner
            .short_names
            .insert(def.alias.clone(), def.fqid.clone());
        debug!(fqid = %def.fqid, alias = %def.alias, "service defined");
        inner.by_fqid.insert(
            def.fqid.clone(),
            Entry {
                alias: def.alias,
                fqid: def.fqid,
                public: def.public,
                plugin: def.plugin,
                status: ServiceStatus::Defined,
                is_extension,
                parent_fqid,
                factory: def.factory,
                instance: None,
            },
        );
        Ok(())
    }

    /// Resolve a service by FQID or short name, instantiating on first use.
    pub fn get(&self, service_id: &str) -> Result<Arc<dyn Service>, RegistryError> {
        let mut inner = self.inner.lock();
        let fqid = resolve_id(&inner, service_id)?;
        let mut chain = Vec::new();
        instantiate(&mut inner, &fqid, &mut chain)
    }

    /// All definitions, sorted by FQID.
    pub fn list(&self) -> Vec<ServiceInfo> {
        let inner = self.inner.lock();
        let mut out: Vec<ServiceInfo> = inner
            .by_fqid
            .values()
            .map(|e| ServiceInfo {
                fqid: e.fqid.clone(),
                alias: e.alias.clone(),
                public: e.public,
                plugin: e.plugin.clone(),
                status: format!("{:?}", e.status).to_lowercase(),
                is_extension: e.is_extension,
                parent_fqid: e.parent_fqid.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.fqid.cmp(&b.fqid));
        out
    }

    /// Remove everything except entries whose FQID starts with `keep_prefix`
    /// (plan reload keeps core services).
    pub fn retain_prefix(&self, keep_prefix: &str) {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .by_fqid
            .keys()
            .filter(|fqid| !fqid.starts_with(keep_prefix))
            .cloned()
            .collect();
        for fqid in &doomed {
            if let Some(entry) = inner.by_fqid.remove(fqid) {
                if inner.short_names.get(&entry.alias) == Some(fqid) {
                    inner.short_names.remove(&entry.alias);
                }
            }
        }
        if !doomed.is_empty() {
            info!(count = doomed.len(), "plugin services removed");
        }
    }
}

fn resolve_id(inner: &Inner, service_id: &str) -> Result<String, RegistryError> {
    if service_id.contains('/') {
        return Ok(service_id.to_string());
    }
    inner
        .short_names
        .get(service_id)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound(service_id.to_string()))
}

fn instantiate(
    inner: &mut Inner,
    fqid: &str,
    chain: &mut Vec<String>,
) -> Result<Arc<dyn Service>, RegistryError> {
    if chain.iter().any(|c| c == fqid) {
        chain.push(fqid.to_string());
        return Err(RegistryError::Cycle(chain.join(" -> ")));
    }

    let (status, instance) = match inner.by_fqid.get(fqid) {
        Some(entry) => (entry.status, entry.instance.clone()),
        None => return Err(RegistryError::NotFound(fqid.to_string())),
    };
    if let Some(instance) = instance {
        return Ok(instance);
    }
    match status {
        ServiceStatus::Failed => return Err(RegistryError::Poisoned(fqid.to_string())),
        ServiceStatus::Resolving => return Err(RegistryError::Resolving(fqid.to_string())),
        _ => {}
    }

    chain.push(fqid.to_string());
    if let Some(entry) = inner.by_fqid.get_mut(fqid) {
        entry.status = ServiceStatus::Resolving;
    }

    let result = build_entry(inner, fqid, chain);
    chain.pop();

    match result {
        Ok(instance) => {
            if let Some(entry) = inner.by_fqid.get_mut(fqid) {
                entry.status = ServiceStatus::Resolved;
                entry.instance = Some(instance.clone());
            }
            info!(fqid, "service resolved");
            Ok(instance)
        }
        Err(err) => {
            if let Some(entry) = inner.by_fqid.get_mut(fqid) {
                entry.status = ServiceStatus::Failed;
            }
            Err(err)
        }
    }
}

fn build_entry(
    inner: &mut Inner,
    fqid: &str,
    chain: &mut Vec<String>,
) -> Result<Arc<dyn Service>, RegistryError> {
    let (factory, is_extension, parent_fqid) = match inner.by_fqid.get(fqid) {
        Some(entry) => (
            entry.factory.clone(),
            entry.is_extension,
            entry.parent_fqid.clone(),
        ),
        None => return Err(RegistryError::NotFound(fqid.to_string())),
    };
    let factory = factory.ok_or_else(|| RegistryError::BuildFailed {
        fqid: fqid.to_string(),
        detail: "definition has no factory".to_string(),
    })?;

    let parent = match (is_extension, parent_fqid) {
        (true, Some(parent_fqid)) => {
            let resolved = resolve_id(inner, &parent_fqid)?;
            Some(instantiate(inner, &resolved, chain)?)
        }
        _ => None,
    };

    let mut deps = HashMap::new();
    for dep in &factory.deps {
        let dep_fqid = resolve_id(inner, dep)?;
        let instance = instantiate(inner, &dep_fqid, chain)?;
        deps.insert(dep.clone(), instance);
    }

    let built = (factory.build)(ResolvedDeps {
        deps,
        parent: parent.clone(),
    })?;

    Ok(match parent {
        Some(parent) => Arc::new(ExtensionProxy::wrap(parent, built)),
        None => built,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceError;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo(&'static str);

    #[async_trait]
    impl Service for Echo {
        fn methods(&self) -> &[&'static str] {
            &["whoami"]
        }
        async fn call(&self, method: &str, _args: Value) -> Result<Value, ServiceError> {
            match method {
                "whoami" => Ok(json!(self.0)),
                other => Err(ServiceError::MethodNotFound(other.to_string())),
            }
        }
    }

    fn def(alias: &str, fqid: &str, factory: ServiceFactory) -> ServiceDefinition {
        ServiceDefinition {
            alias: alias.into(),
            fqid: fqid.into(),
            public: true,
            plugin: Some("tester/pkg".into()),
            factory: Some(factory),
        }
    }

    fn manifest_with(extends: Vec<(&str, &str)>, overrides: Vec<&str>) -> PluginManifest {
        let mut manifest = PluginManifest::for_tests("tester", "pkg");
        for (service, from_plugin) in extends {
            manifest.extends.push(crate::plugin::manifest::ExtendDecl {
                service: service.into(),
                from_plugin: from_plugin.into(),
            });
        }
        manifest.overrides = overrides.into_iter().map(String::from).collect();
        manifest
    }

    #[tokio::test]
    async fn test_resolution_with_deps() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                def("leafy", "a/p/leafy", ServiceFactory::leaf(|| Arc::new(Echo("leaf")))),
                None,
            )
            .unwrap();
        registry
            .register(
                def(
                    "uses_leaf",
                    "a/p/uses_leaf",
                    ServiceFactory::new(vec!["leafy".into()], |deps| {
                        deps.get("leafy")?;
                        Ok(Arc::new(Echo("composite")) as Arc<dyn Service>)
                    }),
                ),
                None,
            )
            .unwrap();

        let svc = registry.get("uses_leaf").unwrap();
        assert_eq!(svc.call("whoami", json!({})).await.unwrap(), json!("composite"));
        // Cached on second get
        assert!(registry.get("a/p/uses_leaf").is_ok());
    }

    #[test]
    fn test_cycle_detected_and_named() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                def(
                    "a",
                    "x/p/a",
                    ServiceFactory::new(vec!["b".into()], |_| {
                        Ok(Arc::new(Echo("a")) as Arc<dyn Service>)
                    }),
                ),
                None,
            )
            .unwrap();
        registry
            .register(
                def(
                    "b",
                    "x/p/b",
                    ServiceFactory::new(vec!["a".into()], |_| {
                        Ok(Arc::new(Echo("b")) as Arc<dyn Service>)
                    }),
                ),
                None,
            )
            .unwrap();

        match registry.get("a") {
            Err(RegistryError::Cycle(path)) => {
                assert!(path.contains("x/p/a"));
                assert!(path.contains("x/p/b"));
            }
            other => panic!("expected cycle error, got {other:?}", other = other.err()),
        }
    }

    #[test]
    fn test_failure_poisons_dependents() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                def(
                    "broken",
                    "x/p/broken",
                    ServiceFactory::new(vec![], |_| {
                        Err(RegistryError::BuildFailed {
                            fqid: "x/p/broken".into(),
                            detail: "boom".into(),
                        })
                    }),
                ),
                None,
            )
            .unwrap();

        assert!(matches!(
            registry.get("broken"),
            Err(RegistryError::BuildFailed { .. })
        ));
        // Second attempt sees the poisoned status
        assert!(matches!(
            registry.get("broken"),
            Err(RegistryError::Poisoned(_))
        ));
    }

    #[test]
    fn test_alias_conflict_requires_declaration() {
        let registry = ServiceRegistry::new();
        registry.register_instance("store", "core/store", Arc::new(Echo("core")), true);

        let result = registry.register(
            def("store", "tester/pkg/store", ServiceFactory::leaf(|| Arc::new(Echo("new")))),
            Some(&manifest_with(vec![], vec![])),
        );
        assert!(matches!(result, Err(RegistryError::AliasConflict { .. })));
    }

    #[tokio::test]
    async fn test_override_replaces_alias() {
        let registry = ServiceRegistry::new();
        registry.register_instance("store", "core/store", Arc::new(Echo("old")), true);

        registry
            .register(
                def("store", "tester/pkg/store", ServiceFactory::leaf(|| Arc::new(Echo("new")))),
                Some(&manifest_with(vec![], vec!["core/store"])),
            )
            .unwrap();

        let svc = registry.get("store").unwrap();
        assert_eq!(svc.call("whoami", json!({})).await.unwrap(), json!("new"));
    }

    #[tokio::test]
    async fn test_extend_wraps_parent() {
        let registry = ServiceRegistry::new();
        registry.register_instance("store", "core/store", Arc::new(Echo("parent")), true);

        registry
            .register(
                def("store", "tester/pkg/store", ServiceFactory::leaf(|| Arc::new(Echo("child")))),
                Some(&manifest_with(vec![("store", "core")], vec![])),
            )
            .unwrap();

        let svc = registry.get("store").unwrap();
        // Both expose "whoami"; the child wins
        assert_eq!(svc.call("whoami", json!({})).await.unwrap(), json!("child"));
    }

    #[test]
    fn test_extend_and_override_rejected() {
        let registry = ServiceRegistry::new();
        registry.register_instance("store", "core/store", Arc::new(Echo("old")), true);

        let result = registry.register(
            def("store", "tester/pkg/store", ServiceFactory::leaf(|| Arc::new(Echo("new")))),
            Some(&manifest_with(vec![("store", "core")], vec!["core/store"])),
        );
        assert!(matches!(
            result,
            Err(RegistryError::ExtendAndOverride { .. })
        ));
    }

    #[test]
    fn test_retain_prefix_keeps_core() {
        let registry = ServiceRegistry::new();
        registry.register_instance("bus", "core/bus", Arc::new(Echo("bus")), true);
        registry
            .register(
                def("extra", "tester/pkg/extra", ServiceFactory::leaf(|| Arc::new(Echo("x")))),
                None,
            )
            .unwrap();

        registry.retain_prefix("core/");
        assert!(registry.get("core/bus").is_ok());
        assert!(matches!(
            registry.get("extra"),
            Err(RegistryError::NotFound(_))
        ));
    }
}
