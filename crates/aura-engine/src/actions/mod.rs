//! Action registry
//!
//! An action is a named callable invokable from task steps. Definitions
//! carry explicit formal parameters (there is no runtime introspection):
//! either a list of named parameters with optional defaults, or the
//! record style where the whole rendered parameter map is deserialized
//! into the handler's typed input in one shot.
//!
//! Lookup is by lower-cased name. Re-registering a name replaces the
//! previous definition with a warning, which is how overriding plugins
//! shadow base actions.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use aura_core::Context;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::service::{Service, ServiceError};

/// Errors surfaced by action lookup and invocation
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// No action registered under the requested name
    #[error("no action named '{0}'")]
    NotFound(String),

    /// A required parameter could not be filled from any source
    #[error("action '{action}' is missing required parameter '{param}'")]
    MissingParameter { action: String, param: String },

    /// Record-style construction failed validation
    #[error("invalid arguments for action '{action}': {detail}")]
    InvalidArguments { action: String, detail: String },

    /// A service dependency failed
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The action ran and failed
    #[error("action '{action}' failed: {detail}")]
    Failed { action: String, detail: String },

    /// Control-flow request from `stop_task`; consumed by the engine
    #[error("stop requested: {message}")]
    Stop { success: bool, message: String },
}

/// One formal parameter of a named-style action
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &str, default: Value) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            default: Some(default),
        }
    }
}

/// How an action's arguments are assembled
#[derive(Debug, Clone)]
pub enum ParamStyle {
    /// Per-parameter filling with the injector's precedence rules
    Named(Vec<ParamSpec>),
    /// The whole rendered map is handed over and deserialized in one shot
    Record,
}

/// Everything a handler receives for one invocation
pub struct ActionCall {
    /// Assembled named arguments (or the full rendered map in record style)
    pub args: Map<String, Value>,
    /// Resolved service dependencies, keyed by alias
    pub services: HashMap<String, Arc<dyn Service>>,
    /// The run's context
    pub context: Context,
    /// `plan/task` the call belongs to
    pub task_fqid: String,
}

impl ActionCall {
    /// Deserialize the argument map into a typed input (record style).
    pub fn parse_args<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
    ) -> Result<T, ActionError> {
        serde_json::from_value(Value::Object(self.args.clone())).map_err(|err| {
            ActionError::InvalidArguments {
                action: action.to_string(),
                detail: err.to_string(),
            }
        })
    }

    /// Fetch a resolved service dependency by alias.
    pub fn service(&self, alias: &str) -> Result<Arc<dyn Service>, ActionError> {
        self.services
            .get(alias)
            .cloned()
            .ok_or_else(|| ActionError::Failed {
                action: String::new(),
                detail: format!("service dependency '{alias}' was not injected"),
            })
    }
}

pub type ActionResult = Result<Value, ActionError>;
type AsyncHandlerFn = Arc<dyn Fn(ActionCall) -> BoxFuture<'static, ActionResult> + Send + Sync>;
type BlockingHandlerFn = Arc<dyn Fn(ActionCall) -> ActionResult + Send + Sync>;

/// The callable behind an action
#[derive(Clone)]
pub enum ActionHandler {
    /// Awaited on the event loop
    Async(AsyncHandlerFn),
    /// Dispatched to the blocking pool
    Blocking(BlockingHandlerFn),
}

impl ActionHandler {
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(ActionCall) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActionResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |call| Box::pin(f(call))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(ActionCall) -> ActionResult + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }
}

/// A registered action
#[derive(Clone)]
pub struct ActionDefinition {
    /// Lookup key; always stored lower-cased
    pub name: String,
    /// `author/plugin/action_name`
    pub fqid: String,
    /// Safe to evaluate from interrupt conditions
    pub read_only: bool,
    pub public: bool,
    /// alias → service id, resolved and injected per call
    pub service_deps: HashMap<String, String>,
    pub params: ParamStyle,
    pub handler: ActionHandler,
}

impl ActionDefinition {
    pub fn new(name: &str, fqid: &str, params: ParamStyle, handler: ActionHandler) -> Self {
        Self {
            name: name.to_lowercase(),
            fqid: fqid.to_string(),
            read_only: false,
            public: true,
            service_deps: HashMap::new(),
            params,
            handler,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.public = false;
        self
    }

    pub fn with_service(mut self, alias: &str, service_id: &str) -> Self {
        self.service_deps
            .insert(alias.to_string(), service_id.to_string());
        self
    }
}

/// Lookup table of all registered actions
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<ActionDefinition>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: ActionDefinition) {
        let mut actions = self.actions.write();
        if let Some(existing) = actions.get(&def.name) {
            warn!(
                name = %def.name,
                new = %def.fqid,
                old = %existing.fqid,
                "action name conflict: definition replaced"
            );
        }
        debug!(name = %def.name, fqid = %def.fqid, "action defined");
        actions.insert(def.name.clone(), Arc::new(def));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ActionDefinition>> {
        self.actions.read().get(&name.to_lowercase()).cloned()
    }

    /// All definitions sorted by FQID.
    pub fn list(&self) -> Vec<Arc<ActionDefinition>> {
        let mut out: Vec<Arc<ActionDefinition>> =
            self.actions.read().values().cloned().collect();
        out.sort_by(|a, b| a.fqid.cmp(&b.fqid));
        out
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }

    pub fn clear(&self) {
        self.actions.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> ActionHandler {
        ActionHandler::asynchronous(|_call| async { Ok(Value::Bool(true)) })
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = ActionRegistry::new();
        registry.register(ActionDefinition::new(
            "My_Action",
            "a/p/my_action",
            ParamStyle::Named(vec![]),
            noop(),
        ));

        assert!(registry.get("my_action").is_some());
        assert!(registry.get("MY_ACTION").is_some());
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = ActionRegistry::new();
        registry.register(ActionDefinition::new(
            "log",
            "a/p/log",
            ParamStyle::Named(vec![]),
            noop(),
        ));
        registry.register(ActionDefinition::new(
            "log",
            "b/q/log",
            ParamStyle::Named(vec![]),
            noop(),
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("log").unwrap().fqid, "b/q/log");
    }

    #[test]
    fn test_parse_args_surfaces_offending_field() {
        #[derive(serde::Deserialize, Debug)]
        struct Input {
            #[allow(dead_code)]
            key: String,
        }

        let call = ActionCall {
            args: json!({"unrelated": 42}).as_object().unwrap().clone(),
            services: HashMap::new(),
            context: Context::new(),
            task_fqid: "p/t".into(),
        };
        let err = call.parse_args::<Input>("state.set").unwrap_err();
        match err {
            ActionError::InvalidArguments { action, detail } => {
                assert_eq!(action, "state.set");
                assert!(detail.contains("key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
