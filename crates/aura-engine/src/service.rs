//! Service object model
//!
//! Services are named capabilities injected into actions by alias. Every
//! service exposes a uniform dynamic surface: a method list plus an async
//! `call`. Extensions wrap a parent service in an [`ExtensionProxy`] whose
//! dispatch table, built once at wrap time, routes each method to the child
//! implementation first and falls back to the parent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Errors surfaced by service calls
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service does not expose the requested method
    #[error("service has no method '{0}'")]
    MethodNotFound(String),

    /// The arguments did not match the method's expectations
    #[error("invalid arguments for '{method}': {detail}")]
    InvalidArguments { method: String, detail: String },

    /// The call itself failed
    #[error("service call '{method}' failed: {detail}")]
    Failed { method: String, detail: String },
}

/// A resolvable, injectable capability
#[async_trait]
pub trait Service: Send + Sync {
    /// The methods this service dispatches
    fn methods(&self) -> &[&'static str];

    /// Invoke one method with a JSON argument object
    async fn call(&self, method: &str, args: Value) -> Result<Value, ServiceError>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DispatchTarget {
    Child,
    Parent,
}

/// Inheritance proxy for `extends` services
pub struct ExtensionProxy {
    parent: Arc<dyn Service>,
    child: Arc<dyn Service>,
    table: HashMap<&'static str, DispatchTarget>,
    methods: Vec<&'static str>,
}

impl ExtensionProxy {
    /// Wrap `child` over `parent`, building the dispatch table once.
    pub fn wrap(parent: Arc<dyn Service>, child: Arc<dyn Service>) -> Self {
        let mut table = HashMap::new();
        for method in parent.methods() {
            table.insert(*method, DispatchTarget::Parent);
        }
        for method in child.methods() {
            table.insert(*method, DispatchTarget::Child);
        }
        let mut methods: Vec<&'static str> = table.keys().copied().collect();
        methods.sort_unstable();
        Self {
            parent,
            child,
            table,
            methods,
        }
    }
}

#[async_trait]
impl Service for ExtensionProxy {
    fn methods(&self) -> &[&'static str] {
        &self.methods
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, ServiceError> {
        match self.table.get(method) {
            Some(DispatchTarget::Child) => self.child.call(method, args).await,
            Some(DispatchTarget::Parent) => self.parent.call(method, args).await,
            None => Err(ServiceError::MethodNotFound(method.to_string())),
        }
    }
}

/// Pull a string field out of a JSON argument object.
pub fn arg_str(args: &Value, key: &str, method: &str) -> Result<String, ServiceError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ServiceError::InvalidArguments {
            method: method.to_string(),
            detail: format!("missing string field '{key}'"),
        })
}
