//! Per-run execution context
//!
//! A `Context` is the mutable key-value scope one task run sees. Keys are
//! normalized to lower case. The handle is cheap to clone; the engine, the
//! action injector, and builtin actions all share the same underlying map.
//! Opaque collaborators (the persistent context handle, the triggering
//! event) live in typed side-fields rather than the data map.
//!
//! `fork()` produces the child scope used for sub-task calls: a copy of the
//! data map sharing the same persistent-context handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::event::Event;
use crate::persistent::PersistentContext;

#[derive(Default)]
struct ContextInner {
    data: HashMap<String, Value>,
    persistent: Option<Arc<PersistentContext>>,
    event: Option<Event>,
}

/// Shared handle to one run's scope
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<RwLock<ContextInner>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value under a case-insensitive key.
    pub fn set(&self, key: &str, value: Value) {
        self.inner.write().data.insert(key.to_lowercase(), value);
    }

    /// Get a value by case-insensitive key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().data.get(&key.to_lowercase()).cloned()
    }

    /// Remove a key, ignoring absence.
    pub fn delete(&self, key: &str) {
        self.inner.write().data.remove(&key.to_lowercase());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().data.contains_key(&key.to_lowercase())
    }

    /// Attach the persistent-context handle for this run.
    pub fn set_persistent(&self, persistent: Arc<PersistentContext>) {
        self.inner.write().persistent = Some(persistent);
    }

    pub fn persistent(&self) -> Option<Arc<PersistentContext>> {
        self.inner.read().persistent.clone()
    }

    /// Attach the triggering event, also exposing it as `event` to templates.
    pub fn set_event(&self, event: Event) {
        let mut inner = self.inner.write();
        if let Ok(value) = serde_json::to_value(&event) {
            inner.data.insert("event".to_string(), value);
        }
        inner.event = Some(event);
    }

    pub fn event(&self) -> Option<Event> {
        self.inner.read().event.clone()
    }

    /// Snapshot the data map as one JSON object, for template rendering.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.read();
        let map: Map<String, Value> = inner
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    /// Child scope for a sub-task: copied data, shared persistent handle.
    pub fn fork(&self) -> Context {
        let inner = self.inner.read();
        Context {
            inner: Arc::new(RwLock::new(ContextInner {
                data: inner.data.clone(),
                persistent: inner.persistent.clone(),
                event: inner.event.clone(),
            })),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        let mut keys: Vec<&String> = inner.data.keys().collect();
        keys.sort();
        f.debug_struct("Context").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_case_insensitive() {
        let ctx = Context::new();
        ctx.set("MyKey", json!(1));
        assert_eq!(ctx.get("mykey"), Some(json!(1)));
        assert_eq!(ctx.get("MYKEY"), Some(json!(1)));
        ctx.delete("MyKeY");
        assert_eq!(ctx.get("mykey"), None);
    }

    #[test]
    fn test_fork_isolates_writes() {
        let parent = Context::new();
        parent.set("shared", json!("before"));

        let child = parent.fork();
        child.set("shared", json!("after"));
        child.set("only_child", json!(true));

        assert_eq!(parent.get("shared"), Some(json!("before")));
        assert_eq!(parent.get("only_child"), None);
        assert_eq!(child.get("shared"), Some(json!("after")));
    }

    #[test]
    fn test_snapshot_is_object() {
        let ctx = Context::new();
        ctx.set("a", json!(1));
        let snap = ctx.snapshot();
        assert_eq!(snap["a"], json!(1));
    }

    #[test]
    fn test_event_visible_to_templates() {
        let ctx = Context::new();
        ctx.set_event(Event::new("trigger.fired", json!({"k": "v"})));
        let snap = ctx.snapshot();
        assert_eq!(snap["event"]["name"], json!("trigger.fired"));
        assert!(ctx.event().is_some());
    }
}
