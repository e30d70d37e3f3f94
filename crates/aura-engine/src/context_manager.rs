//! Context creation
//!
//! Builds the fresh `Context` each task run receives: persistent-context
//! snapshot keys, the plan's config map, the run's metadata keys, the debug
//! directory, the triggering event, and any caller-provided seeds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aura_core::event::Event;
use aura_core::{Context, PersistentContext};
use serde_json::{Map, Value};
use tracing::warn;

/// Per-plan context factory
pub struct ContextManager {
    plan_name: String,
    plan_path: PathBuf,
    persistent_path: PathBuf,
    plan_config: Map<String, Value>,
}

impl ContextManager {
    pub fn new(plan_name: impl Into<String>, plan_path: &Path, plan_config: Map<String, Value>) -> Self {
        Self {
            plan_name: plan_name.into(),
            plan_path: plan_path.to_path_buf(),
            persistent_path: plan_path.join("persistent_context.json"),
            plan_config,
        }
    }

    /// Build and seed a new run context.
    pub async fn create_context(
        &self,
        task_id: &str,
        triggering_event: Option<Event>,
        seeds: &Map<String, Value>,
    ) -> Context {
        let context = Context::new();

        let persistent = Arc::new(PersistentContext::open(&self.persistent_path));
        for (key, value) in persistent.all() {
            context.set(&key, value);
        }
        context.set_persistent(persistent);

        context.set("config", Value::Object(self.plan_config.clone()));

        let debug_dir = self.plan_path.join("debug");
        if let Err(err) = tokio::fs::create_dir_all(&debug_dir).await {
            warn!(dir = %debug_dir.display(), %err, "could not create debug directory");
        }
        context.set(
            "debug_dir",
            Value::String(debug_dir.to_string_lossy().into_owned()),
        );

        context.set("__task_name__", Value::String(task_id.to_string()));
        context.set("__plan_name__", Value::String(self.plan_name.clone()));

        if let Some(event) = triggering_event {
            context.set_event(event);
        }
        for (key, value) in seeds {
            context.set(key, value.clone());
        }

        context
    }

    /// Load the persistent context fresh from disk.
    pub async fn persistent_data(&self) -> std::collections::BTreeMap<String, Value> {
        let persistent = PersistentContext::open(&self.persistent_path);
        persistent.all()
    }

    /// Replace and save the persistent context.
    pub async fn save_persistent_data(
        &self,
        data: std::collections::BTreeMap<String, Value>,
    ) -> Result<(), aura_core::PersistenceError> {
        let persistent = PersistentContext::open(&self.persistent_path);
        persistent.replace(data);
        persistent.save().await
    }
}
