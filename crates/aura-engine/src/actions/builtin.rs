//! Builtin actions and core services
//!
//! The domain-neutral action set every project gets: logging, sleeping,
//! task control, context and persistent-context writes, resident-state
//! access, and event publication. Core services (`core/config`,
//! `core/state_store`, `core/event_bus`) back the actions that need shared
//! capabilities and are also injectable into plugin actions by alias.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aura_core::event::Event;
use aura_core::template::truthy;
use aura_core::{Config, StateStore};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{
    ActionDefinition, ActionError, ActionHandler, ActionRegistry, ParamSpec, ParamStyle,
};
use crate::bus::EventBus;
use crate::container::ServiceRegistry;
use crate::service::{arg_str, Service, ServiceError};

// ---------------------------------------------------------------------------
// Core services
// ---------------------------------------------------------------------------

/// `core/config`: read-only view of the layered configuration
pub struct ConfigService {
    config: Config,
}

impl ConfigService {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Service for ConfigService {
    fn methods(&self) -> &[&'static str] {
        &["get"]
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, ServiceError> {
        match method {
            "get" => {
                let key = arg_str(&args, "key", method)?;
                let default = args.get("default").cloned().unwrap_or(Value::Null);
                Ok(self.config.get(&key).unwrap_or(default))
            }
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }
}

/// `core/state_store`: resident signals with optional TTL
pub struct StateStoreService {
    store: Arc<StateStore>,
}

impl StateStoreService {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Service for StateStoreService {
    fn methods(&self) -> &[&'static str] {
        &["get", "set", "delete", "all"]
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, ServiceError> {
        match method {
            "get" => {
                let key = arg_str(&args, "key", method)?;
                let default = args.get("default").cloned().unwrap_or(Value::Null);
                Ok(self.store.get(&key).unwrap_or(default))
            }
            "set" => {
                let key = arg_str(&args, "key", method)?;
                let value = args.get("value").cloned().unwrap_or(Value::Null);
                let ttl = args
                    .get("ttl_sec")
                    .and_then(Value::as_f64)
                    .map(Duration::from_secs_f64);
                self.store.set(&key, value, ttl);
                Ok(Value::Bool(true))
            }
            "delete" => {
                let key = arg_str(&args, "key", method)?;
                Ok(Value::Bool(self.store.delete(&key)))
            }
            "all" => Ok(json!(self.store.all())),
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }
}

/// `core/event_bus`: publish access for actions
pub struct EventBusService {
    bus: Arc<EventBus>,
}

impl EventBusService {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Service for EventBusService {
    fn methods(&self) -> &[&'static str] {
        &["publish"]
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, ServiceError> {
        match method {
            "publish" => {
                let name = arg_str(&args, "name", method)?;
                let payload = args.get("payload").cloned().unwrap_or(json!({}));
                let channel = args
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or(aura_core::event::CHANNEL_GLOBAL);
                let mut event = Event::with_channel(name, payload, channel);
                if let Some(source) = args.get("source").and_then(Value::as_str) {
                    event = event.from_source(source);
                }
                let reached = self.bus.publish(event).await;
                Ok(json!({ "subscribers": reached }))
            }
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }
}

/// Register the core service instances.
pub fn register_core_services(
    registry: &ServiceRegistry,
    config: Config,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
) {
    registry.register_instance(
        "config",
        "core/config",
        Arc::new(ConfigService { config }),
        true,
    );
    registry.register_instance(
        "state_store",
        "core/state_store",
        Arc::new(StateStoreService { store }),
        true,
    );
    registry.register_instance(
        "event_bus",
        "core/event_bus",
        Arc::new(EventBusService { bus }),
        true,
    );
}

// ---------------------------------------------------------------------------
// Builtin actions
// ---------------------------------------------------------------------------

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn log_action() -> ActionDefinition {
    ActionDefinition::new(
        "log",
        "core/system/log",
        ParamStyle::Named(vec![
            ParamSpec::required("message"),
            ParamSpec::optional("level", json!("info")),
        ]),
        ActionHandler::asynchronous(|call| async move {
            let message = call
                .args
                .get("message")
                .map(render_text)
                .unwrap_or_default();
            let level = call
                .args
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("info");
            match level {
                "debug" => debug!(task = %call.task_fqid, "{message}"),
                "warn" | "warning" => warn!(task = %call.task_fqid, "{message}"),
                "error" => error!(task = %call.task_fqid, "{message}"),
                _ => info!(task = %call.task_fqid, "{message}"),
            }
            Ok(Value::Bool(true))
        }),
    )
    .read_only()
}

fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sleep_action() -> ActionDefinition {
    ActionDefinition::new(
        "sleep",
        "core/system/sleep",
        ParamStyle::Named(vec![ParamSpec::required("seconds")]),
        ActionHandler::asynchronous(|call| async move {
            let seconds = call
                .args
                .get("seconds")
                .and_then(as_f64)
                .ok_or_else(|| ActionError::InvalidArguments {
                    action: "sleep".into(),
                    detail: "'seconds' must be a number".into(),
                })?;
            tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            Ok(Value::Bool(true))
        }),
    )
    .read_only()
}

fn stop_task_action() -> ActionDefinition {
    ActionDefinition::new(
        "stop_task",
        "core/system/stop_task",
        ParamStyle::Named(vec![
            ParamSpec::optional("message", json!("task stopped")),
            ParamSpec::optional("success", json!(true)),
        ]),
        ActionHandler::asynchronous(|call| async move {
            let message = call
                .args
                .get("message")
                .map(render_text)
                .unwrap_or_else(|| "task stopped".to_string());
            let success = call
                .args
                .get("success")
                .map(truthy)
                .unwrap_or(true);
            Err(ActionError::Stop { success, message })
        }),
    )
    .read_only()
}

fn assert_condition_action() -> ActionDefinition {
    ActionDefinition::new(
        "assert_condition",
        "core/system/assert_condition",
        ParamStyle::Named(vec![
            ParamSpec::required("condition"),
            ParamSpec::optional("message", json!("assertion failed")),
        ]),
        ActionHandler::asynchronous(|call| async move {
            let holds = call.args.get("condition").map(truthy).unwrap_or(false);
            if holds {
                Ok(Value::Bool(true))
            } else {
                Err(ActionError::Failed {
                    action: "assert_condition".into(),
                    detail: call
                        .args
                        .get("message")
                        .map(render_text)
                        .unwrap_or_else(|| "assertion failed".to_string()),
                })
            }
        }),
    )
    .read_only()
}

fn string_format_action() -> ActionDefinition {
    ActionDefinition::new(
        "string_format",
        "core/system/string_format",
        ParamStyle::Named(vec![
            ParamSpec::required("template"),
            ParamSpec::optional("values", json!({})),
        ]),
        ActionHandler::blocking(|call| {
            let template = call
                .args
                .get("template")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut out = template;
            if let Some(values) = call.args.get("values").and_then(Value::as_object) {
                for (key, value) in values {
                    out = out.replace(&format!("{{{key}}}"), &render_text(value));
                }
            }
            Ok(Value::String(out))
        }),
    )
    .read_only()
}

fn set_value_action() -> ActionDefinition {
    ActionDefinition::new(
        "set_value",
        "core/system/set_value",
        ParamStyle::Named(vec![
            ParamSpec::required("key"),
            ParamSpec::required("value"),
        ]),
        ActionHandler::asynchronous(|call| async move {
            let key = call
                .args
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| ActionError::InvalidArguments {
                    action: "set_value".into(),
                    detail: "'key' must be a string".into(),
                })?;
            let value = call.args.get("value").cloned().unwrap_or(Value::Null);
            call.context.set(key, value);
            Ok(Value::Bool(true))
        }),
    )
}

fn set_persistent_value_action() -> ActionDefinition {
    ActionDefinition::new(
        "set_persistent_value",
        "core/system/set_persistent_value",
        ParamStyle::Named(vec![
            ParamSpec::required("key"),
            ParamSpec::required("value"),
        ]),
        ActionHandler::asynchronous(|call| async move {
            let persistent = call.context.persistent().ok_or(ActionError::Failed {
                action: "set_persistent_value".into(),
                detail: "no persistent context attached to this run".into(),
            })?;
            let key = call
                .args
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| ActionError::InvalidArguments {
                    action: "set_persistent_value".into(),
                    detail: "'key' must be a string".into(),
                })?;
            let value = call.args.get("value").cloned().unwrap_or(Value::Null);
            persistent.set(key, value.clone());
            // Mirror into the run scope so later steps see it
            call.context.set(key, value);
            Ok(Value::Bool(true))
        }),
    )
}

fn save_persistent_context_action() -> ActionDefinition {
    ActionDefinition::new(
        "save_persistent_context",
        "core/system/save_persistent_context",
        ParamStyle::Named(vec![]),
        ActionHandler::asynchronous(|call| async move {
            let persistent = call.context.persistent().ok_or(ActionError::Failed {
                action: "save_persistent_context".into(),
                detail: "no persistent context attached to this run".into(),
            })?;
            persistent
                .save()
                .await
                .map_err(|err| ActionError::Failed {
                    action: "save_persistent_context".into(),
                    detail: err.to_string(),
                })?;
            Ok(Value::Bool(true))
        }),
    )
}

fn publish_event_action() -> ActionDefinition {
    ActionDefinition::new(
        "publish_event",
        "core/system/publish_event",
        ParamStyle::Named(vec![
            ParamSpec::required("name"),
            ParamSpec::optional("payload", json!({})),
            ParamSpec::optional("channel", json!("global")),
            ParamSpec::optional("source", Value::Null),
        ]),
        ActionHandler::asynchronous(|call| async move {
            let bus = call.service("event_bus")?;
            bus.call("publish", Value::Object(call.args.clone()))
                .await
                .map_err(ActionError::from)
        }),
    )
    .with_service("event_bus", "core/event_bus")
}

#[derive(Deserialize)]
struct StateSetParams {
    key: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    ttl_sec: Option<f64>,
}

fn state_set_action() -> ActionDefinition {
    ActionDefinition::new(
        "state.set",
        "core/system/state.set",
        ParamStyle::Record,
        ActionHandler::asynchronous(|call| async move {
            let params: StateSetParams = call.parse_args("state.set")?;
            let store = call.service("state_store")?;
            store
                .call(
                    "set",
                    json!({"key": params.key, "value": params.value, "ttl_sec": params.ttl_sec}),
                )
                .await
                .map_err(ActionError::from)
        }),
    )
    .with_service("state_store", "core/state_store")
}

#[derive(Deserialize)]
struct StateGetParams {
    key: String,
    #[serde(default)]
    default: Value,
}

fn state_get_action() -> ActionDefinition {
    ActionDefinition::new(
        "state.get",
        "core/system/state.get",
        ParamStyle::Record,
        ActionHandler::asynchronous(|call| async move {
            let params: StateGetParams = call.parse_args("state.get")?;
            let store = call.service("state_store")?;
            store
                .call("get", json!({"key": params.key, "default": params.default}))
                .await
                .map_err(ActionError::from)
        }),
    )
    .with_service("state_store", "core/state_store")
    .read_only()
}

#[derive(Deserialize)]
struct StateDeleteParams {
    key: String,
}

fn state_delete_action() -> ActionDefinition {
    ActionDefinition::new(
        "state.delete",
        "core/system/state.delete",
        ParamStyle::Record,
        ActionHandler::asynchronous(|call| async move {
            let params: StateDeleteParams = call.parse_args("state.delete")?;
            let store = call.service("state_store")?;
            store
                .call("delete", json!({"key": params.key}))
                .await
                .map_err(ActionError::from)
        }),
    )
    .with_service("state_store", "core/state_store")
}

/// All builtin definitions, in registration order.
pub fn builtin_actions() -> Vec<ActionDefinition> {
    vec![
        log_action(),
        sleep_action(),
        stop_task_action(),
        assert_condition_action(),
        string_format_action(),
        set_value_action(),
        set_persistent_value_action(),
        save_persistent_context_action(),
        publish_event_action(),
        state_set_action(),
        state_get_action(),
        state_delete_action(),
    ]
}

/// Register every builtin into the given registry.
pub fn register_builtin_actions(registry: &ActionRegistry) {
    for def in builtin_actions() {
        registry.register(def);
    }
}
