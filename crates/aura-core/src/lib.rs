//! Core types for the Aura execution framework.
//!
//! This crate holds everything the engine and the CLI share: the layered
//! configuration, per-run contexts, the file-backed persistent context, the
//! event type with its causation chain, the template renderer, the TTL state
//! store, and the serde model for plan YAML (tasks, schedules, interrupts,
//! state maps, tasklets).

pub mod config;
pub mod context;
pub mod event;
pub mod model;
pub mod persistent;
pub mod state_store;
pub mod template;

pub use config::{Config, ConfigError};
pub use context::Context;
pub use event::Event;
pub use model::interrupt::{InterruptCondition, InterruptRule, OnComplete};
pub use model::schedule::{RunOptions, ScheduleItem, Trigger, TriggerType};
pub use model::states::{StateMapSpec, StateSpec, TransitionRetry, TransitionSpec};
pub use model::task::{RetryConfig, Step, StepBody, TaskDefinition, TaskValidationError};
pub use model::tasklet::{ExecutionMode, Priority, Tasklet};
pub use persistent::{PersistenceError, PersistentContext};
pub use state_store::StateStore;
pub use template::TemplateRenderer;
