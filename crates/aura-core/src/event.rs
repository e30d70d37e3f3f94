//! Event type and well-known event names
//!
//! Events are immutable once published. The bus assigns a fresh id, bumps
//! `depth`, and appends the parent id to the causation chain before
//! dispatch; the chain carries ids only and is capped by a rolling window
//! so long causal threads cannot grow without bound.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default channel for events published without an explicit channel
pub const CHANNEL_GLOBAL: &str = "global";
/// Channel carrying the state planner's progress stream
pub const CHANNEL_PLANNER: &str = "planner";

// Task lifecycle events
pub const TASK_STARTED: &str = "task.started";
pub const TASK_SUCCEEDED: &str = "task.succeeded";
pub const TASK_FAILED: &str = "task.failed";

// State planner events
pub const PLANNER_STARTED: &str = "PLANNER_STARTED";
pub const PLANNER_MAP_LOADED: &str = "PLANNER_MAP_LOADED";
pub const PLANNER_STATE_LOCATED: &str = "PLANNER_STATE_LOCATED";
pub const PLANNER_PATH_FOUND: &str = "PLANNER_PATH_FOUND";
pub const PLANNER_STEP_EXECUTING: &str = "PLANNER_STEP_EXECUTING";
pub const PLANNER_STEP_COMPLETED: &str = "PLANNER_STEP_COMPLETED";
pub const PLANNER_SUCCEEDED: &str = "PLANNER_SUCCEEDED";
pub const PLANNER_FAILED: &str = "PLANNER_FAILED";

/// Rolling window on the causation chain: only the newest ids are kept.
pub const CAUSATION_WINDOW: usize = 32;

/// A single event flowing through the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub causation_chain: Vec<Uuid>,
    #[serde(default)]
    pub depth: u32,
}

impl Event {
    /// Create an event on the global channel.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self::with_channel(name, payload, CHANNEL_GLOBAL)
    }

    /// Create an event on a specific channel.
    pub fn with_channel(
        name: impl Into<String>,
        payload: Value,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            channel: channel.into(),
            payload,
            source: None,
            timestamp: Utc::now(),
            causation_chain: Vec::new(),
            depth: 0,
        }
    }

    /// Set the source tag.
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Derive the published copy of this event: fresh id, incremented depth,
    /// and the parent id appended to the (windowed) causation chain.
    pub fn caused_copy(&self) -> Self {
        let mut chain = self.causation_chain.clone();
        chain.push(self.id);
        if chain.len() > CAUSATION_WINDOW {
            let excess = chain.len() - CAUSATION_WINDOW;
            chain.drain(..excess);
        }
        Self {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            channel: self.channel.clone(),
            payload: self.payload.clone(),
            source: self.source.clone(),
            timestamp: Utc::now(),
            causation_chain: chain,
            depth: self.depth + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_defaults() {
        let event = Event::new("task.succeeded", json!({"task": "p/t"}));
        assert_eq!(event.channel, CHANNEL_GLOBAL);
        assert_eq!(event.depth, 0);
        assert!(event.causation_chain.is_empty());
        assert!(event.source.is_none());
    }

    #[test]
    fn test_caused_copy_links_parent() {
        let parent = Event::new("a", Value::Null);
        let child = parent.caused_copy();

        assert_ne!(child.id, parent.id);
        assert_eq!(child.depth, 1);
        assert_eq!(child.causation_chain, vec![parent.id]);
    }

    #[test]
    fn test_causation_window_caps_chain() {
        let mut event = Event::new("a", Value::Null);
        for _ in 0..(CAUSATION_WINDOW * 2) {
            event = event.caused_copy();
        }
        assert_eq!(event.causation_chain.len(), CAUSATION_WINDOW);
    }

    #[test]
    fn test_serde_round_trip() {
        let event = Event::with_channel("x", json!([1, 2]), "planner").from_source("test");
        let text = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name, "x");
        assert_eq!(back.channel, "planner");
        assert_eq!(back.id, event.id);
    }
}
