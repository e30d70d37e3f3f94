//! Tasklet: the unit of scheduling
//!
//! A tasklet wraps a task FQID (`plan/task`) plus the runtime knobs the
//! execution manager needs: priority, resource tags, timeout, and the lane
//! hints. Triggers (time, event, manual, interrupt recovery) all produce
//! tasklets; the commander consumes them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;

/// How a task's run is classified and reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
}

/// Queue priority; high jumps the queue but never preempts a running task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// A scheduled unit of work
#[derive(Debug, Clone)]
pub struct Tasklet {
    /// `plan/task` fully-qualified id
    pub task_fqid: String,

    /// The schedule item (or ad-hoc request) that produced this tasklet
    pub payload: Option<Value>,

    pub is_ad_hoc: bool,

    pub triggering_event: Option<Event>,

    pub execution_mode: ExecutionMode,

    /// `key` or `key:limit` tags mapped to capped semaphores
    pub resource_tags: Vec<String>,

    pub timeout: Duration,

    /// Route blocking work to the CPU lane instead of the I/O lane
    pub cpu_bound: bool,

    pub priority: Priority,
}

impl Tasklet {
    pub fn new(task_fqid: impl Into<String>) -> Self {
        Self {
            task_fqid: task_fqid.into(),
            payload: None,
            is_ad_hoc: false,
            triggering_event: None,
            execution_mode: ExecutionMode::default(),
            resource_tags: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            cpu_bound: false,
            priority: Priority::default(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn ad_hoc(mut self) -> Self {
        self.is_ad_hoc = true;
        self
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.triggering_event = Some(event);
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_resource_tags(mut self, tags: Vec<String>) -> Self {
        self.resource_tags = tags;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cpu_bound(mut self) -> Self {
        self.cpu_bound = true;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Split the FQID into `(plan, task-in-plan)`.
    pub fn split_fqid(&self) -> Option<(&str, &str)> {
        self.task_fqid.split_once('/')
    }

    /// The schedule-item id this tasklet was produced from, if any.
    pub fn schedule_id(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let tasklet = Tasklet::new("plan/task");
        assert_eq!(tasklet.priority, Priority::Normal);
        assert_eq!(tasklet.execution_mode, ExecutionMode::Sync);
        assert_eq!(tasklet.timeout, Duration::from_secs(3600));
        assert!(!tasklet.cpu_bound);
        assert!(!tasklet.is_ad_hoc);
    }

    #[test]
    fn test_split_fqid() {
        let tasklet = Tasklet::new("myplan/quests/daily/main");
        assert_eq!(tasklet.split_fqid(), Some(("myplan", "quests/daily/main")));
        assert_eq!(Tasklet::new("bare").split_fqid(), None);
    }

    #[test]
    fn test_schedule_id_from_payload() {
        let tasklet = Tasklet::new("p/t").with_payload(json!({"id": "sched-1"}));
        assert_eq!(tasklet.schedule_id(), Some("sched-1"));
        assert_eq!(Tasklet::new("p/t").schedule_id(), None);
    }

    #[test]
    fn test_execution_mode_serde() {
        assert_eq!(
            serde_json::from_str::<ExecutionMode>("\"async\"").unwrap(),
            ExecutionMode::Async
        );
        assert_eq!(
            serde_json::from_str::<ExecutionMode>("\"sync\"").unwrap(),
            ExecutionMode::Sync
        );
    }
}
