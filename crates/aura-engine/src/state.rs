//! Shared scheduler state
//!
//! The mutable maps and queues every background service works against,
//! owned by the facade and shared by `Arc`. Everything here is guarded by
//! asynchronous locks; none of them is held across a suspension point that
//! waits on another lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use aura_core::{InterruptRule, ScheduleItem, TaskDefinition, Tasklet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;
use crate::pause::PauseGate;
use crate::queue::TaskQueue;

/// Where a schedule item currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Queued,
    Running,
}

/// How the last run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResultKind {
    Success,
    Timeout,
    Cancelled,
    Failure,
}

/// One entry in a run's timeline
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub entry: String,
}

/// Status record per schedule item
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub state: RunState,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub result: Option<RunResultKind>,
    pub timeline: Vec<TimelineEntry>,
}

impl Default for RunRecord {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            queued_at: None,
            started_at: None,
            last_run: None,
            result: None,
            timeline: Vec::new(),
        }
    }
}

impl RunRecord {
    fn note(&mut self, entry: impl Into<String>) {
        self.timeline.push(TimelineEntry {
            at: Utc::now(),
            entry: entry.into(),
        });
        // Rolling window; old entries age out
        if self.timeline.len() > 64 {
            self.timeline.remove(0);
        }
    }

    pub fn mark_queued(&mut self, at: DateTime<Utc>) {
        self.state = RunState::Queued;
        self.queued_at = Some(at);
        self.note("queued");
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.state = RunState::Running;
        self.started_at = Some(at);
        self.note("running");
    }

    pub fn mark_finished(&mut self, at: DateTime<Utc>, result: RunResultKind) {
        self.state = RunState::Idle;
        self.last_run = Some(at);
        self.result = Some(result);
        self.note(format!("finished: {result:?}").to_lowercase());
    }
}

/// A currently executing tasklet
pub struct RunHandle {
    pub tasklet: Tasklet,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    pub is_interrupt_handler: bool,
}

/// Everything the background services share
pub struct SharedState {
    pub plans: RwLock<HashMap<String, Arc<Orchestrator>>>,
    /// plan name → owning plugin canonical id
    pub plan_plugin_ids: RwLock<HashMap<String, String>>,
    pub schedule_items: RwLock<Vec<ScheduleItem>>,
    pub run_statuses: RwLock<HashMap<String, RunRecord>>,
    pub interrupt_rules: RwLock<HashMap<String, InterruptRule>>,
    pub user_enabled_globals: RwLock<HashSet<String>>,
    /// Every known task, keyed by FQID
    pub task_definitions: RwLock<HashMap<String, Arc<TaskDefinition>>>,
    pub task_queue: TaskQueue,
    pub event_task_queue: TaskQueue,
    pub interrupt_queue: Mutex<VecDeque<InterruptRule>>,
    pub running_tasks: RwLock<HashMap<String, Arc<RunHandle>>>,
    pub pause_gate: PauseGate,
    /// Set while an interrupt handler holds the device
    pub device_busy: AtomicBool,
    pub running: AtomicBool,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            plan_plugin_ids: RwLock::new(HashMap::new()),
            schedule_items: RwLock::new(Vec::new()),
            run_statuses: RwLock::new(HashMap::new()),
            interrupt_rules: RwLock::new(HashMap::new()),
            user_enabled_globals: RwLock::new(HashSet::new()),
            task_definitions: RwLock::new(HashMap::new()),
            task_queue: TaskQueue::default(),
            event_task_queue: TaskQueue::default(),
            interrupt_queue: Mutex::new(VecDeque::new()),
            running_tasks: RwLock::new(HashMap::new()),
            pause_gate: PauseGate::new(),
            device_busy: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update_run_status<F>(&self, schedule_id: &str, update: F)
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut statuses = self.run_statuses.write().await;
        update(statuses.entry(schedule_id.to_string()).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_record_transitions() {
        let mut record = RunRecord::default();
        assert_eq!(record.state, RunState::Idle);

        let now = Utc::now();
        record.mark_queued(now);
        assert_eq!(record.state, RunState::Queued);
        record.mark_running(now);
        assert_eq!(record.state, RunState::Running);
        record.mark_finished(now, RunResultKind::Success);
        assert_eq!(record.state, RunState::Idle);
        assert_eq!(record.result, Some(RunResultKind::Success));
        assert_eq!(record.timeline.len(), 3);
    }

    #[tokio::test]
    async fn test_update_run_status_creates_record() {
        let shared = SharedState::new();
        shared
            .update_run_status("item-1", |record| record.mark_queued(Utc::now()))
            .await;
        let statuses = shared.run_statuses.read().await;
        assert_eq!(statuses["item-1"].state, RunState::Queued);
    }
}
