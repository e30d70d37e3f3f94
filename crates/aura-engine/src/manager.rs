//! Execution manager
//!
//! Admits tasklets under concurrency limits and owns their lifecycle: a
//! global semaphore caps total concurrent tasklets, per-resource semaphores
//! (built lazily from `key[:limit]` tags, first declaration wins) cap
//! shared resources, and each run gets a timeout and a cancellation token.
//! Hooks fire around every run; interrupt handlers bypass the status map
//! but follow the same acquire/release discipline. Acquisition order is
//! always the global semaphore first, then resources in tag order.

use std::collections::HashMap;
use std::sync::Arc;

use aura_core::{ExecutionMode, Tasklet};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::engine::RunStatus;
use crate::hooks::{self, HookManager};
use crate::pause::PauseGate;
use crate::state::{RunHandle, RunResultKind, SharedState};

/// Submission failures that never started the task
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("tasklet '{0}' has no plan prefix in its FQID")]
    BadFqid(String),

    #[error("no orchestrator for plan '{0}'")]
    UnknownPlan(String),

    #[error("execution manager is shut down")]
    Closed,
}

/// Outcome of one managed run
#[derive(Debug, Clone)]
pub struct TaskRunResult {
    pub result: RunResultKind,
    pub detail: Option<String>,
}

const DEFAULT_GLOBAL_LIMIT: usize = 32;
const DEFAULT_CPU_LIMIT: usize = 4;

/// Concurrency controller and per-tasklet lifecycle manager
pub struct ExecutionManager {
    shared: Arc<SharedState>,
    hooks: Arc<HookManager>,
    global: Arc<Semaphore>,
    resource_sems: Mutex<HashMap<String, Arc<Semaphore>>>,
    /// Extra gate for `cpu_bound` tasklets
    cpu_lane: Arc<Semaphore>,
}

impl ExecutionManager {
    pub fn new(shared: Arc<SharedState>, hooks: Arc<HookManager>) -> Self {
        Self::with_limits(shared, hooks, DEFAULT_GLOBAL_LIMIT, DEFAULT_CPU_LIMIT)
    }

    pub fn with_limits(
        shared: Arc<SharedState>,
        hooks: Arc<HookManager>,
        global_limit: usize,
        cpu_limit: usize,
    ) -> Self {
        Self {
            shared,
            hooks,
            global: Arc::new(Semaphore::new(global_limit.max(1))),
            resource_sems: Mutex::new(HashMap::new()),
            cpu_lane: Arc::new(Semaphore::new(cpu_limit.max(1))),
        }
    }

    /// Resolve the semaphores a tasklet needs, creating resource semaphores
    /// on first appearance. The limit from the first declaration wins.
    async fn semaphores_for(&self, tasklet: &Tasklet) -> Vec<Arc<Semaphore>> {
        let mut sems = vec![Arc::clone(&self.global)];
        let mut registry = self.resource_sems.lock().await;
        for tag in &tasklet.resource_tags {
            let (key, limit) = match tag.split_once(':') {
                Some((key, limit)) => (key, limit.parse::<usize>().unwrap_or(1)),
                None => (tag.as_str(), 1),
            };
            let sem = registry
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))));
            sems.push(Arc::clone(sem));
        }
        if tasklet.cpu_bound {
            sems.push(Arc::clone(&self.cpu_lane));
        }
        sems
    }

    /// Execute one tasklet under the full lifecycle protocol.
    #[instrument(skip(self, tasklet), fields(task = %tasklet.task_fqid))]
    pub async fn submit(
        &self,
        tasklet: Tasklet,
        is_interrupt_handler: bool,
    ) -> Result<TaskRunResult, SubmitError> {
        let schedule_id = tasklet.schedule_id().map(str::to_string);
        let now = Utc::now();
        let cancel = CancellationToken::new();

        if let Some(id) = &schedule_id {
            if !is_interrupt_handler {
                self.shared
                    .update_run_status(id, |record| record.mark_running(now))
                    .await;
            }
        }

        let handle = Arc::new(RunHandle {
            tasklet: tasklet.clone(),
            cancel: cancel.clone(),
            started_at: now,
            is_interrupt_handler,
        });
        if !is_interrupt_handler {
            self.shared
                .running_tasks
                .write()
                .await
                .insert(tasklet.task_fqid.clone(), Arc::clone(&handle));
        }

        // Global first, then resources in declaration order
        let mut permits: Vec<OwnedSemaphorePermit> = Vec::new();
        for sem in self.semaphores_for(&tasklet).await {
            match sem.acquire_owned().await {
                Ok(permit) => permits.push(permit),
                Err(_) => {
                    if !is_interrupt_handler {
                        self.shared
                            .running_tasks
                            .write()
                            .await
                            .remove(&tasklet.task_fqid);
                    }
                    return Err(SubmitError::Closed);
                }
            }
        }

        let hook_payload = json!({
            "task": tasklet.task_fqid,
            "schedule_id": schedule_id,
            "is_interrupt_handler": is_interrupt_handler,
            "started_at": now,
        });
        info!(mode = ?tasklet.execution_mode, "task execution started");
        self.hooks
            .trigger(hooks::BEFORE_TASK_RUN, hook_payload.clone())
            .await;

        let run = self.run_chain(&tasklet, is_interrupt_handler);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("task cancelled");
                TaskRunResult { result: RunResultKind::Cancelled, detail: None }
            }
            timed = tokio::time::timeout(tasklet.timeout, run) => match timed {
                Err(_) => {
                    error!(timeout = ?tasklet.timeout, "task timed out");
                    TaskRunResult { result: RunResultKind::Timeout, detail: None }
                }
                Ok(Err(err)) => {
                    error!(%err, "task failed to start");
                    TaskRunResult {
                        result: RunResultKind::Failure,
                        detail: Some(err.to_string()),
                    }
                }
                Ok(Ok(status)) => match status {
                    RunStatus::Success => TaskRunResult {
                        result: RunResultKind::Success,
                        detail: None,
                    },
                    other => TaskRunResult {
                        result: RunResultKind::Failure,
                        detail: Some(format!("run ended with status {other:?}").to_lowercase()),
                    },
                },
            },
        };

        if let Some(id) = &schedule_id {
            if !is_interrupt_handler {
                let result = outcome.result;
                self.shared
                    .update_run_status(id, move |record| {
                        record.mark_finished(Utc::now(), result)
                    })
                    .await;
            }
        }
        match outcome.result {
            RunResultKind::Success => {
                info!("task execution succeeded");
                self.hooks
                    .trigger(hooks::AFTER_TASK_SUCCESS, hook_payload.clone())
                    .await;
            }
            _ => {
                self.hooks
                    .trigger(hooks::AFTER_TASK_FAILURE, hook_payload.clone())
                    .await;
            }
        }

        if !is_interrupt_handler {
            self.shared
                .running_tasks
                .write()
                .await
                .remove(&tasklet.task_fqid);
        }
        self.hooks.trigger(hooks::AFTER_TASK_RUN, hook_payload).await;
        drop(permits);
        info!("task execution finished, resources released");
        Ok(outcome)
    }

    /// Resolve the orchestrator and run the task chain.
    async fn run_chain(
        &self,
        tasklet: &Tasklet,
        is_interrupt_handler: bool,
    ) -> Result<RunStatus, SubmitError> {
        let (plan_name, task_in_plan) = resolve_target(tasklet)?;

        let orchestrator = {
            let plans = self.shared.plans.read().await;
            plans
                .get(&plan_name)
                .cloned()
                .ok_or(SubmitError::UnknownPlan(plan_name.clone()))?
        };

        // Handlers get a fresh gate so they never observe their own pause
        let gate = if is_interrupt_handler {
            PauseGate::new()
        } else {
            self.shared.pause_gate.clone()
        };

        let seeds = tasklet
            .payload
            .as_ref()
            .and_then(|p| p.get("params"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new);

        let outcome = orchestrator
            .execute_task_seeded(&task_in_plan, tasklet.triggering_event.clone(), gate, &seeds)
            .await;
        match outcome {
            Ok(outcome) => Ok(outcome.status),
            Err(err) => {
                error!(%err, "orchestrator rejected the task");
                Ok(RunStatus::Error)
            }
        }
    }

    /// The execution mode only classifies runs; lane choice is per action.
    pub fn classify(&self, tasklet: &Tasklet) -> ExecutionMode {
        tasklet.execution_mode
    }
}

fn resolve_target(tasklet: &Tasklet) -> Result<(String, String), SubmitError> {
    if let Some(payload) = &tasklet.payload {
        let plan = payload.get("plan_name").and_then(Value::as_str);
        let task = payload
            .get("task")
            .or_else(|| payload.get("task_name"))
            .and_then(Value::as_str);
        if let (Some(plan), Some(task)) = (plan, task) {
            return Ok((plan.to_string(), task.to_string()));
        }
    }
    tasklet
        .split_fqid()
        .map(|(plan, task)| (plan.to_string(), task.to_string()))
        .ok_or_else(|| SubmitError::BadFqid(tasklet.task_fqid.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::RuntimeEnv;
    use crate::orchestrator::Orchestrator;
    use aura_core::{Config, Priority};
    use std::time::{Duration, Instant};

    async fn project(sleep_sec: f64) -> (tempfile::TempDir, Arc<SharedState>, ExecutionManager) {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plans/demo");
        std::fs::create_dir_all(plan.join("tasks")).unwrap();
        std::fs::write(
            plan.join("tasks/t.yaml"),
            format!(
                "slow:\n  steps:\n    - action: sleep\n      params:\n        seconds: {sleep_sec}\nquick:\n  steps:\n    - action: log\n      params:\n        message: ok\nbroken:\n  steps:\n    - action: no_such_action\n"
            ),
        )
        .unwrap();

        let env = RuntimeEnv::new(Config::new());
        crate::actions::builtin::register_builtin_actions(&env.actions);
        crate::actions::builtin::register_core_services(
            &env.services,
            env.config.clone(),
            Arc::clone(&env.state_store),
            Arc::clone(&env.bus),
        );
        let env = Arc::new(env);
        let orchestrator = Arc::new(Orchestrator::new("demo", &plan, env, Map::new()));

        let shared = Arc::new(SharedState::new());
        let manager = ExecutionManager::new(Arc::clone(&shared), Arc::new(HookManager::new()));
        shared
            .plans
            .write()
            .await
            .insert("demo".to_string(), orchestrator);
        (dir, shared, manager)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_successful_run() {
        let (_dir, _shared, manager) = project(0.0).await;
        let result = manager
            .submit(Tasklet::new("demo/t/quick"), false)
            .await
            .unwrap();
        assert_eq!(result.result, RunResultKind::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_step_reports_failure() {
        let (_dir, _shared, manager) = project(0.0).await;
        let result = manager
            .submit(Tasklet::new("demo/t/broken"), false)
            .await
            .unwrap();
        assert_eq!(result.result, RunResultKind::Failure);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_is_reported() {
        let (_dir, _shared, manager) = project(5.0).await;
        let tasklet = Tasklet::new("demo/t/slow").with_timeout(Duration::from_millis(50));
        let result = manager.submit(tasklet, false).await.unwrap();
        assert_eq!(result.result, RunResultKind::Timeout);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resource_tag_serializes_runs() {
        let (_dir, _shared, manager) = project(0.2).await;
        let manager = Arc::new(manager);

        let start = Instant::now();
        let a = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .submit(
                        Tasklet::new("demo/t/slow")
                            .with_resource_tags(vec!["gpu:1".to_string()]),
                        false,
                    )
                    .await
            })
        };
        let b = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .submit(
                        Tasklet::new("demo/t/slow")
                            .with_resource_tags(vec!["gpu:1".to_string()]),
                        false,
                    )
                    .await
            })
        };
        assert_eq!(a.await.unwrap().unwrap().result, RunResultKind::Success);
        assert_eq!(b.await.unwrap().unwrap().result, RunResultKind::Success);
        // Serialized: total wall time at least the sum of both runs
        assert!(start.elapsed() >= Duration::from_millis(380));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation() {
        let (_dir, shared, manager) = project(5.0).await;
        let manager = Arc::new(manager);

        let run = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit(Tasklet::new("demo/t/slow"), false).await })
        };
        // Wait until the run registers, then cancel it
        let handle = loop {
            if let Some(handle) = shared.running_tasks.read().await.get("demo/t/slow") {
                break Arc::clone(handle);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        handle.cancel.cancel();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.result, RunResultKind::Cancelled);
        assert!(!shared.running_tasks.read().await.contains_key("demo/t/slow"));
    }

    #[test]
    fn test_resolve_target_variants() {
        let tasklet = Tasklet::new("demo/quests/daily/main");
        assert_eq!(
            resolve_target(&tasklet).unwrap(),
            ("demo".to_string(), "quests/daily/main".to_string())
        );

        let tasklet = Tasklet::new("whatever").with_payload(json!({
            "plan_name": "demo",
            "task": "t/quick",
        }));
        assert_eq!(
            resolve_target(&tasklet).unwrap(),
            ("demo".to_string(), "t/quick".to_string())
        );

        assert!(resolve_target(&Tasklet::new("bare").with_priority(Priority::High)).is_err());
    }
}
