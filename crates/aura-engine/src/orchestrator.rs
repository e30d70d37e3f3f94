//! Per-plan orchestrator
//!
//! Loads the plan's tasks, builds a fresh context per run, drives the
//! engine, and chains `go_task` jumps within the plan. Cross-plan jumps are
//! rejected: the orchestrator is the authority on plan boundaries. Also
//! hosts the read-only condition checks used by the interrupt service and
//! the state-planner entry point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aura_core::event::{self, Event};
use aura_core::model::interrupt::InterruptCondition;
use aura_core::model::states::StateMapSpec;
use aura_core::TaskDefinition;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::context_manager::ContextManager;
use crate::engine::{ExecutionEngine, RunOutcome, RunStatus};
use crate::env::RuntimeEnv;
use crate::injector::ActionInjector;
use crate::pause::PauseGate;
use crate::planner::StatePlanner;
use crate::task_loader::TaskLoader;

/// Orchestrator failures
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("task definition not found: {0}")]
    TaskNotFound(String),

    #[error("step index {index} out of range for task '{task}'")]
    StepIndexOutOfRange { task: String, index: usize },

    #[error("access outside the plan directory refused: {0}")]
    PathEscape(String),

    #[error("file not found in plan: {0}")]
    FileNotFound(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state map {path} is invalid: {detail}")]
    BadStateMap { path: String, detail: String },
}

/// One plan's execution façade
pub struct Orchestrator {
    plan_name: String,
    plan_path: PathBuf,
    env: Arc<RuntimeEnv>,
    task_loader: TaskLoader,
    context_manager: ContextManager,
    state_maps: Mutex<HashMap<(PathBuf, u32), Arc<StateMapSpec>>>,
}

impl Orchestrator {
    pub fn new(
        plan_name: impl Into<String>,
        plan_path: &Path,
        env: Arc<RuntimeEnv>,
        plan_config: Map<String, Value>,
    ) -> Self {
        let plan_name = plan_name.into();
        Self {
            task_loader: TaskLoader::new(plan_name.clone(), plan_path),
            context_manager: ContextManager::new(plan_name.clone(), plan_path, plan_config),
            plan_name,
            plan_path: plan_path.to_path_buf(),
            env,
            state_maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    pub fn env(&self) -> &Arc<RuntimeEnv> {
        &self.env
    }

    pub fn plan_path(&self) -> &Path {
        &self.plan_path
    }

    /// Execute a task (and any `go_task` successors) to completion.
    pub async fn execute_task(
        self: Arc<Self>,
        task_in_plan: &str,
        triggering_event: Option<Event>,
        gate: PauseGate,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.execute_task_seeded(task_in_plan, triggering_event, gate, &Map::new())
            .await
    }

    /// Execute a task with extra context seeds (ad-hoc params).
    pub async fn execute_task_seeded(
        self: Arc<Self>,
        task_in_plan: &str,
        mut triggering_event: Option<Event>,
        gate: PauseGate,
        seeds: &Map<String, Value>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let mut current = task_in_plan.to_string();
        let mut last: Option<RunOutcome> = None;

        loop {
            let fqid = format!("{}/{}", self.plan_name, current);
            let task = self
                .task_loader
                .get_task(&current)
                .ok_or_else(|| OrchestratorError::TaskNotFound(fqid.clone()))?;

            let context = self
                .context_manager
                .create_context(&fqid, triggering_event.take(), seeds)
                .await;
            let mut engine = ExecutionEngine::new(
                Arc::clone(&self.env),
                Arc::clone(&self),
                context,
                gate.clone(),
                fqid.clone(),
            );

            self.env
                .bus
                .publish(Event::new(event::TASK_STARTED, json!({"task": fqid})))
                .await;
            let outcome = engine.run(&task, &fqid).await;
            match outcome.status {
                RunStatus::Success => {
                    self.env
                        .bus
                        .publish(Event::new(event::TASK_SUCCEEDED, json!({"task": fqid})))
                        .await;
                }
                RunStatus::GoTask => {}
                RunStatus::Stopped | RunStatus::Error => {
                    let status = if outcome.status == RunStatus::Stopped {
                        "stopped"
                    } else {
                        "error"
                    };
                    self.env
                        .bus
                        .publish(Event::new(
                            event::TASK_FAILED,
                            json!({"task": fqid, "status": status}),
                        ))
                        .await;
                }
            }

            let next = match (&outcome.status, &outcome.next_task) {
                (RunStatus::GoTask, Some(target)) => Some(target.clone()),
                _ => None,
            };
            last = Some(outcome);

            match next {
                Some(target) => match target.split_once('/') {
                    Some((plan, task)) if plan == self.plan_name => {
                        info!(from = %current, to = %task, "go_task chains to next task");
                        current = task.to_string();
                    }
                    Some((plan, _)) => {
                        error!(
                            from = %self.plan_name,
                            to = %plan,
                            "go_task cannot cross plans, chain ends"
                        );
                        break;
                    }
                    None => {
                        // Bare target is a task of this plan
                        current = target;
                    }
                },
                None => break,
            }
        }

        Ok(last.unwrap_or(RunOutcome {
            status: RunStatus::Success,
            next_task: None,
            output: None,
        }))
    }

    /// Load a task by full FQID; only this plan's tasks resolve.
    pub fn load_task_data(&self, full_task_id: &str) -> Option<Arc<TaskDefinition>> {
        match full_task_id.split_once('/') {
            Some((plan, task)) if plan == self.plan_name => self.task_loader.get_task(task),
            Some((plan, _)) => {
                error!(
                    own = %self.plan_name,
                    requested = plan,
                    "cannot load a task belonging to another plan"
                );
                None
            }
            None => self.task_loader.get_task(full_task_id),
        }
    }

    /// All task definitions of this plan, keyed by in-plan id.
    pub fn task_definitions(&self) -> HashMap<String, Arc<TaskDefinition>> {
        self.task_loader.get_all()
    }

    /// Drop the task-file cache (after file mutations).
    pub fn invalidate_tasks(&self) {
        self.task_loader.invalidate();
    }

    /// Evaluate an interrupt condition: the action must exist and be
    /// read-only; any failure reads as false.
    pub async fn perform_condition_check(&self, condition: &InterruptCondition) -> bool {
        if condition.action.is_empty() {
            return false;
        }
        match self.env.actions.get(&condition.action) {
            Some(def) if def.read_only => {}
            Some(_) => {
                warn!(action = %condition.action, "condition action is not read-only, skipped");
                return false;
            }
            None => {
                warn!(action = %condition.action, "condition action does not exist, skipped");
                return false;
            }
        }

        let context = self
            .context_manager
            .create_context(
                &format!("condition_check/{}", condition.action),
                None,
                &Map::new(),
            )
            .await;
        let injector = ActionInjector::new(
            Arc::clone(&self.env),
            context,
            format!("{}/condition_check", self.plan_name),
        );
        match injector.execute(&condition.action, &condition.params).await {
            Ok(value) => aura_core::template::truthy(&value),
            Err(err) => {
                error!(action = %condition.action, %err, "condition check failed");
                false
            }
        }
    }

    /// Render and run a single step's action, for editor tooling.
    pub async fn inspect_step(
        &self,
        task_in_plan: &str,
        step_index: usize,
    ) -> Result<Value, OrchestratorError> {
        let fqid = format!("{}/{}", self.plan_name, task_in_plan);
        let task = self
            .task_loader
            .get_task(task_in_plan)
            .ok_or_else(|| OrchestratorError::TaskNotFound(fqid.clone()))?;
        let step = task.steps.get(step_index).ok_or(
            OrchestratorError::StepIndexOutOfRange {
                task: fqid.clone(),
                index: step_index,
            },
        )?;

        let (action, params) = match &step.body {
            aura_core::StepBody::Action {
                action: Some(action),
                params,
                ..
            } => (action.clone(), params.clone()),
            _ => {
                return Ok(json!({
                    "status": "no_action",
                    "message": "this step has no runnable action",
                }))
            }
        };

        let context = self
            .context_manager
            .create_context(&format!("inspect/{fqid}"), None, &Map::new())
            .await;
        context.set("__is_inspect_mode__", Value::Bool(true));
        let injector = ActionInjector::new(Arc::clone(&self.env), context, fqid);
        match injector.execute(&action, &params).await {
            Ok(value) => Ok(value),
            Err(err) => Ok(json!({"status": "error", "message": err.to_string()})),
        }
    }

    /// Drive the system into `target_state` via the state planner.
    pub async fn ensure_state(self: Arc<Self>, target_state: &str) -> bool {
        self.ensure_state_with_cost(target_state, 1).await
    }

    pub async fn ensure_state_with_cost(
        self: Arc<Self>,
        target_state: &str,
        default_cost: u32,
    ) -> bool {
        let spec = match self.load_state_map(default_cost).await {
            Ok(spec) => spec,
            Err(err) => {
                error!(plan = %self.plan_name, %err, "state map unavailable");
                return false;
            }
        };
        let planner = StatePlanner::new(spec, Arc::clone(&self), default_cost);
        planner.ensure_state(target_state).await
    }

    /// Parse (and cache) the plan's `states_map.yaml`.
    async fn load_state_map(
        &self,
        default_cost: u32,
    ) -> Result<Arc<StateMapSpec>, OrchestratorError> {
        let path = self.plan_path.join("states_map.yaml");
        let key = (path.clone(), default_cost);

        let mut cache = self.state_maps.lock().await;
        if let Some(spec) = cache.get(&key) {
            return Ok(Arc::clone(spec));
        }

        let text =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| OrchestratorError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
        let spec: StateMapSpec =
            serde_yaml::from_str(&text).map_err(|err| OrchestratorError::BadStateMap {
                path: path.display().to_string(),
                detail: err.to_string(),
            })?;
        let spec = Arc::new(spec);
        cache.insert(key, Arc::clone(&spec));
        info!(
            plan = %self.plan_name,
            states = spec.states.len(),
            transitions = spec.transitions.len(),
            "state map loaded"
        );
        Ok(spec)
    }

    /// Persistent-context accessors for the facade API.
    pub async fn persistent_data(&self) -> std::collections::BTreeMap<String, Value> {
        self.context_manager.persistent_data().await
    }

    pub async fn save_persistent_data(
        &self,
        data: std::collections::BTreeMap<String, Value>,
    ) -> Result<(), aura_core::PersistenceError> {
        self.context_manager.save_persistent_data(data).await
    }

    /// Read a file inside the plan directory; escapes are refused.
    pub fn read_plan_file(&self, relative: &str) -> Result<String, OrchestratorError> {
        let path = self.resolve_inside(relative)?;
        if !path.is_file() {
            return Err(OrchestratorError::FileNotFound(relative.to_string()));
        }
        std::fs::read_to_string(&path).map_err(|source| OrchestratorError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Write a file inside the plan directory; escapes are refused.
    pub fn write_plan_file(&self, relative: &str, content: &str) -> Result<(), OrchestratorError> {
        let path = self.resolve_inside(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| OrchestratorError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(&path, content).map_err(|source| OrchestratorError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn resolve_inside(&self, relative: &str) -> Result<PathBuf, OrchestratorError> {
        let candidate = self.plan_path.join(relative);
        let normalized = normalize(&candidate);
        let root = normalize(&self.plan_path);
        if !normalized.starts_with(&root) {
            return Err(OrchestratorError::PathEscape(relative.to_string()));
        }
        Ok(normalized)
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the fs.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::Config;

    fn orchestrator() -> (tempfile::TempDir, Arc<Orchestrator>) {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plans/demo");
        std::fs::create_dir_all(plan.join("tasks")).unwrap();
        std::fs::write(
            plan.join("tasks/t.yaml"),
            r#"
main:
  steps:
    - action: log
      params:
        message: hello
chained:
  steps:
    - go_task: demo/t/main
"#,
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
        let orch = Arc::new(Orchestrator::new("demo", &plan, Arc::new(env), Map::new()));
        (dir, orch)
    }

    #[tokio::test]
    async fn test_execute_simple_task() {
        let (_dir, orch) = orchestrator();
        let outcome = orch
            .execute_task("t/main", None, PauseGate::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_go_task_chains_within_plan() {
        let (_dir, orch) = orchestrator();
        let outcome = orch
            .execute_task("t/chained", None, PauseGate::new())
            .await
            .unwrap();
        // The chain lands on main, which succeeds
        assert_eq!(outcome.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_unknown_task_errors() {
        let (_dir, orch) = orchestrator();
        assert!(matches!(
            orch.execute_task("t/missing", None, PauseGate::new()).await,
            Err(OrchestratorError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_plan_task_load_refused() {
        let (_dir, orch) = orchestrator();
        assert!(orch.load_task_data("other/t/main").is_none());
        assert!(orch.load_task_data("demo/t/main").is_some());
    }

    #[test]
    fn test_path_escape_refused() {
        let (_dir, orch) = orchestrator();
        assert!(matches!(
            orch.read_plan_file("../../etc/passwd"),
            Err(OrchestratorError::PathEscape(_))
        ));
    }
}
