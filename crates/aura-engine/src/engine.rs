//! Execution engine
//!
//! Interprets one task's step tree to completion or early termination.
//! Control flow (`go_step`, `go_task`, `stop_task`) travels as signals, not
//! results: a jump unwinds the recursion to the top-level loop, which either
//! re-enters at the target index or exits so the orchestrator can chain to
//! the next task. The pause gate is checked at every step entry, before
//! retry attempts, and on each loop iteration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aura_core::template::truthy;
use aura_core::{Context, Step, StepBody, TaskDefinition};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::actions::ActionError;
use crate::env::RuntimeEnv;
use crate::injector::ActionInjector;
use crate::orchestrator::Orchestrator;
use crate::pause::PauseGate;

/// Classification of one task run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Stopped,
    Error,
    GoTask,
}

/// What a run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Set on `GoTask` (the jump target) or on success via `next:`
    pub next_task: Option<String>,
    /// The task's rendered `outputs` map, on success
    pub output: Option<Value>,
}

impl RunOutcome {
    fn success(next_task: Option<String>, output: Option<Value>) -> Self {
        Self {
            status: RunStatus::Success,
            next_task,
            output,
        }
    }

    fn stopped() -> Self {
        Self {
            status: RunStatus::Stopped,
            next_task: None,
            output: None,
        }
    }

    fn error() -> Self {
        Self {
            status: RunStatus::Error,
            next_task: None,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JumpKind {
    GoStep,
    GoTask,
}

#[derive(Debug)]
struct JumpSignal {
    kind: JumpKind,
    target: String,
}

/// Step-level control flow and failures
#[derive(Debug)]
enum StepError {
    Jump(JumpSignal),
    Stop { success: bool, reason: String },
    Fatal(String),
}

const DEFAULT_MAX_LOOPS: u64 = 1000;

/// One task run's interpreter; exclusive per run
pub struct ExecutionEngine {
    env: Arc<RuntimeEnv>,
    orchestrator: Arc<Orchestrator>,
    context: Context,
    pause: PauseGate,
    injector: ActionInjector,
    task_fqid: String,
    step_map: HashMap<String, usize>,
    next_task_target: Option<String>,
}

impl ExecutionEngine {
    pub fn new(
        env: Arc<RuntimeEnv>,
        orchestrator: Arc<Orchestrator>,
        context: Context,
        pause: PauseGate,
        task_fqid: impl Into<String>,
    ) -> Self {
        let task_fqid = task_fqid.into();
        let injector = ActionInjector::new(Arc::clone(&env), context.clone(), task_fqid.clone());
        Self {
            env,
            orchestrator,
            context,
            pause,
            injector,
            task_fqid,
            step_map: HashMap::new(),
            next_task_target: None,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Run the task to completion or early termination.
    pub async fn run(&mut self, task: &TaskDefinition, task_fqid: &str) -> RunOutcome {
        if task.steps.is_empty() {
            return RunOutcome::success(None, None);
        }

        self.step_map.clear();
        build_step_map(&task.steps, &mut self.step_map, None);
        let display_name = task.display_name(task_fqid);
        info!(task = %display_name, "======= task started =======");

        let mut current = 0usize;
        while current < task.steps.len() {
            self.next_task_target = None;
            let step = &task.steps[current];
            let step_name = step
                .name
                .clone()
                .unwrap_or_else(|| format!("step {}", current + 1));
            debug!(step = %step_name, index = current + 1, total = task.steps.len(), "executing step");

            match self.execute_step(step).await {
                Ok(()) => {}
                Err(StepError::Jump(signal)) => match signal.kind {
                    JumpKind::GoTask => {
                        return RunOutcome {
                            status: RunStatus::GoTask,
                            next_task: Some(signal.target),
                            output: None,
                        };
                    }
                    JumpKind::GoStep => {
                        let target = self
                            .injector
                            .render_value(&Value::String(signal.target.clone()));
                        let target_id = target.as_str().unwrap_or(&signal.target).to_string();
                        match self.step_map.get(&target_id) {
                            Some(&index) => {
                                current = index;
                                continue;
                            }
                            None => {
                                warn!(target = %target_id, "go_step target not found, stopping");
                                return RunOutcome::stopped();
                            }
                        }
                    }
                },
                Err(StepError::Stop { success, reason }) => {
                    if success {
                        info!(%reason, "task stopped");
                    } else {
                        warn!(%reason, "task stopped");
                    }
                    return RunOutcome::stopped();
                }
                Err(StepError::Fatal(reason)) => {
                    error!(task = %task_fqid, %reason, "task aborted by unexpected error");
                    return RunOutcome::error();
                }
            }

            if let Some(next) = self.next_task_target.take() {
                return RunOutcome::success(Some(next), self.render_outputs(task));
            }
            current += 1;
        }

        info!(task = %display_name, "======= task finished =======");
        RunOutcome::success(self.next_task_target.take(), self.render_outputs(task))
    }

    fn render_outputs(&self, task: &TaskDefinition) -> Option<Value> {
        task.outputs.as_ref().map(|outputs| {
            self.env
                .renderer
                .render_value(&Value::Object(outputs.clone()), &self.context.snapshot())
        })
    }

    fn execute_step<'a>(&'a mut self, step: &'a Step) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            self.pause.wait_if_paused().await;

            if let Some(when) = &step.when {
                if !self.injector.render_truthy(when) {
                    debug!(condition = ?when, "'when' not satisfied, step skipped");
                    return Ok(());
                }
            }

            if let Some(target) = &step.go_step {
                return Err(StepError::Jump(JumpSignal {
                    kind: JumpKind::GoStep,
                    target: target.clone(),
                }));
            }
            if let Some(target) = &step.go_task {
                let rendered = self.injector.render_value(target);
                let target = rendered
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| render_plain(target));
                return Err(StepError::Jump(JumpSignal {
                    kind: JumpKind::GoTask,
                    target,
                }));
            }
            if let Some(next) = &step.next {
                let rendered = self.injector.render_value(next);
                if let Some(next) = rendered.as_str() {
                    self.next_task_target = Some(next.to_string());
                }
            }

            match &step.body {
                StepBody::If {
                    condition,
                    then_steps,
                    else_steps,
                } => {
                    if self.injector.render_truthy(condition) {
                        self.execute_block(then_steps).await
                    } else {
                        self.execute_block(else_steps).await
                    }
                }
                StepBody::For { var, items, body } => self.execute_for(var, items, body).await,
                StepBody::While {
                    condition,
                    max_loops,
                    body,
                } => self.execute_while(condition, max_loops.as_ref(), body).await,
                StepBody::Switch {
                    subject,
                    cases,
                    default,
                } => {
                    let subject = self.injector.render_value(subject);
                    for case in cases {
                        if self.injector.render_value(&case.case) == subject {
                            return self.execute_block(&case.then_steps).await;
                        }
                    }
                    self.execute_block(default).await
                }
                StepBody::Action { .. } => {
                    let succeeded = self.execute_action_step(step).await?;
                    let continue_on_failure = matches!(
                        &step.body,
                        StepBody::Action {
                            continue_on_failure: true,
                            ..
                        }
                    );
                    if !succeeded && !continue_on_failure {
                        let name = step.name.clone().unwrap_or_else(|| "unnamed".to_string());
                        return Err(StepError::Stop {
                            success: false,
                            reason: format!(
                                "step '{name}' failed and continue_on_failure is not set"
                            ),
                        });
                    }
                    Ok(())
                }
            }
        })
    }

    async fn execute_block(&mut self, steps: &[Step]) -> Result<(), StepError> {
        for step in steps {
            self.execute_step(step).await?;
        }
        Ok(())
    }

    async fn execute_for(
        &mut self,
        var: &str,
        items: &Value,
        body: &[Step],
    ) -> Result<(), StepError> {
        let rendered = self.injector.render_value(items);
        let items: Vec<Value> = match rendered {
            Value::Array(items) => items,
            // Objects iterate over their keys, everything else is skipped
            Value::Object(map) => map.keys().map(|k| Value::String(k.clone())).collect(),
            _ => {
                warn!(var, "'for' expression did not render to an iterable, skipped");
                return Ok(());
            }
        };

        let result = async {
            for item in items {
                self.pause.wait_if_paused().await;
                self.context.set(var, item);
                self.execute_block(body).await?;
            }
            Ok(())
        }
        .await;
        // The loop variable never leaks, even on jumps and failures
        self.context.delete(var);
        result
    }

    async fn execute_while(
        &mut self,
        condition: &Value,
        max_loops: Option<&Value>,
        body: &[Step],
    ) -> Result<(), StepError> {
        let limit = max_loops
            .map(|v| self.injector.render_value(v))
            .as_ref()
            .and_then(value_as_u64)
            .unwrap_or(DEFAULT_MAX_LOOPS);

        let mut iterations = 0u64;
        while self.injector.render_truthy(condition) {
            self.pause.wait_if_paused().await;
            if iterations >= limit {
                warn!(limit, "'while' reached its loop bound");
                break;
            }
            iterations += 1;
            self.execute_block(body).await?;
        }
        Ok(())
    }

    /// Run a single action step with retries. Returns step success.
    async fn execute_action_step(&mut self, step: &Step) -> Result<bool, StepError> {
        let StepBody::Action {
            action,
            params,
            retry,
            wait_before,
            output_to,
            ..
        } = &step.body
        else {
            return Err(StepError::Fatal("not an action step".to_string()));
        };

        if let Some(wait) = wait_before {
            let rendered = self.injector.render_value(wait);
            if let Some(seconds) = value_as_f64(&rendered) {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            }
        }

        let retry = retry.clone().unwrap_or_default();
        let attempts = retry.count.max(1);

        for attempt in 0..attempts {
            self.pause.wait_if_paused().await;
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs_f64(retry.interval_sec.max(0.0))).await;
            }

            let result = match action.as_deref() {
                Some(name) if name.eq_ignore_ascii_case("run_task") => {
                    match self.run_sub_task(params).await {
                        Ok(value) => Ok(value),
                        Err(StepError::Jump(signal)) => return Err(StepError::Jump(signal)),
                        Err(other) => return Err(other),
                    }
                }
                Some(name) => match self.injector.execute(name, params).await {
                    Ok(value) => Ok(value),
                    Err(ActionError::Stop { success, message }) => {
                        return Err(StepError::Stop {
                            success,
                            reason: message,
                        });
                    }
                    Err(err) => Err(err),
                },
                // A step with no action is a pure control step
                None => Ok(Value::Bool(true)),
            };

            match result {
                Ok(value) if is_step_success(&value) => {
                    if let Some(key) = output_to {
                        self.context.set(key, value);
                    }
                    return Ok(true);
                }
                Ok(_) => {
                    debug!(attempt = attempt + 1, attempts, "action reported failure");
                }
                Err(err) => {
                    warn!(
                        action = action.as_deref().unwrap_or(""),
                        attempt = attempt + 1,
                        attempts,
                        %err,
                        "action attempt failed"
                    );
                }
            }
        }

        if let Some(key) = output_to {
            self.context.set(key, Value::Bool(false));
        }
        self.capture_failure_diagnostic(step.name.as_deref().unwrap_or("unnamed_step"))
            .await;
        Ok(false)
    }

    /// `run_task`: execute another task of the same plan in a forked scope.
    async fn run_sub_task(&mut self, params: &Map<String, Value>) -> Result<Value, StepError> {
        let rendered = self.injector.render_params(params);
        let Some(sub_fqid) = rendered.get("task_name").and_then(Value::as_str) else {
            warn!("run_task without a 'task_name' parameter");
            return Ok(Value::Bool(false));
        };
        let Some(sub_task) = self.orchestrator.load_task_data(sub_fqid) else {
            return Ok(Value::Bool(false));
        };

        let sub_context = self.context.fork();
        if let Some(pass) = rendered.get("pass_params").and_then(Value::as_object) {
            for (key, value) in pass {
                sub_context.set(key, value.clone());
            }
        }

        let mut sub_engine = ExecutionEngine::new(
            Arc::clone(&self.env),
            Arc::clone(&self.orchestrator),
            sub_context.clone(),
            self.pause.clone(),
            sub_fqid.to_string(),
        );
        let outcome = sub_engine.run(&sub_task, sub_fqid).await;

        if outcome.status == RunStatus::GoTask {
            return Err(StepError::Jump(JumpSignal {
                kind: JumpKind::GoTask,
                target: outcome.next_task.unwrap_or_default(),
            }));
        }
        if outcome.status == RunStatus::Success {
            if let Some(next) = outcome.next_task {
                self.next_task_target = Some(next);
            }
        }

        // The sub-task's declared outputs, rendered in its own scope
        let mut result = Map::new();
        if let Some(outputs) = &sub_task.outputs {
            let snapshot = sub_context.snapshot();
            for (key, expr) in outputs {
                result.insert(key.clone(), self.env.renderer.render_value(expr, &snapshot));
            }
        }
        Ok(Value::Object(result))
    }

    /// Best-effort failure report into the run's debug directory.
    async fn capture_failure_diagnostic(&self, step_name: &str) {
        let Some(debug_dir) = self.context.get("debug_dir").and_then(|v| {
            v.as_str().map(str::to_string)
        }) else {
            return;
        };

        let safe_name: String = step_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let path = PathBuf::from(debug_dir).join(format!("failure_{stamp}_{safe_name}.json"));
        let report = json!({
            "task": self.task_fqid,
            "step": step_name,
            "captured_at": chrono::Utc::now(),
            "context": self.context.snapshot(),
        });

        let write = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, serde_json::to_vec_pretty(&report).unwrap_or_default())?;
            Ok(path)
        })
        .await;

        match write {
            Ok(Ok(path)) => error!(step = %step_name, report = %path.display(), "step failed, diagnostic written"),
            Ok(Err(err)) => error!(step = %step_name, %err, "failed to write failure diagnostic"),
            Err(err) => error!(step = %step_name, %err, "failure diagnostic task panicked"),
        }
    }
}

fn render_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A result is a success unless it is literally `false` or carries a
/// boolean-ish `found` field equal to false.
fn is_step_success(value: &Value) -> bool {
    if value == &Value::Bool(false) {
        return false;
    }
    if let Some(found) = value.get("found") {
        if !truthy(found) {
            return false;
        }
    }
    true
}

/// Map every step id (at any nesting depth) to its top-level index.
fn build_step_map(steps: &[Step], map: &mut HashMap<String, usize>, top_level: Option<usize>) {
    for (i, step) in steps.iter().enumerate() {
        let index = top_level.unwrap_or(i);
        if let Some(id) = &step.id {
            if map.contains_key(id) {
                warn!(id = %id, "duplicate step id in step map");
            }
            map.insert(id.clone(), index);
        }
        match &step.body {
            StepBody::If {
                then_steps,
                else_steps,
                ..
            } => {
                build_step_map(then_steps, map, Some(index));
                build_step_map(else_steps, map, Some(index));
            }
            StepBody::For { body, .. } | StepBody::While { body, .. } => {
                build_step_map(body, map, Some(index));
            }
            StepBody::Switch { cases, default, .. } => {
                for case in cases {
                    build_step_map(&case.then_steps, map, Some(index));
                }
                build_step_map(default, map, Some(index));
            }
            StepBody::Action { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(yaml: &str) -> Vec<Step> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_step_map_uses_top_level_indices() {
        let steps = steps(
            r#"
- id: first
  action: log
- if: "{{ x }}"
  then:
    - id: nested
      action: log
- id: last
  action: log
"#,
        );
        let mut map = HashMap::new();
        build_step_map(&steps, &mut map, None);
        assert_eq!(map["first"], 0);
        assert_eq!(map["nested"], 1);
        assert_eq!(map["last"], 2);
    }

    #[test]
    fn test_step_success_rules() {
        assert!(is_step_success(&json!(true)));
        assert!(is_step_success(&json!({"anything": 1})));
        assert!(is_step_success(&json!(0)));
        assert!(!is_step_success(&json!(false)));
        assert!(!is_step_success(&json!({"found": false})));
        assert!(is_step_success(&json!({"found": true})));
    }
}
