//! Task definitions and the step tree
//!
//! A task file is a mapping from task key to `TaskDefinition`. Steps are a
//! tagged union discriminated by key presence: `action`, `if`, `for`,
//! `while`, or `switch`. A step with none of these keys is a no-op action
//! step, which is how pure control steps like `{go_step: done}` are written.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Validation failures for a parsed task
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskValidationError {
    /// More than one of action/if/for/while/switch on one step
    #[error("step '{0}' mixes control-flow variants: {1:?}")]
    MixedVariants(String, Vec<&'static str>),

    /// The same step id appears twice in one task
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// A go_step names an id that does not exist in the task
    #[error("go_step target '{0}' does not exist")]
    UnknownGoStepTarget(String),
}

/// Retry policy for a single action step
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_retry_count")]
    pub count: u32,

    /// Seconds between attempts
    #[serde(default = "default_retry_interval")]
    pub interval_sec: f64,
}

fn default_retry_count() -> u32 {
    1
}

fn default_retry_interval() -> f64 {
    1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            interval_sec: default_retry_interval(),
        }
    }
}

/// An event trigger attached to a task definition
#[derive(Debug, Clone, Deserialize)]
pub struct EventTrigger {
    /// Glob pattern matched against event names
    pub event: String,

    /// Channel to listen on; defaults to the owning plugin's canonical id
    #[serde(default)]
    pub channel: Option<String>,
}

/// One task: metadata plus an ordered list of steps
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TaskDefinition {
    #[serde(default)]
    pub meta: Option<Map<String, Value>>,

    #[serde(default)]
    pub triggers: Vec<EventTrigger>,

    #[serde(default)]
    pub execution_mode: super::tasklet::ExecutionMode,

    /// `key` or `key:limit` resource tags
    #[serde(default)]
    pub resource_tags: Vec<String>,

    #[serde(default)]
    pub timeout_sec: Option<u64>,

    /// Interrupt rules activated while this task runs
    #[serde(default)]
    pub activates_interrupts: Vec<String>,

    /// Expressions rendered in the sub-task context to form its return map
    #[serde(default)]
    pub outputs: Option<Map<String, Value>>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl TaskDefinition {
    /// Display title: `meta.title` when present, else the given fallback.
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.meta
            .as_ref()
            .and_then(|m| m.get("title"))
            .and_then(|v| v.as_str())
            .unwrap_or(fallback)
    }

    /// Enforce the step invariants: unique ids and resolvable go_step
    /// targets. Templated targets are checked at run time instead.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        let mut ids = HashSet::new();
        let mut targets = Vec::new();
        collect(&self.steps, &mut ids, &mut targets)?;
        for target in targets {
            if !target.contains("{{") && !ids.contains(target.as_str()) {
                return Err(TaskValidationError::UnknownGoStepTarget(target));
            }
        }
        Ok(())
    }
}

fn collect(
    steps: &[Step],
    ids: &mut HashSet<String>,
    targets: &mut Vec<String>,
) -> Result<(), TaskValidationError> {
    for step in steps {
        if let Some(id) = &step.id {
            if !ids.insert(id.clone()) {
                return Err(TaskValidationError::DuplicateStepId(id.clone()));
            }
        }
        if let Some(target) = &step.go_step {
            targets.push(target.clone());
        }
        match &step.body {
            StepBody::If {
                then_steps,
                else_steps,
                ..
            } => {
                collect(then_steps, ids, targets)?;
                collect(else_steps, ids, targets)?;
            }
            StepBody::For { body, .. } | StepBody::While { body, .. } => {
                collect(body, ids, targets)?;
            }
            StepBody::Switch { cases, default, .. } => {
                for case in cases {
                    collect(&case.then_steps, ids, targets)?;
                }
                collect(default, ids, targets)?;
            }
            StepBody::Action { .. } => {}
        }
    }
    Ok(())
}

/// One arm of a switch step
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchCase {
    /// Value compared against the rendered switch subject
    pub case: Value,

    #[serde(rename = "then", default)]
    pub then_steps: Vec<Step>,
}

/// The variant part of a step
#[derive(Debug, Clone)]
pub enum StepBody {
    Action {
        /// Absent for pure control steps
        action: Option<String>,
        params: Map<String, Value>,
        retry: Option<RetryConfig>,
        wait_before: Option<Value>,
        output_to: Option<String>,
        continue_on_failure: bool,
    },
    If {
        condition: Value,
        then_steps: Vec<Step>,
        else_steps: Vec<Step>,
    },
    For {
        var: String,
        items: Value,
        body: Vec<Step>,
    },
    While {
        condition: Value,
        max_loops: Option<Value>,
        body: Vec<Step>,
    },
    Switch {
        subject: Value,
        cases: Vec<SwitchCase>,
        default: Vec<Step>,
    },
}

/// One step: shared control keys plus the variant body
#[derive(Debug, Clone)]
pub struct Step {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Pre-condition; falsy skips the step
    pub when: Option<Value>,
    /// Jump to a step id within the task
    pub go_step: Option<String>,
    /// Jump to another task (rendered before use)
    pub go_task: Option<Value>,
    /// Successor task, does not interrupt the current run
    pub next: Option<Value>,
    pub body: StepBody,
}

/// Raw mirror of the YAML shape; converted and validated into `Step`.
#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    when: Option<Value>,
    #[serde(default)]
    go_step: Option<String>,
    #[serde(default)]
    go_task: Option<Value>,
    #[serde(default)]
    next: Option<Value>,

    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    params: Option<Map<String, Value>>,
    #[serde(default)]
    retry: Option<RetryConfig>,
    #[serde(default)]
    wait_before: Option<Value>,
    #[serde(default)]
    output_to: Option<String>,
    #[serde(default)]
    continue_on_failure: Option<bool>,

    #[serde(rename = "if", default)]
    if_cond: Option<Value>,
    #[serde(rename = "then", default)]
    then_steps: Option<Vec<Step>>,
    #[serde(rename = "else", default)]
    else_steps: Option<Vec<Step>>,

    #[serde(rename = "for", default)]
    for_spec: Option<ForSpec>,
    #[serde(rename = "while", default)]
    while_cond: Option<Value>,
    #[serde(default)]
    max_loops: Option<Value>,
    #[serde(rename = "do", default)]
    do_steps: Option<Vec<Step>>,

    #[serde(default)]
    switch: Option<Value>,
    #[serde(default)]
    cases: Option<Vec<SwitchCase>>,
    #[serde(default)]
    default: Option<Vec<Step>>,
}

#[derive(Deserialize)]
struct ForSpec {
    /// Loop variable name bound for each item
    #[serde(rename = "as")]
    var: String,
    /// Expression rendering to the iterable
    #[serde(rename = "in")]
    items: Value,
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawStep::deserialize(deserializer)?;

        let mut variants: Vec<&'static str> = Vec::new();
        if raw.action.is_some() {
            variants.push("action");
        }
        if raw.if_cond.is_some() {
            variants.push("if");
        }
        if raw.for_spec.is_some() {
            variants.push("for");
        }
        if raw.while_cond.is_some() {
            variants.push("while");
        }
        if raw.switch.is_some() {
            variants.push("switch");
        }
        if variants.len() > 1 {
            let label = raw.id.clone().or(raw.name.clone()).unwrap_or_default();
            return Err(serde::de::Error::custom(TaskValidationError::MixedVariants(
                label, variants,
            )));
        }

        let body = if let Some(condition) = raw.if_cond {
            StepBody::If {
                condition,
                then_steps: raw.then_steps.unwrap_or_default(),
                else_steps: raw.else_steps.unwrap_or_default(),
            }
        } else if let Some(for_spec) = raw.for_spec {
            StepBody::For {
                var: for_spec.var,
                items: for_spec.items,
                body: raw.do_steps.unwrap_or_default(),
            }
        } else if let Some(condition) = raw.while_cond {
            StepBody::While {
                condition,
                max_loops: raw.max_loops,
                body: raw.do_steps.unwrap_or_default(),
            }
        } else if let Some(subject) = raw.switch {
            StepBody::Switch {
                subject,
                cases: raw.cases.unwrap_or_default(),
                default: raw.default.unwrap_or_default(),
            }
        } else {
            StepBody::Action {
                action: raw.action,
                params: raw.params.unwrap_or_default(),
                retry: raw.retry,
                wait_before: raw.wait_before,
                output_to: raw.output_to,
                continue_on_failure: raw.continue_on_failure.unwrap_or(false),
            }
        };

        Ok(Step {
            id: raw.id,
            name: raw.name,
            when: raw.when,
            go_step: raw.go_step,
            go_task: raw.go_task,
            next: raw.next,
            body,
        })
    }
}
