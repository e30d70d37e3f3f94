//! Interrupt rules
//!
//! `interrupts.yaml` carries `{interrupts: [rule, ...]}` per plan. A rule's
//! condition is polled by the interrupt service; when it fires, the handler
//! task preempts whatever main task is running.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Whether a rule is armed globally or only while listed tasks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterruptScope {
    #[default]
    Task,
    Global,
}

/// What happens to the interrupted main task after the handler finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnComplete {
    /// Clear the pause gate and let the task continue
    #[default]
    Resume,
    /// Abandon the paused run and re-enqueue the tasklet at high priority
    RestartTask,
    /// Drop the interrupted task entirely
    Abort,
}

/// The polled condition: a read-only action plus its params
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InterruptCondition {
    pub action: String,

    #[serde(default)]
    pub params: Map<String, Value>,
}

/// One preemption rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptRule {
    pub name: String,

    #[serde(default)]
    pub scope: InterruptScope,

    #[serde(default)]
    pub enabled_by_default: bool,

    /// Seconds between condition evaluations
    #[serde(default = "default_check_interval")]
    pub check_interval_sec: u64,

    /// Seconds after firing before the rule may fire again
    #[serde(default = "default_cooldown")]
    pub cooldown_sec: u64,

    #[serde(default)]
    pub condition: InterruptCondition,

    /// Task (within the owning plan) run as the handler
    pub handler_task: String,

    #[serde(default)]
    pub on_complete: OnComplete,

    /// Stamped by the loader; never serialized into the plan file
    #[serde(skip)]
    pub plan_name: String,
}

fn default_check_interval() -> u64 {
    5
}

fn default_cooldown() -> u64 {
    60
}

/// On-disk shape of `interrupts.yaml`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InterruptFile {
    #[serde(default)]
    pub interrupts: Vec<InterruptRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_with_defaults() {
        let file: InterruptFile = serde_yaml::from_str(
            r#"
interrupts:
  - name: low_battery
    scope: global
    enabled_by_default: true
    condition:
      action: state.get
      params:
        key: battery_low
    handler_task: recover/charge
"#,
        )
        .unwrap();
        let rule = &file.interrupts[0];
        assert_eq!(rule.scope, InterruptScope::Global);
        assert_eq!(rule.check_interval_sec, 5);
        assert_eq!(rule.cooldown_sec, 60);
        assert_eq!(rule.on_complete, OnComplete::Resume);
        assert_eq!(rule.condition.action, "state.get");
    }

    #[test]
    fn test_on_complete_variants() {
        for (text, expected) in [
            ("resume", OnComplete::Resume),
            ("restart_task", OnComplete::RestartTask),
            ("abort", OnComplete::Abort),
        ] {
            let parsed: OnComplete =
                serde_yaml::from_str(&format!("{text}\n")).unwrap();
            assert_eq!(parsed, expected);
        }
    }
}
