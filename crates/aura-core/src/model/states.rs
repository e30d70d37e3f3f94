//! State map definitions
//!
//! `states_map.yaml` describes system state as a directed weighted graph:
//! named states with check tasks, and transitions carrying a cost and the
//! task that performs them. The planner builds its graph from these.

use std::collections::BTreeMap;

use serde::Deserialize;

/// One named state
#[derive(Debug, Clone, Deserialize)]
pub struct StateSpec {
    /// Task whose truthy success confirms this state is current
    #[serde(default)]
    pub check_task: Option<String>,

    /// Whether the check may race with others
    #[serde(default = "default_can_async")]
    pub can_async: bool,

    /// Tie-breaker among checks at the same graph distance (lower first)
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_can_async() -> bool {
    true
}

fn default_priority() -> i64 {
    100
}

/// Retry policy for one transition edge
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TransitionRetry {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Seconds between attempts
    #[serde(default)]
    pub delay_sec: f64,

    /// Seconds to let the system settle before re-locating the state
    #[serde(default)]
    pub post_delay_sec: f64,
}

fn default_attempts() -> u32 {
    1
}

impl Default for TransitionRetry {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_sec: 0.0,
            post_delay_sec: 0.0,
        }
    }
}

/// One directed edge in the state graph
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionSpec {
    pub from: String,
    pub to: String,

    /// Absent cost falls back to the planner's default (normally 1)
    #[serde(default)]
    pub cost: Option<u32>,

    /// Task executed to move along this edge
    pub transition_task: String,

    #[serde(default)]
    pub retry: Option<TransitionRetry>,
}

/// The whole `states_map.yaml`
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StateMapSpec {
    #[serde(default)]
    pub states: BTreeMap<String, StateSpec>,

    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,

    #[serde(default)]
    pub start_state: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_map() {
        let spec: StateMapSpec = serde_yaml::from_str(
            r#"
states:
  lobby:
    check_task: checks/in_lobby
  battle:
    check_task: checks/in_battle
    can_async: false
    priority: 10
transitions:
  - from: lobby
    to: battle
    cost: 5
    transition_task: moves/enter_battle
  - from: battle
    to: lobby
    transition_task: moves/leave_battle
    retry:
      attempts: 3
      delay_sec: 1.0
"#,
        )
        .unwrap();

        assert_eq!(spec.states.len(), 2);
        assert!(spec.states["lobby"].can_async);
        assert_eq!(spec.states["battle"].priority, 10);
        assert_eq!(spec.transitions[0].cost, Some(5));
        assert_eq!(spec.transitions[1].cost, None);
        assert_eq!(spec.transitions[1].retry.unwrap().attempts, 3);
    }
}
