//! Schedule items
//!
//! `schedule.yaml` holds a list of these per plan, without the `plan_name`
//! field; the loader stamps the plan on each item after parsing and the
//! writer strips it again. Field order here is the on-disk order, so
//! mutations round-trip the file exactly.

use serde::{Deserialize, Serialize};

/// What causes a schedule item to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    TimeBased,
}

/// Trigger configuration for a schedule item
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,

    /// Standard 5-field cron expression, required for `time_based`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// Per-item run options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunOptions {
    /// Minimum seconds between runs, measured from the last run
    #[serde(default)]
    pub cooldown_sec: u64,
}

/// One entry in a plan's `schedule.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Task id within the plan (`tasks/<path>/<key>` without `tasks/`)
    pub task: String,

    #[serde(default)]
    pub trigger: Trigger,

    #[serde(default)]
    pub run_options: RunOptions,

    /// Stamped by the loader; never serialized into the plan file
    #[serde(skip)]
    pub plan_name: String,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleItem {
    /// Fully-qualified task id for this item.
    pub fn task_fqid(&self) -> String {
        format!("{}/{}", self.plan_name, self.task)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_item() {
        let item: ScheduleItem = serde_yaml::from_str(
            "id: s1\ntask: quests/daily/main\ntrigger:\n  type: time_based\n  schedule: '* * * * *'\n",
        )
        .unwrap();
        assert!(item.enabled);
        assert_eq!(item.trigger.trigger_type, TriggerType::TimeBased);
        assert_eq!(item.trigger.schedule.as_deref(), Some("* * * * *"));
        assert_eq!(item.run_options.cooldown_sec, 0);
        assert!(item.plan_name.is_empty());
    }

    #[test]
    fn test_round_trip_omits_plan_name() {
        let mut item: ScheduleItem =
            serde_yaml::from_str("id: s1\ntask: t\ntrigger:\n  type: manual\n").unwrap();
        item.plan_name = "myplan".into();

        let text = serde_yaml::to_string(&item).unwrap();
        assert!(!text.contains("plan_name"));

        let back: ScheduleItem = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.id, "s1");
        assert!(back.plan_name.is_empty());
    }

    #[test]
    fn test_task_fqid() {
        let mut item: ScheduleItem =
            serde_yaml::from_str("id: s1\ntask: a/b\ntrigger:\n  type: manual\n").unwrap();
        item.plan_name = "p".into();
        assert_eq!(item.task_fqid(), "p/a/b");
    }
}
