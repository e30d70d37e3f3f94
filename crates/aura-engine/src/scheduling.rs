//! Time-based scheduling service
//!
//! Sweeps the schedule items once a minute. An enabled item that is neither
//! queued nor running is enqueued when its cron trigger has an occurrence
//! after the effective last run that is not in the future, unless its
//! cooldown since the last run has not elapsed. Cron expressions are
//! standard 5-field with minute granularity; a seconds field of `0` is
//! prepended for evaluation.

use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aura_core::model::schedule::TriggerType;
use aura_core::{ScheduleItem, Tasklet};
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use tracing::{debug, error, info};

use crate::state::{RunState, SharedState};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic cron evaluator producing tasklets
pub struct SchedulingService {
    shared: Arc<SharedState>,
}

impl SchedulingService {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Service loop; lives until the scheduler stops.
    pub async fn run(self) {
        info!("scheduling service started");
        loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            self.sweep(Utc::now()).await;
            tokio::time::sleep(SWEEP_INTERVAL).await;
        }
        info!("scheduling service stopped");
    }

    /// One pass over all schedule items.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let items: Vec<ScheduleItem> = self.shared.schedule_items.read().await.clone();

        for item in items {
            if !item.enabled {
                continue;
            }

            let (state, last_run) = {
                let statuses = self.shared.run_statuses.read().await;
                match statuses.get(&item.id) {
                    Some(record) => (record.state, record.last_run),
                    None => (RunState::Idle, None),
                }
            };
            if state != RunState::Idle {
                continue;
            }

            if !is_ready_to_run(&item, now, last_run) {
                continue;
            }

            info!(
                item = %item.display_name(),
                plan = %item.plan_name,
                "schedule condition met, task enqueued"
            );
            let fqid = item.task_fqid();
            let task_def = self.shared.task_definitions.read().await.get(&fqid).cloned();

            let mut tasklet = Tasklet::new(fqid)
                .with_payload(serde_json::to_value(&item).unwrap_or_default());
            if let Some(def) = task_def {
                tasklet = tasklet
                    .with_execution_mode(def.execution_mode)
                    .with_resource_tags(def.resource_tags.clone());
                if let Some(timeout) = def.timeout_sec {
                    tasklet = tasklet.with_timeout(Duration::from_secs(timeout));
                }
            }

            if let Err(err) = self.shared.task_queue.put(tasklet).await {
                error!(item = %item.id, %err, "could not enqueue scheduled task");
                continue;
            }
            self.shared
                .update_run_status(&item.id, |record| record.mark_queued(now))
                .await;
        }
    }
}

/// Whether a schedule item should fire at `now`.
pub fn is_ready_to_run(
    item: &ScheduleItem,
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> bool {
    let cooldown = item.run_options.cooldown_sec;
    if let Some(last) = last_run {
        if cooldown > 0 && now.signed_duration_since(last).num_seconds() < cooldown as i64 {
            debug!(item = %item.id, "still cooling down");
            return false;
        }
    }

    if item.trigger.trigger_type != TriggerType::TimeBased {
        return false;
    }
    let Some(expr) = item.trigger.schedule.as_deref() else {
        return false;
    };

    match previous_due(expr, last_run, now) {
        Ok(Some(due)) => due <= now,
        Ok(None) => false,
        Err(err) => {
            error!(item = %item.id, cron = expr, %err, "invalid cron expression");
            false
        }
    }
}

/// The first cron occurrence strictly after the effective last run.
fn previous_due(
    expr: &str,
    last_run: Option<DateTime<Utc>>,
    _now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, cron::error::Error> {
    let schedule = Schedule::from_str(&normalize_cron(expr))?;
    let effective_last = last_run.unwrap_or_else(|| {
        // Before any run, the most recent elapsed occurrence counts
        Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    });
    Ok(schedule.after(&effective_last).next())
}

/// Accept standard 5-field expressions by prepending a seconds field.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::model::schedule::{RunOptions, Trigger};

    fn item(schedule: &str, cooldown_sec: u64) -> ScheduleItem {
        ScheduleItem {
            id: "s1".into(),
            name: None,
            description: None,
            enabled: true,
            task: "t/main".into(),
            trigger: Trigger {
                trigger_type: TriggerType::TimeBased,
                schedule: Some(schedule.to_string()),
            },
            run_options: RunOptions { cooldown_sec },
            plan_name: "demo".into(),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 30).single().unwrap()
    }

    #[test]
    fn test_every_minute_fires_after_last_run() {
        let item = item("* * * * *", 0);
        assert!(is_ready_to_run(&item, at(12, 5), Some(at(12, 4))));
        // Ran this minute already; the next occurrence is in the future
        assert!(!is_ready_to_run(&item, at(12, 5), Some(at(12, 5))));
    }

    #[test]
    fn test_first_run_fires() {
        let item = item("* * * * *", 0);
        assert!(is_ready_to_run(&item, at(9, 0), None));
    }

    #[test]
    fn test_cooldown_blocks_consecutive_minutes() {
        let item = item("* * * * *", 120);
        // One minute after the last run: cron is due but cooldown holds
        assert!(!is_ready_to_run(&item, at(12, 5), Some(at(12, 4))));
        // Two minutes after: both cron and cooldown allow it
        assert!(is_ready_to_run(&item, at(12, 6), Some(at(12, 4))));
    }

    #[test]
    fn test_hourly_schedule() {
        let item = item("0 * * * *", 0);
        // Last ran at 11:00:30; 12:00 has passed
        assert!(is_ready_to_run(&item, at(12, 0), Some(at(11, 0))));
        // At 11:59 nothing new is due
        assert!(!is_ready_to_run(&item, at(11, 59), Some(at(11, 0))));
    }

    #[test]
    fn test_manual_trigger_never_fires() {
        let mut item = item("* * * * *", 0);
        item.trigger.trigger_type = TriggerType::Manual;
        assert!(!is_ready_to_run(&item, at(12, 0), None));
    }

    #[test]
    fn test_invalid_cron_never_fires() {
        let item = item("not a cron", 0);
        assert!(!is_ready_to_run(&item, at(12, 0), None));
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron("0 0 * * * *"), "0 0 * * * *");
    }
}
