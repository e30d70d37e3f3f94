//! Interrupt monitoring service
//!
//! Polls interrupt conditions once a second. Active rules are the
//! user-enabled globals plus every rule listed in `activates_interrupts`
//! of a currently running task. Each rule is throttled by its own check
//! interval and silenced by its cooldown after firing. Conditions are
//! evaluated through the owning plan's read-only check path; failures read
//! as false. At most one interrupt is submitted per sweep.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aura_core::InterruptRule;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::state::SharedState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The condition-polling guardian
pub struct InterruptService {
    shared: Arc<SharedState>,
    last_checks: Mutex<HashMap<String, DateTime<Utc>>>,
    cooldown_until: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InterruptService {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            last_checks: Mutex::new(HashMap::new()),
            cooldown_until: Mutex::new(HashMap::new()),
        }
    }

    /// Service loop; lives until the scheduler stops.
    pub async fn run(self) {
        info!("interrupt service started");
        loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            self.sweep(Utc::now()).await;
            tokio::time::sleep(SWEEP_INTERVAL).await;
        }
        info!("interrupt service stopped");
    }

    /// One pass: evaluate due conditions, submit at most one interrupt.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let mut active: Vec<String> = self.active_rules().await.into_iter().collect();
        active.sort();

        for rule_name in active {
            let Some(rule) = self
                .shared
                .interrupt_rules
                .read()
                .await
                .get(&rule_name)
                .cloned()
            else {
                continue;
            };
            if !self.should_check(&rule, now) {
                continue;
            }

            debug!(rule = %rule_name, "checking interrupt condition");
            let orchestrator = {
                let plans = self.shared.plans.read().await;
                plans.get(&rule.plan_name).cloned()
            };
            let Some(orchestrator) = orchestrator else {
                warn!(rule = %rule_name, plan = %rule.plan_name, "no orchestrator for rule");
                continue;
            };

            let fired = orchestrator.perform_condition_check(&rule.condition).await;
            if fired {
                warn!(rule = %rule_name, "interrupt condition met, submitted to commander");
                self.submit(rule, now).await;
                // One interrupt per sweep
                break;
            }
        }
    }

    /// Globals the user enabled plus rules activated by running tasks.
    pub async fn active_rules(&self) -> HashSet<String> {
        let mut active: HashSet<String> =
            self.shared.user_enabled_globals.read().await.iter().cloned().collect();

        let running: Vec<String> = self
            .shared
            .running_tasks
            .read()
            .await
            .keys()
            .cloned()
            .collect();
        let definitions = self.shared.task_definitions.read().await;
        for fqid in running {
            if let Some(def) = definitions.get(&fqid) {
                if !def.activates_interrupts.is_empty() {
                    debug!(task = %fqid, rules = ?def.activates_interrupts, "task activates interrupts");
                    active.extend(def.activates_interrupts.iter().cloned());
                }
            }
        }

        let rules = self.shared.interrupt_rules.read().await;
        active.retain(|name| rules.contains_key(name));
        active
    }

    /// Cooldown plus per-rule check-interval throttling.
    fn should_check(&self, rule: &InterruptRule, now: DateTime<Utc>) -> bool {
        if let Some(&until) = self.cooldown_until.lock().get(&rule.name) {
            if now < until {
                return false;
            }
        }

        let mut last_checks = self.last_checks.lock();
        let due = match last_checks.get(&rule.name) {
            Some(&last) => {
                now.signed_duration_since(last).num_seconds() >= rule.check_interval_sec as i64
            }
            None => true,
        };
        if due {
            last_checks.insert(rule.name.clone(), now);
        }
        due
    }

    async fn submit(&self, rule: InterruptRule, now: DateTime<Utc>) {
        let cooldown = chrono::Duration::seconds(rule.cooldown_sec as i64);
        self.cooldown_until
            .lock()
            .insert(rule.name.clone(), now + cooldown);
        self.shared.interrupt_queue.lock().await.push_back(rule);
    }

    /// Next time the rule may fire again, if it is cooling down.
    pub fn cooldown_of(&self, rule_name: &str) -> Option<DateTime<Utc>> {
        self.cooldown_until.lock().get(rule_name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::model::interrupt::{InterruptCondition, InterruptScope, OnComplete};
    use chrono::TimeZone;

    fn rule(name: &str, check_interval_sec: u64, cooldown_sec: u64) -> InterruptRule {
        InterruptRule {
            name: name.into(),
            scope: InterruptScope::Global,
            enabled_by_default: true,
            check_interval_sec,
            cooldown_sec,
            condition: InterruptCondition::default(),
            handler_task: "recover/handle".into(),
            on_complete: OnComplete::Resume,
            plan_name: "demo".into(),
        }
    }

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, minute, second)
            .single()
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_interval_throttles() {
        let service = InterruptService::new(Arc::new(SharedState::new()));
        let rule = rule("r", 5, 60);

        assert!(service.should_check(&rule, at(0, 0)));
        assert!(!service.should_check(&rule, at(0, 2)));
        assert!(service.should_check(&rule, at(0, 5)));
    }

    #[tokio::test]
    async fn test_cooldown_silences_rule() {
        let shared = Arc::new(SharedState::new());
        let service = InterruptService::new(Arc::clone(&shared));
        let rule = rule("r", 1, 60);

        service.submit(rule.clone(), at(0, 0)).await;
        assert_eq!(shared.interrupt_queue.lock().await.len(), 1);

        // Condition may stay true; the rule must not fire again within C
        assert!(!service.should_check(&rule, at(0, 30)));
        assert!(!service.should_check(&rule, at(0, 59)));
        assert!(service.should_check(&rule, at(1, 0)));
    }

    #[tokio::test]
    async fn test_active_rules_from_globals_and_running_tasks() {
        let shared = Arc::new(SharedState::new());
        {
            let mut rules = shared.interrupt_rules.write().await;
            rules.insert("global_rule".into(), rule("global_rule", 1, 1));
            rules.insert("task_rule".into(), rule("task_rule", 1, 1));
            rules.insert("unused".into(), rule("unused", 1, 1));
        }
        shared
            .user_enabled_globals
            .write()
            .await
            .insert("global_rule".into());
        {
            let mut defs = shared.task_definitions.write().await;
            let task: aura_core::TaskDefinition = serde_yaml::from_str(
                "steps: []\nactivates_interrupts:\n  - task_rule\n  - not_defined\n",
            )
            .unwrap();
            defs.insert("demo/t/main".into(), Arc::new(task));
        }
        {
            let mut running = shared.running_tasks.write().await;
            running.insert(
                "demo/t/main".into(),
                Arc::new(crate::state::RunHandle {
                    tasklet: aura_core::Tasklet::new("demo/t/main"),
                    cancel: tokio_util::sync::CancellationToken::new(),
                    started_at: Utc::now(),
                    is_interrupt_handler: false,
                }),
            );
        }

        let service = InterruptService::new(shared);
        let active = service.active_rules().await;
        assert!(active.contains("global_rule"));
        assert!(active.contains("task_rule"));
        // Rules without definitions never activate
        assert!(!active.contains("not_defined"));
        assert!(!active.contains("unused"));
    }
}
