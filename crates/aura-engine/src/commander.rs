//! Commander loop
//!
//! The single dispatch loop: a ready interrupt rule always wins, otherwise
//! the next tasklet is taken from the queue and handed to the execution
//! manager. Interrupt handling pauses the running main tasks, runs the
//! handler to completion (bypassing the status map), then applies the
//! rule's recovery policy: `resume` clears the pause gate, `restart_task`
//! cancels the paused runs and re-enqueues them at high priority, `abort`
//! drops them.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aura_core::{InterruptRule, Priority, Tasklet};
use aura_core::model::interrupt::OnComplete;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::manager::ExecutionManager;
use crate::state::SharedState;

const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// The dispatch loop
pub struct Commander {
    shared: Arc<SharedState>,
    manager: Arc<ExecutionManager>,
    interrupted_mains: Mutex<Vec<Tasklet>>,
}

impl Commander {
    pub fn new(shared: Arc<SharedState>, manager: Arc<ExecutionManager>) -> Self {
        Self {
            shared,
            manager,
            interrupted_mains: Mutex::new(Vec::new()),
        }
    }

    /// Loop until the scheduler stops.
    pub async fn run(self: Arc<Self>) {
        info!("commander loop started");
        while self.shared.running.load(Ordering::SeqCst) {
            let interrupt = self.shared.interrupt_queue.lock().await.pop_front();
            if let Some(rule) = interrupt {
                self.handle_interrupt(rule).await;
                continue;
            }

            if !self.shared.device_busy.load(Ordering::SeqCst) {
                if let Some(tasklet) = self.shared.task_queue.try_get() {
                    self.dispatch_main(tasklet);
                    continue;
                }
            }

            tokio::time::sleep(IDLE_SLEEP).await;
        }
        info!("commander loop exited");
    }

    /// Fire-and-track a main tasklet; concurrency is bounded by the
    /// execution manager's semaphores, not by the commander.
    fn dispatch_main(&self, tasklet: Tasklet) {
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            if let Err(err) = manager.submit(tasklet, false).await {
                error!(%err, "main task submission failed");
            }
        });
    }

    /// Interrupt protocol: pause, run handler, apply recovery policy.
    pub async fn handle_interrupt(&self, rule: InterruptRule) {
        info!(rule = %rule.name, "commander handling interrupt");
        self.shared.device_busy.store(true, Ordering::SeqCst);

        // Pause whatever main tasks are running and remember them
        {
            let running = self.shared.running_tasks.read().await;
            let mut interrupted = self.interrupted_mains.lock().await;
            for handle in running.values() {
                if !handle.is_interrupt_handler {
                    info!(task = %handle.tasklet.task_fqid, "pausing main task for interrupt");
                    interrupted.push(handle.tasklet.clone());
                }
            }
            if !interrupted.is_empty() {
                self.shared.pause_gate.pause();
            }
        }

        let handler = Tasklet::new(format!("{}/{}", rule.plan_name, rule.handler_task))
            .ad_hoc()
            .with_priority(Priority::High);
        match self.manager.submit(handler, true).await {
            Ok(result) => info!(rule = %rule.name, result = ?result.result, "interrupt handler finished"),
            Err(err) => error!(rule = %rule.name, %err, "interrupt handler failed to start"),
        }

        self.post_interrupt_handling(&rule).await;
        self.shared.device_busy.store(false, Ordering::SeqCst);
    }

    async fn post_interrupt_handling(&self, rule: &InterruptRule) {
        let interrupted: Vec<Tasklet> =
            self.interrupted_mains.lock().await.drain(..).collect();
        info!(policy = ?rule.on_complete, "applying post-interrupt policy");

        match rule.on_complete {
            OnComplete::Resume => {
                self.shared.pause_gate.resume();
            }
            OnComplete::RestartTask => {
                for tasklet in interrupted {
                    warn!(
                        task = %tasklet.task_fqid,
                        "restart policy: abandoning paused run, re-enqueueing at high priority"
                    );
                    // Cancel the paused run so it reports `cancelled`
                    if let Some(handle) = self
                        .shared
                        .running_tasks
                        .read()
                        .await
                        .get(&tasklet.task_fqid)
                    {
                        handle.cancel.cancel();
                    }
                    let restarted = tasklet.with_priority(Priority::High);
                    if let Err(err) = self.shared.task_queue.put(restarted).await {
                        error!(%err, "could not re-enqueue interrupted task");
                    }
                }
                self.shared.pause_gate.resume();
            }
            OnComplete::Abort => {
                for tasklet in interrupted {
                    warn!(task = %tasklet.task_fqid, "abort policy: dropping interrupted task");
                    if let Some(handle) = self
                        .shared
                        .running_tasks
                        .read()
                        .await
                        .get(&tasklet.task_fqid)
                    {
                        handle.cancel.cancel();
                    }
                }
                self.shared.pause_gate.resume();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookManager;
    use aura_core::model::interrupt::{InterruptCondition, InterruptScope};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn rule(on_complete: OnComplete) -> InterruptRule {
        InterruptRule {
            name: "r".into(),
            scope: InterruptScope::Global,
            enabled_by_default: true,
            check_interval_sec: 1,
            cooldown_sec: 60,
            condition: InterruptCondition::default(),
            handler_task: "recover/handle".into(),
            on_complete,
            plan_name: "demo".into(),
        }
    }

    async fn commander_with_running_main() -> (Arc<SharedState>, Commander, CancellationToken) {
        let shared = Arc::new(SharedState::new());
        let token = CancellationToken::new();
        shared.running_tasks.write().await.insert(
            "demo/t/main".into(),
            Arc::new(crate::state::RunHandle {
                tasklet: Tasklet::new("demo/t/main"),
                cancel: token.clone(),
                started_at: Utc::now(),
                is_interrupt_handler: false,
            }),
        );
        let manager = Arc::new(ExecutionManager::new(
            Arc::clone(&shared),
            Arc::new(HookManager::new()),
        ));
        let commander = Commander::new(Arc::clone(&shared), manager);
        (shared, commander, token)
    }

    #[tokio::test]
    async fn test_resume_clears_pause() {
        let (shared, commander, token) = commander_with_running_main().await;
        shared.pause_gate.pause();
        commander
            .interrupted_mains
            .lock()
            .await
            .push(Tasklet::new("demo/t/main"));

        commander.post_interrupt_handling(&rule(OnComplete::Resume)).await;
        assert!(!shared.pause_gate.is_paused());
        assert!(!token.is_cancelled());
        assert!(shared.task_queue.is_empty());
    }

    #[tokio::test]
    async fn test_restart_requeues_high_priority_and_cancels() {
        let (shared, commander, token) = commander_with_running_main().await;
        shared.pause_gate.pause();
        commander
            .interrupted_mains
            .lock()
            .await
            .push(Tasklet::new("demo/t/main"));

        commander
            .post_interrupt_handling(&rule(OnComplete::RestartTask))
            .await;
        assert!(token.is_cancelled());
        let requeued = shared.task_queue.try_get().unwrap();
        assert_eq!(requeued.task_fqid, "demo/t/main");
        assert_eq!(requeued.priority, Priority::High);
        assert!(!shared.pause_gate.is_paused());
    }

    #[tokio::test]
    async fn test_abort_drops_task() {
        let (shared, commander, token) = commander_with_running_main().await;
        shared.pause_gate.pause();
        commander
            .interrupted_mains
            .lock()
            .await
            .push(Tasklet::new("demo/t/main"));

        commander.post_interrupt_handling(&rule(OnComplete::Abort)).await;
        assert!(token.is_cancelled());
        assert!(shared.task_queue.is_empty());
    }
}
