//! Cooperative pause gate
//!
//! Edge-triggered pause signal shared by every engine in a run tree. The
//! engine checks the gate at the top of each step, before retry attempts,
//! and in loop bodies; a paused engine parks until the gate clears.
//! Interrupt handlers run with their own fresh gate, so they never observe
//! the pause they caused.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

/// Shared pause signal
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request all engines on this gate to pause at their next check.
    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    /// Release paused engines.
    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Park until the gate is clear. Returns immediately when not paused.
    pub async fn wait_if_paused(&self) {
        if !self.is_paused() {
            return;
        }
        warn!("pause signal received, task execution parked until resume");
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        info!("resume signal received, task execution continues");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unpaused_gate_does_not_block() {
        let gate = PauseGate::new();
        tokio::time::timeout(Duration::from_millis(50), gate.wait_if_paused())
            .await
            .expect("must not block");
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let gate = PauseGate::new();
        gate.pause();
        assert!(gate.is_paused());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait_if_paused().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter must finish after resume")
            .unwrap();
    }
}
