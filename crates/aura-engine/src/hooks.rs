//! Hook manager
//!
//! Named extension points fired around task execution. Callbacks receive a
//! JSON payload describing the run; every callback failure is isolated and
//! logged, and all callbacks for one trigger run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error};

// Hook points fired by the execution manager
pub const BEFORE_TASK_RUN: &str = "before_task_run";
pub const AFTER_TASK_SUCCESS: &str = "after_task_success";
pub const AFTER_TASK_FAILURE: &str = "after_task_failure";
pub const AFTER_TASK_RUN: &str = "after_task_run";

/// Hook callback; the payload is a JSON description of the task run
pub type HookCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registry of named hooks
#[derive(Default)]
pub struct HookManager {
    hooks: RwLock<HashMap<String, Vec<HookCallback>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an async closure into a [`HookCallback`].
    pub fn callback<F, Fut>(f: F) -> HookCallback
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |payload| Box::pin(f(payload)))
    }

    pub async fn register(&self, hook_name: &str, callback: HookCallback) {
        debug!(hook = hook_name, "hook registered");
        self.hooks
            .write()
            .await
            .entry(hook_name.to_string())
            .or_default()
            .push(callback);
    }

    /// Fire all callbacks for a hook concurrently; failures are logged per
    /// callback and never propagate.
    pub async fn trigger(&self, hook_name: &str, payload: Value) {
        let callbacks: Vec<HookCallback> = {
            let hooks = self.hooks.read().await;
            match hooks.get(hook_name) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        let runs = callbacks.into_iter().map(|cb| {
            let payload = payload.clone();
            let hook = hook_name.to_string();
            async move {
                if let Err(err) = cb(payload).await {
                    error!(hook = %hook, %err, "hook callback failed");
                }
            }
        });
        futures::future::join_all(runs).await;
    }

    pub async fn clear(&self) {
        self.hooks.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_trigger_runs_all_callbacks() {
        let manager = HookManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            manager
                .register(
                    BEFORE_TASK_RUN,
                    HookManager::callback(move |_payload| {
                        let count = Arc::clone(&count);
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .await;
        }

        manager.trigger(BEFORE_TASK_RUN, json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let manager = HookManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        manager
            .register(
                AFTER_TASK_RUN,
                HookManager::callback(|_| async { anyhow::bail!("hook exploded") }),
            )
            .await;
        let count_clone = Arc::clone(&count);
        manager
            .register(
                AFTER_TASK_RUN,
                HookManager::callback(move |_| {
                    let count = Arc::clone(&count_clone);
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;

        manager.trigger(AFTER_TASK_RUN, json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_hook_is_noop() {
        let manager = HookManager::new();
        manager.trigger("nothing_registered", json!({})).await;
    }
}
