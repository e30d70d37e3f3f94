//! Event bus
//!
//! Pub/sub keyed by `(channel, glob pattern)`. Channel `*` matches every
//! channel; patterns are globs (`*`, `?`, bracket classes) matched against
//! the event name. Publishing derives a copy of the event — fresh id,
//! incremented depth, parent id appended to the causation chain — and drops
//! it when the depth limit is hit: that is the cycle breaker. Matching
//! callbacks are collected under the lock, the lock is released, and
//! dispatch runs concurrently with every failure isolated to its
//! subscriber. Each publish awaits its whole dispatch set, which keeps
//! delivery FIFO per subscriber.
//!
//! A bounded broadcast queue mirrors every delivered event to external
//! consumers; overflow drops the oldest entries.

use std::sync::Arc;

use aura_core::event::Event;
use futures::future::BoxFuture;
use globset::{Glob, GlobMatcher};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};

/// Subscriber callback: failures are logged, never propagated
pub type BusCallback = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Errors from subscription management
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid event pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Opaque handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    channel: String,
    pattern: String,
    token: usize,
}

struct Subscription {
    channel: String,
    pattern: String,
    matcher: GlobMatcher,
    token: usize,
    callback: BusCallback,
}

const DEFAULT_MAX_DEPTH: u32 = 10;
const FANOUT_CAPACITY: usize = 256;

/// The bus
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    max_depth: u32,
    fanout: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl EventBus {
    pub fn new(max_depth: u32) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            subscriptions: Mutex::new(Vec::new()),
            max_depth,
            fanout,
        }
    }

    /// Wrap an async closure into a [`BusCallback`].
    pub fn callback<F, Fut>(f: F) -> BusCallback
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |event| Box::pin(f(event)))
    }

    /// Subscribe a callback to `(channel, pattern)`. A duplicate
    /// `(channel, pattern, callback)` triple is rejected silently: the
    /// existing handle is returned and nothing is added.
    pub async fn subscribe(
        &self,
        channel: &str,
        pattern: &str,
        callback: BusCallback,
    ) -> Result<SubscriptionHandle, BusError> {
        let matcher = Glob::new(pattern)
            .map_err(|source| BusError::BadPattern {
                pattern: pattern.to_string(),
                source,
            })?
            .compile_matcher();
        let token = Arc::as_ptr(&callback) as *const () as usize;
        let handle = SubscriptionHandle {
            channel: channel.to_string(),
            pattern: pattern.to_string(),
            token,
        };

        let mut subs = self.subscriptions.lock().await;
        let duplicate = subs
            .iter()
            .any(|s| s.channel == channel && s.pattern == pattern && s.token == token);
        if duplicate {
            warn!(channel, pattern, "duplicate subscription ignored");
            return Ok(handle);
        }
        subs.push(Subscription {
            channel: channel.to_string(),
            pattern: pattern.to_string(),
            matcher,
            token,
            callback,
        });
        debug!(channel, pattern, "subscription added");
        Ok(handle)
    }

    /// Subscribe a synchronous callback; it runs on the blocking pool.
    pub async fn subscribe_blocking<F>(
        &self,
        channel: &str,
        pattern: &str,
        f: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let callback: BusCallback = Arc::new(move |event| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                tokio::task::spawn_blocking(move || f(event))
                    .await
                    .map_err(|e| anyhow::anyhow!("blocking subscriber panicked: {e}"))?
            })
        });
        self.subscribe(channel, pattern, callback).await
    }

    /// Remove one subscription; unknown handles log and return.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut subs = self.subscriptions.lock().await;
        let before = subs.len();
        subs.retain(|s| {
            !(s.channel == handle.channel
                && s.pattern == handle.pattern
                && s.token == handle.token)
        });
        if subs.len() == before {
            warn!(
                channel = %handle.channel,
                pattern = %handle.pattern,
                "unsubscribe found no matching subscription"
            );
        }
    }

    /// Publish an event. Returns the number of subscribers it reached; a
    /// depth-limit drop reaches zero and is logged at error severity.
    pub async fn publish(&self, event: Event) -> usize {
        let delivered = event.caused_copy();

        if delivered.depth >= self.max_depth {
            error!(
                name = %delivered.name,
                depth = delivered.depth,
                max_depth = self.max_depth,
                chain = ?delivered.causation_chain,
                "cycle breaker tripped: event dropped at depth limit"
            );
            return 0;
        }

        let callbacks: Vec<BusCallback> = {
            let subs = self.subscriptions.lock().await;
            let mut seen = Vec::new();
            let mut out = Vec::new();
            for sub in subs.iter() {
                let channel_match = sub.channel == "*" || sub.channel == delivered.channel;
                if channel_match && sub.matcher.is_match(&delivered.name) {
                    if !seen.contains(&sub.token) {
                        seen.push(sub.token);
                        out.push(Arc::clone(&sub.callback));
                    }
                }
            }
            out
        };

        // External fan-out; lagging receivers lose the oldest events.
        let _ = self.fanout.send(delivered.clone());

        if callbacks.is_empty() {
            debug!(name = %delivered.name, channel = %delivered.channel, "event had no subscribers");
            return 0;
        }

        let count = callbacks.len();
        let dispatches = callbacks.into_iter().map(|cb| {
            let event = delivered.clone();
            async move {
                let name = event.name.clone();
                if let Err(err) = cb(event).await {
                    error!(event = %name, %err, "event subscriber failed");
                }
            }
        });
        futures::future::join_all(dispatches).await;
        count
    }

    /// Stream of every delivered event, for external consumers.
    pub fn event_stream(&self) -> broadcast::Receiver<Event> {
        self.fanout.subscribe()
    }

    /// Drop all subscriptions atomically.
    pub async fn clear_subscriptions(&self) {
        self.subscriptions.lock().await.clear();
        debug!("all event subscriptions cleared");
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> BusCallback {
        EventBus::callback(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_pattern_and_channel_matching() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("global", "task.*", counting_callback(Arc::clone(&hits)))
            .await
            .unwrap();

        bus.publish(Event::new("task.succeeded", json!({}))).await;
        bus.publish(Event::new("other.event", json!({}))).await;
        bus.publish(Event::with_channel("task.failed", json!({}), "planner"))
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_channel_sees_everything() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("*", "*", counting_callback(Arc::clone(&hits)))
            .await
            .unwrap();

        bus.publish(Event::new("a", json!({}))).await;
        bus.publish(Event::with_channel("b", json!({}), "planner"))
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected_silently() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb = counting_callback(Arc::clone(&hits));

        bus.subscribe("global", "*", Arc::clone(&cb)).await.unwrap();
        bus.subscribe("global", "*", Arc::clone(&cb)).await.unwrap();
        assert_eq!(bus.subscription_count().await, 1);

        bus.publish(Event::new("x", json!({}))).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = bus
            .subscribe("global", "*", counting_callback(Arc::clone(&hits)))
            .await
            .unwrap();

        bus.unsubscribe(&handle).await;
        bus.publish(Event::new("x", json!({}))).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_depth_limit_drops_event() {
        let bus = EventBus::new(3);
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("*", "*", counting_callback(Arc::clone(&hits)))
            .await
            .unwrap();

        let mut event = Event::new("looping", json!({}));
        // Simulate a causal chain approaching the limit
        event.depth = 2;
        let reached = bus.publish(event).await;
        assert_eq!(reached, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscriber_error_is_isolated() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "global",
            "*",
            EventBus::callback(|_| async { anyhow::bail!("subscriber exploded") }),
        )
        .await
        .unwrap();
        bus.subscribe("global", "*", counting_callback(Arc::clone(&hits)))
            .await
            .unwrap();

        let reached = bus.publish(Event::new("x", json!({}))).await;
        assert_eq!(reached, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fanout_stream_receives_events() {
        let bus = EventBus::default();
        let mut stream = bus.event_stream();

        bus.publish(Event::new("observed", json!({"k": 1}))).await;
        let got = stream.recv().await.unwrap();
        assert_eq!(got.name, "observed");
        assert_eq!(got.depth, 1);
    }

    #[tokio::test]
    async fn test_publish_increments_depth_and_chain() {
        let bus = EventBus::default();
        let mut stream = bus.event_stream();

        let original = Event::new("chained", json!({}));
        let original_id = original.id;
        bus.publish(original).await;

        let got = stream.recv().await.unwrap();
        assert_eq!(got.depth, 1);
        assert_eq!(got.causation_chain, vec![original_id]);
        assert_ne!(got.id, original_id);
    }

    #[tokio::test]
    async fn test_clear_subscriptions() {
        let bus = EventBus::default();
        bus.subscribe("global", "*", counting_callback(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();
        bus.clear_subscriptions().await;
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_blocking_subscriber_runs() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        bus.subscribe_blocking("global", "*", move |_event| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        bus.publish(Event::new("x", json!({}))).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
