//! Bounded two-priority task queue
//!
//! High priority pops before normal; within a priority, pop order equals
//! push order. `put` suspends when the queue is full (backpressure);
//! `put_nowait` fails fast. Capacity is released inside `get` before the
//! item is handed back, so a consumer cancelled mid-wait can never strand
//! a permit.

use std::collections::VecDeque;

use aura_core::{Priority, Tasklet};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Queue errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// `put_nowait` on a full queue
    #[error("task queue is full")]
    Full,

    /// The queue was closed while waiting
    #[error("task queue is closed")]
    Closed,
}

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Default)]
struct Lanes {
    high: VecDeque<Tasklet>,
    normal: VecDeque<Tasklet>,
}

/// The queue
pub struct TaskQueue {
    lanes: Mutex<Lanes>,
    /// Permits for queued items; `get` waits on this
    items: Semaphore,
    /// Permits for free slots; `put` waits on this
    slots: Semaphore,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl TaskQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            items: Semaphore::new(0),
            slots: Semaphore::new(capacity.max(1)),
        }
    }

    fn push(&self, tasklet: Tasklet) {
        let mut lanes = self.lanes.lock();
        match tasklet.priority {
            Priority::High => lanes.high.push_back(tasklet),
            Priority::Normal => lanes.normal.push_back(tasklet),
        }
    }

    fn pop(&self) -> Option<Tasklet> {
        let mut lanes = self.lanes.lock();
        lanes.high.pop_front().or_else(|| lanes.normal.pop_front())
    }

    /// Enqueue, waiting for a free slot when full.
    pub async fn put(&self, tasklet: Tasklet) -> Result<(), QueueError> {
        let permit = self.slots.acquire().await.map_err(|_| QueueError::Closed)?;
        permit.forget();
        self.push(tasklet);
        self.items.add_permits(1);
        Ok(())
    }

    /// Enqueue without waiting; fails fast when full.
    pub fn put_nowait(&self, tasklet: Tasklet) -> Result<(), QueueError> {
        let permit = self.slots.try_acquire().map_err(|_| QueueError::Full)?;
        permit.forget();
        self.push(tasklet);
        self.items.add_permits(1);
        Ok(())
    }

    /// Dequeue, waiting when empty.
    pub async fn get(&self) -> Result<Tasklet, QueueError> {
        let permit = self.items.acquire().await.map_err(|_| QueueError::Closed)?;
        permit.forget();
        self.slots.add_permits(1);
        // An item permit guarantees a queued tasklet
        Ok(self.pop().expect("item permit without a queued tasklet"))
    }

    /// Dequeue without waiting.
    pub fn try_get(&self) -> Option<Tasklet> {
        let permit = self.items.try_acquire().ok()?;
        permit.forget();
        self.slots.add_permits(1);
        Some(self.pop().expect("item permit without a queued tasklet"))
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.high.len() + lanes.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tasklet(name: &str, priority: Priority) -> Tasklet {
        Tasklet::new(format!("p/{name}")).with_priority(priority)
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = TaskQueue::default();
        for name in ["a", "b", "c"] {
            queue.put(tasklet(name, Priority::Normal)).await.unwrap();
        }

        assert_eq!(queue.get().await.unwrap().task_fqid, "p/a");
        assert_eq!(queue.get().await.unwrap().task_fqid, "p/b");
        assert_eq!(queue.get().await.unwrap().task_fqid, "p/c");
    }

    #[tokio::test]
    async fn test_high_priority_jumps_queue() {
        let queue = TaskQueue::default();
        queue.put(tasklet("normal1", Priority::Normal)).await.unwrap();
        queue.put(tasklet("normal2", Priority::Normal)).await.unwrap();
        queue.put(tasklet("urgent", Priority::High)).await.unwrap();

        assert_eq!(queue.get().await.unwrap().task_fqid, "p/urgent");
        assert_eq!(queue.get().await.unwrap().task_fqid, "p/normal1");
    }

    #[tokio::test]
    async fn test_put_nowait_fails_when_full() {
        let queue = TaskQueue::with_capacity(2);
        queue.put_nowait(tasklet("a", Priority::Normal)).unwrap();
        queue.put_nowait(tasklet("b", Priority::Normal)).unwrap();
        assert_eq!(
            queue.put_nowait(tasklet("c", Priority::Normal)),
            Err(QueueError::Full)
        );
    }

    #[tokio::test]
    async fn test_put_blocks_until_slot_frees() {
        let queue = std::sync::Arc::new(TaskQueue::with_capacity(1));
        queue.put(tasklet("first", Priority::Normal)).await.unwrap();

        let blocked = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.put(tasklet("second", Priority::Normal)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.get().await.unwrap().task_fqid, "p/first");
        tokio::time::timeout(Duration::from_millis(200), blocked)
            .await
            .expect("put must complete after a slot frees")
            .unwrap()
            .unwrap();
        assert_eq!(queue.get().await.unwrap().task_fqid, "p/second");
    }

    #[tokio::test]
    async fn test_get_waits_for_item() {
        let queue = std::sync::Arc::new(TaskQueue::default());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.put(tasklet("late", Priority::Normal)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.task_fqid, "p/late");
    }

    #[tokio::test]
    async fn test_try_get() {
        let queue = TaskQueue::default();
        assert!(queue.try_get().is_none());
        queue.put_nowait(tasklet("x", Priority::Normal)).unwrap();
        assert_eq!(queue.try_get().unwrap().task_fqid, "p/x");
        assert!(queue.is_empty());
    }
}
