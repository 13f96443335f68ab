//! Work item queue
//!
//! Workers pop ready items; retries come back through `push_delayed` once
//! their backoff has elapsed. Each pushed item is popped by exactly one worker.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::WorkItem;

/// Shared queue of pending work items
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue an item for immediate processing
    async fn push(&self, item: WorkItem) -> Result<()>;

    /// Enqueue an item that becomes ready after `delay`
    async fn push_delayed(&self, item: WorkItem, delay: Duration) -> Result<()>;

    /// Take the next ready item, waiting up to `timeout`
    async fn pop(&self, timeout: Duration) -> Result<Option<WorkItem>>;

    /// Items waiting, ready or delayed
    async fn len(&self) -> Result<usize>;
}

/// Channel-backed queue for a single process
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    ready: Arc<AtomicUsize>,
    delayed: Arc<AtomicUsize>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            ready: Arc::new(AtomicUsize::new(0)),
            delayed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for InProcessQueue {
    async fn push(&self, item: WorkItem) -> Result<()> {
        // Counted before it is visible so a racing pop never underflows
        self.ready.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.ready.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Storage("work queue closed".into()));
        }
        Ok(())
    }

    async fn push_delayed(&self, item: WorkItem, delay: Duration) -> Result<()> {
        let tx = self.tx.clone();
        let ready = Arc::clone(&self.ready);
        let delayed = Arc::clone(&self.delayed);
        delayed.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let item_id = item.id.clone();
            // Count as ready before it becomes visible so len() never dips
            ready.fetch_add(1, Ordering::SeqCst);
            delayed.fetch_sub(1, Ordering::SeqCst);
            if tx.send(item).is_err() {
                ready.fetch_sub(1, Ordering::SeqCst);
                debug!(item = %item_id, "Queue closed before delayed item became ready");
            }
        });
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<WorkItem>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => {
                self.ready.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(item))
            }
            // The sender lives in self, so the channel cannot close here
            Ok(None) | Err(_) => Ok(None),
        }
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.ready.load(Ordering::SeqCst) + self.delayed.load(Ordering::SeqCst))
    }
}
