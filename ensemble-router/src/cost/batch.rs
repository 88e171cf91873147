//! Low-priority request batching
//!
//! Deferred requests queue on a channel. A background task collects them and
//! flushes the batch to a handler once it reaches the configured size or the
//! first queued request has waited the batch timeout, whichever comes first.
//! Each submitter gets its own result back over a oneshot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::error::{EnsembleError, EnsembleResult};
use crate::events::{EnsembleEvent, SharedEventBus};

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timeout,
    Closed,
}

impl std::fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Size => write!(f, "size"),
            Self::Timeout => write!(f, "timeout"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

struct Pending<T, R> {
    item: T,
    reply: oneshot::Sender<R>,
}

/// Handle for submitting items to a running batch loop.
///
/// Dropping every handle flushes what is queued and stops the loop.
pub struct Batcher<T, R> {
    tx: mpsc::UnboundedSender<Pending<T, R>>,
}

impl<T, R> Clone for Batcher<T, R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T, R> Batcher<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Start the batch loop. `handler` receives each flushed batch and must
    /// return one result per item, in order.
    pub fn spawn<F, Fut>(
        config: &BatchConfig,
        bus: Option<SharedEventBus>,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<R>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let size = config.size.max(1);
        let timeout = Duration::from_millis(config.timeout_ms);
        tokio::spawn(run(rx, size, timeout, bus, Arc::new(handler)));
        Self { tx }
    }

    /// Queue an item and wait for its batch to be processed.
    pub async fn submit(&self, item: T) -> EnsembleResult<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Pending { item, reply })
            .map_err(|_| EnsembleError::BatchClosed)?;
        rx.await.map_err(|_| EnsembleError::BatchClosed)
    }
}

async fn run<T, R, F, Fut>(
    mut rx: mpsc::UnboundedReceiver<Pending<T, R>>,
    size: usize,
    timeout: Duration,
    bus: Option<SharedEventBus>,
    handler: Arc<F>,
) where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<R>> + Send + 'static,
{
    while let Some(first) = rx.recv().await {
        let deadline = Instant::now() + timeout;
        let mut batch = vec![first];
        let trigger = loop {
            if batch.len() >= size {
                break FlushTrigger::Size;
            }
            tokio::select! {
                next = rx.recv() => match next {
                    Some(pending) => batch.push(pending),
                    None => break FlushTrigger::Closed,
                },
                _ = sleep_until(deadline) => break FlushTrigger::Timeout,
            }
        };
        debug!(size = batch.len(), %trigger, "Flushing batch");
        if let Some(bus) = &bus {
            bus.publish(EnsembleEvent::BatchFlushed {
                size: batch.len(),
                trigger: trigger.to_string(),
                timestamp: Utc::now(),
            });
        }
        // flush concurrently so a slow batch does not hold up the next one
        tokio::spawn(flush(batch, Arc::clone(&handler)));
    }
}

async fn flush<T, R, F, Fut>(batch: Vec<Pending<T, R>>, handler: Arc<F>)
where
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Vec<R>>,
{
    let (items, replies): (Vec<T>, Vec<oneshot::Sender<R>>) =
        batch.into_iter().map(|p| (p.item, p.reply)).unzip();
    let expected = items.len();
    let results = handler(items).await;
    if results.len() != expected {
        warn!(expected, got = results.len(), "Batch handler returned wrong result count");
    }
    for (reply, result) in replies.into_iter().zip(results) {
        // submitter may have given up
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(size: usize, timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            enabled: true,
            size,
            timeout_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_size() {
        let batches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&batches);
        let batcher: Batcher<u32, u32> = Batcher::spawn(&config(3, 60_000), None, move |items| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { items.into_iter().map(|i| i * 10).collect() }
        });

        let (a, b, c) = tokio::join!(batcher.submit(1), batcher.submit(2), batcher.submit(3));
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (10, 20, 30));
        assert_eq!(batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_timeout() {
        let bus = EventBus::new().shared();
        let mut events = bus.subscribe();
        let batcher: Batcher<u32, u32> =
            Batcher::spawn(&config(10, 2_000), Some(Arc::clone(&bus)), |items| async move {
                items
            });

        let started = Instant::now();
        assert_eq!(batcher.submit(7).await.unwrap(), 7);
        assert!(started.elapsed() >= Duration::from_millis(2_000));

        match events.recv().await.unwrap() {
            EnsembleEvent::BatchFlushed { size, trigger, .. } => {
                assert_eq!(size, 1);
                assert_eq!(trigger, "timeout");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_short_handler_result_reports_closed() {
        let batcher: Batcher<u32, u32> =
            Batcher::spawn(&config(2, 10), None, |_items| async move { vec![1] });
        let (a, b) = tokio::join!(batcher.submit(1), batcher.submit(2));
        assert_eq!(a.unwrap(), 1);
        assert!(matches!(b, Err(EnsembleError::BatchClosed)));
    }
}
