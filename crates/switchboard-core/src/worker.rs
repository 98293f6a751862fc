//! Worker pool: N tasks draining one bus topic.
//!
//! The pool holds a single subscription. Its workers share the subscriber
//! queue, so each published event is handled by exactly one worker.

use crate::bus::{Bus, Subscription, Topic};
use crate::event::{Event, EventId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handles events taken from the pool's topic.
///
/// Implemented for any `Fn(Event) -> Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event. Errors are reported, never retried.
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// A handler failure reported to the pool's error sink.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Index of the worker that ran the handler.
    pub worker_id: usize,
    /// Topic the event came from.
    pub topic: Topic,
    /// ID of the failed event.
    pub event_id: EventId,
    /// The handler's error.
    pub error: anyhow::Error,
}

struct Running {
    subscription: Subscription,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// A fixed-size pool of workers consuming one topic.
pub struct WorkerPool {
    bus: Bus,
    topic: Topic,
    workers: usize,
    handler: Arc<dyn EventHandler>,
    errors: Option<mpsc::Sender<HandlerFailure>>,
    running: Option<Running>,
}

impl WorkerPool {
    /// Create a pool. A worker count of zero is raised to one.
    pub fn new(
        bus: Bus,
        topic: impl Into<Topic>,
        workers: usize,
        handler: impl EventHandler,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            workers: workers.max(1),
            handler: Arc::new(handler),
            errors: None,
            running: None,
        }
    }

    /// Report handler failures to `sink`.
    ///
    /// Failures are offered without waiting; a full sink loses them.
    #[must_use]
    pub fn with_error_sink(mut self, sink: mpsc::Sender<HandlerFailure>) -> Self {
        self.errors = Some(sink);
        self
    }

    /// Get the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Check if the pool has been started and not stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Subscribe to the topic and spawn the workers.
    ///
    /// Workers exit when `parent` is cancelled or the pool is stopped.
    /// Starting a running pool does nothing.
    pub fn start(&mut self, parent: &CancellationToken) {
        if self.running.is_some() {
            warn!(topic = %self.topic, "Worker pool already started");
            return;
        }

        let token = parent.child_token();
        let subscriber = self.bus.subscribe(
            &token,
            format!("worker-pool-{}", self.topic),
            [self.topic.clone()],
        );
        let (subscription, receiver) = subscriber.into_parts();
        let queue = Arc::new(Mutex::new(receiver));

        let handles = (0..self.workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    topic: self.topic.clone(),
                    queue: Arc::clone(&queue),
                    handler: Arc::clone(&self.handler),
                    errors: self.errors.clone(),
                    token: token.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(topic = %self.topic, workers = self.workers, "Worker pool started");

        self.running = Some(Running {
            subscription,
            token,
            handles,
        });
    }

    /// Unsubscribe and wait for every worker to exit.
    ///
    /// Events already queued are still handled before the workers exit.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.bus.unsubscribe(&running.subscription);

        for handle in running.handles {
            if let Err(e) = handle.await {
                error!(topic = %self.topic, error = %e, "Worker task failed");
            }
        }

        info!(topic = %self.topic, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            self.bus.unsubscribe(&running.subscription);
            running.token.cancel();
        }
    }
}

struct Worker {
    id: usize,
    topic: Topic,
    queue: Arc<Mutex<mpsc::Receiver<Event>>>,
    handler: Arc<dyn EventHandler>,
    errors: Option<mpsc::Sender<HandlerFailure>>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(topic = %self.topic, worker = self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                event = async { self.queue.lock().await.recv().await } => event,
            };
            let Some(event) = next else {
                break;
            };

            let event_id = event.id();
            if let Err(e) = self.handler.handle(event).await {
                error!(
                    topic = %self.topic,
                    worker = self.id,
                    event = event_id,
                    error = %e,
                    "Event handler failed"
                );
                self.report(event_id, e);
            }
        }

        debug!(topic = %self.topic, worker = self.id, "Worker exited");
    }

    fn report(&self, event_id: EventId, error: anyhow::Error) {
        let Some(sink) = &self.errors else {
            return;
        };
        let failure = HandlerFailure {
            worker_id: self.id,
            topic: self.topic.clone(),
            event_id,
            error,
        };
        if sink.try_send(failure).is_err() {
            warn!(topic = %self.topic, worker = self.id, "Error sink unavailable, dropping failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_each_event_handled_exactly_once() {
        let bus = Bus::new();
        let seen = Arc::new(SyncMutex::new(HashSet::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let handler = {
            let seen = Arc::clone(&seen);
            let calls = Arc::clone(&calls);
            move |event: Event| {
                let seen = Arc::clone(&seen);
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    seen.lock().insert(event.id());
                    tokio::task::yield_now().await;
                    Ok::<_, anyhow::Error>(())
                }
            }
        };

        let mut pool = WorkerPool::new(bus.clone(), "jobs", 4, handler);
        pool.start(&CancellationToken::new());

        for i in 0..50 {
            assert_eq!(bus.publish("jobs", format!("job-{i}")), 1);
        }

        pool.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert_eq!(seen.lock().len(), 50);
    }

    #[tokio::test]
    async fn test_handler_failure_reaches_sink() {
        let bus = Bus::new();
        let (tx, mut rx) = mpsc::channel(8);

        let handler = |event: Event| async move {
            if &event.payload()[..] == b"bad" {
                anyhow::bail!("cannot handle");
            }
            Ok(())
        };

        let mut pool = WorkerPool::new(bus.clone(), "jobs", 2, handler).with_error_sink(tx);
        pool.start(&CancellationToken::new());

        bus.publish("jobs", "good");
        bus.publish("jobs", "bad");

        let failure = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.topic, "jobs");
        assert_eq!(failure.error.to_string(), "cannot handle");

        pool.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_zero_workers_raised_to_one() {
        let handler = |_: Event| async { Ok::<_, anyhow::Error>(()) };
        let pool = WorkerPool::new(Bus::new(), "jobs", 0, handler);
        assert_eq!(pool.workers(), 1);
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let bus = Bus::new();
        let handler = |_: Event| async { Ok::<_, anyhow::Error>(()) };
        let mut pool = WorkerPool::new(bus.clone(), "jobs", 2, handler);

        pool.start(&CancellationToken::new());
        assert!(pool.is_running());
        assert_eq!(bus.subscriber_count("jobs"), 1);

        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(bus.subscriber_count("jobs"), 0);
        assert_eq!(bus.publish("jobs", "late"), 0);
    }

    #[tokio::test]
    async fn test_parent_cancel_ends_workers() {
        let bus = Bus::new();
        let handler = |_: Event| async { Ok::<_, anyhow::Error>(()) };
        let mut pool = WorkerPool::new(bus.clone(), "jobs", 3, handler);
        let parent = CancellationToken::new();

        pool.start(&parent);
        parent.cancel();

        // Cancelled subscribers are skipped by publish.
        assert_eq!(bus.publish("jobs", "ignored"), 0);

        tokio::time::timeout(Duration::from_secs(1), pool.stop())
            .await
            .expect("workers exit after parent cancellation");
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = Bus::new();
        let handler = |_: Event| async { Ok::<_, anyhow::Error>(()) };
        let mut pool = WorkerPool::new(bus.clone(), "jobs", 1, handler);

        pool.start(&CancellationToken::new());
        drop(pool);
        assert_eq!(bus.subscriber_count("jobs"), 0);
    }
}
