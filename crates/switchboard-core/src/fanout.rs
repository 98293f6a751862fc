//! Fanout: copy every event from one input to many outputs.

use crate::event::Event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Outputs {
    /// `None` once the fanout has closed.
    senders: Mutex<Option<Vec<mpsc::Sender<Event>>>>,
    dropped: AtomicU64,
}

impl Outputs {
    fn send(&self, event: &Event) {
        let mut guard = self.senders.lock();
        let Some(senders) = guard.as_mut() else {
            return;
        };

        senders.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %event.topic(), "Fanout output full, dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Fanout output receiver dropped, removing output");
                false
            }
        });
    }

    fn close(&self) {
        if self.senders.lock().take().is_some() {
            debug!("Fanout closed");
        }
    }
}

/// Copies each input event to every registered output.
///
/// Runs one background task. Outputs are offered events without waiting:
/// a full output loses the event and the drop is counted. All outputs are
/// closed when the input closes or the fanout's scope is cancelled.
pub struct Fanout {
    outputs: Arc<Outputs>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Fanout {
    /// Start a fanout reading from `input`.
    pub fn spawn(mut input: mpsc::Receiver<Event>, parent: &CancellationToken) -> Self {
        let outputs = Arc::new(Outputs {
            senders: Mutex::new(Some(Vec::new())),
            dropped: AtomicU64::new(0),
        });
        let token = parent.child_token();

        let handle = tokio::spawn({
            let outputs = Arc::clone(&outputs);
            let token = token.clone();
            async move {
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        event = input.recv() => match event {
                            Some(event) => event,
                            None => break,
                        },
                    };
                    outputs.send(&event);
                }
                outputs.close();
            }
        });

        Self {
            outputs,
            token,
            handle: Some(handle),
        }
    }

    /// Start a fanout with its own input queue of `capacity`.
    ///
    /// Returns the input sender alongside the fanout.
    pub fn with_capacity(
        capacity: usize,
        parent: &CancellationToken,
    ) -> (mpsc::Sender<Event>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::spawn(rx, parent))
    }

    /// Register a new output with its own queue of `capacity`.
    ///
    /// If the fanout has already closed the returned receiver is closed too.
    pub fn add_output(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Some(senders) = self.outputs.senders.lock().as_mut() {
            senders.push(tx);
        }
        rx
    }

    /// Get the number of live outputs.
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.outputs.senders.lock().as_ref().map_or(0, Vec::len)
    }

    /// Get the number of events dropped on full outputs.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.outputs.dropped.load(Ordering::Relaxed)
    }

    /// Check if the fanout has closed its outputs.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outputs.senders.lock().is_none()
    }

    /// Stop the fanout and wait for its task to exit.
    pub async fn close(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Fanout task failed");
            }
        }
        self.outputs.close();
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_output_receives() {
        let (input, fanout) = Fanout::with_capacity(8, &CancellationToken::new());
        let mut a = fanout.add_output(8);
        let mut b = fanout.add_output(8);
        assert_eq!(fanout.output_count(), 2);

        input.send(Event::new("t", "x")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().topic(), "t");
        assert_eq!(b.recv().await.unwrap().topic(), "t");
    }

    #[tokio::test]
    async fn test_full_output_drops_without_stalling_others() {
        let (input, fanout) = Fanout::with_capacity(8, &CancellationToken::new());
        let mut slow = fanout.add_output(1);
        let mut fast = fanout.add_output(8);

        input.send(Event::new("t", "1")).await.unwrap();
        input.send(Event::new("t", "2")).await.unwrap();

        assert_eq!(&fast.recv().await.unwrap().payload()[..], b"1");
        assert_eq!(&fast.recv().await.unwrap().payload()[..], b"2");
        assert_eq!(fanout.dropped(), 1);

        assert_eq!(&slow.recv().await.unwrap().payload()[..], b"1");

        drop(input);
        assert!(slow.recv().await.is_none());
        assert!(fast.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_input_close_closes_outputs() {
        let (input, fanout) = Fanout::with_capacity(4, &CancellationToken::new());
        let mut out = fanout.add_output(4);

        drop(input);
        assert!(out.recv().await.is_none());
        assert!(fanout.is_closed());

        let mut late = fanout.add_output(4);
        assert!(late.recv().await.is_none());
        assert_eq!(fanout.output_count(), 0);
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_outputs() {
        let parent = CancellationToken::new();
        let (_input, fanout) = Fanout::with_capacity(4, &parent);
        let mut out = fanout.add_output(4);

        parent.cancel();
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_and_dropped_output() {
        let (input, mut fanout) = Fanout::with_capacity(4, &CancellationToken::new());
        let gone = fanout.add_output(4);
        let mut kept = fanout.add_output(4);
        drop(gone);

        input.send(Event::new("t", "x")).await.unwrap();
        kept.recv().await.unwrap();
        assert_eq!(fanout.output_count(), 1);

        fanout.close().await;
        assert!(fanout.is_closed());
        assert!(kept.recv().await.is_none());
    }
}
