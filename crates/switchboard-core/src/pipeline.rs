//! Pipeline: run each event through an ordered list of stages.
//!
//! A stage either transforms the event or fails it. A failure stops the
//! event at that stage and is reported on the error output; later stages
//! are not run.

use crate::event::Event;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type Stage = Box<dyn Fn(Event) -> anyhow::Result<Event> + Send + Sync>;

/// A stage failure.
#[derive(Debug, Error)]
#[error("stage {stage} failed for topic '{topic}': {error}")]
pub struct StageError {
    /// Zero-based index of the failing stage.
    pub stage: usize,
    /// Topic of the failed event.
    pub topic: String,
    /// The stage's error.
    pub error: anyhow::Error,
}

/// An ordered list of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Create an empty pipeline. An empty pipeline passes events through.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    #[must_use]
    pub fn stage<F>(mut self, f: F) -> Self
    where
        F: Fn(Event) -> anyhow::Result<Event> + Send + Sync + 'static,
    {
        self.stages.push(Box::new(f));
        self
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if there are no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one event through every stage.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure.
    pub fn process(&self, event: Event) -> Result<Event, StageError> {
        self.stages
            .iter()
            .enumerate()
            .try_fold(event, |event, (stage, f)| {
                let topic = event.topic().to_string();
                f(event).map_err(|error| StageError {
                    stage,
                    topic,
                    error,
                })
            })
    }

    /// Start the pipeline on a background task.
    ///
    /// Successful events go to the output, which applies backpressure: a
    /// full output pauses the pipeline. Failures are offered to the error
    /// output without waiting. Both outputs hold `capacity` items and close
    /// when `input` closes or the scope is cancelled.
    pub fn spawn(
        self,
        mut input: mpsc::Receiver<Event>,
        capacity: usize,
        parent: &CancellationToken,
    ) -> PipelineHandle {
        let capacity = capacity.max(1);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);
        let token = parent.child_token();

        let handle = tokio::spawn({
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

                    match self.process(event) {
                        Ok(event) => {
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => break,
                                sent = output_tx.send(event) => {
                                    if sent.is_err() {
                                        debug!("Pipeline output receiver dropped");
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!(stage = e.stage, topic = %e.topic, error = %e.error, "Pipeline stage failed");
                            if let Err(TrySendError::Full(e)) = errors_tx.try_send(e) {
                                warn!(stage = e.stage, topic = %e.topic, "Pipeline error output full, dropping failure");
                            }
                        }
                    }
                }
                debug!("Pipeline stopped");
            }
        });

        PipelineHandle {
            output: output_rx,
            errors: errors_rx,
            token,
            handle: Some(handle),
        }
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    output: mpsc::Receiver<Event>,
    errors: mpsc::Receiver<StageError>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Get the output of successfully processed events.
    pub fn output(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.output
    }

    /// Get the output of stage failures.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<StageError> {
        &mut self.errors
    }

    /// Stop the pipeline and wait for its task to exit.
    pub async fn close(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pipeline task failed");
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
