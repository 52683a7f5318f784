use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::pipeline::{Outcome, Pipeline, PipelineRequest};

/// Receives human-readable progress lines in order.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, line: &str);
}

impl ProgressSink for mpsc::UnboundedSender<String> {
    fn emit(&self, line: &str) {
        // The receiver going away only means nobody is listening any more.
        let _ = self.send(line.to_string());
    }
}

/// Adapts a closure into a [`ProgressSink`].
pub struct FnProgress<F>(pub F);

impl<F> ProgressSink for FnProgress<F>
where
    F: Fn(&str) + Send + Sync,
{
    fn emit(&self, line: &str) {
        (self.0)(line)
    }
}

/// Cooperative cancellation flag, checked only between pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct ActiveRun(Arc<AtomicBool>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs the pipeline on a worker task, one run at a time.
pub struct RunController {
    pipeline: Arc<Pipeline>,
    active: Arc<AtomicBool>,
}

impl RunController {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a run. Fails with [`Error::Busy`] while another is in flight.
    pub fn start(&self, request: PipelineRequest) -> Result<RunHandle> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        let active = ActiveRun(Arc::clone(&self.active));

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let pipeline = Arc::clone(&self.pipeline);

        let task = tokio::spawn(async move {
            let _active = active;
            pipeline.process(&request, &tx, &token).await
        });

        Ok(RunHandle {
            progress: rx,
            cancel,
            task,
        })
    }
}

pub struct RunHandle {
    progress: mpsc::UnboundedReceiver<String>,
    cancel: CancelToken,
    task: JoinHandle<Outcome>,
}

impl RunHandle {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next progress line; `None` once the run has finished and drained.
    pub async fn next_progress(&mut self) -> Option<String> {
        self.progress.recv().await
    }

    /// Wait for the single terminal outcome of the run.
    pub async fn wait(self) -> Outcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed {
                stage: None,
                error: Error::Worker(e.to_string()),
            },
        }
    }
}
