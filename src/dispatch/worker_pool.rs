//! Fixed-size pool of workers draining the dispatch queue
//!
//! Every worker takes envelopes in FIFO order and calls the handler. With a
//! single worker the handler sees messages in arrival order. With more than
//! one worker messages are processed concurrently and the global order in
//! which the handler observes them is NOT guaranteed; callers that need
//! strict ordering must run with `worker_count = 1`.
//!
//! Handlers are plain synchronous code and may block, so every call runs on
//! tokio's blocking pool. The worker task only waits for it, which leaves the
//! network loops and the recorder free to make progress in the meantime. An
//! immediate stop does not wait for a handler call that is still running; the
//! call finishes on its own thread and is still counted.

use crate::dispatch::handler::MessageHandler;
use crate::dispatch::queue::DispatchQueue;
use crate::error::{Result, StreamError};
use crate::mqtt::envelope::Envelope;
use crate::stats::StreamStats;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WORKER_COUNT: usize = 2;

/// How the pool treats envelopes still buffered when it is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Close the queue and let workers process what is left
    Drain,
    /// Stop at the next suspension point and discard the buffer
    Immediate,
}

impl StopMode {
    pub fn from_drain(drain: bool) -> Self {
        if drain {
            StopMode::Drain
        } else {
            StopMode::Immediate
        }
    }
}

pub struct WorkerPool {
    queue: Arc<DispatchQueue>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one) on the given queue
    pub fn start(
        size: usize,
        queue: Arc<DispatchQueue>,
        handler: Arc<dyn MessageHandler>,
        stats: Arc<StreamStats>,
    ) -> Self {
        let size = size.max(1);
        let cancel = CancellationToken::new();
        info!("Starting worker pool with {} workers", size);

        let workers = (0..size)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    queue.clone(),
                    handler.clone(),
                    stats.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            queue,
            workers,
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops all workers and waits for them, aborting the ones that overrun `timeout`
    pub async fn stop(self, mode: StopMode, timeout: Duration) -> Result<()> {
        debug!("Stopping worker pool ({:?})", mode);
        match mode {
            StopMode::Drain => self.queue.close(),
            StopMode::Immediate => {
                self.cancel.cancel();
                self.queue.close();
                let discarded = self.queue.clear();
                if discarded > 0 {
                    warn!("Discarded {} undispatched messages", discarded);
                }
            }
        }

        let deadline = Instant::now() + timeout;
        let mut aborted = Vec::new();
        for (id, mut worker) in self.workers.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => debug!("Worker {} finished", id),
                Ok(Err(e)) => error!("Worker {} terminated abnormally: {}", id, e),
                Err(_) => {
                    warn!("Worker {} did not stop in time, aborting", id);
                    worker.abort();
                    aborted.push(format!("worker-{}", id));
                }
            }
        }

        if aborted.is_empty() {
            info!("Worker pool stopped");
            Ok(())
        } else {
            Err(StreamError::ForcedShutdown {
                components: aborted,
            })
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<DispatchQueue>,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<StreamStats>,
    cancel: CancellationToken,
) {
    debug!("Worker {} started", id);
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.take() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let call = {
            let handler = handler.clone();
            let stats = stats.clone();
            tokio::task::spawn_blocking(move || invoke(id, handler.as_ref(), &envelope, &stats))
        };
        tokio::select! {
            biased;
            joined = call => {
                if let Err(e) = joined {
                    error!("Worker {}: handler call did not complete: {}", id, e);
                }
            }
            _ = cancel.cancelled() => {
                warn!("Worker {} cancelled while its handler was still running", id);
                break;
            }
        }
    }
    debug!("Worker {} exiting", id);
}

fn invoke(id: usize, handler: &dyn MessageHandler, envelope: &Envelope, stats: &StreamStats) {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
        Ok(Ok(())) => stats.inc_dispatched(),
        Ok(Err(e)) => {
            stats.inc_handler_failures();
            warn!(
                "Worker {}: handler failed for message on {}: {}",
                id,
                envelope.topic(),
                e
            );
        }
        Err(panic) => {
            stats.inc_handler_failures();
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                "Worker {}: handler panicked on message on {}: {}",
                id,
                envelope.topic(),
                reason
            );
        }
    }
}
