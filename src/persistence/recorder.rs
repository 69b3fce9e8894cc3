//! Background writer appending live envelopes to a recording
//!
//! The subscriber hands envelopes to a [`RecordSink`]; a single writer task
//! appends them in the order they were handed over. A failed write disables
//! the recorder for the rest of the session and is reported to the manager,
//! the live path is not affected.
//!
//! Every record is synced to disk before the next one is written, so the
//! writer can fall behind a fast broker. At most [`RECORD_CAPACITY`] envelopes
//! wait for it; further ones are dropped and counted in `record_dropped`.

use crate::error::Result;
#[cfg(test)]
use crate::error::StreamError;
use crate::mqtt::envelope::Envelope;
use crate::persistence::recording::RecordingWriter;
use crate::shutdown::join_or_abort;
use crate::stats::StreamStats;
use crate::stream::events::{ComponentEvent, EventSender};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Envelopes that may wait for the writer before new ones are dropped
pub const RECORD_CAPACITY: usize = 1024;

/// Cheap handle used to feed envelopes to the recorder
#[derive(Debug, Clone)]
pub struct RecordSink {
    tx: mpsc::Sender<Envelope>,
    stats: Arc<StreamStats>,
}

impl RecordSink {
    /// Queues an envelope for writing without waiting
    ///
    /// False once the recorder has stopped, or when the writer already has
    /// its full backlog of envelopes waiting; the envelope is then dropped and
    /// counted in `record_dropped`.
    pub fn record(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                self.stats.inc_record_dropped();
                warn!("Recorder backlog full, not recording message on {}", envelope.topic());
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub struct Recorder {
    path: PathBuf,
    sink: RecordSink,
    cancel: CancellationToken,
    task: JoinHandle<Result<u64>>,
}

impl Recorder {
    /// Opens (or resumes) the recording and starts the writer task
    pub async fn start(
        path: impl AsRef<Path>,
        stats: Arc<StreamStats>,
        events: Option<EventSender>,
    ) -> Result<Self> {
        Self::with_capacity(path, RECORD_CAPACITY, stats, events).await
    }

    /// Like [`Recorder::start`] with a custom backlog bound
    pub async fn with_capacity(
        path: impl AsRef<Path>,
        capacity: usize,
        stats: Arc<StreamStats>,
        events: Option<EventSender>,
    ) -> Result<Self> {
        let writer = RecordingWriter::open(path.as_ref()).await?;
        let path = writer.path().to_path_buf();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_writer(writer, rx, stats.clone(), events, cancel.clone()));
        info!("Recorder started: {}", path.display());

        Ok(Self {
            path,
            sink: RecordSink { tx, stats },
            cancel,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sink(&self) -> RecordSink {
        self.sink.clone()
    }

    /// True while the writer task is alive
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Writes whatever is still queued, closes the file and returns the record count
    pub async fn stop(self, timeout: Duration) -> Result<u64> {
        debug!("Stopping recorder {}", self.path.display());
        self.cancel.cancel();
        drop(self.sink);

        let written = join_or_abort("recorder", self.task, timeout).await??;
        info!(
            "Recorder stopped, {} records written to {}",
            written,
            self.path.display()
        );
        Ok(written)
    }
}

async fn run_writer(
    mut writer: RecordingWriter,
    mut rx: mpsc::Receiver<Envelope>,
    stats: Arc<StreamStats>,
    events: Option<EventSender>,
    cancel: CancellationToken,
) -> Result<u64> {
    loop {
        let envelope = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
            _ = cancel.cancelled() => {
                // keep everything accepted before the stop request
                rx.close();
                while let Some(envelope) = rx.recv().await {
                    write_one(&mut writer, &envelope, &stats, events.as_ref()).await?;
                }
                break;
            }
        };
        write_one(&mut writer, &envelope, &stats, events.as_ref()).await?;
    }
    Ok(writer.written())
}

async fn write_one(
    writer: &mut RecordingWriter,
    envelope: &Envelope,
    stats: &StreamStats,
    events: Option<&EventSender>,
) -> Result<()> {
    match writer.append(envelope).await {
        Ok(()) => {
            stats.inc_recorded();
            Ok(())
        }
        Err(e) => {
            stats.inc_persistence_errors();
            error!("Recording write failed, disabling recorder: {}", e);
            if let Some(events) = events {
                let _ = events.send(ComponentEvent::RecordingFailed {
                    path: writer.path().to_path_buf(),
                    reason: e.to_string(),
                });
            }
            Err(e)
        }
    }
}
