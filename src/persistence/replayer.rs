//! Recording playback with original inter-message timing
//!
//! # State Machine
//!
//! ```text
//! Pending ──open──► Streaming ──run──► Finished
//! ```
//!
//! Publish instants are computed against a running schedule instead of
//! sleeping for each gap, so a slow publish does not push every later message
//! back. How late each publish was relative to the schedule is kept as drift.

use crate::error::{Result, StreamError};
use crate::mqtt::publisher::PublishSink;
use crate::persistence::recording::RecordingReader;
use crate::shutdown::join_or_abort;
use crate::stats::StreamStats;
use crate::stream::events::{ComponentEvent, EventSender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statum::{machine, state};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MIN_SPEED: f64 = 0.01;
pub const MAX_SPEED: f64 = 100.0;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct ReplayOptions {
    /// Playback rate; 2.0 plays twice as fast as recorded
    pub speed: f64,
    /// Start over at the end of the recording until stopped
    pub loop_playback: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
        }
    }
}

impl ReplayOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(StreamError::Configuration(format!(
                "replay speed must be a positive number, got {}",
                self.speed
            )));
        }
        Ok(())
    }

    pub fn effective_speed(&self) -> f64 {
        self.speed.clamp(MIN_SPEED, MAX_SPEED)
    }
}

/// Outcome of a replay, accumulated over all passes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub passes: u32,
    pub published: u64,
    pub skipped: u64,
    pub failed: u64,
    pub avg_drift: Duration,
    pub max_drift: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
struct DriftStats {
    total: Duration,
    max: Duration,
    samples: u64,
}

impl DriftStats {
    fn record(&mut self, lateness: Duration) {
        self.total += lateness;
        self.max = self.max.max(lateness);
        self.samples += 1;
    }

    fn average(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total.as_secs_f64() / self.samples as f64)
    }

    fn merge(&mut self, other: &DriftStats) {
        self.total += other.total;
        self.max = self.max.max(other.max);
        self.samples += other.samples;
    }
}

enum PassEnd {
    Completed { valid: u64 },
    Cancelled,
}

#[state]
#[derive(Debug, Clone)]
pub enum ReplayState {
    Pending,
    Streaming,
    Finished,
}

#[machine]
pub struct ReplaySession<S: ReplayState> {
    path: PathBuf,
    options: ReplayOptions,
    reader: Option<RecordingReader>,
    summary: ReplaySummary,
    drift: DriftStats,
}

impl<S: ReplayState> ReplaySession<S> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> ReplayOptions {
        self.options
    }
}

impl ReplaySession<Pending> {
    pub fn create(path: impl Into<PathBuf>, options: ReplayOptions) -> Self {
        Self::new(
            path.into(),
            options,
            None,
            ReplaySummary::default(),
            DriftStats::default(),
        )
    }

    /// Validates the options and opens the recording
    pub async fn open(mut self) -> Result<ReplaySession<Streaming>> {
        self.options.validate()?;
        let speed = self.options.effective_speed();
        if speed != self.options.speed {
            warn!(
                "Replay speed {} out of range, using {}",
                self.options.speed, speed
            );
            self.options.speed = speed;
        }

        self.reader = Some(RecordingReader::open(&self.path).await?);
        info!(
            "Replay of {} ready (speed {}, loop {})",
            self.path.display(),
            speed,
            self.options.loop_playback
        );
        Ok(self.transition())
    }
}

impl ReplaySession<Streaming> {
    /// Publishes the recording into `sink` until the end (or until cancelled)
    ///
    /// Malformed lines and transient publish failures are counted and skipped.
    /// A connection error ends the replay with that error.
    pub async fn run(
        mut self,
        sink: &dyn PublishSink,
        stats: &StreamStats,
        cancel: &CancellationToken,
    ) -> Result<ReplaySession<Finished>> {
        loop {
            let end = self.play_pass(sink, stats, cancel).await?;
            self.summary.passes += 1;

            let valid = match end {
                PassEnd::Cancelled => {
                    debug!("Replay cancelled during pass {}", self.summary.passes);
                    break;
                }
                PassEnd::Completed { valid } => valid,
            };
            if !self.options.loop_playback {
                break;
            }
            if valid == 0 {
                warn!(
                    "{} has no valid records, not looping",
                    self.path.display()
                );
                break;
            }
            self.reader = Some(RecordingReader::open(&self.path).await?);
        }

        self.summary.avg_drift = self.drift.average();
        self.summary.max_drift = self.drift.max;
        info!(
            "Replay of {} finished: {} published, {} skipped, {} failed over {} pass(es)",
            self.path.display(),
            self.summary.published,
            self.summary.skipped,
            self.summary.failed,
            self.summary.passes
        );
        Ok(self.transition())
    }

    async fn play_pass(
        &mut self,
        sink: &dyn PublishSink,
        stats: &StreamStats,
        cancel: &CancellationToken,
    ) -> Result<PassEnd> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(PassEnd::Completed { valid: 0 });
        };
        let speed = self.options.effective_speed();
        let mut drift = DriftStats::default();
        let mut previous: Option<DateTime<Utc>> = None;
        let mut schedule = Instant::now();
        let mut valid = 0u64;

        while let Some(record) = reader.next_record().await? {
            let envelope = match record {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Skipping record in {}: {}", self.path.display(), e);
                    self.summary.skipped += 1;
                    stats.inc_replay_skipped();
                    continue;
                }
            };
            valid += 1;

            match previous {
                None => schedule = Instant::now(),
                Some(prev) => {
                    // out of order timestamps play back to back
                    let gap = (envelope.timestamp() - prev)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    schedule += gap.div_f64(speed);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(PassEnd::Cancelled),
                        _ = sleep_until(schedule) => {}
                    }
                }
            }
            previous = Some(envelope.timestamp());
            drift.record(Instant::now().saturating_duration_since(schedule));

            let published = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PassEnd::Cancelled),
                result = sink.publish(
                    envelope.topic(),
                    envelope.payload().clone(),
                    envelope.qos(),
                    envelope.retain(),
                ) => result,
            };
            match published {
                Ok(()) => {
                    self.summary.published += 1;
                    stats.inc_replayed();
                }
                Err(e) if e.is_transient() => {
                    warn!("Replay publish to {} failed: {}", envelope.topic(), e);
                    self.summary.failed += 1;
                    stats.inc_replay_failed();
                }
                Err(e) => {
                    error!("Replay aborted on {}: {}", envelope.topic(), e);
                    return Err(e);
                }
            }
        }

        info!(
            "Replay pass {} of {}: {} records, drift avg {:?} max {:?}",
            self.summary.passes + 1,
            self.path.display(),
            valid,
            drift.average(),
            drift.max
        );
        self.drift.merge(&drift);
        Ok(PassEnd::Completed { valid })
    }
}

impl ReplaySession<Finished> {
    pub fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    pub fn into_summary(self) -> ReplaySummary {
        self.summary
    }
}

/// Plays a recording once into `sink` and waits for the end
pub async fn replay_once(
    path: impl Into<PathBuf>,
    options: ReplayOptions,
    sink: &dyn PublishSink,
    stats: &StreamStats,
) -> Result<ReplaySummary> {
    let options = ReplayOptions {
        loop_playback: false,
        ..options
    };
    let session = ReplaySession::create(path, options).open().await?;
    let finished = session
        .run(sink, stats, &CancellationToken::new())
        .await?;
    Ok(finished.into_summary())
}

/// Replay running in a background task
pub struct Replayer {
    cancel: CancellationToken,
    task: JoinHandle<Result<ReplaySummary>>,
}

impl Replayer {
    /// Opens the recording, then spawns the playback
    ///
    /// Reports `ReplayFinished` or `ReplayFailed` on `events` unless stopped
    /// through [`Replayer::stop`].
    pub async fn start(
        path: impl Into<PathBuf>,
        options: ReplayOptions,
        sink: Arc<dyn PublishSink>,
        stats: Arc<StreamStats>,
        events: Option<EventSender>,
    ) -> Result<Self> {
        let session = ReplaySession::create(path, options).open().await?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let result = session
                .run(sink.as_ref(), &stats, &token)
                .await
                .map(|finished| finished.into_summary());
            if !token.is_cancelled() {
                if let Some(events) = events {
                    let event = match &result {
                        Ok(summary) => ComponentEvent::ReplayFinished(summary.clone()),
                        Err(e) => ComponentEvent::ReplayFailed {
                            reason: e.to_string(),
                        },
                    };
                    let _ = events.send(event);
                }
            }
            result
        });

        Ok(Self { cancel, task })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels playback and returns what was replayed so far
    pub async fn stop(self, timeout: Duration) -> Result<ReplaySummary> {
        debug!("Stopping replayer");
        self.cancel.cancel();
        join_or_abort("replayer", self.task, timeout).await?
    }
}
