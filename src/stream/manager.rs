//! Stream lifecycle coordinator
//!
//! # Component order
//!
//! ```text
//! start:  device publisher ─► recorder ─► worker pool ─► subscriber ─► publisher ─► replayer
//! stop:   replayer ─► publisher ─► subscriber ─► worker pool ─► recorder ─► device publisher
//! ```
//!
//! `start`, `stop`, `start_recording` and `stop_recording` run under one async
//! mutex, so at most one lifecycle transition is in flight. Background
//! components report through an event channel to a supervisor task, which
//! takes the same mutex before reacting.

use crate::dispatch::{DiscardHandler, DispatchQueue, MessageHandler, StopMode, WorkerPool};
use crate::error::{Result, StreamError};
use crate::mqtt::publisher::{PublishSink, PublisherConnection};
use crate::mqtt::subscriber::Subscriber;
use crate::persistence::recorder::{RecordSink, Recorder};
use crate::persistence::replayer::Replayer;
use crate::stats::{StatsSnapshot, StreamStats};
use crate::stream::config::{StreamConfig, StreamOptions};
use crate::stream::device::{self, DeviceAnalytics, PublisherId};
use crate::stream::events::{event_channel, ComponentEvent, EventReceiver, EventSender};
use crate::stream::state::StreamState;
use bytes::Bytes;
use rumqttc::QoS;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct StreamManager {
    config: StreamConfig,
    handler: Option<Arc<dyn MessageHandler>>,
    shared: Arc<Shared>,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<StreamState>,
    stats: Arc<StreamStats>,
    options: StreamOptions,
}

#[derive(Default)]
struct Lifecycle {
    /// Bumped on every start and teardown; events from older cycles are ignored
    generation: u64,
    components: Option<Components>,
    supervisor: Option<JoinHandle<()>>,
}

struct DeviceLease {
    device: Arc<dyn DeviceAnalytics>,
    id: PublisherId,
}

/// Everything started for one lifecycle cycle
struct Components {
    events: EventSender,
    device: Option<DeviceLease>,
    topic: Option<String>,
    recording_tx: watch::Sender<Option<RecordSink>>,
    recorder: Option<Recorder>,
    pool: Option<WorkerPool>,
    subscriber: Option<Subscriber>,
    publisher: Option<PublisherConnection>,
    replayer: Option<Replayer>,
}

impl StreamManager {
    pub fn new(config: StreamConfig, options: StreamOptions) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            config,
            handler: None,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle::default()),
                state,
                stats: Arc::new(StreamStats::default()),
                options,
            }),
        }
    }

    /// Runs `handler` on the worker pool for every live message
    pub fn with_handler(self, handler: impl MessageHandler) -> Self {
        self.with_shared_handler(Arc::new(handler))
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn options(&self) -> &StreamOptions {
        &self.shared.options
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Brings up every component the configuration needs
    ///
    /// On failure everything already started is torn down again in reverse
    /// order and the manager is left `Failed`.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        let current = self.state();
        if !current.can_start() {
            return Err(StreamError::InvalidTransition(format!(
                "cannot start a {} stream",
                current
            )));
        }

        info!("Starting {} stream", self.config.kind());
        self.shared.set_state(StreamState::Starting);
        lifecycle.generation += 1;

        if let Err(e) = self.validate().await {
            error!("Stream configuration rejected: {}", e);
            self.shared.set_state(StreamState::Failed);
            return Err(e);
        }

        let (events, event_rx) = event_channel();
        let mut components = Components::new(events);
        if let Err(e) = self.bring_up(&mut components).await {
            error!("Stream start failed, rolling back: {}", e);
            if let Err(cleanup) = components.teardown(&self.shared.options).await {
                warn!("Rollback incomplete: {}", cleanup);
            }
            self.shared.set_state(StreamState::Failed);
            return Err(e);
        }

        lifecycle.components = Some(components);
        lifecycle.supervisor = Some(tokio::spawn(supervise(
            self.shared.clone(),
            event_rx,
            lifecycle.generation,
        )));
        self.shared.set_state(StreamState::Running);
        Ok(())
    }

    /// Tears everything down; safe to call in any state and more than once
    ///
    /// Resources are always released. Tasks that had to be aborted or a
    /// failed device cleanup are reported afterwards as the error.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        if let Some(supervisor) = lifecycle.supervisor.take() {
            supervisor.abort();
        }

        let Some(components) = lifecycle.components.take() else {
            if self.state() == StreamState::Failed {
                self.shared.set_state(StreamState::Idle);
            }
            debug!("Stream not running, nothing to stop");
            return Ok(());
        };

        lifecycle.generation += 1;
        self.shared.set_state(StreamState::Stopping);
        let result = components.teardown(&self.shared.options).await;
        self.shared.set_state(StreamState::Idle);

        match &result {
            Ok(()) => info!("Stream stopped"),
            Err(e) => warn!("Stream stopped with errors: {}", e),
        }
        result
    }

    /// Starts recording live traffic on a running stream
    ///
    /// A no-op (logged) when a recording is already active.
    pub async fn start_recording(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut lifecycle = self.shared.lifecycle.lock().await;
        let state = self.state();
        let Some(components) = lifecycle
            .components
            .as_mut()
            .filter(|_| state == StreamState::Running)
        else {
            return Err(StreamError::InvalidTransition(format!(
                "cannot start recording on a {} stream",
                state
            )));
        };

        if components.subscriber.is_none() {
            return Err(StreamError::Configuration(
                "this stream has no live subscription to record".to_string(),
            ));
        }
        if let Some(recorder) = components.recorder.as_ref().filter(|r| r.is_active()) {
            info!(
                "Already recording to {}, ignoring request for {}",
                recorder.path().display(),
                path.display()
            );
            return Ok(());
        }
        if let StreamConfig::Simulation(simulation) = &self.config {
            if same_file(path, &simulation.recording_path).await {
                return Err(StreamError::Configuration(format!(
                    "cannot record into the replayed file {}",
                    path.display()
                )));
            }
        }

        // a recorder that died on a write error is still parked here
        if let Err(e) = components.stop_recorder(self.shared.options.stop_timeout).await {
            debug!("Previous recorder ended with: {}", e);
        }

        let recorder = Recorder::start(
            path,
            self.shared.stats.clone(),
            Some(components.events.clone()),
        )
        .await?;
        components.recording_tx.send_replace(Some(recorder.sink()));
        components.recorder = Some(recorder);
        Ok(())
    }

    /// Stops the active recording, returning how many records it wrote
    pub async fn stop_recording(&self) -> Result<Option<u64>> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        match lifecycle.components.as_mut() {
            Some(components) => {
                components
                    .stop_recorder(self.shared.options.stop_timeout)
                    .await
            }
            None => Ok(None),
        }
    }

    pub async fn is_recording(&self) -> bool {
        let lifecycle = self.shared.lifecycle.lock().await;
        lifecycle
            .components
            .as_ref()
            .and_then(|c| c.recorder.as_ref())
            .is_some_and(Recorder::is_active)
    }

    /// Topic the device publishes to while an analytics stream runs
    pub async fn active_topic(&self) -> Option<String> {
        let lifecycle = self.shared.lifecycle.lock().await;
        lifecycle.components.as_ref().and_then(|c| c.topic.clone())
    }

    /// Publishes through the stream's outbound connection (simulation streams)
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let publisher = {
            let lifecycle = self.shared.lifecycle.lock().await;
            lifecycle
                .components
                .as_ref()
                .and_then(|c| c.publisher.as_ref())
                .map(PublisherConnection::publisher)
        };
        let publisher = publisher.ok_or_else(|| {
            StreamError::Configuration("no outbound connection is active".to_string())
        })?;
        publisher.publish(topic, payload.into(), qos, retain).await
    }

    async fn validate(&self) -> Result<()> {
        self.shared.options.validate()?;
        self.config.validate()?;

        if let StreamConfig::Simulation(simulation) = &self.config {
            let path = &simulation.recording_path;
            let exists = tokio::fs::try_exists(path)
                .await
                .map_err(|e| StreamError::persistence(path, e))?;
            if !exists {
                return Err(StreamError::Configuration(format!(
                    "recording {} does not exist",
                    path.display()
                )));
            }
            if let Some(target) = &self.shared.options.record_to {
                if same_file(target, path).await {
                    return Err(StreamError::Configuration(format!(
                        "cannot record into the replayed file {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Filters of the live subscriber, `None` when the stream has no live side
    fn live_filters(&self, analytics_topic: Option<&str>) -> Option<Vec<String>> {
        match &self.config {
            StreamConfig::Raw(raw) => Some(raw.topics.iter().cloned().collect()),
            StreamConfig::Analytics(_) => analytics_topic.map(|topic| vec![topic.to_string()]),
            StreamConfig::Simulation(simulation) => {
                let observe = self.handler.is_some() || self.shared.options.record_to.is_some();
                observe.then(|| simulation.observe_topics.iter().cloned().collect())
            }
        }
    }

    async fn bring_up(&self, components: &mut Components) -> Result<()> {
        let options = &self.shared.options;
        let stats = &self.shared.stats;

        if let StreamConfig::Analytics(analytics) = &self.config {
            let topic = analytics.resolve_topic();
            let id = device::activate(
                analytics.device.as_ref(),
                &analytics.data_source_key,
                &topic,
            )
            .await?;
            components.device = Some(DeviceLease {
                device: analytics.device.clone(),
                id,
            });
            components.topic = Some(topic);
        }

        if let Some(path) = &options.record_to {
            let recorder =
                Recorder::start(path, stats.clone(), Some(components.events.clone())).await?;
            components.recording_tx.send_replace(Some(recorder.sink()));
            components.recorder = Some(recorder);
        }

        if let Some(filters) = self.live_filters(components.topic.as_deref()) {
            let queue = Arc::new(DispatchQueue::new(options.queue_capacity));
            let handler: Arc<dyn MessageHandler> = match &self.handler {
                Some(handler) => handler.clone(),
                None => Arc::new(DiscardHandler),
            };
            components.pool = Some(WorkerPool::start(
                options.worker_count,
                queue.clone(),
                handler,
                stats.clone(),
            ));

            let mut subscriber =
                Subscriber::new(self.config.broker().clone(), filters, queue, stats.clone())
                    .with_qos(options.subscribe_qos)
                    .with_connect_timeout(options.connect_timeout)
                    .with_recording(components.recording_tx.subscribe())
                    .with_events(components.events.clone());
            let started = subscriber.start().await;
            components.subscriber = Some(subscriber);
            started?;
        }

        if let StreamConfig::Simulation(simulation) = &self.config {
            let connection = PublisherConnection::connect(
                &simulation.broker,
                options.connect_timeout,
                options.ack_timeout,
            )
            .await?;
            let sink: Arc<dyn PublishSink> = Arc::new(connection.publisher());
            components.publisher = Some(connection);

            components.replayer = Some(
                Replayer::start(
                    &simulation.recording_path,
                    simulation.replay,
                    sink,
                    stats.clone(),
                    Some(components.events.clone()),
                )
                .await?,
            );
        }
        Ok(())
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        let state = self.state();
        if state.is_active() {
            warn!("StreamManager dropped while {}, call stop() first", state);
        }
    }
}

impl Shared {
    fn set_state(&self, next: StreamState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            warn!("Unexpected state change {} -> {}", previous, next);
        }
        info!("Stream state {} -> {}", previous, next);
    }

    /// Teardown triggered from the supervisor
    async fn wind_down(&self, lifecycle: &mut Lifecycle, target: StreamState) {
        // the calling supervisor must not abort itself
        drop(lifecycle.supervisor.take());
        lifecycle.generation += 1;
        let Some(components) = lifecycle.components.take() else {
            return;
        };

        if target == StreamState::Idle {
            self.set_state(StreamState::Stopping);
        }
        if let Err(e) = components.teardown(&self.options).await {
            warn!("Teardown finished with errors: {}", e);
        }
        self.set_state(target);
    }
}

async fn supervise(shared: Arc<Shared>, mut events: EventReceiver, generation: u64) {
    while let Some(event) = events.recv().await {
        let mut lifecycle = shared.lifecycle.lock().await;
        if lifecycle.generation != generation {
            debug!("Ignoring {:?} from a previous cycle", event);
            return;
        }

        match event {
            ComponentEvent::RecordingFailed { path, reason } => {
                warn!(
                    "Recording to {} failed ({}), continuing without recording",
                    path.display(),
                    reason
                );
                if let Some(components) = lifecycle.components.as_mut() {
                    if let Err(e) = components.stop_recorder(shared.options.stop_timeout).await {
                        debug!("Recorder ended with: {}", e);
                    }
                }
            }
            ComponentEvent::ReplayFinished(summary) => {
                info!(
                    "Replay finished: {} published, {} skipped, {} failed, drift avg {:?} max {:?}",
                    summary.published,
                    summary.skipped,
                    summary.failed,
                    summary.avg_drift,
                    summary.max_drift
                );
                shared.wind_down(&mut lifecycle, StreamState::Idle).await;
                return;
            }
            ComponentEvent::ReplayFailed { reason } => {
                error!("Replay failed: {}", reason);
                shared.wind_down(&mut lifecycle, StreamState::Failed).await;
                return;
            }
            ComponentEvent::SubscriberFailed { reason } => {
                error!("Subscriber failed: {}", reason);
                shared.wind_down(&mut lifecycle, StreamState::Failed).await;
                return;
            }
        }
    }
}

impl Components {
    fn new(events: EventSender) -> Self {
        let (recording_tx, _) = watch::channel(None);
        Self {
            events,
            device: None,
            topic: None,
            recording_tx,
            recorder: None,
            pool: None,
            subscriber: None,
            publisher: None,
            replayer: None,
        }
    }

    async fn stop_recorder(&mut self, timeout: Duration) -> Result<Option<u64>> {
        self.recording_tx.send_replace(None);
        match self.recorder.take() {
            Some(recorder) => recorder.stop(timeout).await.map(Some),
            None => Ok(None),
        }
    }

    /// Stops everything in reverse start order, continuing past failures
    async fn teardown(mut self, options: &StreamOptions) -> Result<()> {
        let timeout = options.stop_timeout;
        let mut report = TeardownReport::default();

        if let Some(replayer) = self.replayer.take() {
            match replayer.stop(timeout).await {
                Ok(summary) => debug!("Replayer stopped after {} publishes", summary.published),
                Err(e) => report.add(e),
            }
        }
        if let Some(publisher) = self.publisher.take() {
            report.check(publisher.stop(timeout).await);
        }
        if let Some(mut subscriber) = self.subscriber.take() {
            report.check(subscriber.stop(timeout).await);
        }
        if let Some(pool) = self.pool.take() {
            report.check(pool.stop(StopMode::from_drain(options.drain_on_stop), timeout).await);
        }
        report.check(self.stop_recorder(timeout).await);

        if let Some(lease) = self.device.take() {
            match lease.device.remove_publisher(&lease.id).await {
                Ok(()) => info!("Device publisher {} removed", lease.id),
                Err(e) => report.add(StreamError::Device(format!(
                    "could not remove device publisher {}: {}",
                    lease.id, e
                ))),
            }
        }
        report.finish()
    }
}

#[derive(Default)]
struct TeardownReport {
    forced: Vec<String>,
    first: Option<StreamError>,
}

impl TeardownReport {
    fn add(&mut self, error: StreamError) {
        warn!("Teardown: {}", error);
        match error {
            StreamError::ForcedShutdown { components } => self.forced.extend(components),
            other => {
                self.first.get_or_insert(other);
            }
        }
    }

    fn check<T>(&mut self, result: Result<T>) {
        if let Err(e) = result {
            self.add(e);
        }
    }

    fn finish(self) -> Result<()> {
        if !self.forced.is_empty() {
            return Err(StreamError::ForcedShutdown {
                components: self.forced,
            });
        }
        match self.first {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (
        tokio::fs::canonicalize(a).await,
        tokio::fs::canonicalize(b).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::BrokerEndpoint;
    use crate::stream::config::{RawConfig, SimulationConfig};

    fn unreachable_broker() -> BrokerEndpoint {
        let mut endpoint = BrokerEndpoint::new("127.0.0.1", 1);
        endpoint.auto_reconnect = false;
        endpoint
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_never_started() {
        let manager = StreamManager::new(
            StreamConfig::Raw(RawConfig::new(unreachable_broker(), ["#"])),
            StreamOptions::default(),
        );
        assert!(manager.stop().await.is_ok());
        assert!(manager.stop().await.is_ok());
        assert_eq!(manager.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn invalid_configuration_fails_before_connecting() {
        let manager = StreamManager::new(
            StreamConfig::Raw(RawConfig::new(unreachable_broker(), Vec::<String>::new())),
            StreamOptions::default(),
        );
        assert!(matches!(
            manager.start().await,
            Err(StreamError::Configuration(_))
        ));
        assert_eq!(manager.state(), StreamState::Failed);
        assert!(manager.stop().await.is_ok());
        assert_eq!(manager.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn simulation_requires_existing_recording() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StreamManager::new(
            StreamConfig::Simulation(SimulationConfig::new(
                dir.path().join("missing.jsonl"),
                unreachable_broker(),
            )),
            StreamOptions::default(),
        );
        assert!(matches!(
            manager.start().await,
            Err(StreamError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn simulation_cannot_record_into_its_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("trace.jsonl");
        std::fs::write(&source, "").unwrap();

        let options = StreamOptions {
            record_to: Some(source.clone()),
            ..StreamOptions::default()
        };
        let manager = StreamManager::new(
            StreamConfig::Simulation(SimulationConfig::new(&source, unreachable_broker())),
            options,
        );
        assert!(matches!(
            manager.start().await,
            Err(StreamError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_rolls_back_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let options = StreamOptions {
            record_to: Some(dir.path().join("live.jsonl")),
            connect_timeout: Duration::from_secs(5),
            ..StreamOptions::default()
        };
        let manager = StreamManager::new(
            StreamConfig::Raw(RawConfig::new(unreachable_broker(), ["sensors/#"])),
            options,
        );
        let mut states = manager.subscribe_state();

        assert!(matches!(
            manager.start().await,
            Err(StreamError::Connection(_))
        ));
        assert_eq!(*states.borrow_and_update(), StreamState::Failed);
        assert!(!manager.is_recording().await);
        assert!(manager.stop().await.is_ok());
    }

    #[tokio::test]
    async fn runtime_operations_need_a_running_stream() {
        let manager = StreamManager::new(
            StreamConfig::Raw(RawConfig::new(unreachable_broker(), ["#"])),
            StreamOptions::default(),
        );
        assert!(matches!(
            manager.start_recording("/tmp/never.jsonl").await,
            Err(StreamError::InvalidTransition(_))
        ));
        assert_eq!(manager.stop_recording().await.unwrap(), None);
        assert!(matches!(
            manager.publish("a/b", "x", QoS::AtMostOnce, false).await,
            Err(StreamError::Configuration(_))
        ));
        assert_eq!(manager.active_topic().await, None);
    }
}
