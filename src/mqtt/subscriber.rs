use crate::dispatch::DispatchQueue;
use crate::error::{Result, StreamError};
use crate::mqtt::backoff::Backoff;
use crate::mqtt::config::{validate_topic_filter, BrokerEndpoint, ClientRole};
use crate::mqtt::envelope::Envelope;
use crate::persistence::recorder::RecordSink;
use crate::shutdown::join_or_abort;
use crate::stats::StreamStats;
use crate::stream::events::{ComponentEvent, EventSender};
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Inbound broker connection feeding the dispatch queue
///
/// The network task only wraps packets into envelopes and offers them to the
/// queue (and to the active recording sink). It never runs handler code, so a
/// slow handler shows up as queue drops rather than as a stalled connection.
pub struct Subscriber {
    endpoint: BrokerEndpoint,
    filters: Vec<String>,
    qos: QoS,
    connect_timeout: Duration,
    queue: Arc<DispatchQueue>,
    stats: Arc<StreamStats>,
    recording: watch::Receiver<Option<RecordSink>>,
    events: Option<EventSender>,
    running: Option<RunningSession>,
}

struct RunningSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscriber {
    pub fn new(
        endpoint: BrokerEndpoint,
        filters: impl IntoIterator<Item = impl Into<String>>,
        queue: Arc<DispatchQueue>,
        stats: Arc<StreamStats>,
    ) -> Self {
        // nothing is ever recorded through a channel whose sender is gone
        let (_, recording) = watch::channel(None);
        Self {
            endpoint,
            filters: filters.into_iter().map(Into::into).collect(),
            qos: QoS::AtMostOnce,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue,
            stats,
            recording,
            events: None,
            running: None,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Every received envelope is also handed to the sink currently published here
    pub fn with_recording(mut self, recording: watch::Receiver<Option<RecordSink>>) -> Self {
        self.recording = recording;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    /// Connects and subscribes; returns after the first CONNACK
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            debug!("Subscriber already running");
            return Ok(());
        }
        // reap a session that ended on its own
        if let Some(stale) = self.running.take() {
            stale.cancel.cancel();
            let _ = stale.task.await;
        }

        self.endpoint.validate()?;
        if self.filters.is_empty() {
            return Err(StreamError::Configuration(
                "subscriber needs at least one topic filter".to_string(),
            ));
        }
        for filter in &self.filters {
            validate_topic_filter(filter)?;
        }

        info!(
            "Subscriber connecting to {}:{} for {:?}",
            self.endpoint.host, self.endpoint.port, self.filters
        );

        let capacity = (self.filters.len() * 2 + 2).max(10);
        let (client, eventloop) =
            AsyncClient::new(self.endpoint.mqtt_options(ClientRole::Subscriber), capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let session = SubscriberSession {
            client,
            eventloop,
            filters: self.filters.clone(),
            qos: self.qos,
            auto_reconnect: self.endpoint.auto_reconnect,
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            recording: self.recording.clone(),
            events: self.events.clone(),
            ready: Some(ready_tx),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run());

        let outcome = match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::Connection(
                "subscriber task exited before connecting".to_string(),
            )),
            Err(_) => Err(StreamError::Connection(format!(
                "no CONNACK from {}:{} within {:?}",
                self.endpoint.host, self.endpoint.port, self.connect_timeout
            ))),
        };

        if let Err(e) = outcome {
            error!("Subscriber failed to start: {}", e);
            cancel.cancel();
            let _ = join_or_abort("subscriber", task, DISCONNECT_GRACE * 2).await;
            return Err(e);
        }

        self.running = Some(RunningSession { cancel, task });
        Ok(())
    }

    /// Unsubscribes and disconnects; a no-op when not running
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(session) = self.running.take() else {
            return Ok(());
        };
        debug!("Stopping subscriber");
        session.cancel.cancel();
        join_or_abort("subscriber", session.task, timeout).await
    }
}

struct SubscriberSession {
    client: AsyncClient,
    eventloop: EventLoop,
    filters: Vec<String>,
    qos: QoS,
    auto_reconnect: bool,
    queue: Arc<DispatchQueue>,
    stats: Arc<StreamStats>,
    recording: watch::Receiver<Option<RecordSink>>,
    events: Option<EventSender>,
    ready: Option<oneshot::Sender<Result<()>>>,
    cancel: CancellationToken,
}

impl SubscriberSession {
    async fn run(mut self) {
        let mut connected = false;
        let mut retry_at: Option<Instant> = None;
        let mut backoff = Backoff::default();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    debug!("Subscriber reconnecting (attempt {})", backoff.attempts());
                    retry_at = None;
                }

                event = self.eventloop.poll(), if retry_at.is_none() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("Subscriber connected ({:?})", ack.code);
                        connected = true;
                        backoff.reset();
                        self.subscribe_all();
                        if let Some(ready) = self.ready.take() {
                            let _ = ready.send(Ok(()));
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        deliver(&publish, &self.queue, &self.stats, &self.recording);
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!("Subscriber SUBACK {}: {:?}", ack.pkid, ack.return_codes);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = e.to_string();
                        connected = false;

                        if !self.auto_reconnect {
                            if let Some(ready) = self.ready.take() {
                                let _ = ready.send(Err(StreamError::Connection(reason)));
                            } else {
                                error!("Subscriber connection lost: {}", reason);
                                if let Some(events) = &self.events {
                                    let _ = events.send(ComponentEvent::SubscriberFailed { reason });
                                }
                            }
                            break;
                        }

                        let delay = backoff.next_delay();
                        warn!("Subscriber connection error: {}, retrying in {:?}", reason, delay);
                        retry_at = Some(Instant::now() + delay);
                    }
                },
            }
        }

        if connected {
            self.disconnect().await;
        }
        info!("Subscriber stopped");
    }

    /// Subscriptions are repeated on every CONNACK since a clean session forgets them
    fn subscribe_all(&self) {
        for filter in &self.filters {
            match self.client.try_subscribe(filter.clone(), self.qos) {
                Ok(()) => debug!("Subscribing to {}", filter),
                Err(e) => warn!("Could not subscribe to {}: {}", filter, e),
            }
        }
    }

    async fn disconnect(&mut self) {
        for filter in &self.filters {
            if let Err(e) = self.client.try_unsubscribe(filter.clone()) {
                debug!("Unsubscribe from {} not queued: {}", filter, e);
            }
        }
        if self.client.try_disconnect().is_err() {
            return;
        }

        let eventloop = &mut self.eventloop;
        let drain = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, drain).await.is_err() {
            debug!("Subscriber disconnect not flushed within {:?}", DISCONNECT_GRACE);
        }
    }
}

fn deliver(
    publish: &Publish,
    queue: &DispatchQueue,
    stats: &StreamStats,
    recording: &watch::Receiver<Option<RecordSink>>,
) {
    let envelope = Envelope::from_publish(publish);
    trace!("Received {}", envelope);
    stats.inc_received();

    let sink = recording.borrow().clone();
    if let Some(sink) = sink {
        if !sink.record(envelope.clone()) {
            debug!("Message on {} not recorded", envelope.topic());
        }
    }

    if !queue.offer(envelope) {
        stats.inc_dropped();
    }
}
