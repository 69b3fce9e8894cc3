//! Outbound broker connection
//!
//! A [`PublisherConnection`] owns the rumqttc event loop in a background task.
//! Callers talk to it through cloneable [`Publisher`] handles; each publish is
//! answered once the broker acknowledged it for the requested QoS:
//!
//! | QoS | resolved on |
//! |-----|-------------|
//! | 0   | packet written to the socket |
//! | 1   | PUBACK |
//! | 2   | PUBCOMP |
//!
//! Publishes are serialized: the task keeps at most one acknowledgment in
//! flight, which keeps replayed messages in recording order. A publish that
//! timed out before rumqttc wrote it still owes an outgoing event; that event
//! is skipped rather than credited to the next request.

use crate::error::{Result, StreamError};
use crate::mqtt::backoff::Backoff;
use crate::mqtt::config::{validate_topic_name, BrokerEndpoint, ClientRole};
use crate::shutdown::join_or_abort;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const CLIENT_CAPACITY: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Anything a recording can be replayed into
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()>;
}

struct PublishRequest {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    reply: oneshot::Sender<Result<()>>,
}

struct PendingAck {
    topic: String,
    qos: QoS,
    pkid: Option<u16>,
    deadline: Instant,
    reply: oneshot::Sender<Result<()>>,
}

impl PendingAck {
    fn resolve(self, result: Result<()>) {
        // the caller may already have given up
        let _ = self.reply.send(result);
    }
}

/// Matches rumqttc's outgoing and ack events to the request in flight
#[derive(Default)]
struct AckTracker {
    pending: Option<PendingAck>,
    /// Outgoing publishes still expected for requests that were abandoned
    owed_writes: usize,
}

impl AckTracker {
    fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    fn track(&mut self, ack: PendingAck) {
        self.pending = Some(ack);
    }

    /// Gives up on the request in flight
    fn expire(&mut self, timeout: Duration) {
        let Some(ack) = self.pending.take() else {
            return;
        };
        warn!("Publish to '{}' not acknowledged within {:?}", ack.topic, timeout);
        if ack.pkid.is_none() {
            self.owed_writes += 1;
        }
        let topic = ack.topic.clone();
        ack.resolve(Err(StreamError::PublishTimeout {
            topic,
            timeout_ms: millis(timeout),
        }));
    }

    fn on_outgoing_publish(&mut self, pkid: u16) {
        if self.owed_writes > 0 {
            self.owed_writes -= 1;
            debug!("Late write of abandoned publish (pkid {})", pkid);
            return;
        }
        let Some(ack) = self.pending.as_mut() else {
            return;
        };
        if ack.pkid.is_some() {
            return;
        }
        ack.pkid = Some(pkid);
        if ack.qos == QoS::AtMostOnce {
            self.resolve(Ok(()));
        }
    }

    fn on_ack(&mut self, qos: QoS, pkid: u16) {
        let matches = self
            .pending
            .as_ref()
            .is_some_and(|ack| ack.qos == qos && ack.pkid == Some(pkid));
        if matches {
            self.resolve(Ok(()));
        }
    }

    /// The connection is gone; nothing owed from it will be written any more
    fn fail(&mut self, reason: &str) {
        self.owed_writes = 0;
        self.resolve(Err(StreamError::Connection(reason.to_string())));
    }

    fn resolve(&mut self, result: Result<()>) {
        if let Some(ack) = self.pending.take() {
            ack.resolve(result);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Handle used to publish through a running [`PublisherConnection`]
#[derive(Debug, Clone)]
pub struct Publisher {
    requests: mpsc::Sender<PublishRequest>,
    ack_timeout: Duration,
}

impl Publisher {
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// False once the network task has exited
    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }
}

#[async_trait]
impl PublishSink for Publisher {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        validate_topic_name(topic)?;

        let (reply, answer) = oneshot::channel();
        let request = PublishRequest {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            reply,
        };

        let exchange = async {
            self.requests
                .send(request)
                .await
                .map_err(|_| StreamError::Connection("publisher is not running".to_string()))?;
            answer.await.map_err(|_| {
                StreamError::Connection("publisher stopped before acknowledging".to_string())
            })?
        };

        match tokio::time::timeout(self.ack_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::PublishTimeout {
                topic: topic.to_string(),
                timeout_ms: millis(self.ack_timeout),
            }),
        }
    }
}

/// Owner of the outbound connection task
pub struct PublisherConnection {
    publisher: Publisher,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PublisherConnection {
    /// Connects and returns once the broker accepted the session
    pub async fn connect(
        endpoint: &BrokerEndpoint,
        connect_timeout: Duration,
        ack_timeout: Duration,
    ) -> Result<Self> {
        endpoint.validate()?;
        info!(
            "Publisher connecting to {}:{}",
            endpoint.host, endpoint.port
        );

        let (client, eventloop) =
            AsyncClient::new(endpoint.mqtt_options(ClientRole::Publisher), CLIENT_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let session = PublisherSession {
            client,
            eventloop,
            requests: requests_rx,
            ready: Some(ready_tx),
            auto_reconnect: endpoint.auto_reconnect,
            ack_timeout,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run());

        let outcome = match tokio::time::timeout(connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::Connection(
                "publisher task exited before connecting".to_string(),
            )),
            Err(_) => Err(StreamError::Connection(format!(
                "no CONNACK from {}:{} within {:?}",
                endpoint.host, endpoint.port, connect_timeout
            ))),
        };

        if let Err(e) = outcome {
            error!("Publisher connection failed: {}", e);
            cancel.cancel();
            let _ = join_or_abort("publisher", task, DISCONNECT_GRACE * 2).await;
            return Err(e);
        }

        info!("Publisher connected");
        Ok(Self {
            publisher: Publisher {
                requests: requests_tx,
                ack_timeout,
            },
            cancel,
            task,
        })
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Disconnects gracefully; pending publishes fail with a connection error
    pub async fn stop(self, timeout: Duration) -> Result<()> {
        debug!("Stopping publisher");
        self.cancel.cancel();
        join_or_abort("publisher", self.task, timeout).await
    }
}

struct PublisherSession {
    client: AsyncClient,
    eventloop: EventLoop,
    requests: mpsc::Receiver<PublishRequest>,
    ready: Option<oneshot::Sender<Result<()>>>,
    auto_reconnect: bool,
    ack_timeout: Duration,
    cancel: CancellationToken,
}

impl PublisherSession {
    async fn run(mut self) {
        let mut acks = AckTracker::default();
        let mut connected = false;
        let mut retry_at: Option<Instant> = None;
        let mut backoff = Backoff::default();

        loop {
            let deadline = acks.deadline();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    acks.expire(self.ack_timeout);
                }

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    debug!("Publisher reconnecting (attempt {})", backoff.attempts());
                    retry_at = None;
                }

                request = self.requests.recv(), if acks.is_idle() => {
                    let Some(request) = request else { break };
                    if request.reply.is_closed() {
                        continue;
                    }
                    if !connected {
                        let _ = request.reply.send(Err(StreamError::Connection(
                            "publisher is not connected to the broker".to_string(),
                        )));
                        continue;
                    }
                    if let Some(ack) = self.submit(request) {
                        acks.track(ack);
                    }
                }

                event = self.eventloop.poll(), if retry_at.is_none() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        debug!("Publisher CONNACK: {:?}", ack.code);
                        connected = true;
                        backoff.reset();
                        if let Some(ready) = self.ready.take() {
                            let _ = ready.send(Ok(()));
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.on_outgoing_publish(pkid),
                    Ok(Event::Incoming(Packet::PubAck(puback))) => {
                        acks.on_ack(QoS::AtLeastOnce, puback.pkid);
                    }
                    Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                        acks.on_ack(QoS::ExactlyOnce, pubcomp.pkid);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = e.to_string();
                        connected = false;
                        acks.fail(&reason);

                        if !self.auto_reconnect {
                            error!("Publisher connection lost: {}", reason);
                            if let Some(ready) = self.ready.take() {
                                let _ = ready.send(Err(StreamError::Connection(reason)));
                            }
                            break;
                        }

                        let delay = backoff.next_delay();
                        warn!("Publisher connection error: {}, retrying in {:?}", reason, delay);
                        retry_at = Some(Instant::now() + delay);
                    }
                },
            }
        }

        acks.fail("publisher stopped");
        self.shutdown(connected).await;
    }

    fn submit(&self, request: PublishRequest) -> Option<PendingAck> {
        let PublishRequest {
            topic,
            payload,
            qos,
            retain,
            reply,
        } = request;

        match self
            .client
            .try_publish(topic.clone(), qos, retain, payload.to_vec())
        {
            Ok(()) => Some(PendingAck {
                topic,
                qos,
                pkid: None,
                deadline: Instant::now() + self.ack_timeout,
                reply,
            }),
            Err(e) => {
                let _ = reply.send(Err(StreamError::from(e)));
                None
            }
        }
    }

    async fn shutdown(mut self, connected: bool) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.reply.send(Err(StreamError::Connection(
                "publisher stopped".to_string(),
            )));
        }

        if connected && self.client.try_disconnect().is_ok() {
            let drain = async {
                loop {
                    match self.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_GRACE, drain).await.is_err() {
                debug!("Publisher disconnect not flushed within {:?}", DISCONNECT_GRACE);
            }
        }
        info!("Publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_fails_fast_without_reconnect() {
        let mut endpoint = BrokerEndpoint::new("127.0.0.1", 1);
        endpoint.auto_reconnect = false;

        let result = PublisherConnection::connect(
            &endpoint,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(StreamError::Connection(_))));
    }

    #[tokio::test]
    async fn reconnecting_publisher_gives_up_after_connect_timeout() {
        let endpoint = BrokerEndpoint::new("127.0.0.1", 1);
        let started = std::time::Instant::now();

        let result = PublisherConnection::connect(
            &endpoint,
            Duration::from_millis(300),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(StreamError::Connection(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn stopped_publisher_rejects_publishes() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let publisher = Publisher {
            requests: tx,
            ack_timeout: Duration::from_millis(200),
        };
        assert!(!publisher.is_running());
        let result = publisher
            .publish("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .await;
        assert!(matches!(result, Err(StreamError::Connection(_))));
    }

    #[tokio::test]
    async fn wildcard_topics_are_rejected_before_sending() {
        let (tx, _rx) = mpsc::channel(1);
        let publisher = Publisher {
            requests: tx,
            ack_timeout: Duration::from_millis(200),
        };
        let result = publisher
            .publish("a/#", Bytes::new(), QoS::AtMostOnce, false)
            .await;
        assert!(matches!(result, Err(StreamError::Configuration(_))));
    }

    #[tokio::test]
    async fn unanswered_publish_times_out() {
        let (tx, mut rx) = mpsc::channel(1);
        let publisher = Publisher {
            requests: tx,
            ack_timeout: Duration::from_millis(100),
        };
        // hold requests without ever answering
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(request) = rx.recv().await {
                held.push(request);
            }
        });
        let result = publisher
            .publish("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(StreamError::PublishTimeout { .. })));
        assert!(result.unwrap_err().is_transient());
        holder.abort();
    }

    fn pending(qos: QoS) -> (PendingAck, oneshot::Receiver<Result<()>>) {
        let (reply, answer) = oneshot::channel();
        let ack = PendingAck {
            topic: "replay/t".to_string(),
            qos,
            pkid: None,
            deadline: Instant::now() + Duration::from_secs(1),
            reply,
        };
        (ack, answer)
    }

    #[tokio::test]
    async fn late_write_of_expired_publish_is_not_credited_to_the_next() {
        let mut acks = AckTracker::default();
        let (first, mut first_answer) = pending(QoS::AtLeastOnce);
        acks.track(first);
        acks.expire(Duration::from_millis(100));
        assert!(matches!(
            first_answer.try_recv(),
            Ok(Err(StreamError::PublishTimeout { .. }))
        ));

        let (second, mut second_answer) = pending(QoS::AtLeastOnce);
        acks.track(second);
        // the expired publish is written only now, then acknowledged
        acks.on_outgoing_publish(1);
        acks.on_ack(QoS::AtLeastOnce, 1);
        assert!(second_answer.try_recv().is_err());
        assert!(!acks.is_idle());

        acks.on_outgoing_publish(2);
        acks.on_ack(QoS::AtLeastOnce, 2);
        assert!(matches!(second_answer.try_recv(), Ok(Ok(()))));
        assert!(acks.is_idle());
    }

    #[tokio::test]
    async fn qos0_publish_waits_for_its_own_write() {
        let mut acks = AckTracker::default();
        let (first, _first_answer) = pending(QoS::AtMostOnce);
        acks.track(first);
        acks.expire(Duration::from_millis(100));

        let (second, mut second_answer) = pending(QoS::AtMostOnce);
        acks.track(second);
        acks.on_outgoing_publish(0);
        assert!(second_answer.try_recv().is_err());
        acks.on_outgoing_publish(0);
        assert!(matches!(second_answer.try_recv(), Ok(Ok(()))));
    }

    #[tokio::test]
    async fn connection_loss_fails_the_request_and_forgets_owed_writes() {
        let mut acks = AckTracker::default();
        let (first, _first_answer) = pending(QoS::AtLeastOnce);
        acks.track(first);
        acks.expire(Duration::from_millis(100));

        let (second, mut second_answer) = pending(QoS::AtLeastOnce);
        acks.track(second);
        acks.fail("connection reset");
        assert!(matches!(
            second_answer.try_recv(),
            Ok(Err(StreamError::Connection(_)))
        ));

        let (third, mut third_answer) = pending(QoS::AtLeastOnce);
        acks.track(third);
        acks.on_outgoing_publish(7);
        acks.on_ack(QoS::AtLeastOnce, 7);
        assert!(matches!(third_answer.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn oversized_timeouts_saturate() {
        assert_eq!(millis(Duration::MAX), u64::MAX);
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
    }
}
