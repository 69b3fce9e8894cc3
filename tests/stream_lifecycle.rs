use async_trait::async_trait;
use mqttstream::stream::config::TEMP_TOPIC_PREFIX;
use mqttstream::{
    AnalyticsConfig, BrokerEndpoint, DataSource, DeviceAnalytics, PublisherId, RawConfig, Result,
    SimulationConfig, StreamConfig, StreamError, StreamManager, StreamOptions, StreamState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Default)]
struct FakeDevice {
    sources: Vec<DataSource>,
    refuse_create: bool,
    enumerations: AtomicUsize,
    created: Mutex<Vec<(String, String, u8, bool)>>,
    removed: Mutex<Vec<PublisherId>>,
}

impl FakeDevice {
    fn offering(key: &str) -> Self {
        Self {
            sources: vec![DataSource {
                key: key.to_string(),
                name: "Object analytics".to_string(),
                format: "json".to_string(),
            }],
            ..Self::default()
        }
    }

    fn created(&self) -> Vec<(String, String, u8, bool)> {
        self.created.lock().unwrap().clone()
    }

    fn removed(&self) -> Vec<PublisherId> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceAnalytics for FakeDevice {
    async fn enumerate_data_sources(&self) -> Result<Vec<DataSource>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self.sources.clone())
    }

    async fn create_publisher(
        &self,
        data_source_key: &str,
        topic: &str,
        qos: u8,
        retain: bool,
    ) -> Result<PublisherId> {
        if self.refuse_create {
            return Err(StreamError::Device("publisher limit reached".to_string()));
        }
        let mut created = self.created.lock().unwrap();
        created.push((data_source_key.to_string(), topic.to_string(), qos, retain));
        Ok(PublisherId(format!("pub-{}", created.len())))
    }

    async fn remove_publisher(&self, id: &PublisherId) -> Result<()> {
        self.removed.lock().unwrap().push(id.clone());
        Ok(())
    }
}

/// Non-loopback address that never answers (TEST-NET-1)
fn unreachable_broker() -> BrokerEndpoint {
    let mut endpoint = BrokerEndpoint::new("192.0.2.1", 1883);
    endpoint.auto_reconnect = false;
    endpoint
}

fn quick_options() -> StreamOptions {
    StreamOptions {
        connect_timeout: Duration::from_millis(300),
        stop_timeout: Duration::from_secs(2),
        ..StreamOptions::default()
    }
}

#[tokio::test]
async fn stopping_a_never_started_manager_twice_is_fine() {
    let device = Arc::new(FakeDevice::offering("analytics"));
    let manager = StreamManager::new(
        StreamConfig::Analytics(AnalyticsConfig::new(
            unreachable_broker(),
            device.clone(),
            "analytics",
        )),
        quick_options(),
    );

    assert!(manager.stop().await.is_ok());
    assert!(manager.stop().await.is_ok());
    assert_eq!(manager.state(), StreamState::Idle);
    assert_eq!(device.enumerations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refused_device_publisher_fails_without_connecting() {
    let device = Arc::new(FakeDevice {
        refuse_create: true,
        ..FakeDevice::offering("analytics")
    });
    let manager = StreamManager::new(
        StreamConfig::Analytics(AnalyticsConfig::new(
            unreachable_broker(),
            device.clone(),
            "analytics",
        )),
        quick_options(),
    );

    let started = Instant::now();
    let result = manager.start().await;
    assert!(matches!(result, Err(StreamError::Device(_))));
    assert_eq!(manager.state(), StreamState::Failed);
    // a subscriber attempt would have run into the connect timeout
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(device.created().is_empty());
    assert!(device.removed().is_empty());
    assert_eq!(manager.stats().received, 0);
}

#[tokio::test]
async fn unknown_data_source_is_rejected() {
    let device = Arc::new(FakeDevice::offering("analytics"));
    let manager = StreamManager::new(
        StreamConfig::Analytics(AnalyticsConfig::new(
            unreachable_broker(),
            device.clone(),
            "thermal",
        )),
        quick_options(),
    );

    assert!(matches!(manager.start().await, Err(StreamError::Device(_))));
    assert_eq!(device.enumerations.load(Ordering::SeqCst), 1);
    assert!(device.created().is_empty());
}

#[tokio::test]
async fn connection_failure_removes_the_device_publisher() {
    let device = Arc::new(FakeDevice::offering("analytics"));
    let manager = StreamManager::new(
        StreamConfig::Analytics(AnalyticsConfig::new(
            unreachable_broker(),
            device.clone(),
            "analytics",
        )),
        quick_options(),
    );

    assert!(matches!(
        manager.start().await,
        Err(StreamError::Connection(_))
    ));
    assert_eq!(manager.state(), StreamState::Failed);

    let created = device.created();
    assert_eq!(created.len(), 1);
    let (key, topic, qos, retain) = &created[0];
    assert_eq!(key, "analytics");
    assert!(topic.starts_with(TEMP_TOPIC_PREFIX));
    assert_eq!((*qos, *retain), (0, false));
    assert_eq!(device.removed(), vec![PublisherId("pub-1".to_string())]);

    // the failed manager can be reset and started again
    assert!(manager.stop().await.is_ok());
    assert_eq!(manager.state(), StreamState::Idle);
}

#[tokio::test]
async fn configured_topic_is_used_verbatim() {
    let device = Arc::new(FakeDevice::offering("analytics"));
    let manager = StreamManager::new(
        StreamConfig::Analytics(
            AnalyticsConfig::new(unreachable_broker(), device.clone(), "analytics")
                .with_topic("site/cam1/analytics"),
        ),
        quick_options(),
    );

    assert!(manager.start().await.is_err());
    assert_eq!(device.created()[0].1, "site/cam1/analytics");
}

#[tokio::test]
async fn loopback_broker_is_rejected_for_analytics() {
    let device = Arc::new(FakeDevice::offering("analytics"));
    let manager = StreamManager::new(
        StreamConfig::Analytics(AnalyticsConfig::new(
            BrokerEndpoint::new("localhost", 1883),
            device.clone(),
            "analytics",
        )),
        quick_options(),
    );

    assert!(matches!(
        manager.start().await,
        Err(StreamError::Configuration(_))
    ));
    assert_eq!(device.enumerations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn simulation_rolls_back_recorder_when_broker_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("trace.jsonl");
    std::fs::write(
        &source,
        r#"{"timestamp":"2024-05-01T12:00:00Z","topic":"t","payload":"x"}"#,
    )
    .unwrap();

    let mut broker = BrokerEndpoint::new("127.0.0.1", 1);
    broker.auto_reconnect = false;
    let options = StreamOptions {
        record_to: Some(dir.path().join("observed.jsonl")),
        ..quick_options()
    };
    let manager = StreamManager::new(
        StreamConfig::Simulation(SimulationConfig::new(&source, broker)),
        options,
    );

    assert!(matches!(
        manager.start().await,
        Err(StreamError::Connection(_))
    ));
    assert_eq!(manager.state(), StreamState::Failed);
    assert!(!manager.is_recording().await);
    assert!(manager.stop().await.is_ok());
}

/// Accepts one client, answers its CONNECT and hangs up after the SUBSCRIBE
async fn broker_that_hangs_up() -> (BrokerEndpoint, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 512];
        let _ = socket.read(&mut buf).await.unwrap();
        // CONNACK, session accepted
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        let _ = socket.read(&mut buf).await;
    });

    let mut broker = BrokerEndpoint::new("127.0.0.1", port);
    broker.auto_reconnect = false;
    (broker, server)
}

#[tokio::test]
async fn lost_subscriber_connection_fails_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, server) = broker_that_hangs_up().await;
    let options = StreamOptions {
        record_to: Some(dir.path().join("live.jsonl")),
        ..quick_options()
    };
    let manager = StreamManager::new(
        StreamConfig::Raw(RawConfig::new(broker, ["site/#"])),
        options,
    );
    let mut states = manager.subscribe_state();

    manager.start().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == StreamState::Failed),
    )
    .await
    .expect("stream never failed")
    .unwrap();
    server.await.unwrap();

    assert_eq!(manager.state(), StreamState::Failed);
    assert!(!manager.is_recording().await);
    assert!(manager.active_topic().await.is_none());
    // everything was released by the supervisor, stop only resets the state
    assert!(manager.stop().await.is_ok());
    assert_eq!(manager.state(), StreamState::Idle);
}
