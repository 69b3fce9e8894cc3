use crate::dispatch::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};
use crate::error::{Result, StreamError};
use crate::mqtt::config::{validate_topic_filter, validate_topic_name, BrokerEndpoint};
use crate::persistence::replayer::ReplayOptions;
use crate::stream::device::DeviceAnalytics;
use rumqttc::QoS;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Prefix of the topic generated when an analytics stream has none configured
pub const TEMP_TOPIC_PREFIX: &str = "mqttstream/temp";

/// Device analytics published to the broker and consumed live
#[derive(Clone)]
pub struct AnalyticsConfig {
    pub broker: BrokerEndpoint,
    pub device: Arc<dyn DeviceAnalytics>,
    pub data_source_key: String,
    pub topic: Option<String>,
}

impl AnalyticsConfig {
    pub fn new(
        broker: BrokerEndpoint,
        device: Arc<dyn DeviceAnalytics>,
        data_source_key: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            device,
            data_source_key: data_source_key.into(),
            topic: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Configured topic, or a fresh temporary one
    pub fn resolve_topic(&self) -> String {
        self.topic.clone().unwrap_or_else(|| {
            format!("{}/{}", TEMP_TOPIC_PREFIX, uuid::Uuid::new_v4().simple())
        })
    }
}

impl fmt::Debug for AnalyticsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyticsConfig")
            .field("broker", &self.broker)
            .field("data_source_key", &self.data_source_key)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Plain subscription to a set of topic filters
#[derive(Clone, Debug)]
pub struct RawConfig {
    pub broker: BrokerEndpoint,
    pub topics: BTreeSet<String>,
}

impl RawConfig {
    pub fn new(broker: BrokerEndpoint, topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            broker,
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }
}

/// Replay of a recording, optionally observing the replayed traffic
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub recording_path: PathBuf,
    pub broker: BrokerEndpoint,
    /// Filters of the observing subscriber
    pub observe_topics: BTreeSet<String>,
    pub replay: ReplayOptions,
}

impl SimulationConfig {
    pub fn new(recording_path: impl Into<PathBuf>, broker: BrokerEndpoint) -> Self {
        Self {
            recording_path: recording_path.into(),
            broker,
            observe_topics: BTreeSet::from(["#".to_string()]),
            replay: ReplayOptions::default(),
        }
    }

    pub fn with_replay(mut self, replay: ReplayOptions) -> Self {
        self.replay = replay;
        self
    }
}

/// What a [`StreamManager`](super::StreamManager) runs; one variant per mode
#[derive(Clone, Debug)]
pub enum StreamConfig {
    Analytics(AnalyticsConfig),
    Raw(RawConfig),
    Simulation(SimulationConfig),
}

impl StreamConfig {
    pub fn broker(&self) -> &BrokerEndpoint {
        match self {
            StreamConfig::Analytics(c) => &c.broker,
            StreamConfig::Raw(c) => &c.broker,
            StreamConfig::Simulation(c) => &c.broker,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamConfig::Analytics(_) => "analytics",
            StreamConfig::Raw(_) => "raw",
            StreamConfig::Simulation(_) => "simulation",
        }
    }

    /// Checks everything that can be checked without I/O
    pub fn validate(&self) -> Result<()> {
        self.broker().validate()?;
        match self {
            StreamConfig::Analytics(c) => {
                if c.data_source_key.trim().is_empty() {
                    return Err(StreamError::Configuration(
                        "analytics stream needs a data source key".to_string(),
                    ));
                }
                if c.broker.is_loopback() {
                    return Err(StreamError::Configuration(format!(
                        "broker host '{}' is a loopback address the device cannot reach",
                        c.broker.host
                    )));
                }
                if let Some(topic) = &c.topic {
                    validate_topic_name(topic)?;
                }
            }
            StreamConfig::Raw(c) => {
                if c.topics.is_empty() {
                    return Err(StreamError::Configuration(
                        "raw stream needs at least one topic".to_string(),
                    ));
                }
                for topic in &c.topics {
                    validate_topic_filter(topic)?;
                }
            }
            StreamConfig::Simulation(c) => {
                if c.recording_path.as_os_str().is_empty() {
                    return Err(StreamError::Configuration(
                        "simulation needs a recording path".to_string(),
                    ));
                }
                c.replay.validate()?;
                for topic in &c.observe_topics {
                    validate_topic_filter(topic)?;
                }
            }
        }
        Ok(())
    }
}

/// Tuning shared by every mode
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Let workers empty the queue on stop instead of discarding it
    pub drain_on_stop: bool,
    pub stop_timeout: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub subscribe_qos: QoS,
    /// Record every received message from the start of the stream
    pub record_to: Option<PathBuf>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_count: DEFAULT_WORKER_COUNT,
            drain_on_stop: true,
            stop_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            subscribe_qos: QoS::AtMostOnce,
            record_to: None,
        }
    }
}

impl StreamOptions {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(StreamError::Configuration(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(StreamError::Configuration(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.stop_timeout.is_zero() || self.connect_timeout.is_zero() || self.ack_timeout.is_zero() {
            return Err(StreamError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
