//! Configuration file of the `mqttstream` binary
//!
//! ```toml
//! [broker]
//! host = "broker.local"
//! port = 1883
//!
//! [stream]
//! worker_count = 1
//! record_to = "/var/lib/mqttstream/live.jsonl"
//!
//! [mode]
//! kind = "raw"
//! topics = ["sensors/#"]
//! ```

use crate::dispatch::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};
use crate::mqtt::config::BrokerEndpoint;
use crate::mqtt::envelope::qos_from_level;
use crate::persistence::replayer::ReplayOptions;
use crate::stream::{RawConfig, SimulationConfig, StreamConfig, StreamOptions};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "MQTTSTREAM_CONFIG";
const CONFIG_DIR: &str = "mqttstream";
const CONFIG_FILE: &str = "config.toml";

const ENV_BROKER_ADDR: &str = "MQTTSTREAM_BROKER_ADDR";
const ENV_BROKER_PORT: &str = "MQTTSTREAM_BROKER_PORT";
const ENV_BROKER_USER: &str = "MQTTSTREAM_BROKER_USER";
const ENV_BROKER_PASS: &str = "MQTTSTREAM_BROKER_PASS";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerEndpoint,
    pub stream: StreamSection,
    pub mode: ModeSection,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct StreamSection {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub drain_on_stop: bool,
    pub stop_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub subscribe_qos: u8,
    pub record_to: Option<PathBuf>,
    /// Stop on its own after this many seconds
    pub run_for_secs: Option<u64>,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_count: DEFAULT_WORKER_COUNT,
            drain_on_stop: true,
            stop_timeout_ms: 5000,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 5000,
            subscribe_qos: 0,
            record_to: None,
            run_for_secs: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModeSection {
    Raw {
        #[serde(default = "match_all")]
        topics: Vec<String>,
    },
    Simulation {
        recording_path: PathBuf,
        #[serde(default = "match_all")]
        observe_topics: Vec<String>,
        #[serde(default = "unit_speed")]
        speed: f64,
        #[serde(default)]
        loop_playback: bool,
    },
}

impl Default for ModeSection {
    fn default() -> Self {
        ModeSection::Raw {
            topics: match_all(),
        }
    }
}

fn match_all() -> Vec<String> {
    vec!["#".to_string()]
}

fn unit_speed() -> f64 {
    1.0
}

impl AppConfig {
    /// Config file location: explicit argument, `$MQTTSTREAM_CONFIG`, then the user config dir
    pub fn locate(arg: Option<String>) -> PathBuf {
        if let Some(path) = arg {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Reads the file (defaults when missing) and applies environment overrides
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
            info!("Loaded configuration from {}", path.display());
            Self::parse(&content)?
        } else {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    /// Applies `MQTTSTREAM_BROKER_*` values looked up through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup(ENV_BROKER_ADDR) {
            debug!("Broker host overridden by {}", ENV_BROKER_ADDR);
            self.broker.host = host;
        }
        if let Some(port) = lookup(ENV_BROKER_PORT) {
            self.broker.port = port
                .trim()
                .parse()
                .map_err(|e| eyre!("Invalid {} '{}': {}", ENV_BROKER_PORT, port, e))?;
        }
        if let Some(user) = lookup(ENV_BROKER_USER) {
            self.broker.username = Some(user);
        }
        if let Some(pass) = lookup(ENV_BROKER_PASS) {
            self.broker.password = Some(pass);
        }
        Ok(())
    }

    pub fn stream_options(&self) -> Result<StreamOptions> {
        let section = &self.stream;
        let subscribe_qos = qos_from_level(section.subscribe_qos)
            .ok_or_else(|| eyre!("Invalid subscribe_qos {}", section.subscribe_qos))?;
        Ok(StreamOptions {
            queue_capacity: section.queue_capacity,
            worker_count: section.worker_count,
            drain_on_stop: section.drain_on_stop,
            stop_timeout: Duration::from_millis(section.stop_timeout_ms),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            ack_timeout: Duration::from_millis(section.ack_timeout_ms),
            subscribe_qos,
            record_to: section.record_to.clone(),
        })
    }

    pub fn stream_config(&self) -> StreamConfig {
        match &self.mode {
            ModeSection::Raw { topics } => {
                StreamConfig::Raw(RawConfig::new(self.broker.clone(), topics.iter().cloned()))
            }
            ModeSection::Simulation {
                recording_path,
                observe_topics,
                speed,
                loop_playback,
            } => {
                let mut simulation = SimulationConfig::new(recording_path, self.broker.clone())
                    .with_replay(ReplayOptions {
                        speed: *speed,
                        loop_playback: *loop_playback,
                    });
                simulation.observe_topics = observe_topics.iter().cloned().collect();
                StreamConfig::Simulation(simulation)
            }
        }
    }

    pub fn run_for(&self) -> Option<Duration> {
        self.stream.run_for_secs.map(Duration::from_secs)
    }
}
