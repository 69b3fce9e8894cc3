//! # mqttstream
//!
//! Stream lifecycle engine between an MQTT broker, an analytics-emitting
//! device and recorded message traces.
//!
//! ```text
//! live:    broker ─► Subscriber ─► DispatchQueue ─► WorkerPool ─► MessageHandler
//!                        └──────► Recorder ─► recording.jsonl
//! replay:  recording.jsonl ─► Replayer ─► Publisher ─► broker
//! ```
//!
//! Everything is owned and sequenced by a [`StreamManager`], configured with
//! one [`StreamConfig`] variant per mode.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod mqtt;
pub mod persistence;
pub mod stats;
pub mod stream;

mod shutdown;

pub use dispatch::MessageHandler;
pub use error::{Result, StreamError};
pub use mqtt::{BrokerEndpoint, Envelope};
pub use persistence::{ReplayOptions, ReplaySummary};
pub use stats::{StatsSnapshot, StreamStats};
pub use stream::{
    AnalyticsConfig, DataSource, DeviceAnalytics, PublisherId, RawConfig, SimulationConfig,
    StreamConfig, StreamManager, StreamOptions, StreamState,
};
