//! # Stream lifecycle
//!
//! The [`StreamManager`] is the single owner of every background task of a
//! stream. Which tasks it runs is decided by the [`StreamConfig`] variant:
//!
//! | mode        | device publisher | subscriber + workers | publisher + replayer |
//! |-------------|------------------|----------------------|----------------------|
//! | Analytics   | yes              | yes                  | no                   |
//! | Raw         | no               | yes                  | no                   |
//! | Simulation  | no               | with handler/record  | yes                  |
//!
//! A recorder is added to any mode with a live subscriber when
//! [`StreamOptions::record_to`] is set or `start_recording` is called.

pub mod config;
pub mod device;
pub mod events;
pub mod manager;
pub mod state;

pub use config::{AnalyticsConfig, RawConfig, SimulationConfig, StreamConfig, StreamOptions};
pub use device::{DataSource, DeviceAnalytics, PublisherId};
pub use manager::StreamManager;
pub use state::StreamState;
