//! Capability boundary towards an analytics-emitting device
//!
//! The engine never speaks the device's own protocol. It only asks the device
//! to publish one of its data sources to a broker topic and later to stop.

use crate::error::{Result, StreamError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// One stream of analytics data the device can publish
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DataSource {
    pub key: String,
    pub name: String,
    pub format: String,
}

/// Device-side handle for a publisher created through [`DeviceAnalytics`]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PublisherId(pub String);

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait DeviceAnalytics: Send + Sync {
    async fn enumerate_data_sources(&self) -> Result<Vec<DataSource>>;

    async fn create_publisher(
        &self,
        data_source_key: &str,
        topic: &str,
        qos: u8,
        retain: bool,
    ) -> Result<PublisherId>;

    async fn remove_publisher(&self, id: &PublisherId) -> Result<()>;
}

/// Makes the device publish `data_source_key` to `topic` (QoS 0, not retained)
pub(crate) async fn activate(
    device: &dyn DeviceAnalytics,
    data_source_key: &str,
    topic: &str,
) -> Result<PublisherId> {
    let sources = device.enumerate_data_sources().await?;
    debug!(
        "Device offers {:?}",
        sources.iter().map(|s| s.key.as_str()).collect::<Vec<_>>()
    );
    if !sources.iter().any(|source| source.key == data_source_key) {
        return Err(StreamError::Device(format!(
            "data source '{}' is not offered by the device",
            data_source_key
        )));
    }

    let id = device
        .create_publisher(data_source_key, topic, 0, false)
        .await?;
    info!(
        "Device publishing '{}' to {} as {}",
        data_source_key, topic, id
    );
    Ok(id)
}
