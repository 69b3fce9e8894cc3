use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::{Publish, QoS};
use std::fmt;

const PREVIEW_LEN: usize = 48;

/// One MQTT message together with the instant it was received
///
/// Envelopes are immutable once built. Cloning is cheap because the payload
/// is reference counted, which lets the subscriber hand the same message to
/// the dispatch queue and to the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    topic: String,
    payload: Bytes,
    timestamp: DateTime<Utc>,
    qos: QoS,
    retain: bool,
}

impl Envelope {
    /// Creates an envelope with an explicit timestamp (QoS 0, no retain)
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, timestamp: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            timestamp,
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Creates an envelope stamped with the current time
    pub fn received(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(topic, payload, Utc::now())
    }

    /// Wraps an inbound PUBLISH packet, stamping it with the receipt time
    pub fn from_publish(publish: &Publish) -> Self {
        Self::received(publish.topic.clone(), publish.payload.clone())
            .with_delivery(publish.qos, publish.retain)
    }

    /// Returns the same message with the given delivery flags
    pub fn with_delivery(mut self, qos: QoS, retain: bool) -> Self {
        self.qos = qos;
        self.retain = retain;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Short human readable rendering of the payload (hex for binary data)
    pub fn payload_preview(&self) -> String {
        match self.payload_str() {
            Some(s) if s.chars().count() <= PREVIEW_LEN => s.to_string(),
            Some(s) => format!("{}...", s.chars().take(PREVIEW_LEN).collect::<String>()),
            None => {
                let hex: Vec<String> = self
                    .payload
                    .iter()
                    .take(PREVIEW_LEN / 2)
                    .map(|b| format!("{:02x}", b))
                    .collect();
                if self.payload.len() > PREVIEW_LEN / 2 {
                    format!("{}...", hex.join(" "))
                } else {
                    hex.join(" ")
                }
            }
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} ({} bytes): {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len(),
            self.payload_preview()
        )
    }
}

/// Maps a numeric QoS level onto the rumqttc enum
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Numeric QoS level of the rumqttc enum
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
