//! # Broker connections
//!
//! Everything that touches the MQTT broker lives here. The wire protocol is
//! handled by `rumqttc`; this module adds the pieces the stream engine needs
//! on top of it.
//!
//! ```text
//! mqtt/
//! ├── config.rs      - BrokerEndpoint, per-role client options, topic validation
//! ├── envelope.rs    - immutable received message (topic, payload, timestamp)
//! ├── backoff.rs     - reconnect delays
//! ├── subscriber.rs  - inbound connection feeding the dispatch queue
//! └── publisher.rs   - outbound connection with per-QoS acknowledgment
//! ```
//!
//! Subscriber and publisher are independent connections with their own client
//! ids (`<id>-sub`, `<id>-pub`), so a simulation can observe exactly the
//! traffic it replays.

pub mod backoff;
pub mod config;
pub mod envelope;
pub mod publisher;
pub mod subscriber;

pub use config::{BrokerEndpoint, ClientRole};
pub use envelope::Envelope;
pub use publisher::{PublishSink, Publisher, PublisherConnection};
pub use subscriber::Subscriber;
