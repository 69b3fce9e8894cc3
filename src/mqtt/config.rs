use crate::error::{Result, StreamError};
use rumqttc::{MqttOptions, Transport};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Connection parameters shared by the subscriber and the publisher
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    /// Base client id; each connection appends its role (`-sub`, `-pub`)
    pub client_id: String,
    pub clean_session: bool,
    pub auto_reconnect: bool,
    pub keep_alive_secs: u64,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            use_tls: false,
            client_id: default_client_id(),
            clean_session: true,
            auto_reconnect: true,
            keep_alive_secs: 30,
        }
    }
}

/// Which side of the stream a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Subscriber,
    Publisher,
}

impl ClientRole {
    fn suffix(self) -> &'static str {
        match self {
            ClientRole::Subscriber => "sub",
            ClientRole::Publisher => "pub",
        }
    }
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Checks the endpoint before any connection attempt
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(StreamError::Configuration(
                "broker host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(StreamError::Configuration(
                "broker port must be in 1-65535".to_string(),
            ));
        }
        if self.client_id.is_empty() || self.client_id.starts_with(char::is_whitespace) {
            return Err(StreamError::Configuration(format!(
                "invalid client id '{}'",
                self.client_id
            )));
        }
        if self.keep_alive_secs > u64::from(u16::MAX) {
            return Err(StreamError::Configuration(format!(
                "keep alive of {}s exceeds the MQTT maximum of {}s",
                self.keep_alive_secs,
                u16::MAX
            )));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(StreamError::Configuration(
                "a broker password requires a username".to_string(),
            ));
        }
        Ok(())
    }

    /// True when the host only resolves on this machine
    pub fn is_loopback(&self) -> bool {
        let host = self.host.trim();
        host.eq_ignore_ascii_case("localhost")
            || host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }

    /// Builds the rumqttc options for one connection role
    pub fn mqtt_options(&self, role: ClientRole) -> MqttOptions {
        let client_id = format!("{}-{}", self.client_id, role.suffix());
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive())
            .set_clean_session(self.clean_session);

        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        if self.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("mqttstream-{}", &id[..8])
}

/// Validates a subscription filter (`+` and `#` wildcards allowed)
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(StreamError::Configuration(
            "topic filter must not be empty".to_string(),
        ));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || idx != levels.len() - 1) {
            return Err(StreamError::Configuration(format!(
                "'#' must be the last level of filter '{}'",
                filter
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(StreamError::Configuration(format!(
                "'+' must occupy a whole level in filter '{}'",
                filter
            )));
        }
    }
    Ok(())
}

/// Validates a topic name used for publishing (no wildcards)
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(StreamError::Configuration(
            "topic must not be empty".to_string(),
        ));
    }
    if topic.contains(['+', '#']) {
        return Err(StreamError::Configuration(format!(
            "wildcards are not allowed in publish topic '{}'",
            topic
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_host_and_zero_port() {
        assert!(BrokerEndpoint::new("", 1883).validate().is_err());
        assert!(BrokerEndpoint::new("broker", 0).validate().is_err());
        assert!(BrokerEndpoint::new("broker", 8883).validate().is_ok());
    }

    #[test]
    fn password_without_user_is_rejected() {
        let mut endpoint = BrokerEndpoint::new("broker", 1883);
        endpoint.password = Some("secret".to_string());
        assert!(matches!(
            endpoint.validate(),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn loopback_detection() {
        assert!(BrokerEndpoint::new("localhost", 1883).is_loopback());
        assert!(BrokerEndpoint::new("127.0.0.5", 1883).is_loopback());
        assert!(BrokerEndpoint::new("[::1]", 1883).is_loopback());
        assert!(!BrokerEndpoint::new("192.168.1.20", 1883).is_loopback());
    }

    #[test]
    fn topic_filters() {
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("a/+/c/#").is_ok());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b+").is_err());
        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_name("a/b").is_ok());
        assert!(validate_topic_name("a/+").is_err());
    }

    #[test]
    fn roles_get_distinct_client_ids() {
        let endpoint = BrokerEndpoint::new("broker", 1883);
        let sub = endpoint.mqtt_options(ClientRole::Subscriber);
        let publ = endpoint.mqtt_options(ClientRole::Publisher);
        assert_ne!(sub.client_id(), publ.client_id());
        assert!(sub.client_id().ends_with("-sub"));
    }
}
