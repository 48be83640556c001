//! Configuration types for the fleetlink SDK.

use crate::error::{SdkError, SdkResult};
use std::time::Duration;
use url::Url;

/// Path of the slave link endpoint on the master.
pub const LINK_PATH: &str = "/slave/connect";

/// Configuration for a slave link.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// Base URL of the master (`http(s)://` or `ws(s)://`).
    pub master_url: Url,
    /// Host id this slave registers as. Must match its credential.
    pub host_id: String,
    /// Serial of the credential issued at pairing.
    pub cert_serial: String,
    /// Version reported at registration.
    pub version: String,
    /// Keep-alive period.
    pub heartbeat_interval: Duration,
    /// Timeout for registration and master tool calls.
    pub request_timeout: Duration,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl SlaveConfig {
    /// Create a new configuration with defaults.
    pub fn new(
        master_url: &str,
        host_id: impl Into<String>,
        cert_serial: impl Into<String>,
    ) -> SdkResult<Self> {
        let host_id = host_id.into();
        if host_id.is_empty() {
            return Err(SdkError::Config("host_id is required".to_string()));
        }

        Ok(Self {
            master_url: Url::parse(master_url)?,
            host_id,
            cert_serial: cert_serial.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            event_capacity: 16,
        })
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the WebSocket URL of the link endpoint.
    pub fn link_url(&self) -> SdkResult<Url> {
        let mut url = self.master_url.clone();

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| SdkError::Config("Failed to set WebSocket scheme".to_string()))?;
        url.set_path(LINK_PATH);

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SlaveConfig::new("http://master:8080", "alpha", "serial").unwrap();

        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.host_id, "alpha");
    }

    #[test]
    fn test_link_url_scheme() {
        let plain = SlaveConfig::new("http://master:8080", "alpha", "s").unwrap();
        assert_eq!(plain.link_url().unwrap().as_str(), "ws://master:8080/slave/connect");

        let tls = SlaveConfig::new("https://master.example.com/ignored", "alpha", "s").unwrap();
        assert_eq!(
            tls.link_url().unwrap().as_str(),
            "wss://master.example.com/slave/connect"
        );
    }

    #[test]
    fn test_rejects_empty_host() {
        assert!(matches!(
            SlaveConfig::new("http://master", "", "s"),
            Err(SdkError::Config(_))
        ));
        assert!(matches!(
            SlaveConfig::new("not a url", "alpha", "s"),
            Err(SdkError::InvalidUrl(_))
        ));
    }
}
