//! Client configuration.
//!
//! All durations are stored in milliseconds so a config can be loaded from
//! JSON as-is; the accessors hand out [`Duration`]s.
//!
//! ```
//! use dubbo_client::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{
//!     "timeout_ms": 2000,
//!     "heartbeat": true,
//!     "references": {
//!         "com.example.Greeter": { "version": "2.0.0", "methods": { "greet": { "timeout": "500" } } }
//!     }
//! }"#).unwrap();
//!
//! assert_eq!(config.timeout().as_millis(), 2000);
//! assert_eq!(config.owner, "dubbo-client");
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RpcError};
use crate::protocol::{Attachments, ResyncPolicy, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::EndpointConfig;

pub const PATH_KEY: &str = "path";
pub const INTERFACE_KEY: &str = "interface";
pub const VERSION_KEY: &str = "version";
pub const TIMEOUT_KEY: &str = "timeout";
pub const OWNER_KEY: &str = "owner";
pub const CUSTOMER_KEY: &str = "customer";

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_APPLICATION: &str = "dubbo-client";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 100;

/// How a channel maps calls onto connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// One shared connection per address, calls told apart by request id.
    #[default]
    Pooled,
    /// A fresh connection per call, closed once the call is resolved.
    Ephemeral,
}

/// Per-service settings, keyed by service path in [`ClientConfig::references`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Service version for this reference.
    pub version: Option<String>,
    /// Call timeout for this reference.
    pub timeout_ms: Option<u64>,
    /// Extra attachments sent with every call to this service.
    pub attachments: Attachments,
    /// Attachments applied to single methods, keyed by method name.
    pub methods: HashMap<String, Attachments>,
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default call timeout.
    pub timeout_ms: u64,
    /// Enable the idle heartbeat driver.
    pub heartbeat: bool,
    /// Idle time after which a heartbeat is sent.
    pub heartbeat_interval_ms: u64,
    /// Default service version.
    pub version: String,
    pub owner: String,
    pub customer: String,
    /// Upper bound on one connect attempt.
    pub connect_timeout_ms: u64,
    /// Pause after a refused connect.
    pub reconnect_delay_ms: u64,
    /// Period of the pending-call timeout sweep.
    pub sweep_interval_ms: u64,
    pub connection_mode: ConnectionMode,
    /// Fail a connection's pending calls as soon as it drops instead of
    /// letting them time out.
    pub fail_pending_on_disconnect: bool,
    /// Largest accepted inbound payload.
    pub max_payload_size: u32,
    pub resync: ResyncPolicy,
    /// Attachments sent with every call.
    pub attachments: Attachments,
    /// Per-service settings keyed by service path.
    pub references: HashMap<String, ReferenceConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            heartbeat: false,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            version: DEFAULT_VERSION.to_string(),
            owner: DEFAULT_APPLICATION.to_string(),
            customer: DEFAULT_APPLICATION.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            connection_mode: ConnectionMode::default(),
            fail_pending_on_disconnect: false,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            resync: ResyncPolicy::default(),
            attachments: Attachments::new(),
            references: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reject settings that would stall or busy-loop the background tasks.
    pub fn validate(&self) -> Result<()> {
        require_positive("timeout_ms", self.timeout_ms)?;
        require_positive("connect_timeout_ms", self.connect_timeout_ms)?;
        require_positive("reconnect_delay_ms", self.reconnect_delay_ms)?;
        if self.heartbeat {
            require_positive("heartbeat_interval_ms", self.heartbeat_interval_ms)?;
        }
        Ok(())
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[inline]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Settings for the endpoints this client opens.
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_payload_size: self.max_payload_size,
            resync: self.resync,
            ..EndpointConfig::default()
        }
    }

    pub fn reference(&self, service: &str) -> Option<&ReferenceConfig> {
        self.references.get(service)
    }
}

fn require_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(RpcError::Configuration(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert!(!config.heartbeat);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.version, "1.0.0");
        assert_eq!(config.connection_mode, ConnectionMode::Pooled);
        assert_eq!(config.resync, ResyncPolicy::ScanForMagic);
        assert!(!config.fail_pending_on_disconnect);
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.customer, DEFAULT_APPLICATION);
    }

    #[test]
    fn test_from_json() {
        let config = ClientConfig::from_json(
            r#"{
                "timeout_ms": 250,
                "heartbeat": true,
                "heartbeat_interval_ms": 3000,
                "connection_mode": "ephemeral",
                "resync": "discard_chunk",
                "attachments": {"app": "billing"},
                "references": {
                    "com.example.Greeter": {
                        "version": "2.0.0",
                        "timeout_ms": 900,
                        "methods": {"greet": {"timeout": "100"}}
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert!(config.heartbeat);
        assert_eq!(config.connection_mode, ConnectionMode::Ephemeral);
        assert_eq!(config.resync, ResyncPolicy::DiscardChunk);
        assert_eq!(config.attachments["app"], "billing");

        let reference = config.reference("com.example.Greeter").unwrap();
        assert_eq!(reference.version.as_deref(), Some("2.0.0"));
        assert_eq!(reference.timeout_ms, Some(900));
        assert_eq!(reference.methods["greet"]["timeout"], "100");
    }

    #[test]
    fn test_resync_alias() {
        let config = ClientConfig::from_json(r#"{"resync": "scan"}"#).unwrap();
        assert_eq!(config.resync, ResyncPolicy::ScanForMagic);
    }

    #[test]
    fn test_invalid_json() {
        assert!(ClientConfig::from_json("{\"timeout_ms\": \"soon\"}").is_err());
    }

    #[test]
    fn test_endpoint_config() {
        let config = ClientConfig {
            connect_timeout_ms: 10,
            reconnect_delay_ms: 20,
            max_payload_size: 1024,
            ..ClientConfig::default()
        };
        let endpoint = config.endpoint_config();
        assert_eq!(endpoint.connect_timeout, Duration::from_millis(10));
        assert_eq!(endpoint.reconnect_delay, Duration::from_millis(20));
        assert_eq!(endpoint.max_payload_size, 1024);
    }

    #[test]
    fn test_defaults_validate() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let cases = [
            ClientConfig { timeout_ms: 0, ..ClientConfig::default() },
            ClientConfig { connect_timeout_ms: 0, ..ClientConfig::default() },
            ClientConfig { reconnect_delay_ms: 0, ..ClientConfig::default() },
            ClientConfig { heartbeat: true, heartbeat_interval_ms: 0, ..ClientConfig::default() },
        ];
        for config in cases {
            let err = config.validate().unwrap_err();
            assert!(err.is_configuration(), "{:?}", err);
        }
    }

    #[test]
    fn test_zero_heartbeat_interval_ignored_when_disabled() {
        let config = ClientConfig {
            heartbeat: false,
            heartbeat_interval_ms: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
