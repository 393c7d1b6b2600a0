//! Configuration for pools and endpoints.
//!
//! Both structs deserialize with every field optional, so an embedding
//! service can load just the knobs it cares about:
//!
//! ```
//! use agentwire_common::config::PoolConfig;
//!
//! let config: PoolConfig = serde_json::from_str(r#"{ "call_retries": 5 }"#).unwrap();
//! assert_eq!(config.call_retries, 5);
//! assert_eq!(config.connect_timeout, PoolConfig::default().connect_timeout);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::RpcError;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Client-side connection pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Bound on a single lower-level connect attempt
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Times a call may be re-issued after a transport failure
    pub call_retries: u32,
    /// How long an unreferenced, idle connection is kept warm
    #[serde(rename = "expiry_time_ms", with = "duration_ms")]
    pub expiry_time: Duration,
    /// Delay before reconnecting after a failed or broken connection
    #[serde(rename = "reconnect_interval_ms", with = "duration_ms")]
    pub reconnect_interval: Duration,
    /// Debug only: probability that a call is transmitted twice
    pub dupe_calls: f64,
    /// Largest response frame accepted from an agent
    pub max_message_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_retries: 3,
            expiry_time: Duration::from_secs(60),
            reconnect_interval: Duration::from_millis(100),
            dupe_calls: 0.0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.connect_timeout.is_zero() {
            return Err(RpcError::InvalidConfig(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dupe_calls) {
            return Err(RpcError::InvalidConfig(format!(
                "dupe_calls must be a probability, got {}",
                self.dupe_calls
            )));
        }
        if self.max_message_size == 0 {
            return Err(RpcError::InvalidConfig(
                "max_message_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server-side endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Calls a single connection may have dispatched but unanswered
    pub max_outstanding_calls: usize,
    /// Encoded-but-unsent response bytes before completions stop being drained
    pub tx_buffer_limit: usize,
    /// Largest request frame accepted from a client
    pub max_message_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_outstanding_calls: 64,
            tx_buffer_limit: 1024 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.max_outstanding_calls == 0 {
            return Err(RpcError::InvalidConfig(
                "max_outstanding_calls must be at least 1".to_string(),
            ));
        }
        if self.tx_buffer_limit == 0 {
            return Err(RpcError::InvalidConfig(
                "tx_buffer_limit must be non-zero".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(RpcError::InvalidConfig(
                "max_message_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.call_retries, 3);
        assert_eq!(config.dupe_calls, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_bad_probability() {
        let config = PoolConfig {
            dupe_calls: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RpcError::InvalidConfig(_))));
    }

    #[test]
    fn test_pool_config_from_json_millis() {
        let config: PoolConfig =
            serde_json::from_str(r#"{ "connect_timeout_ms": 250, "expiry_time_ms": 1000 }"#)
                .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.expiry_time, Duration::from_secs(1));
        assert_eq!(config.call_retries, 3);
    }

    #[test]
    fn test_endpoint_config_validate() {
        assert!(EndpointConfig::default().validate().is_ok());
        let config = EndpointConfig {
            max_outstanding_calls: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
