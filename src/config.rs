/// Modbus TCP transport configuration
///
/// Holds the serializable part of the transport setup. The push handler and
/// the log sink are attached to the transporter directly because closures
/// cannot be serialized.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::VerifyMode;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::UnitId;

/// Default connect, write and response timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle time before the connection is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Modbus TCP transport configuration
///
/// A zero `timeout` disables the connect timeout, the write deadline and the
/// response wait bound. A zero `idle_timeout` disables idle closing.
///
/// ```rust
/// use std::time::Duration;
/// use voltage_modbus_link::TcpTransportConfig;
///
/// let config = TcpTransportConfig::new("192.168.12.239:502")
///     .with_timeout(Duration::from_secs(3))
///     .with_unit_id(1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Target address, `host:port`
    pub address: String,
    /// Connect timeout, write deadline and response wait window
    pub timeout: Duration,
    /// Inactivity window after which the connection is closed
    pub idle_timeout: Duration,
    /// Unit/slave identifier placed in every request
    pub unit_id: UnitId,
    /// Response header verification policy
    pub verify_mode: VerifyMode,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout: DEFAULT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            unit_id: 0,
            verify_mode: VerifyMode::default(),
        }
    }
}

impl TcpTransportConfig {
    /// Create a configuration with default timeouts for `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_unit_id(mut self, unit_id: UnitId) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_verify_mode(mut self, verify_mode: VerifyMode) -> Self {
        self.verify_mode = verify_mode;
        self
    }

    /// Load a configuration from JSON
    ///
    /// Durations use serde's `{ "secs": .., "nanos": .. }` representation;
    /// missing fields take their defaults.
    pub fn from_json(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the transport cannot work with
    pub fn validate(&self) -> ModbusResult<()> {
        if self.address.trim().is_empty() {
            return Err(ModbusError::configuration("address must not be empty"));
        }
        if !self.address.contains(':') {
            return Err(ModbusError::configuration(format!(
                "address '{}' is missing a port",
                self.address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TcpTransportConfig::new("127.0.0.1:502");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.unit_id, 0);
        assert_eq!(config.verify_mode, VerifyMode::Lenient);
    }

    #[test]
    fn test_validation() {
        assert!(TcpTransportConfig::new("127.0.0.1:502").validate().is_ok());
        assert!(TcpTransportConfig::new("plc.local:1502").validate().is_ok());

        let err = TcpTransportConfig::default().validate().unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));

        let err = TcpTransportConfig::new("127.0.0.1").validate().unwrap_err();
        assert!(err.to_string().contains("missing a port"));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "address": "10.0.0.5:502",
            "timeout": { "secs": 2, "nanos": 0 },
            "unit_id": 17,
            "verify_mode": "strict"
        }"#;
        let config = TcpTransportConfig::from_json(json).unwrap();
        assert_eq!(config.address, "10.0.0.5:502");
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.unit_id, 17);
        assert_eq!(config.verify_mode, VerifyMode::Strict);
    }

    #[test]
    fn test_from_json_errors() {
        let err = TcpTransportConfig::from_json("{ not json").unwrap_err();
        assert!(err.to_string().contains("JSON error"));

        let err = TcpTransportConfig::from_json(r#"{ "unit_id": 1 }"#).unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }
}
