//! Client configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::SENSOR_DATA_CHARACTERISTIC_UUID;
use crate::error::{Error, Result};

/// Default substring matched against advertised device names.
pub const DEFAULT_NAME_PATTERN: &str = "ESP32";

/// Default scan window.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the lifecycle event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Configuration for a [`SensorClient`](crate::SensorClient).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Substring the advertised name must contain.
    pub name_pattern: String,
    /// Characteristic to subscribe to.
    pub characteristic: Uuid,
    /// How long a scan collects advertisements.
    pub scan_timeout: Duration,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name_pattern: DEFAULT_NAME_PATTERN.to_string(),
            characteristic: SENSOR_DATA_CHARACTERISTIC_UUID,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name pattern.
    pub fn with_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = pattern.into();
        self
    }

    /// Set the notification characteristic.
    pub fn with_characteristic(mut self, characteristic: Uuid) -> Self {
        self.characteristic = characteristic;
        self
    }

    /// Set the scan window.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the lifecycle event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check that all values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name_pattern.is_empty() {
            return Err(invalid("name_pattern", "\"\""));
        }
        if self.scan_timeout.is_zero() {
            return Err(invalid("scan_timeout", "0s"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "0s"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "0"));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: &str) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.name_pattern, "ESP32");
        assert_eq!(config.characteristic, SENSOR_DATA_CHARACTERISTIC_UUID);
        assert_eq!(config.scan_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new()
            .with_name_pattern("Weather")
            .with_scan_timeout(Duration::from_secs(2))
            .with_connect_timeout(Duration::from_secs(3))
            .with_event_capacity(4);
        assert_eq!(config.name_pattern, "Weather");
        assert_eq!(config.scan_timeout, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.event_capacity, 4);
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let err = ClientConfig::new()
            .with_scan_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "scan_timeout"));

        let err = ClientConfig::new()
            .with_connect_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "connect_timeout"));
    }

    #[test]
    fn test_validate_rejects_empty_pattern() {
        assert!(ClientConfig::new().with_name_pattern("").validate().is_err());
        assert!(ClientConfig::new().with_event_capacity(0).validate().is_err());
    }
}
