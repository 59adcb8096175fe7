//! Error types for the esp32-sensor-ble crate.

use thiserror::Error;

use crate::ble::connection::ConnectionState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Unclassified error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio adapter could not be opened or could not start scanning.
    #[error("Bluetooth radio unavailable: {reason}")]
    RadioUnavailable {
        /// Description of why the radio is unavailable.
        reason: String,
    },

    /// Failed to establish a connection to the device.
    #[error("Connection to {device} failed: {reason}")]
    ConnectFailed {
        /// Identifier of the device the attempt was made against.
        device: String,
        /// Description of why the connection failed.
        reason: String,
    },

    /// Failed to subscribe to notifications on a characteristic.
    #[error("Subscribe to {characteristic} failed: {reason}")]
    SubscribeFailed {
        /// UUID of the characteristic.
        characteristic: String,
        /// Description of why the subscription failed.
        reason: String,
    },

    /// A notification payload could not be decoded.
    #[error("Malformed notification: {0}")]
    MalformedNotification(#[from] DecodeError),

    /// The operation is not valid in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the manager was in.
        state: ConnectionState,
    },

    /// A pending connect attempt was aborted by a disconnect request.
    #[error("Connect attempt cancelled")]
    Cancelled,

    /// The notification stream failed while streaming.
    #[error("Notification stream failed: {reason}")]
    StreamFailed {
        /// Description of the transport failure.
        reason: String,
    },

    /// No advertising device satisfied the filter.
    #[error("No device matching {filter} found")]
    NoMatchingDevice {
        /// Description of the filter that was applied.
        filter: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

/// Per-notification decode failure.
///
/// These never leave the notification pipeline; they are logged and
/// counted there.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The payload is not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidText(#[from] std::str::Utf8Error),

    /// The text is not a well-formed JSON document.
    #[error("payload is not well-formed JSON: {0}")]
    InvalidStructure(#[from] serde_json::Error),

    /// The document is valid JSON but not an object.
    #[error("payload is a JSON {found}, expected an object")]
    NotAnObject {
        /// The kind of JSON value that was found.
        found: &'static str,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConnectFailed {
            device: "AA:BB".to_string(),
            reason: "timed out".to_string(),
        };
        assert_eq!(err.to_string(), "Connection to AA:BB failed: timed out");

        let err = Error::InvalidState {
            operation: "subscribe",
            state: ConnectionState::Idle,
        };
        assert_eq!(err.to_string(), "Cannot subscribe while Idle");
    }

    #[test]
    fn test_decode_error_converts() {
        let bytes = [0xff, 0xfe];
        let utf8 = std::str::from_utf8(&bytes).unwrap_err();
        let err: Error = DecodeError::from(utf8).into();
        assert!(matches!(
            err,
            Error::MalformedNotification(DecodeError::InvalidText(_))
        ));
    }
}
