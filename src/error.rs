//! Error types for the ble-central crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// Invalid configuration value. Raised before any native call is made.
    #[error("Invalid configuration: {name} = {value}")]
    Configuration {
        /// The name of the offending setting.
        name: String,
        /// The rejected value.
        value: String,
    },

    /// The native stack rejected an operation.
    #[error("Native {operation} failed: {reason}")]
    Native {
        /// The operation that was rejected (scan start, connect, ...).
        operation: String,
        /// Description of why the operation failed.
        reason: String,
    },

    /// The operation was cancelled by the consumer.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// A stream ended before producing the awaited value.
    #[error("Stream closed before a value was received")]
    StreamClosed,

    /// Operation requires a connection but the peripheral is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Invalid data was received from the native stack.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// The requested operation is not supported by the native stack.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

impl Error {
    /// Build a configuration error.
    pub(crate) fn configuration(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Configuration {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Build a native operation error.
    pub(crate) fn native(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Native {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is a consumer-initiated cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
