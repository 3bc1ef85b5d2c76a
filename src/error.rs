use thiserror::Error;

use crate::types::Parameter;

/// Errors that can occur when driving smart-bike peripherals
#[derive(Error, Debug)]
pub enum PedalError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Peripheral not found during scanning
    #[error("Peripheral {address} not found")]
    DeviceNotFound {
        /// Link address that was searched for
        address: String,
    },

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Service discovery failed after connecting
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid parameters supplied by the caller
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Command value rejected by the validator
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Telemetry packet could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Session or channel is not ready for commands
    #[error("Not ready: {reason}")]
    NotReady {
        /// Reason why the component is not ready
        reason: String,
    },

    /// Transport refused or failed to submit an operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// Publish/subscribe transport failure
    #[error("Pub/sub error: {0}")]
    PubSub(String),

    /// MQTT client request failed
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Kafka client request failed
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rskafka::client::error::Error),

    /// Inbound command payload could not be interpreted
    #[error("Malformed payload on {topic}: {reason}")]
    MalformedPayload {
        /// Topic the payload arrived on
        topic: String,
        /// What was wrong with it
        reason: String,
    },

    /// Inbound topic does not map to any controllable parameter
    #[error("No control channel for topic {0}")]
    UnroutableTopic(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for pedalers operations
pub type Result<T> = std::result::Result<T, PedalError>;

impl PedalError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::DiscoveryFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound { .. }
        )
    }

    /// Check if this error only terminates the current operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::NotReady { .. }
                | Self::InvalidParameters(_)
                | Self::Validation(_)
                | Self::Decode(_)
                | Self::MalformedPayload { .. }
                | Self::UnroutableTopic(_)
        )
    }

    /// Check if this error ends the device session and must reach the operator
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::DiscoveryFailed(_) | Self::DeviceNotFound { .. }
        )
    }
}

/// A command value that failed range or resolution checks
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{parameter} value {value} rejected: must be within {min} to {max}{}", resolution_note(.resolution))]
pub struct ValidationError {
    /// Parameter the value was meant for
    pub parameter: Parameter,
    /// The offending value
    pub value: f64,
    /// Inclusive lower bound
    pub min: f64,
    /// Inclusive upper bound
    pub max: f64,
    /// Required step, if the parameter has one
    pub resolution: Option<f64>,
}

fn resolution_note(resolution: &Option<f64>) -> String {
    resolution.map_or_else(String::new, |step| format!(" in steps of {step}"))
}

/// Telemetry decode failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Packet length disagrees with the length implied by its flags
    #[error("malformed length: flags imply {expected} bytes, packet has {actual}")]
    MalformedLength {
        /// Length implied by the flags field
        expected: usize,
        /// Actual packet length
        actual: usize,
    },

    /// Flags field carries reserved bits
    #[error("malformed flags: {flags:#06x}")]
    MalformedFlags {
        /// The raw flags value
        flags: u16,
    },
}
