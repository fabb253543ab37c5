//! Error types for the MQTT ingestion layer

use thiserror::Error;

/// Errors surfaced to callers of the connection manager.
///
/// Connection failures that happen after `connect` has returned are never
/// reported here; they land in the `connection_error` field of the
/// telemetry snapshot instead.
#[derive(Debug, Error)]
pub enum MqttError {
    /// The broker address could not be parsed
    #[error("Invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The address carries a scheme we cannot map to a transport
    #[error("Unsupported transport scheme: {0}")]
    UnsupportedScheme(String),

    /// Topic strings must not be empty
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// The manager task is gone or its queue is full
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Request rejected by the rumqttc client
    #[error("Client error: {0}")]
    ClientError(#[from] rumqttc::ClientError),
}
