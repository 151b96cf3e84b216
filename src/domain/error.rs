//! Error taxonomy for the alert pipeline
//!
//! None of these are fatal to the process. Each one describes a single
//! event, alert or delivery that did not complete.

use thiserror::Error;

/// Errors returned to the transport-consumption loop
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Payload could not be parsed; the message is dropped, never retried
    #[error("malformed payload on topic {topic}: {reason}")]
    MalformedPayload { topic: String, reason: String },

    /// Intake is closed because the process is shutting down
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    pub fn malformed(topic: &str, reason: impl Into<String>) -> Self {
        PipelineError::MalformedPayload { topic: topic.to_string(), reason: reason.into() }
    }
}

/// One failed delivery attempt to one (recipient, channel) pair
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelDeliveryFailure {
    #[error("delivery timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by provider (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("rate limited by provider")]
    RateLimited,

    #[error("no channel configured for {0}")]
    NotConfigured(String),
}

/// Entity state store could not be read or written
#[derive(Debug, Clone, PartialEq, Error)]
#[error("device state unavailable: {0}")]
pub struct StateUnavailable(pub String);

/// Recipient registry could not be queried
#[derive(Debug, Clone, PartialEq, Error)]
#[error("recipient registry unavailable: {0}")]
pub struct RegistryUnavailable(pub String);
