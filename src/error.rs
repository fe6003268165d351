//! Error taxonomy shared by every pipeline stage.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network or transport failure talking to the feed, including non-2xx answers.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The feed answered, but without the record list or status envelope we expect.
    #[error("upstream response malformed: {0}")]
    UpstreamMalformed(String),

    /// The hand-off artifact could not be written or read back.
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Only raised when the delivery policy asks for it, or when a message
    /// could not even be enqueued.
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
