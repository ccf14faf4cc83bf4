//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur during encoding operations.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The encoder has not been started, or has been stopped.
    #[error("Encoder '{0}' is not ready")]
    NotReady(String),

    /// `start` was called on a running encoder.
    #[error("Encoder '{0}' is already started")]
    AlreadyStarted(String),

    /// General encoding error.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),

    /// The consumer of encoded packets went away.
    #[error("Encoded packet channel disconnected")]
    ChannelDisconnected,
}
