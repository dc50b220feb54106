//! Errors from the duplex protocol layer.

use crate::transport::packet::RejectionReason;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Encryption error: {0}")]
    Crypto(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Greeting failed: {0}")]
    GreetingFailed(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Channel rejected ({reason}): {message}")]
    ChannelRejected {
        reason: RejectionReason,
        message: String,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
