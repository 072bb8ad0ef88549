//! Connector error types

use thiserror::Error;

use crate::feed::FeedConfigError;
use crate::normalize::NormalizeError;
use crate::transform::TransformError;

/// Errors raised while opening or running a protocol adapter
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Rejected at adapter construction; never retried
    #[error("Configuration error: {0}")]
    Config(#[from] FeedConfigError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid response body: {0}")]
    Body(#[from] NormalizeError),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),
}

impl ConnectorError {
    /// Configuration errors are fatal to activation and are not retried
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
