//! Error types for the protocol layer.

use std::time::Duration;

use thiserror::Error;

use courier_core::{DomainError, RecipientId, ServiceId};

/// Protocol store / content error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed content: {0}")]
    MalformedContent(String),
    #[error("malformed sender key distribution message: {0}")]
    MalformedDistributionMessage(String),
    #[error("no identity stored for {0}")]
    UnknownIdentity(ServiceId),
    #[error("protocol storage error: {0}")]
    Storage(String),
    #[error("session guard belongs to a different session lock")]
    ForeignGuard,
}

/// Recipient directory lookup error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("recipient not found: {0}")]
    RecipientNotFound(RecipientId),
    #[error("directory storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Network transport error.
///
/// `PushNetwork` and `RateLimited` are both failures of the push transport
/// itself; everything else is a definitive answer from the service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("push network failure: {0}")]
    PushNetwork(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request rejected by service: {0}")]
    Rejected(String),
    #[error("not registered on the service")]
    NotRegistered,
}

impl TransportError {
    pub fn push_network(msg: impl Into<String>) -> Self {
        Self::PushNetwork(msg.into())
    }

    /// Whether the failure happened in the push transport (and may succeed later).
    pub fn is_push_network(&self) -> bool {
        matches!(
            self,
            TransportError::PushNetwork(_) | TransportError::RateLimited { .. }
        )
    }
}

/// Failure of a resend attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResendError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("recipient {0} has no service id")]
    MissingServiceId(RecipientId),
}

impl ResendError {
    /// Only push-network failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResendError::Transport(e) if e.is_push_network())
    }
}
