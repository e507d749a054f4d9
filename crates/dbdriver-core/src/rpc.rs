//! Session RPCs consumed from the server, expressed as a trait.
//!
//! The wire transport lives outside this crate; anything that can create,
//! attach to and delete server-side sessions implements [`SessionService`].

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::retry::{Cancelled, Classifiable, Code, StatusCode, TransportCode};

/// Opaque server-assigned session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Successful `CreateSession` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub id: SessionId,
    /// Node that owns the session; requests should be routed there.
    pub node_id: i64,
}

/// One message on a session's attach stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is alive and usable.
    Ready,
    /// Server reports the session can no longer be used.
    Unusable(StatusCode),
}

impl SessionStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, SessionStatus::Ready)
    }
}

/// Long-lived stream of liveness updates for one session.
pub type StatusStream = BoxStream<'static, Result<SessionStatus, RpcError>>;

/// Error returned by session RPCs.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The channel failed before a server response was decoded.
    #[error("transport error ({code}): {message}")]
    Transport {
        code: TransportCode,
        message: String,
    },
    /// The server answered with a non-success status.
    #[error("server status {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl RpcError {
    pub fn transport(code: TransportCode, message: impl Into<String>) -> Self {
        RpcError::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        RpcError::Status {
            status,
            message: message.into(),
        }
    }
}

impl From<Cancelled> for RpcError {
    fn from(_: Cancelled) -> Self {
        RpcError::Cancelled
    }
}

impl Classifiable for RpcError {
    fn code(&self) -> Option<Code> {
        match self {
            RpcError::Transport { code, .. } => Some(Code::Transport(*code)),
            RpcError::Status { status, .. } => Some(Code::Status(*status)),
            RpcError::Cancelled => Some(Code::Transport(TransportCode::Cancelled)),
        }
    }
}

/// Server-side session RPCs.
#[async_trait]
pub trait SessionService: Send + Sync + 'static {
    /// `CreateSession`: a non-success status is returned as [`RpcError::Status`].
    async fn create_session(&self) -> Result<CreatedSession, RpcError>;

    /// `AttachSession`: open the liveness stream for `id`.
    async fn attach_session(&self, id: &SessionId) -> Result<StatusStream, RpcError>;

    /// `DeleteSession`.
    async fn delete_session(&self, id: &SessionId) -> Result<(), RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_code() {
        let err = RpcError::status(StatusCode::Overloaded, "too many requests");
        assert_eq!(err.to_string(), "server status overloaded: too many requests");
        let err = RpcError::transport(TransportCode::Unavailable, "connection reset");
        assert_eq!(err.to_string(), "transport error (unavailable): connection reset");
    }

    #[test]
    fn session_id_conversions() {
        let id = SessionId::from("s-1");
        assert_eq!(id.as_str(), "s-1");
        assert_eq!(id.to_string(), "s-1");
        assert_eq!(SessionId::new(String::from("s-1")), id);
    }
}
