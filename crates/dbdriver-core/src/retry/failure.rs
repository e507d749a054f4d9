//! Normalized failure codes and the classes the retry policy decides on.

use std::error::Error;
use std::fmt;

/// Transport-level outcome of an RPC, reported by the channel rather than the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    Internal,
    Unavailable,
    Unauthenticated,
    Unimplemented,
}

impl TransportCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportCode::Cancelled => "cancelled",
            TransportCode::Unknown => "unknown",
            TransportCode::InvalidArgument => "invalid_argument",
            TransportCode::DeadlineExceeded => "deadline_exceeded",
            TransportCode::NotFound => "not_found",
            TransportCode::PermissionDenied => "permission_denied",
            TransportCode::ResourceExhausted => "resource_exhausted",
            TransportCode::Internal => "internal",
            TransportCode::Unavailable => "unavailable",
            TransportCode::Unauthenticated => "unauthenticated",
            TransportCode::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-level status returned by the server in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    BadRequest,
    Unauthorized,
    InternalError,
    Aborted,
    Unavailable,
    Overloaded,
    SchemeError,
    GenericError,
    Timeout,
    BadSession,
    PreconditionFailed,
    AlreadyExists,
    NotFound,
    SessionExpired,
    Cancelled,
    Undetermined,
    Unsupported,
    SessionBusy,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::BadRequest => "bad_request",
            StatusCode::Unauthorized => "unauthorized",
            StatusCode::InternalError => "internal_error",
            StatusCode::Aborted => "aborted",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Overloaded => "overloaded",
            StatusCode::SchemeError => "scheme_error",
            StatusCode::GenericError => "generic_error",
            StatusCode::Timeout => "timeout",
            StatusCode::BadSession => "bad_session",
            StatusCode::PreconditionFailed => "precondition_failed",
            StatusCode::AlreadyExists => "already_exists",
            StatusCode::NotFound => "not_found",
            StatusCode::SessionExpired => "session_expired",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Undetermined => "undetermined",
            StatusCode::Unsupported => "unsupported",
            StatusCode::SessionBusy => "session_busy",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A code extracted from one error in a cause chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Transport(TransportCode),
    Status(StatusCode),
}

/// Retry class of a failure; the policy's decision table is keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Stale or busy session: retry at once on a different session.
    SessionConflict,
    /// The operation may or may not have been applied.
    Undetermined,
    /// Transport or service temporarily unreachable.
    Unavailable,
    /// Upstream asked us to back off.
    Overloaded,
    /// Auth, malformed request, schema errors, anything unrecognized.
    NonRetryable,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::SessionConflict => "session_conflict",
            FailureClass::Undetermined => "undetermined",
            FailureClass::Unavailable => "unavailable",
            FailureClass::Overloaded => "overloaded",
            FailureClass::NonRetryable => "non_retryable",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caught error together with the codes the classifier found in it.
///
/// Borrows the original error so the caller can still return it unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Failure<'a> {
    source: &'a (dyn Error + 'static),
    transport: Option<TransportCode>,
    status: Option<StatusCode>,
}

impl<'a> Failure<'a> {
    pub fn new(
        source: &'a (dyn Error + 'static),
        transport: Option<TransportCode>,
        status: Option<StatusCode>,
    ) -> Self {
        Self {
            source,
            transport,
            status,
        }
    }

    /// A failure with no recognized code; never retried.
    pub fn unclassified(source: &'a (dyn Error + 'static)) -> Self {
        Self::new(source, None, None)
    }

    pub fn source(&self) -> &'a (dyn Error + 'static) {
        self.source
    }

    pub fn transport_code(&self) -> Option<TransportCode> {
        self.transport
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn is_classified(&self) -> bool {
        self.transport.is_some() || self.status.is_some()
    }

    /// Retry class. A transport code takes precedence over a status code.
    pub fn class(&self) -> FailureClass {
        if let Some(code) = self.transport {
            return match code {
                TransportCode::Unavailable => FailureClass::Unavailable,
                TransportCode::ResourceExhausted => FailureClass::Overloaded,
                TransportCode::DeadlineExceeded
                | TransportCode::Unknown
                | TransportCode::Internal => FailureClass::Undetermined,
                _ => FailureClass::NonRetryable,
            };
        }
        match self.status {
            Some(StatusCode::BadSession | StatusCode::SessionBusy | StatusCode::SessionExpired) => {
                FailureClass::SessionConflict
            }
            Some(StatusCode::Undetermined) => FailureClass::Undetermined,
            Some(StatusCode::Unavailable | StatusCode::Aborted) => FailureClass::Unavailable,
            Some(StatusCode::Overloaded) => FailureClass::Overloaded,
            _ => FailureClass::NonRetryable,
        }
    }

    /// Whether the session used for the failed call should be discarded
    /// rather than returned to the idle set.
    ///
    /// Session conflicts always do; so does a broken or undetermined
    /// transport, since the server-side session state is unknown.
    pub fn invalidates_session(&self) -> bool {
        if self.class() == FailureClass::SessionConflict {
            return true;
        }
        matches!(
            self.transport,
            Some(
                TransportCode::Unavailable
                    | TransportCode::DeadlineExceeded
                    | TransportCode::Unknown
                    | TransportCode::Internal
            )
        )
    }
}
