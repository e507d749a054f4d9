//! Errors returned by the session pool.

use crate::retry::{Cancelled, Classifiable, Code};
use crate::rpc::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No idle session and no spare capacity. The pool never queues.
    #[error("session pool exhausted: {active} active, {pending} pending, limit {limit}")]
    Exhausted {
        active: usize,
        pending: usize,
        limit: usize,
    },
    /// Session creation failed. `retries_exhausted` is set when every
    /// attempt failed with a retryable error; otherwise the last error was
    /// fatal on its own (auth, bad request) and was not retried.
    #[error("session creation failed: {source}")]
    CreationFailed {
        #[source]
        source: RpcError,
        retries_exhausted: bool,
    },
    #[error("session pool is closed")]
    Closed,
    #[error("session acquire cancelled")]
    Cancelled,
}

impl PoolError {
    /// True for capacity rejection and for creation that ran out of retries.
    /// A creation failure that was fatal on first occurrence is not.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            PoolError::Exhausted { .. }
                | PoolError::CreationFailed {
                    retries_exhausted: true,
                    ..
                }
        )
    }
}

impl From<Cancelled> for PoolError {
    fn from(_: Cancelled) -> Self {
        PoolError::Cancelled
    }
}

/// Pool errors carry no code of their own; a creation failure exposes its
/// cause through `source()`, which the classifier follows. Callers that wrap
/// pool errors therefore do not retry capacity rejections.
impl Classifiable for PoolError {
    fn code(&self) -> Option<Code> {
        None
    }
}
