//! Error type for callers running operations through the pool.

use crate::retry::Cancelled;
use crate::rpc::RpcError;
use crate::session::PoolError;

/// Combined error for [`SessionPool::execute`](crate::session::SessionPool::execute)
/// callers whose operations fail with [`RpcError`].
///
/// Variants keep the inner error as their `source()` so the classifier can
/// still see the original codes.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("rpc failed: {0}")]
    Rpc(#[from] RpcError),
    #[error("session pool: {0}")]
    Pool(#[from] PoolError),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for DriverError {
    fn from(_: Cancelled) -> Self {
        DriverError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{Classifier, FailureClass, StatusCode};

    #[test]
    fn classifier_sees_through_driver_error() {
        let err = DriverError::from(RpcError::status(StatusCode::SessionBusy, "busy"));
        let failure = Classifier::new().classify(&err);
        assert_eq!(failure.class(), FailureClass::SessionConflict);
    }

    #[test]
    fn pool_exhaustion_is_not_retryable() {
        let err = DriverError::from(PoolError::Exhausted {
            active: 2,
            pending: 0,
            limit: 2,
        });
        let failure = Classifier::new().classify(&err);
        assert_eq!(failure.class(), FailureClass::NonRetryable);
    }
}
