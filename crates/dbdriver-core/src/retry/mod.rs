//! Failure classification, retry policy and the retry loop.
//!
//! Errors are normalized into a [`Failure`] by the [`Classifier`], the
//! [`RetryPolicy`] maps a failure plus attempt count to a backoff decision,
//! and the [`RetryExecutor`] drives an async operation through both so that
//! higher layers (the session pool, query clients) share one consistent policy.

mod classify;
mod failure;
mod policy;
mod run;

pub use classify::{Adapter, Classifiable, Classifier, Inspection};
pub use failure::{Code, Failure, FailureClass, StatusCode, TransportCode};
pub use policy::{Backoff, RetryContext, RetryDecision, RetryPolicy};
pub use run::{AttemptRecord, Cancelled, RetryExecutor};
