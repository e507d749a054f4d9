//! Session lifecycle: leased handles, keep-alive monitoring and the bounded pool.
//!
//! A caller leases a [`SessionHandle`] from the [`SessionPool`], runs its RPC
//! and hands the lease back with `release` (or `invalidate` when the session
//! is suspect). Each created session gets a [`KeepAliveMonitor`] that flips
//! its liveness flag when the server drops it; the pool reads that flag on
//! release and on reuse.

mod error;
mod handle;
mod keep_alive;
mod pool;

pub use error::PoolError;
pub use handle::{Liveness, SessionHandle, SessionInfo, SessionState};
pub use keep_alive::KeepAliveMonitor;
pub use pool::{PoolStats, SessionPool};
