//! Bounded pool of server-side sessions.
//!
//! Pool state (idle stack, active map, pending creations) is guarded by one
//! mutex held only for push/pop/insert/remove. Session creation, deletes and
//! keep-alive streams all run outside it, so a slow RPC never blocks callers
//! leasing or returning other sessions.
//!
//! `active.len() + pending <= size_limit` holds at every point where the
//! mutex is released. `acquire` never waits for capacity: when the limit is
//! reached it fails with [`PoolError::Exhausted`] and callers back off above
//! this layer.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{DriverConfig, PoolConfig};
use crate::retry::{
    Cancelled, Classifier, FailureClass, RetryContext, RetryExecutor, RetryPolicy, TransportCode,
};
use crate::rpc::{CreatedSession, RpcError, SessionId, SessionService};

use super::error::PoolError;
use super::handle::{Liveness, Reclaim, SessionHandle, SessionInfo, SessionState};
use super::keep_alive::KeepAliveMonitor;

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions tracked by the pool (idle + leased).
    pub active: usize,
    pub idle: usize,
    pub leased: usize,
    /// Tracked sessions whose keep-alive already failed.
    pub dead: usize,
    /// Creations in flight.
    pub pending: usize,
    pub size_limit: usize,
    pub closed: bool,
    /// Time since the least recently returned idle session was released.
    pub longest_idle: Option<Duration>,
}

struct TrackedSession {
    node_id: i64,
    liveness: Liveness,
    state: SessionState,
    last_access: Instant,
    monitor: AbortHandle,
}

impl TrackedSession {
    fn state(&self) -> SessionState {
        if self.liveness.is_alive() {
            self.state
        } else {
            SessionState::Invalid
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// LIFO: the most recently returned session is reused first.
    idle: Vec<SessionId>,
    active: HashMap<SessionId, TrackedSession>,
    pending: usize,
    closed: bool,
}

enum Admission {
    Reuse(SessionId, i64, Liveness),
    Create,
    Exhausted { active: usize, pending: usize },
    Closed,
}

struct PoolInner {
    service: Arc<dyn SessionService>,
    state: Mutex<PoolState>,
    size_limit: usize,
    create_timeout: Duration,
    delete_timeout: Duration,
    creator: RetryExecutor,
    operations: RetryExecutor,
    deletes: TaskTracker,
    /// Signalled whenever `pending` drops to zero.
    drained: Notify,
}

/// Counts one in-flight creation; gives the slot back if the creation never
/// gets registered, including when the `acquire` future is dropped.
struct PendingSlot<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl PendingSlot<'_> {
    fn settle(mut self, state: &mut PoolState) {
        self.armed = false;
        self.inner.release_pending(state);
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            self.inner.release_pending(&mut state);
        }
    }
}

impl PoolInner {
    fn release_pending(&self, state: &mut PoolState) {
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once no creation is in flight.
    async fn pending_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.state.lock().pending == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Pop a live idle session or reserve a creation slot. Dead idle sessions
    /// found on the way are removed and handed back for retirement.
    fn admit(&self) -> (Admission, Vec<(SessionId, TrackedSession)>) {
        let mut dead = Vec::new();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return (Admission::Closed, dead);
        }

        while let Some(id) = state.idle.pop() {
            let Some(tracked) = state.active.get_mut(&id) else {
                continue;
            };
            if tracked.liveness.is_alive() {
                tracked.state = SessionState::Leased;
                tracked.last_access = Instant::now();
                let admission = Admission::Reuse(id, tracked.node_id, tracked.liveness.clone());
                return (admission, dead);
            }
            if let Some(tracked) = state.active.remove(&id) {
                dead.push((id, tracked));
            }
        }

        let active = state.active.len();
        if active + state.pending < self.size_limit {
            state.pending += 1;
            (Admission::Create, dead)
        } else {
            (
                Admission::Exhausted {
                    active,
                    pending: state.pending,
                },
                dead,
            )
        }
    }

    async fn create(&self, cancel: &CancellationToken) -> Result<CreatedSession, RpcError> {
        let service = Arc::clone(&self.service);
        let timeout = self.create_timeout;
        self.creator
            .execute(true, cancel, move |_| {
                let service = Arc::clone(&service);
                async move {
                    match tokio::time::timeout(timeout, service.create_session()).await {
                        Ok(result) => result,
                        Err(_) => Err(RpcError::transport(
                            TransportCode::DeadlineExceeded,
                            "session creation timed out",
                        )),
                    }
                }
            })
            .await
    }

    fn invalidate(&self, id: &SessionId) {
        let removed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let removed = state.active.remove(id);
            if removed.is_some() {
                state.idle.retain(|idle| idle != id);
            }
            removed
        };
        if let Some(tracked) = removed {
            self.retire(id.clone(), tracked, "invalidated");
        }
    }

    fn retire(&self, id: SessionId, tracked: TrackedSession, reason: &str) {
        tracked.monitor.abort();
        tracing::debug!(session_id = %id, node_id = tracked.node_id, reason, "retiring session");
        self.spawn_delete(id);
    }

    /// Fire-and-forget delete, tracked so `close` can wait for it.
    fn spawn_delete(&self, id: SessionId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session_id = %id, "no async runtime; skipping session delete");
            return;
        };
        let service = Arc::clone(&self.service);
        self.deletes
            .spawn_on(delete_session(service, id, self.delete_timeout), &runtime);
    }
}

impl Reclaim for PoolInner {
    fn reclaim(&self, id: &SessionId) {
        self.invalidate(id);
    }
}

/// Best-effort, time-bounded `DeleteSession`. Failures are logged only.
async fn delete_session(service: Arc<dyn SessionService>, id: SessionId, timeout: Duration) {
    match tokio::time::timeout(timeout, service.delete_session(&id)).await {
        Ok(Ok(())) => tracing::debug!(session_id = %id, "session deleted"),
        Ok(Err(e)) => tracing::warn!(session_id = %id, error = %e, "session delete failed"),
        Err(_) => tracing::warn!(session_id = %id, "session delete timed out"),
    }
}

/// Shared, cloneable handle to a bounded session pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl SessionPool {
    /// Build a pool from explicit configuration.
    pub fn new(service: Arc<dyn SessionService>, config: &DriverConfig) -> Self {
        Self::with_classifier(service, config, Arc::new(Classifier::new()))
    }

    /// Build a pool whose retry decisions use a caller-supplied classifier.
    pub fn with_classifier(
        service: Arc<dyn SessionService>,
        config: &DriverConfig,
        classifier: Arc<Classifier>,
    ) -> Self {
        let creation = RetryPolicy::for_session_creation(
            &config.retry,
            config.pool.creation_max_attempts,
        );
        let operations = RetryPolicy::from_config(&config.retry);
        Self::with_executors(
            service,
            &config.pool,
            RetryExecutor::new(creation, Arc::clone(&classifier)),
            RetryExecutor::new(operations, classifier),
        )
    }

    /// Build a pool with fully specified executors for session creation and
    /// for operations run through [`SessionPool::execute`].
    pub fn with_executors(
        service: Arc<dyn SessionService>,
        config: &PoolConfig,
        creator: RetryExecutor,
        operations: RetryExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                service,
                state: Mutex::new(PoolState::default()),
                size_limit: config.size_limit.max(1),
                create_timeout: Duration::from_millis(config.create_timeout_ms),
                delete_timeout: Duration::from_millis(config.delete_timeout_ms),
                creator,
                operations,
                deletes: TaskTracker::new(),
                drained: Notify::new(),
            }),
        }
    }

    pub fn size_limit(&self) -> usize {
        self.inner.size_limit
    }

    /// Lease a session: the most recently returned idle one, or a new one if
    /// there is spare capacity.
    ///
    /// Fails immediately with [`PoolError::Exhausted`] at capacity and with
    /// [`PoolError::CreationFailed`] when creation exhausts its retries.
    /// `cancel` bounds only the in-flight creation.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SessionHandle, PoolError> {
        let (admission, dead) = self.inner.admit();
        for (id, tracked) in dead {
            self.inner.retire(id, tracked, "died while idle");
        }

        match admission {
            Admission::Reuse(id, node_id, liveness) => {
                tracing::trace!(session_id = %id, "reusing idle session");
                Ok(self.lease(id, node_id, liveness))
            }
            Admission::Closed => Err(PoolError::Closed),
            Admission::Exhausted { active, pending } => Err(PoolError::Exhausted {
                active,
                pending,
                limit: self.inner.size_limit,
            }),
            Admission::Create => {
                let slot = PendingSlot {
                    inner: &self.inner,
                    armed: true,
                };
                let created = match self.inner.create(cancel).await {
                    Ok(created) => created,
                    Err(RpcError::Cancelled) => return Err(PoolError::Cancelled),
                    Err(e) => {
                        let class = self.inner.creator.classifier().classify(&e).class();
                        tracing::warn!(error = %e, %class, "session creation failed");
                        return Err(PoolError::CreationFailed {
                            source: e,
                            retries_exhausted: class != FailureClass::NonRetryable,
                        });
                    }
                };
                self.register(slot, created)
            }
        }
    }

    fn register(
        &self,
        slot: PendingSlot<'_>,
        created: CreatedSession,
    ) -> Result<SessionHandle, PoolError> {
        let liveness = Liveness::new();
        let monitor = KeepAliveMonitor::spawn(
            Arc::clone(&self.inner.service),
            created.id.clone(),
            liveness.clone(),
        );

        let mut guard = self.inner.state.lock();
        if guard.closed {
            drop(guard);
            // Closed while the creation was in flight. The delete is tracked
            // before the slot is given back, so `close` waits for it.
            monitor.abort();
            self.inner.spawn_delete(created.id);
            drop(slot);
            return Err(PoolError::Closed);
        }

        let state = &mut *guard;
        slot.settle(state);
        state.active.insert(
            created.id.clone(),
            TrackedSession {
                node_id: created.node_id,
                liveness: liveness.clone(),
                state: SessionState::Leased,
                last_access: Instant::now(),
                monitor,
            },
        );
        drop(guard);
        tracing::debug!(session_id = %created.id, node_id = created.node_id, "session created");
        Ok(self.lease(created.id, created.node_id, liveness))
    }

    fn lease(&self, id: SessionId, node_id: i64, liveness: Liveness) -> SessionHandle {
        let pool = Arc::downgrade(&self.inner) as Weak<dyn Reclaim>;
        SessionHandle::new(id, node_id, liveness, pool)
    }

    /// Return a leased session. Live sessions go back on the idle stack; a
    /// session whose keep-alive failed during the lease is retired instead.
    pub fn release(&self, mut handle: SessionHandle) {
        handle.disarm();
        let id = handle.id();
        let retired = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let keep = match state.active.get_mut(id) {
                Some(tracked) if tracked.state == SessionState::Leased => {
                    if tracked.liveness.is_alive() {
                        tracked.state = SessionState::Idle;
                        tracked.last_access = Instant::now();
                        Some(true)
                    } else {
                        Some(false)
                    }
                }
                _ => None,
            };
            match keep {
                Some(true) => {
                    state.idle.push(id.clone());
                    None
                }
                Some(false) => state.active.remove(id),
                None => None,
            }
        };
        if let Some(tracked) = retired {
            self.inner
                .retire(id.clone(), tracked, "released after keep-alive failure");
        }
    }

    /// Discard a leased session and delete it on the server.
    pub fn invalidate(&self, mut handle: SessionHandle) {
        handle.disarm();
        self.inner.invalidate(handle.id());
    }

    /// Discard a session by id. Unknown ids are ignored; never fails.
    pub fn invalidate_id(&self, id: &SessionId) {
        self.inner.invalidate(id);
    }

    /// Close the pool: later `acquire` calls fail with [`PoolError::Closed`],
    /// and every tracked session is deleted before this returns, along with
    /// any delete already started by `invalidate`. Creations still in flight
    /// are awaited and their sessions deleted too.
    ///
    /// Do not call while other tasks still hold leased sessions.
    pub async fn close(&self) {
        let drained: Vec<(SessionId, TrackedSession)> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.closed = true;
            state.idle.clear();
            state.active.drain().collect()
        };
        if !drained.is_empty() {
            tracing::info!(sessions = drained.len(), "closing session pool");
        }

        let deletes = drained.into_iter().map(|(id, tracked)| {
            tracked.monitor.abort();
            delete_session(Arc::clone(&self.inner.service), id, self.inner.delete_timeout)
        });
        futures::future::join_all(deletes).await;

        self.inner.pending_drained().await;
        self.inner.deletes.close();
        self.inner.deletes.wait().await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut leased = 0;
        let mut dead = 0;
        for tracked in state.active.values() {
            match tracked.state() {
                SessionState::Leased => leased += 1,
                SessionState::Invalid => dead += 1,
                SessionState::Idle => {}
            }
        }
        let now = Instant::now();
        let longest_idle = state
            .idle
            .iter()
            .filter_map(|id| state.active.get(id))
            .map(|tracked| now.saturating_duration_since(tracked.last_access))
            .max();
        PoolStats {
            active: state.active.len(),
            idle: state.idle.len(),
            leased,
            dead,
            pending: state.pending,
            size_limit: self.inner.size_limit,
            closed: state.closed,
            longest_idle,
        }
    }

    /// Run `op` on a pooled session with retries.
    ///
    /// Each attempt leases a session, runs `op` with its descriptor and then
    /// returns the session, or discards it when the failure points at the
    /// session or the transport. Retry decisions use the pool's operation
    /// policy and `idempotent`. Pool errors, including capacity exhaustion,
    /// are returned at once without retrying.
    pub async fn execute<T, E, F, Fut>(
        &self,
        idempotent: bool,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(SessionInfo, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + From<PoolError> + From<Cancelled> + 'static,
    {
        let executor = &self.inner.operations;
        let mut ctx = RetryContext::new(idempotent);
        loop {
            if cancel.is_cancelled() {
                return Err(E::from(Cancelled));
            }
            let session = self.acquire(cancel).await.map_err(|e| match e {
                PoolError::Cancelled => E::from(Cancelled),
                other => E::from(other),
            })?;
            let info = session.info();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.invalidate(session);
                    return Err(E::from(Cancelled));
                }
                result = op(info, cancel.clone()) => result,
            };
            let err = match result {
                Ok(value) => {
                    self.release(session);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let record = executor.assess(&err, &ctx);
            if record.invalidates_session {
                self.invalidate(session);
            } else {
                self.release(session);
            }
            let Some(delay) = record.delay else {
                return Err(err);
            };
            executor.pause(delay, cancel).await.map_err(E::from)?;
            ctx.advance();
        }
    }
}
