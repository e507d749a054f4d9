//! In-memory cluster implementing [`SessionService`] for tests and demos.
//!
//! Sessions live in a map; each attach stream is an unbounded channel the
//! test can push statuses into or close. Creation latency, scripted creation
//! and operation failures, and a random transient-failure rate can be set.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::retry::StatusCode;
use crate::rpc::{CreatedSession, RpcError, SessionId, SessionService, SessionStatus, StatusStream};
use crate::session::SessionInfo;

const NODES: i64 = 3;

type StatusSender = mpsc::UnboundedSender<Result<SessionStatus, RpcError>>;

/// Counters observed by the simulated server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Calls to `create_session`, including failed ones.
    pub create_calls: u64,
    pub created: u64,
    pub deleted: u64,
    /// Sessions that exist server-side (created and not yet deleted).
    pub live: usize,
    /// Highest `live + creations in flight` ever observed.
    pub peak_load: usize,
    /// Successful operations.
    pub operations: u64,
}

struct SimSession {
    node_id: i64,
    alive: bool,
    attach: Option<StatusSender>,
}

struct SimState {
    sessions: HashMap<SessionId, SimSession>,
    create_failures: VecDeque<RpcError>,
    operation_failures: VecDeque<RpcError>,
    operation_failure_rate: f64,
    rng: fastrand::Rng,
    creating: usize,
    stats: SimStats,
}

impl SimState {
    fn kill(&mut self, id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.alive = false;
            session.attach = None;
        }
    }
}

/// Simulated database cluster.
pub struct SimulatedCluster {
    state: Mutex<SimState>,
    next_id: AtomicU64,
    create_latency: Duration,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight creation count even if the create future is dropped.
struct CreatingGuard<'a>(&'a Mutex<SimState>);

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.creating = state.creating.saturating_sub(1);
    }
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                sessions: HashMap::new(),
                create_failures: VecDeque::new(),
                operation_failures: VecDeque::new(),
                operation_failure_rate: 0.0,
                rng: fastrand::Rng::new(),
                creating: 0,
                stats: SimStats::default(),
            }),
            next_id: AtomicU64::new(1),
            create_latency: Duration::ZERO,
        }
    }

    /// Delay every `create_session` call by `latency`.
    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.create_latency = latency;
        self
    }

    /// Seed the generator behind the random failure rate.
    pub fn with_seed(self, seed: u64) -> Self {
        self.state.lock().rng = fastrand::Rng::with_seed(seed);
        self
    }

    /// The next `create_session` calls fail with these errors, in order.
    pub fn fail_next_creates(&self, errors: impl IntoIterator<Item = RpcError>) {
        self.state.lock().create_failures.extend(errors);
    }

    /// The next `run_operation` calls fail with these errors, in order.
    /// Session-level statuses also kill the session they ran on.
    pub fn fail_next_operations(&self, errors: impl IntoIterator<Item = RpcError>) {
        self.state.lock().operation_failures.extend(errors);
    }

    /// Fraction (0.0..=1.0) of operations failing with a random transient status.
    pub fn set_operation_failure_rate(&self, rate: f64) {
        self.state.lock().operation_failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Push a status onto the session's attach stream, if attached.
    pub fn send_status(&self, id: &SessionId, status: SessionStatus) {
        let state = self.state.lock();
        if let Some(tx) = state.sessions.get(id).and_then(|s| s.attach.as_ref()) {
            let _ = tx.unbounded_send(Ok(status));
        }
    }

    /// Kill a session server-side: its attach stream ends and operations on
    /// it fail with `BadSession`. It still counts as live until deleted.
    pub fn kill_session(&self, id: &SessionId) {
        self.state.lock().kill(id);
    }

    pub fn is_attached(&self, id: &SessionId) -> bool {
        self.state
            .lock()
            .sessions
            .get(id)
            .is_some_and(|s| s.attach.is_some())
    }

    /// Wait until a keep-alive stream is attached to `id`.
    pub async fn wait_attached(&self, id: &SessionId) {
        while !self.is_attached(id) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn stats(&self) -> SimStats {
        let state = self.state.lock();
        SimStats {
            live: state.sessions.len(),
            ..state.stats
        }
    }

    /// Execute a unit of work on `session`.
    pub async fn run_operation(&self, session: &SessionInfo) -> Result<u64, RpcError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(err) = state.operation_failures.pop_front() {
            if is_session_status(&err) {
                state.kill(&session.id);
            }
            return Err(err);
        }

        match state.sessions.get(&session.id) {
            Some(s) if s.alive => {}
            _ => {
                return Err(RpcError::status(
                    StatusCode::BadSession,
                    format!("session {} not found", session.id),
                ))
            }
        }

        if state.operation_failure_rate > 0.0 && state.rng.f64() < state.operation_failure_rate {
            let status = match state.rng.u8(0..4) {
                0 => StatusCode::Unavailable,
                1 => StatusCode::Overloaded,
                2 => StatusCode::Aborted,
                _ => StatusCode::BadSession,
            };
            if status == StatusCode::BadSession {
                state.kill(&session.id);
            }
            return Err(RpcError::status(status, "injected failure"));
        }

        state.stats.operations += 1;
        Ok(state.stats.operations)
    }
}

fn is_session_status(err: &RpcError) -> bool {
    matches!(
        err,
        RpcError::Status {
            status: StatusCode::BadSession | StatusCode::SessionExpired | StatusCode::SessionBusy,
            ..
        }
    )
}

#[async_trait]
impl SessionService for SimulatedCluster {
    async fn create_session(&self) -> Result<CreatedSession, RpcError> {
        {
            let mut state = self.state.lock();
            state.stats.create_calls += 1;
            state.creating += 1;
            let load = state.sessions.len() + state.creating;
            state.stats.peak_load = state.stats.peak_load.max(load);
        }
        let _creating = CreatingGuard(&self.state);

        if !self.create_latency.is_zero() {
            tokio::time::sleep(self.create_latency).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = SessionId::new(format!("sim-{n}"));
        let node_id = (n as i64 % NODES) + 1;
        state.sessions.insert(
            id.clone(),
            SimSession {
                node_id,
                alive: true,
                attach: None,
            },
        );
        state.stats.created += 1;
        Ok(CreatedSession { id, node_id })
    }

    async fn attach_session(&self, id: &SessionId) -> Result<StatusStream, RpcError> {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(id).filter(|s| s.alive) else {
            return Err(RpcError::status(
                StatusCode::BadSession,
                format!("session {id} not found"),
            ));
        };
        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(Ok(SessionStatus::Ready));
        session.attach = Some(tx);
        tracing::trace!(session_id = %id, node_id = session.node_id, "attached");
        Ok(rx.boxed())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        match state.sessions.remove(id) {
            Some(_) => {
                state.stats.deleted += 1;
                Ok(())
            }
            None => Err(RpcError::status(
                StatusCode::NotFound,
                format!("session {id} not found"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_attach_delete_lifecycle() {
        let cluster = SimulatedCluster::new();
        let created = cluster.create_session().await.unwrap();
        assert_eq!(cluster.stats().live, 1);

        let mut stream = cluster.attach_session(&created.id).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), SessionStatus::Ready);

        cluster.delete_session(&created.id).await.unwrap();
        assert!(stream.next().await.is_none());
        let stats = cluster.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.deleted, 1);
        assert!(cluster.delete_session(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn scripted_create_failures_are_consumed_in_order() {
        let cluster = SimulatedCluster::new();
        cluster.fail_next_creates([
            RpcError::status(StatusCode::Overloaded, "first"),
            RpcError::status(StatusCode::Unavailable, "second"),
        ]);
        assert!(matches!(
            cluster.create_session().await,
            Err(RpcError::Status { status: StatusCode::Overloaded, .. })
        ));
        assert!(matches!(
            cluster.create_session().await,
            Err(RpcError::Status { status: StatusCode::Unavailable, .. })
        ));
        assert!(cluster.create_session().await.is_ok());
        assert_eq!(cluster.stats().create_calls, 3);
    }

    #[tokio::test]
    async fn operations_fail_on_killed_session() {
        let cluster = SimulatedCluster::new();
        let created = cluster.create_session().await.unwrap();
        let info = SessionInfo {
            id: created.id.clone(),
            node_id: created.node_id,
        };
        assert_eq!(cluster.run_operation(&info).await.unwrap(), 1);
        cluster.kill_session(&created.id);
        assert!(matches!(
            cluster.run_operation(&info).await,
            Err(RpcError::Status { status: StatusCode::BadSession, .. })
        ));
        assert!(cluster.attach_session(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn full_failure_rate_always_fails() {
        let cluster = SimulatedCluster::new().with_seed(11);
        cluster.set_operation_failure_rate(1.0);
        let created = cluster.create_session().await.unwrap();
        let info = SessionInfo {
            id: created.id,
            node_id: created.node_id,
        };
        for _ in 0..10 {
            if cluster.run_operation(&info).await.is_ok() {
                panic!("operation should have failed");
            }
        }
    }
}
