//! Leased session handles and their liveness flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::rpc::SessionId;

/// Shared liveness flag. Written only by the session's keep-alive monitor,
/// read by the pool on release.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Flip to dead. Returns `true` only for the call that made the transition.
    pub fn mark_dead(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Lifecycle state of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Leased,
    Invalid,
}

/// Cheap description of a session, handed to operations run on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub node_id: i64,
}

/// Implemented by the pool so a dropped lease can be reclaimed.
pub(crate) trait Reclaim: Send + Sync {
    fn reclaim(&self, id: &SessionId);
}

/// A session leased from the pool.
///
/// The caller owns it until it is passed back to
/// [`SessionPool::release`](super::SessionPool::release) or
/// [`SessionPool::invalidate`](super::SessionPool::invalidate). A handle
/// dropped without either is invalidated.
pub struct SessionHandle {
    id: SessionId,
    node_id: i64,
    liveness: Liveness,
    leased_at: Instant,
    pool: Option<Weak<dyn Reclaim>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("alive", &self.liveness.is_alive())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        node_id: i64,
        liveness: Liveness,
        pool: Weak<dyn Reclaim>,
    ) -> Self {
        Self {
            id,
            node_id,
            liveness,
            leased_at: Instant::now(),
            pool: Some(pool),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Node owning the session.
    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    /// False once the keep-alive monitor has seen the session die.
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    pub fn leased_at(&self) -> Instant {
        self.leased_at
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            node_id: self.node_id,
        }
    }

    /// Detach from the pool so dropping the handle does nothing further.
    pub(crate) fn disarm(&mut self) {
        self.pool = None;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            tracing::debug!(session_id = %self.id, "session lease dropped without release; invalidating");
            pool.reclaim(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SessionId>>);

    impl Reclaim for Recorder {
        fn reclaim(&self, id: &SessionId) {
            self.0.lock().push(id.clone());
        }
    }

    #[test]
    fn mark_dead_transitions_once() {
        let liveness = Liveness::new();
        let observer = liveness.clone();
        assert!(observer.is_alive());
        assert!(liveness.mark_dead());
        assert!(!liveness.mark_dead());
        assert!(!observer.is_alive());
    }

    #[test]
    fn dropped_lease_is_reclaimed() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Reclaim> = Arc::downgrade(&recorder) as Weak<dyn Reclaim>;
        let handle = SessionHandle::new(SessionId::from("s-1"), 3, Liveness::new(), weak);
        drop(handle);
        assert_eq!(recorder.0.lock().as_slice(), &[SessionId::from("s-1")]);
    }

    #[test]
    fn disarmed_lease_is_not_reclaimed() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Reclaim> = Arc::downgrade(&recorder) as Weak<dyn Reclaim>;
        let mut handle = SessionHandle::new(SessionId::from("s-2"), 3, Liveness::new(), weak);
        assert_eq!(handle.info().node_id, 3);
        handle.disarm();
        drop(handle);
        assert!(recorder.0.lock().is_empty());
    }
}
