//! Background liveness monitoring for one session.
//!
//! The monitor attaches to the session's status stream and flips the shared
//! [`Liveness`] flag once the server reports the session unusable or the
//! stream ends. It never reconnects: a dead session is retired and the pool
//! creates a fresh one when capacity is needed.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::AbortHandle;

use crate::rpc::{SessionId, SessionService, SessionStatus};

use super::handle::Liveness;

/// Supervised keep-alive task for a single session.
pub struct KeepAliveMonitor;

impl KeepAliveMonitor {
    /// Spawn the monitor on the current runtime. The returned handle lets the
    /// owner stop it when the session is retired.
    pub fn spawn(
        service: Arc<dyn SessionService>,
        id: SessionId,
        liveness: Liveness,
    ) -> AbortHandle {
        tokio::spawn(Self::run(service, id, liveness)).abort_handle()
    }

    /// Monitor loop. Returns once the session is known to be dead.
    pub async fn run(service: Arc<dyn SessionService>, id: SessionId, liveness: Liveness) {
        let mut stream = match service.attach_session(&id).await {
            Ok(stream) => stream,
            Err(e) => {
                retire(&id, &liveness, &format!("attach failed: {e}"));
                return;
            }
        };

        while let Some(message) = stream.next().await {
            match message {
                Ok(SessionStatus::Ready) => {
                    tracing::trace!(session_id = %id, "session keep-alive ok");
                }
                Ok(SessionStatus::Unusable(status)) => {
                    retire(&id, &liveness, &format!("server reported {status}"));
                    return;
                }
                Err(e) => {
                    retire(&id, &liveness, &format!("stream error: {e}"));
                    return;
                }
            }
        }

        retire(&id, &liveness, "stream closed");
    }
}

fn retire(id: &SessionId, liveness: &Liveness, reason: &str) {
    if liveness.mark_dead() {
        tracing::info!(session_id = %id, reason, "session marked dead");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::StatusCode;
    use crate::sim::SimulatedCluster;
    use std::time::Duration;

    async fn wait_dead(liveness: &Liveness) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while liveness.is_alive() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("liveness never flipped");
    }

    #[tokio::test]
    async fn healthy_messages_keep_session_alive() {
        let cluster = Arc::new(SimulatedCluster::new());
        let created = cluster.create_session().await.unwrap();
        let liveness = Liveness::new();
        let monitor = KeepAliveMonitor::spawn(cluster.clone(), created.id.clone(), liveness.clone());

        cluster.wait_attached(&created.id).await;
        cluster.send_status(&created.id, SessionStatus::Ready);
        cluster.send_status(&created.id, SessionStatus::Ready);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(liveness.is_alive());
        monitor.abort();
    }

    #[tokio::test]
    async fn unusable_status_flips_liveness() {
        let cluster = Arc::new(SimulatedCluster::new());
        let created = cluster.create_session().await.unwrap();
        let liveness = Liveness::new();
        KeepAliveMonitor::spawn(cluster.clone(), created.id.clone(), liveness.clone());

        cluster.wait_attached(&created.id).await;
        cluster.send_status(&created.id, SessionStatus::Unusable(StatusCode::SessionExpired));
        wait_dead(&liveness).await;
    }

    #[tokio::test]
    async fn stream_termination_flips_liveness() {
        let cluster = Arc::new(SimulatedCluster::new());
        let created = cluster.create_session().await.unwrap();
        let liveness = Liveness::new();
        KeepAliveMonitor::spawn(cluster.clone(), created.id.clone(), liveness.clone());

        cluster.wait_attached(&created.id).await;
        cluster.kill_session(&created.id);
        wait_dead(&liveness).await;
    }

    #[tokio::test]
    async fn attach_failure_flips_liveness() {
        let cluster = Arc::new(SimulatedCluster::new());
        let liveness = Liveness::new();
        KeepAliveMonitor::run(cluster, SessionId::from("missing"), liveness.clone()).await;
        assert!(!liveness.is_alive());
    }
}
