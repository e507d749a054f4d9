//! `dbdriver stress` – drive a concurrent workload through the session pool
//! against the in-memory simulated cluster.

use anyhow::{bail, Result};
use dbdriver_core::config::DriverConfig;
use dbdriver_core::session::SessionPool;
use dbdriver_core::sim::SimulatedCluster;
use dbdriver_core::DriverError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct StressOptions {
    pub workers: usize,
    pub operations: usize,
    pub failure_rate: f64,
    pub pool_size: Option<usize>,
    pub seed: Option<u64>,
    pub idempotent: bool,
}

/// Per-worker outcome counts.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    ok: u64,
    exhausted: u64,
    failed: u64,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.ok += other.ok;
        self.exhausted += other.exhausted;
        self.failed += other.failed;
    }
}

async fn worker(
    pool: SessionPool,
    cluster: Arc<SimulatedCluster>,
    operations: usize,
    idempotent: bool,
    cancel: CancellationToken,
) -> Tally {
    let mut tally = Tally::default();
    for _ in 0..operations {
        let result: Result<u64, DriverError> = pool
            .execute(idempotent, &cancel, |session, _| {
                let cluster = Arc::clone(&cluster);
                async move { cluster.run_operation(&session).await.map_err(DriverError::from) }
            })
            .await;
        match result {
            Ok(_) => tally.ok += 1,
            Err(DriverError::Pool(e)) if e.is_resource_exhausted() => {
                tally.exhausted += 1;
                // Pool is full or creation is failing; back off before the next op.
                tokio::time::sleep(Duration::from_millis(fastrand::u64(1..=10))).await;
            }
            Err(DriverError::Cancelled) => break,
            Err(e) => {
                tracing::warn!(error = %e, "operation failed");
                tally.failed += 1;
            }
        }
    }
    tally
}

pub async fn run_stress(cfg: &DriverConfig, opts: StressOptions) -> Result<()> {
    if !(0.0..=1.0).contains(&opts.failure_rate) {
        bail!("--failure-rate must be between 0.0 and 1.0, got {}", opts.failure_rate);
    }
    if opts.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let mut cfg = cfg.clone();
    if let Some(size) = opts.pool_size {
        cfg.pool.size_limit = size;
    }

    let mut cluster = SimulatedCluster::new();
    if let Some(seed) = opts.seed {
        cluster = cluster.with_seed(seed);
    }
    let cluster = Arc::new(cluster);
    cluster.set_operation_failure_rate(opts.failure_rate);

    let pool = SessionPool::new(cluster.clone(), &cfg);
    let cancel = CancellationToken::new();
    tracing::info!(
        workers = opts.workers,
        operations = opts.operations,
        pool_size = pool.size_limit(),
        "starting stress run"
    );

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for _ in 0..opts.workers {
        tasks.spawn(worker(
            pool.clone(),
            Arc::clone(&cluster),
            opts.operations,
            opts.idempotent,
            cancel.clone(),
        ));
    }

    let mut total = Tally::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(tally) => total.merge(tally),
            Err(e) => tracing::error!("stress worker panicked: {e}"),
        }
    }
    let elapsed = started.elapsed();

    let pool_stats = pool.stats();
    pool.close().await;
    let sim = cluster.stats();

    let secs = elapsed.as_secs_f64().max(0.001);
    println!(
        "operations: {} ok, {} rejected (pool exhausted), {} failed in {:.2}s ({:.0} ops/s)",
        total.ok,
        total.exhausted,
        total.failed,
        secs,
        total.ok as f64 / secs
    );
    println!(
        "pool: limit {}, {} active, {} idle at end",
        pool_stats.size_limit, pool_stats.active, pool_stats.idle
    );
    println!(
        "server: {} sessions created ({} create calls), {} deleted, {} left, peak load {}",
        sim.created, sim.create_calls, sim.deleted, sim.live, sim.peak_load
    );

    Ok(())
}
