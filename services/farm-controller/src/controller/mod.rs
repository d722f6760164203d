//! Event-driven dispatch of reconcilers.
//!
//! One queue per kind feeds a bounded pool of workers. The router turns
//! control-plane events and periodic resyncs into queue entries.

mod queue;
mod routing;
mod worker;

pub use queue::WorkQueue;
pub use routing::Router;
pub use worker::{settle, Followup, KindWorker, Reconcile};

use std::sync::Arc;
use std::time::Duration;

use droidfarm_reconcile::FailureBackoff;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::api::{Device, DeviceJob, Farm, Resource};
use crate::store::Client;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub resync_interval: Duration,
    pub max_concurrent_reconciles: usize,
    pub error_backoff: Duration,
    pub max_error_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            resync_interval: droidfarm_reconcile::DEFAULT_RESYNC_INTERVAL,
            max_concurrent_reconciles: 8,
            error_backoff: droidfarm_reconcile::DEFAULT_ERROR_BACKOFF,
            max_error_backoff: droidfarm_reconcile::DEFAULT_MAX_ERROR_BACKOFF,
        }
    }
}

/// Owns the per-kind queues, their workers and the event router.
pub struct Dispatcher {
    router: Router,
    workers: Vec<KindWorker>,
    resync_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        client: Client,
        config: &DispatcherConfig,
        farms: Arc<dyn Reconcile>,
        devices: Arc<dyn Reconcile>,
        jobs: Arc<dyn Reconcile>,
    ) -> Self {
        let (farm_queue, device_queue, job_queue) =
            (WorkQueue::new(), WorkQueue::new(), WorkQueue::new());
        let backoff = || FailureBackoff::new(config.error_backoff, config.max_error_backoff);
        let worker = |kind, queue: &Arc<WorkQueue>, reconciler| {
            KindWorker::new(
                kind,
                Arc::clone(queue),
                reconciler,
                config.max_concurrent_reconciles,
                backoff(),
            )
        };
        let workers = vec![
            worker(Farm::KIND, &farm_queue, farms),
            worker(Device::KIND, &device_queue, devices),
            worker(DeviceJob::KIND, &job_queue, jobs),
        ];
        Self {
            router: Router::new(client, farm_queue, device_queue, job_queue),
            workers,
            resync_interval: config.resync_interval,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Runs every worker and the router until shutdown is signalled.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        for worker in self.workers {
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.run(shutdown).await });
        }
        let router = self.router.clone();
        let resync_interval = self.resync_interval;
        tasks.spawn(async move { router.run(resync_interval, shutdown).await });

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "dispatcher task panicked");
            }
        }
        info!("Dispatcher stopped");
    }
}
