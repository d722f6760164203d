//! Per-kind dispatch loop.

use std::sync::Arc;

use async_trait::async_trait;
use droidfarm_id::ObjectKey;
use droidfarm_reconcile::{FailureBackoff, ReconcileError, ReconcileResult};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info, instrument};

use super::queue::WorkQueue;
use crate::device::DeviceReconciler;
use crate::farm::FarmReconciler;
use crate::jobs::DeviceJobRunner;

/// Something that converges one object identity.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<()>;
}

#[async_trait]
impl Reconcile for FarmReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<()> {
        FarmReconciler::reconcile(self, key).await
    }
}

#[async_trait]
impl Reconcile for DeviceReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<()> {
        DeviceReconciler::reconcile(self, key).await
    }
}

#[async_trait]
impl Reconcile for DeviceJobRunner {
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<()> {
        DeviceJobRunner::reconcile(self, key).await
    }
}

/// What the dispatcher does after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    /// Converged; wait for the next event.
    Idle,
    /// Run again after the delay.
    RunAfter(std::time::Duration),
}

/// Drains one kind's queue into its reconciler.
pub struct KindWorker {
    kind: &'static str,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
    permits: Arc<Semaphore>,
    backoff: Arc<Mutex<FailureBackoff>>,
}

impl KindWorker {
    pub fn new(
        kind: &'static str,
        queue: Arc<WorkQueue>,
        reconciler: Arc<dyn Reconcile>,
        max_concurrent: usize,
        backoff: FailureBackoff,
    ) -> Self {
        Self {
            kind,
            queue,
            reconciler,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            backoff: Arc::new(Mutex::new(backoff)),
        }
    }

    /// Runs until shutdown. A permit is taken before a key, so a worker at
    /// its concurrency limit still observes shutdown.
    #[instrument(skip(self, shutdown), fields(kind = self.kind))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting reconcile worker");
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if stopping(changed.is_err(), &shutdown) {
                        break;
                    }
                    continue;
                }
            };
            let key = tokio::select! {
                key = self.queue.next() => key,
                changed = shutdown.changed() => {
                    if stopping(changed.is_err(), &shutdown) {
                        break;
                    }
                    continue;
                }
            };

            let kind = self.kind;
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            let backoff = Arc::clone(&self.backoff);
            tokio::spawn(async move {
                let result = reconciler.reconcile(&key).await;
                let followup = settle(kind, &key, result, &backoff).await;
                queue.done(&key).await;
                if let Followup::RunAfter(delay) = followup {
                    queue.add_after(key, delay);
                }
                drop(permit);
            });
        }
    }
}

fn stopping(closed: bool, shutdown: &watch::Receiver<bool>) -> bool {
    if closed || *shutdown.borrow() {
        info!("Reconcile worker shutting down");
        return true;
    }
    false
}

/// Turns a reconcile outcome into a followup, tracking fatal-error backoff
/// per key.
pub async fn settle(
    kind: &str,
    key: &ObjectKey,
    result: ReconcileResult<()>,
    backoff: &Mutex<FailureBackoff>,
) -> Followup {
    let id = format!("{kind}/{key}");
    match result {
        Ok(()) => {
            backoff.lock().await.clear(&id);
            debug!(kind, %key, "reconciled");
            Followup::Idle
        }
        Err(ReconcileError::Requeue(signal)) => {
            debug!(kind, %key, %signal, "requeue");
            Followup::RunAfter(signal.after)
        }
        Err(e) => {
            let delay = {
                let mut backoff = backoff.lock().await;
                backoff.prune();
                backoff.record_failure(&id)
            };
            error!(kind, %key, error = %e, retry_in = ?delay, "reconcile failed");
            Followup::RunAfter(delay)
        }
    }
}
