use std::sync::Arc;
use std::time::Duration;

use droidfarm_id::ObjectKey;
use droidfarm_reconcile::{ReconcileError, ReconcileResult, SHORT_REQUEUE};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::template::render_command;
use crate::adb::{DeviceControl, DeviceControlError, DeviceControlResult, Session};
use crate::api::{
    Activity, DeviceJob, DeviceRunStatus, JobTemplate, JobTemplateSpec, Pod, Resource, RunPhase,
};
use crate::apply::persist;
use crate::store::Client;

type StatusUpdate = (String, DeviceRunStatus);
type WorkerFailure = (String, DeviceControlError);

/// Hands a device's outcome to the collector. Returns false when the
/// collector has gone away.
async fn report(
    device: &str,
    outcome: DeviceControlResult<DeviceRunStatus>,
    status_tx: &mpsc::Sender<StatusUpdate>,
    error_tx: &mpsc::Sender<WorkerFailure>,
) -> bool {
    let sent = match outcome {
        Ok(status) => status_tx.send((device.to_string(), status)).await.is_ok(),
        Err(e) => error_tx.send((device.to_string(), e)).await.is_ok(),
    };
    if !sent {
        debug!(device, "job collector closed, dropping device outcome");
    }
    sent
}

/// Runs a DeviceJob's template against each of its target pods in parallel.
#[derive(Clone)]
pub struct DeviceJobRunner {
    client: Client,
    devices: Arc<dyn DeviceControl>,
}

impl DeviceJobRunner {
    pub fn new(client: Client, devices: Arc<dyn DeviceControl>) -> Self {
        Self { client, devices }
    }

    #[instrument(skip(self), fields(job = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<()> {
        let Some(mut job) = self.client.get_opt::<DeviceJob>(key).await? else {
            debug!("device job no longer exists");
            return Ok(());
        };
        let template: JobTemplate = self
            .client
            .get(&ObjectKey::cluster(job.spec.job_template.clone()))
            .await?;
        let targets = self.target_pods(&job).await?;

        let (status_tx, mut status_rx) = mpsc::channel::<StatusUpdate>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<WorkerFailure>(1);
        let template = Arc::new(template.spec);
        let mut workers = JoinSet::new();
        for pod in targets {
            let finished = job.phase_of(&pod.metadata.name).is_finished();
            let devices = Arc::clone(&self.devices);
            let template = Arc::clone(&template);
            let status_tx = status_tx.clone();
            let error_tx = error_tx.clone();
            workers.spawn(async move {
                if finished {
                    debug!(device = %pod.metadata.name, "already finished, skipping");
                    return;
                }
                let outcome = run_on_device(devices.as_ref(), &pod, &template).await;
                report(&pod.metadata.name, outcome, &status_tx, &error_tx).await;
            });
        }
        drop(status_tx);
        drop(error_tx);

        let before = job.status.clone();
        let mut failed = false;
        let (mut statuses_open, mut errors_open) = (true, true);
        while statuses_open || errors_open {
            tokio::select! {
                update = status_rx.recv(), if statuses_open => match update {
                    Some((device, status)) => {
                        info!(device, phase = ?status.status, "device run finished");
                        job.status.job_status.insert(device, status);
                    }
                    None => statuses_open = false,
                },
                failure = error_rx.recv(), if errors_open => match failure {
                    Some((device, e)) => {
                        warn!(device, error = %e, "device run interrupted");
                        failed = true;
                    }
                    None => errors_open = false,
                },
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "device job worker panicked");
                failed = true;
            }
        }

        if job.status != before {
            persist(&self.client, &job).await?;
        }
        if failed {
            return Err(ReconcileError::requeue(
                "one or more devices could not be reached",
                SHORT_REQUEUE,
            ));
        }
        Ok(())
    }

    /// The named pod, or every pod in the job's namespace matching the
    /// selector. A job naming neither targets nothing.
    async fn target_pods(&self, job: &DeviceJob) -> ReconcileResult<Vec<Pod>> {
        let namespace = job.metadata.namespace.as_str();
        if let Some(name) = &job.spec.device_name {
            let pod = self.client.get(&ObjectKey::new(namespace, name.clone())).await?;
            return Ok(vec![pod]);
        }
        if job.spec.device_selector.is_empty() {
            warn!(job = %job.key(), "device job names no device and no selector");
            return Ok(Vec::new());
        }
        Ok(self
            .client
            .list(Some(namespace), &job.spec.device_selector)
            .await?)
    }
}

/// Runs every action of `template` on the device behind `pod`.
///
/// Problems that retrying cannot fix come back as a Failed status; lost
/// connectivity comes back as an error so the run is retried.
async fn run_on_device(
    devices: &dyn DeviceControl,
    pod: &Pod,
    template: &JobTemplateSpec,
) -> DeviceControlResult<DeviceRunStatus> {
    let Some(port) = pod.named_port("adb") else {
        return Ok(DeviceRunStatus::new(
            RunPhase::Failed,
            "could not determine ADB port for device",
        ));
    };
    let Some(ip) = pod.ip() else {
        return Err(DeviceControlError::Transport(format!(
            "{} has no address yet",
            pod.metadata.name
        )));
    };

    let mut session = devices.connect(&format!("{ip}:{port}")).await?;
    let result = run_actions(session.as_mut(), pod, template).await;
    session.close().await;

    match result {
        Ok(()) => Ok(DeviceRunStatus::new(
            RunPhase::Complete,
            "the job completed successfully",
        )),
        Err(Interrupted::Fatal(message)) => Ok(DeviceRunStatus::new(RunPhase::Failed, message)),
        Err(Interrupted::Retry(e)) => Err(e),
    }
}

enum Interrupted {
    Fatal(String),
    Retry(DeviceControlError),
}

async fn run_actions(
    session: &mut dyn Session,
    pod: &Pod,
    template: &JobTemplateSpec,
) -> Result<(), Interrupted> {
    for action in &template.actions {
        match action.activity {
            Activity::Command => {
                for command in &action.commands {
                    let rendered = render_command(command, pod).map_err(|e| {
                        Interrupted::Fatal(format!("failed to template command: {e}"))
                    })?;
                    match session.run_command(action.run_as_root, &rendered).await {
                        Ok(_) => {}
                        Err(e) if e.is_transient() => return Err(Interrupted::Retry(e)),
                        Err(e) => return Err(Interrupted::Fatal(e.to_string())),
                    }
                }
            }
            Activity::Wait => tokio::time::sleep(Duration::from_secs(action.seconds)).await,
        }
    }
    Ok(())
}

impl std::fmt::Debug for DeviceJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceJobRunner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outcomes_reach_the_matching_channel() {
        let (status_tx, mut status_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::channel(1);

        let status = DeviceRunStatus::new(RunPhase::Complete, "");
        assert!(report("g1-0", Ok(status.clone()), &status_tx, &error_tx).await);
        assert_eq!(status_rx.recv().await, Some(("g1-0".to_string(), status)));

        let offline = DeviceControlError::Offline("g1-1".to_string());
        assert!(report("g1-1", Err(offline), &status_tx, &error_tx).await);
        let (device, e) = error_rx.recv().await.unwrap();
        assert_eq!(device, "g1-1");
        assert!(matches!(e, DeviceControlError::Offline(_)));
    }

    #[tokio::test]
    async fn closed_collector_drops_the_outcome() {
        let (status_tx, status_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        drop(status_rx);
        drop(error_rx);

        let status = DeviceRunStatus::new(RunPhase::Complete, "");
        assert!(!report("g1-0", Ok(status), &status_tx, &error_tx).await);
        let offline = DeviceControlError::Offline("g1-0".to_string());
        assert!(!report("g1-0", Err(offline), &status_tx, &error_tx).await);
    }
}
