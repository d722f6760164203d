use std::time::Duration;

use chrono::{DateTime, Utc};
use droidfarm_reconcile::ReconcileResult;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::api::{DeviceJob, Resource};
use crate::store::{Client, Selector};

/// Whether `job` has outlived its TTL at `now`. Jobs without a TTL or a
/// creation time never expire.
pub fn is_expired(job: &DeviceJob, now: DateTime<Utc>) -> bool {
    let (Some(ttl), Some(created)) = (
        job.spec.ttl_seconds_after_creation,
        job.metadata.creation_timestamp,
    ) else {
        return false;
    };
    let age = now.signed_duration_since(created);
    age.num_seconds() >= 0 && age.num_seconds().unsigned_abs() >= ttl
}

/// Deletes every device job past its TTL. Returns how many were deleted.
pub async fn sweep_expired(client: &Client, now: DateTime<Utc>) -> ReconcileResult<usize> {
    let jobs: Vec<DeviceJob> = client.list(None, &Selector::new()).await?;
    let mut deleted = 0;
    for job in jobs.iter().filter(|job| is_expired(job, now)) {
        info!(job = %job.key(), "device job is past its TTL");
        match client.delete::<DeviceJob>(&job.key()).await {
            Ok(()) => deleted += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// Periodically deletes expired device jobs.
pub struct TtlSweeper {
    client: Client,
    interval: Duration,
}

impl TtlSweeper {
    pub fn new(client: Client, interval: Duration) -> Self {
        Self { client, interval }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting device job TTL sweeper"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match sweep_expired(&self.client, Utc::now()).await {
                        Ok(0) => debug!("no expired device jobs"),
                        Ok(deleted) => info!(deleted, "expired device jobs removed"),
                        Err(e) => error!(error = %e, "device job TTL sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("TTL sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::api::ObjectMeta;

    fn job(ttl: Option<u64>, age_secs: i64, now: DateTime<Utc>) -> DeviceJob {
        let mut job = DeviceJob {
            metadata: ObjectMeta::new("lab", "reboot"),
            ..DeviceJob::default()
        };
        job.spec.ttl_seconds_after_creation = ttl;
        job.metadata.creation_timestamp = Some(now - TimeDelta::seconds(age_secs));
        job
    }

    #[test]
    fn expiry_boundaries() {
        let now = Utc::now();
        assert!(!is_expired(&job(None, 10_000, now), now));
        assert!(!is_expired(&job(Some(60), 59, now), now));
        assert!(is_expired(&job(Some(60), 60, now), now));
        assert!(is_expired(&job(Some(0), 0, now), now));
        assert!(!is_expired(&job(Some(60), -120, now), now));
    }

    #[test]
    fn missing_creation_time_never_expires() {
        let mut j = job(Some(1), 100, Utc::now());
        j.metadata.creation_timestamp = None;
        assert!(!is_expired(&j, Utc::now()));
    }
}
