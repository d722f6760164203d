//! Ordered, bounded-width rollout admission.
//!
//! Member `i` of a group may start converging only while fewer than
//! `concurrency` of the members below it are still converging. Members are
//! scanned in ascending order, so a newer device never overtakes an older one.

use async_trait::async_trait;
use droidfarm_id::{device_name, ordinal_of, ObjectKey};
use droidfarm_reconcile::{admits, ReconcileError, ReconcileResult, CONCURRENCY_REQUEUE};
use tracing::debug;

use crate::api::{ConcurrencyPolicy, Device, DeviceGroup, Farm};
use crate::apply::UpdateGate;
use crate::store::Client;

/// What "settled" means for a lower-indexed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness<'a> {
    /// The member has booted.
    Booted,
    /// The member has booted on the configuration with this checksum.
    Converged { checksum: &'a str },
}

/// Whether an observed member no longer counts as pending.
pub fn is_settled(device: Option<&Device>, readiness: Readiness<'_>) -> bool {
    let Some(device) = device else {
        return false;
    };
    match readiness {
        Readiness::Booted => device.boot_completed(),
        Readiness::Converged { checksum } => {
            device.config_checksum() == Some(checksum) && device.boot_completed()
        }
    }
}

/// Admission check for one member of a group.
#[derive(Debug, Clone)]
pub struct OrderedAdmission {
    client: Client,
    group: String,
    namespace: String,
    policy: Option<ConcurrencyPolicy>,
    ordinal: u32,
}

impl OrderedAdmission {
    pub fn new(client: Client, farm: &Farm, group: &DeviceGroup, ordinal: u32) -> Self {
        Self {
            client,
            group: group.name.clone(),
            namespace: group.namespace().to_string(),
            policy: farm.concurrency_policy(&group.name).cloned(),
            ordinal,
        }
    }

    /// Admission for the member called `name`. An unparsable ordinal is fatal.
    pub fn for_device(
        client: Client,
        farm: &Farm,
        group: &DeviceGroup,
        name: &str,
    ) -> ReconcileResult<Self> {
        let ordinal = ordinal_of(name)?;
        Ok(Self::new(client, farm, group, ordinal))
    }

    /// Counts lower-indexed members that are not yet settled, stopping once
    /// `limit` is reached.
    async fn pending_below(&self, readiness: Readiness<'_>, limit: u32) -> ReconcileResult<u32> {
        let mut pending = 0;
        for k in 0..self.ordinal {
            let key = ObjectKey::new(self.namespace.clone(), device_name(&self.group, k));
            let found = self.client.get_opt::<Device>(&key).await?;
            if !is_settled(found.as_ref(), readiness) {
                pending += 1;
                if pending >= limit {
                    break;
                }
            }
        }
        Ok(pending)
    }

    /// Ok when the member may be created; otherwise a requeue.
    pub async fn ready_to_create(&self) -> ReconcileResult<()> {
        let Some(policy) = &self.policy else {
            return Ok(());
        };
        let concurrency = policy.concurrency();
        let pending = self.pending_below(Readiness::Booted, concurrency).await?;
        if admits(pending, concurrency) {
            return Ok(());
        }
        debug!(group = %self.group, ordinal = self.ordinal, pending, concurrency, "create deferred");
        Err(ReconcileError::requeue(
            format!(
                "waiting to create {} under concurrency policy",
                device_name(&self.group, self.ordinal)
            ),
            CONCURRENCY_REQUEUE,
        ))
    }

    /// Whether the member may be replaced with the configuration `checksum`.
    pub async fn ready_to_update(&self, checksum: &str) -> ReconcileResult<bool> {
        let Some(policy) = &self.policy else {
            return Ok(true);
        };
        let concurrency = policy.concurrency();
        let pending = self
            .pending_below(Readiness::Converged { checksum }, concurrency)
            .await?;
        let admitted = admits(pending, concurrency);
        if !admitted {
            debug!(group = %self.group, ordinal = self.ordinal, pending, concurrency, "update deferred");
        }
        Ok(admitted)
    }
}

#[async_trait]
impl UpdateGate<Device> for OrderedAdmission {
    async fn may_update(&self, desired: &Device) -> ReconcileResult<bool> {
        self.ready_to_update(desired.config_checksum().unwrap_or_default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::api::{ObjectMeta, BOOT_COMPLETED_ANNOTATION, CONFIG_CHECKSUM_ANNOTATION};

    fn device(boot: Option<&str>, checksum: Option<&str>) -> Device {
        let mut metadata = ObjectMeta::new("ns", "g1-0");
        if let Some(boot) = boot {
            metadata
                .annotations
                .insert(BOOT_COMPLETED_ANNOTATION.to_string(), boot.to_string());
        }
        if let Some(checksum) = checksum {
            metadata
                .annotations
                .insert(CONFIG_CHECKSUM_ANNOTATION.to_string(), checksum.to_string());
        }
        Device {
            metadata,
            ..Device::default()
        }
    }

    #[rstest]
    #[case(None, None, false)]
    #[case(Some("false"), None, false)]
    #[case(Some("true"), None, true)]
    #[case(Some("yes"), Some("abc"), false)]
    fn booted_readiness(
        #[case] boot: Option<&str>,
        #[case] checksum: Option<&str>,
        #[case] settled: bool,
    ) {
        let d = device(boot, checksum);
        assert_eq!(is_settled(Some(&d), Readiness::Booted), settled);
    }

    #[rstest]
    #[case(Some("true"), Some("abc"), true)]
    #[case(Some("true"), Some("old"), false)]
    #[case(Some("true"), None, false)]
    #[case(Some("false"), Some("abc"), false)]
    #[case(None, Some("abc"), false)]
    fn converged_readiness(
        #[case] boot: Option<&str>,
        #[case] checksum: Option<&str>,
        #[case] settled: bool,
    ) {
        let d = device(boot, checksum);
        assert_eq!(
            is_settled(Some(&d), Readiness::Converged { checksum: "abc" }),
            settled
        );
    }

    #[test]
    fn missing_member_is_pending() {
        assert!(!is_settled(None, Readiness::Booted));
    }
}
