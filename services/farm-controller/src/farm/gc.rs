use std::collections::BTreeMap;

use droidfarm_id::ordinal_of;
use droidfarm_reconcile::ReconcileResult;
use tracing::{debug, info, instrument};

use crate::api::{Device, Farm, Resource};
use crate::registry::{deregister, Registry};
use crate::store::Client;

/// Why a farmed device no longer belongs to its farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    /// The device carries no group label.
    Unlabelled,
    /// The group was removed from the farm, or is no longer emulated.
    UnknownGroup,
    /// The group was scaled below the device's ordinal.
    ScaledDown,
}

impl std::fmt::Display for GcReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unlabelled => "no group label",
            Self::UnknownGroup => "group no longer exists",
            Self::ScaledDown => "group scaled down",
        })
    }
}

/// Decides whether `device` should be collected given the desired member
/// count of every emulated group. A malformed ordinal is fatal.
pub fn collect_reason(
    device: &Device,
    desired: &BTreeMap<&str, u32>,
) -> ReconcileResult<Option<GcReason>> {
    let Some(group) = device.group_name() else {
        return Ok(Some(GcReason::Unlabelled));
    };
    let Some(&count) = desired.get(group) else {
        return Ok(Some(GcReason::UnknownGroup));
    };
    let ordinal = ordinal_of(&device.metadata.name)?;
    Ok((ordinal >= count).then_some(GcReason::ScaledDown))
}

/// Deletes every device labelled with the farm that its groups no longer
/// account for. Returns how many were deleted.
#[instrument(skip_all, fields(farm = %farm.metadata.name))]
pub async fn run_gc(client: &Client, registry: &dyn Registry, farm: &Farm) -> ReconcileResult<usize> {
    let desired = farm.desired_counts();
    let devices: Vec<Device> = client.list(None, &farm.selector()).await?;

    let mut collected = 0;
    for device in devices {
        let Some(reason) = collect_reason(&device, &desired)? else {
            continue;
        };
        info!(device = %device.key(), %reason, "collecting device");
        deregister(registry, &device).await;
        match client.delete::<Device>(&device.key()).await {
            Ok(()) => collected += 1,
            Err(e) if e.is_not_found() => debug!(device = %device.key(), "already gone"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::api::{ObjectMeta, GROUP_LABEL};

    fn device(name: &str, group: Option<&str>) -> Device {
        let mut metadata = ObjectMeta::new("ns", name);
        if let Some(group) = group {
            metadata
                .labels
                .insert(GROUP_LABEL.to_string(), group.to_string());
        }
        Device {
            metadata,
            ..Device::default()
        }
    }

    #[rstest]
    #[case("g1-0", Some("g1"), None)]
    #[case("g1-2", Some("g1"), None)]
    #[case("g1-3", Some("g1"), Some(GcReason::ScaledDown))]
    #[case("g1-10", Some("g1"), Some(GcReason::ScaledDown))]
    #[case("g2-0", Some("g2"), Some(GcReason::UnknownGroup))]
    #[case("g1-0", None, Some(GcReason::Unlabelled))]
    fn collection_decisions(
        #[case] name: &str,
        #[case] group: Option<&str>,
        #[case] expected: Option<GcReason>,
    ) {
        let desired = BTreeMap::from([("g1", 3)]);
        assert_eq!(collect_reason(&device(name, group), &desired).unwrap(), expected);
    }

    #[test]
    fn malformed_ordinal_is_fatal() {
        let desired = BTreeMap::from([("g1", 3)]);
        assert!(collect_reason(&device("g1-x", Some("g1")), &desired).is_err());
    }

    #[test]
    fn zero_count_collects_everything_in_group() {
        let desired = BTreeMap::from([("g1", 0)]);
        assert_eq!(
            collect_reason(&device("g1-0", Some("g1")), &desired).unwrap(),
            Some(GcReason::ScaledDown)
        );
    }
}
