use std::sync::Arc;

use droidfarm_id::ObjectKey;
use droidfarm_reconcile::{earliest, ReconcileError, ReconcileResult, RequeueSignal};
use tracing::{debug, info, instrument};

use super::gc::run_gc;
use crate::api::{Device, DeviceGroup, Farm};
use crate::apply::{apply, apply_gated};
use crate::builders;
use crate::concurrency::OrderedAdmission;
use crate::device::resolve_config;
use crate::registry::Registry;
use crate::store::Client;

/// Reconciles Farms into their group Services and Devices.
#[derive(Clone)]
pub struct FarmReconciler {
    client: Client,
    registry: Arc<dyn Registry>,
}

impl FarmReconciler {
    pub fn new(client: Client, registry: Arc<dyn Registry>) -> Self {
        Self { client, registry }
    }

    #[instrument(skip(self), fields(farm = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<()> {
        match self.client.get_opt::<Farm>(key).await? {
            Some(farm) => self.reconcile_farm(&farm).await,
            None => {
                debug!("farm no longer exists");
                Ok(())
            }
        }
    }

    /// Brings up the provider stack, reconciles every emulated group, then
    /// collects stray devices.
    ///
    /// Until the provider stack is ready no group is touched. A group that
    /// asks for a requeue does not hold up its siblings; the earliest
    /// requeue is returned once every group and GC have run. Any fatal
    /// error aborts the pass before GC.
    pub async fn reconcile_farm(&self, farm: &Farm) -> ReconcileResult<()> {
        if farm.metadata.is_marked_for_deletion() {
            return self.finalize(farm).await;
        }

        if farm.spec.provider.is_some() {
            info!("reconciling provider database");
            self.reconcile_database(farm).await?;
            info!("reconciling group providers");
            self.reconcile_providers(farm).await?;
        }

        let mut pending: Option<RequeueSignal> = None;
        for group in farm.groups().iter().filter(|group| group.is_emulated()) {
            match self.reconcile_group(farm, group).await {
                Ok(()) => {}
                Err(ReconcileError::Requeue(signal)) => {
                    debug!(group = %group.name, %signal, "group not yet converged");
                    pending = Some(earliest(pending, signal));
                }
                Err(e) => return Err(e),
            }
        }

        let collected = run_gc(&self.client, self.registry.as_ref(), farm).await?;
        if collected > 0 {
            info!(collected, "garbage collected devices");
        }

        match pending {
            Some(signal) => Err(ReconcileError::Requeue(signal)),
            None => Ok(()),
        }
    }

    /// Deletes the farm's devices in every group namespace. Objects owned by
    /// the farm itself go with it.
    async fn finalize(&self, farm: &Farm) -> ReconcileResult<()> {
        for group in farm.groups() {
            let namespace = group.namespace();
            match self
                .client
                .delete_all::<Device>(namespace, &farm.device_labels(group))
                .await
            {
                Ok(0) => {}
                Ok(deleted) => info!(group = %group.name, namespace, deleted, "deleted farm devices"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("farm finalized");
        Ok(())
    }

    /// Ensures the database and its headless service, and waits for every
    /// replica to become ready.
    async fn reconcile_database(&self, farm: &Farm) -> ReconcileResult<()> {
        apply(&self.client, builders::database_service(farm), false).await?;
        apply(&self.client, builders::database_statefulset(farm), true).await?;
        Ok(())
    }

    /// Ensures a provider for each emulated group, in declaration order,
    /// stopping at the first one that is not ready.
    async fn reconcile_providers(&self, farm: &Farm) -> ReconcileResult<()> {
        for group in farm.groups().iter().filter(|group| group.is_emulated()) {
            apply(&self.client, builders::provider_service(farm, group), false).await?;
            apply(&self.client, builders::provider_deployment(farm, group), true).await?;
        }
        Ok(())
    }

    /// Ensures the group's Service and its first `count` Devices.
    ///
    /// Members are visited in ascending order and the first deferral stops
    /// the walk, so a higher member is never created ahead of a lower one.
    #[instrument(skip(self, farm, group), fields(group = %group.name))]
    pub async fn reconcile_group(&self, farm: &Farm, group: &DeviceGroup) -> ReconcileResult<()> {
        let count = group.count();
        if count == 0 {
            debug!("group has no members");
            return Ok(());
        }

        let config = resolve_config(
            &self.client,
            &format!("group {}", group.name),
            group.config_ref(),
            group.inline_config(),
        )
        .await?;
        let checksum = config.checksum()?;

        apply(&self.client, builders::group_service(farm, group, &config), false).await?;

        for index in 0..count {
            let admission = OrderedAdmission::new(self.client.clone(), farm, group, index);
            admission.ready_to_create().await?;
            let device = builders::device_for_group(farm, group, index, checksum.as_str());
            apply_gated(&self.client, device, false, &admission).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FarmReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmReconciler").finish_non_exhaustive()
    }
}
