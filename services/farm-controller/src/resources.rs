//! Apply behaviour of each kind the engine manages.

use droidfarm_reconcile::STALE_JOB_REQUEUE;

use crate::api::{ConfigMap, Deployment, Device, Job, Pod, Service, StatefulSet};
use crate::apply::{ManagedResource, UpdatePolicy};

impl ManagedResource for Service {
    const UPDATE_POLICY: UpdatePolicy = UpdatePolicy::InPlace;

    fn adopt_spec(&mut self, desired: &Self) {
        let cluster_ip = self.spec.cluster_ip.take();
        self.spec = desired.spec.clone();
        if cluster_ip.is_some() {
            self.spec.cluster_ip = cluster_ip;
        }
    }
}

impl ManagedResource for ConfigMap {
    const UPDATE_POLICY: UpdatePolicy = UpdatePolicy::InPlace;

    fn adopt_spec(&mut self, desired: &Self) {
        self.data = desired.data.clone();
    }
}

impl ManagedResource for Deployment {
    const UPDATE_POLICY: UpdatePolicy = UpdatePolicy::InPlace;

    fn adopt_spec(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }

    fn readiness_satisfied(desired: &Self, observed: &Self) -> bool {
        observed.status.ready_replicas == desired.spec.replicas
    }
}

impl ManagedResource for StatefulSet {
    const UPDATE_POLICY: UpdatePolicy = UpdatePolicy::InPlace;

    fn adopt_spec(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }

    fn readiness_satisfied(desired: &Self, observed: &Self) -> bool {
        observed.status.ready_replicas == desired.spec.replicas
    }
}

impl ManagedResource for Pod {
    const UPDATE_POLICY: UpdatePolicy = UpdatePolicy::Recreate;
}

impl ManagedResource for Job {
    const UPDATE_POLICY: UpdatePolicy = UpdatePolicy::Recreate;
    const RECREATE_BACKOFF: std::time::Duration = STALE_JOB_REQUEUE;

    fn readiness_satisfied(_desired: &Self, observed: &Self) -> bool {
        observed.status.succeeded == 1
    }
}

impl ManagedResource for Device {
    const UPDATE_POLICY: UpdatePolicy = UpdatePolicy::Recreate;
}
