//! Scripted actions fanned out across devices.

mod common;

use std::collections::BTreeMap;

use chrono::{TimeDelta, Utc};
use common::*;
use droidfarm_controller::adb::FakeDevice;
use droidfarm_controller::api::{
    Action, Activity, Container, ContainerPort, DeviceJob, DeviceJobSpec, JobTemplate,
    JobTemplateSpec, ObjectMeta, Pod, PodSpec, PodStatus, Resource, RunPhase,
};
use droidfarm_controller::jobs::sweep_expired;
use droidfarm_id::ObjectKey;
use droidfarm_reconcile::SHORT_REQUEUE;

fn tester_pod(name: &str, ip: &str, adb: bool) -> Pod {
    let ports = if adb {
        vec![ContainerPort::named("adb", 5555)]
    } else {
        Vec::new()
    };
    Pod {
        metadata: ObjectMeta {
            labels: BTreeMap::from([("role".to_string(), "tester".to_string())]),
            ..ObjectMeta::new(NAMESPACE, name)
        },
        spec: PodSpec {
            containers: vec![Container {
                name: name.to_string(),
                ports,
                ..Container::default()
            }],
            ..PodSpec::default()
        },
        status: PodStatus {
            pod_ip: Some(ip.to_string()),
            ..PodStatus::default()
        },
    }
}

async fn seed_template(fleet: &Fleet, commands: &[&str]) {
    fleet
        .client
        .create(&JobTemplate {
            metadata: ObjectMeta::new("", "smoke"),
            spec: JobTemplateSpec {
                actions: vec![Action {
                    activity: Activity::Command,
                    name: Some("smoke".to_string()),
                    run_as_root: true,
                    commands: commands.iter().map(|c| c.to_string()).collect(),
                    seconds: 0,
                }],
            },
        })
        .await
        .unwrap();
}

fn selector_job(name: &str) -> DeviceJob {
    DeviceJob {
        metadata: ObjectMeta::new(NAMESPACE, name),
        spec: DeviceJobSpec {
            device_selector: BTreeMap::from([("role".to_string(), "tester".to_string())]),
            job_template: "smoke".to_string(),
            ..DeviceJobSpec::default()
        },
        ..DeviceJob::default()
    }
}

async fn run(fleet: &Fleet, name: &str) -> Result<(), droidfarm_reconcile::ReconcileError> {
    fleet.jobs.reconcile(&ObjectKey::new(NAMESPACE, name)).await
}

async fn stored_job(fleet: &Fleet, name: &str) -> DeviceJob {
    fleet
        .client
        .get(&ObjectKey::new(NAMESPACE, name))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_job_runs_on_every_selected_device() {
    let fleet = Fleet::new();
    seed_template(&fleet, &["echo {{ .Name }}/{{ .Namespace }}", "settings put global x 1"]).await;
    fleet
        .client
        .create(&tester_pod("t-0", "10.0.1.1", true))
        .await
        .unwrap();
    fleet
        .client
        .create(&tester_pod("t-1", "10.0.1.2", true))
        .await
        .unwrap();
    fleet.client.create(&selector_job("smoke-run")).await.unwrap();

    run(&fleet, "smoke-run").await.unwrap();

    let job = stored_job(&fleet, "smoke-run").await;
    assert_eq!(job.phase_of("t-0"), RunPhase::Complete);
    assert_eq!(job.phase_of("t-1"), RunPhase::Complete);

    let mut commands = fleet.devices.commands().await;
    commands.sort();
    assert_eq!(commands.len(), 4);
    assert!(commands.contains(&(
        "10.0.1.1:5555".to_string(),
        true,
        "echo t-0/lab".to_string()
    )));
    assert!(commands.contains(&(
        "10.0.1.2:5555".to_string(),
        true,
        "echo t-1/lab".to_string()
    )));

    // Finished devices are skipped and nothing is written.
    let writes = fleet.plane.writes(DeviceJob::KIND).await;
    run(&fleet, "smoke-run").await.unwrap();
    assert_eq!(fleet.devices.commands().await.len(), 4);
    assert_eq!(fleet.plane.writes(DeviceJob::KIND).await, writes);
}

#[tokio::test]
async fn test_unreachable_device_requeues_job() {
    let fleet = Fleet::new();
    seed_template(&fleet, &["reboot"]).await;
    fleet
        .client
        .create(&tester_pod("t-0", "10.0.1.1", true))
        .await
        .unwrap();
    fleet
        .client
        .create(&tester_pod("t-1", "10.0.1.2", true))
        .await
        .unwrap();
    fleet.client.create(&selector_job("reboot-all")).await.unwrap();
    fleet.devices.set("10.0.1.2:5555", FakeDevice::Offline).await;

    let result = run(&fleet, "reboot-all").await;
    assert_eq!(requeue_after(result), Some(SHORT_REQUEUE));
    let job = stored_job(&fleet, "reboot-all").await;
    assert_eq!(job.phase_of("t-0"), RunPhase::Complete);
    assert_eq!(job.phase_of("t-1"), RunPhase::Pending);

    fleet.devices.set("10.0.1.2:5555", FakeDevice::Booted).await;
    run(&fleet, "reboot-all").await.unwrap();
    let job = stored_job(&fleet, "reboot-all").await;
    assert_eq!(job.phase_of("t-1"), RunPhase::Complete);
    let on_first: Vec<_> = fleet
        .devices
        .commands()
        .await
        .into_iter()
        .filter(|(address, _, _)| address == "10.0.1.1:5555")
        .collect();
    assert_eq!(on_first.len(), 1);
}

#[tokio::test]
async fn test_unrecoverable_problems_fail_the_device() {
    let fleet = Fleet::new();
    seed_template(&fleet, &["am start {{ .Activity }}"]).await;
    fleet
        .client
        .create(&tester_pod("t-0", "10.0.1.1", true))
        .await
        .unwrap();
    fleet
        .client
        .create(&tester_pod("t-1", "10.0.1.2", false))
        .await
        .unwrap();
    fleet.client.create(&selector_job("launch")).await.unwrap();

    run(&fleet, "launch").await.unwrap();
    let job = stored_job(&fleet, "launch").await;
    let t0 = &job.status.job_status["t-0"];
    assert_eq!(t0.status, RunPhase::Failed);
    assert!(t0.message.contains("template"));
    let t1 = &job.status.job_status["t-1"];
    assert_eq!(t1.status, RunPhase::Failed);
    assert!(t1.message.contains("ADB port"));
    assert!(fleet.devices.commands().await.is_empty());
}

#[tokio::test]
async fn test_failing_command_fails_only_that_device() {
    let fleet = Fleet::new();
    seed_template(&fleet, &["pm install /sdcard/app.apk", "am start com.example/.Main"]).await;
    fleet
        .client
        .create(&tester_pod("t-0", "10.0.1.1", true))
        .await
        .unwrap();
    let mut job = selector_job("install");
    job.spec.device_selector.clear();
    job.spec.device_name = Some("t-0".to_string());
    fleet.client.create(&job).await.unwrap();
    fleet.devices.fail_commands_containing("pm install").await;

    run(&fleet, "install").await.unwrap();
    let job = stored_job(&fleet, "install").await;
    assert_eq!(job.phase_of("t-0"), RunPhase::Failed);
    // The second command never ran.
    assert_eq!(fleet.devices.commands().await.len(), 1);
}

#[tokio::test]
async fn test_missing_template_is_an_error() {
    let fleet = Fleet::new();
    fleet.client.create(&selector_job("orphan")).await.unwrap();
    let err = run(&fleet, "orphan").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_expired_jobs_are_swept() {
    let fleet = Fleet::new();
    let mut short = selector_job("short-lived");
    short.spec.ttl_seconds_after_creation = Some(60);
    fleet.client.create(&short).await.unwrap();
    fleet.client.create(&selector_job("kept")).await.unwrap();

    assert_eq!(sweep_expired(&fleet.client, Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + TimeDelta::seconds(61);
    assert_eq!(sweep_expired(&fleet.client, later).await.unwrap(), 1);
    assert!(!fleet
        .plane
        .contains(DeviceJob::KIND, &ObjectKey::new(NAMESPACE, "short-lived"))
        .await);
    assert!(fleet
        .plane
        .contains(DeviceJob::KIND, &ObjectKey::new(NAMESPACE, "kept"))
        .await);
}
