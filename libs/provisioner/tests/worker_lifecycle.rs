//! End-to-end tests for the application worker event loop.
//!
//! Each test wires a worker to the in-memory fakes, drives it with life
//! changes, watcher events and external wake-ups, and asserts on the calls
//! that reached the control plane and the substrate. Timers run on virtual
//! time, so the fixed retry delays cost nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use stratus_provisioner::broker::{BrokerUnit, OperatorState};
use stratus_provisioner::error::{Error, Result};
use stratus_provisioner::facade::{
    Base, Channel, CharmFormat, CharmInfo, ContainerSpec, ImageDetails, OciImage,
    ProvisioningInfo,
};
use stratus_provisioner::shutdown;
use stratus_provisioner::status::{StatusInfo, StatusValue};
use stratus_provisioner::testing::{MockBroker, MockFacade, MockUnitFacade};
use stratus_provisioner::{AppHandle, AppWorker, AppWorkerConfig, Life, ProvisioningState};

struct Harness {
    facade: MockFacade,
    unit_facade: MockUnitFacade,
    broker: MockBroker,
    handle: AppHandle,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<Result<()>>,
}

fn provisioning_info() -> ProvisioningInfo {
    ProvisioningInfo {
        charm_url: Some("ch:red".to_string()),
        image_details: ImageDetails {
            registry_path: "registry.example.com/stratus/agent:3.1.0".to_string(),
            repository: "registry.example.com/stratus".to_string(),
            is_private: false,
        },
        base: Base {
            name: "ubuntu".to_string(),
            channel: Channel {
                track: "22.04".to_string(),
                risk: "stable".to_string(),
            },
        },
        version: "3.1.0".to_string(),
        api_addresses: vec!["10.0.0.1:17070".to_string()],
        ca_cert: "cert-bundle".to_string(),
        charm_modified_version: 1,
        trust: false,
        scale: 1,
        ..Default::default()
    }
}

fn sidecar_charm() -> CharmInfo {
    let mut containers = BTreeMap::new();
    containers.insert(
        "workload".to_string(),
        ContainerSpec {
            resource: "workload-image".to_string(),
            mounts: vec![],
        },
    );
    CharmInfo {
        format: CharmFormat::V2,
        containers,
    }
}

fn oci_resources() -> BTreeMap<String, OciImage> {
    let mut images = BTreeMap::new();
    images.insert(
        "workload-image".to_string(),
        OciImage {
            registry_path: "registry.example.com/red/workload:latest".to_string(),
        },
    );
    images
}

fn workload_unit(id: &str) -> BrokerUnit {
    BrokerUnit {
        id: id.to_string(),
        address: "10.1.0.5".to_string(),
        ports: vec![],
        dying: false,
        stateful: true,
        status: StatusInfo::new(StatusValue::Active, ""),
        filesystem_info: vec![],
    }
}

/// Prime the fakes for an alive, fully provisionable application and start
/// its worker.
fn start_alive_worker(name: &str) -> Harness {
    let facade = MockFacade::new();
    let unit_facade = MockUnitFacade::new();
    let broker = MockBroker::new();

    facade.set_life(name, Life::Alive);
    facade.set_application_charm_info(sidecar_charm());
    facade.set_charm_info(sidecar_charm());
    facade.set_provisioning_info(provisioning_info());
    facade.set_oci_resources(oci_resources());

    start_worker(name, &facade, &unit_facade, &broker)
}

fn start_worker(
    name: &str,
    facade: &MockFacade,
    unit_facade: &MockUnitFacade,
    broker: &MockBroker,
) -> Harness {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let worker = AppWorker::new(
        AppWorkerConfig {
            name: name.to_string(),
            model_tag: "model-test".to_string(),
            facade: Arc::new(facade.clone()),
            unit_facade: Arc::new(unit_facade.clone()),
            broker: Arc::new(broker.clone()),
        },
        shutdown_rx,
    );
    let (handle, notify_rx) = stratus_provisioner::worker::notify_channel();
    let task = tokio::spawn(worker.run(notify_rx));

    Harness {
        facade: facade.clone(),
        unit_facade: unit_facade.clone(),
        broker: broker.clone(),
        handle,
        shutdown_tx,
        worker: task,
    }
}

/// Let the worker drain its pending work on virtual time.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn worker_exits_when_application_is_missing() {
    let facade = MockFacade::new();
    let h = start_worker("red", &facade, &MockUnitFacade::new(), &MockBroker::new());

    let result = h.worker.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(h.facade.set_password_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_provisions_then_tears_down_dying_and_dead_application() {
    let h = start_alive_worker("red");
    settle().await;

    // Alive: the application was ensured and the introduction password set
    // exactly once.
    assert_eq!(h.facade.set_password_calls(), 1);
    let ensured = h.broker.app.ensure_calls();
    assert_eq!(ensured.len(), 1);
    assert_eq!(
        ensured[0].introduction_secret,
        h.facade.password().unwrap()
    );
    assert_eq!(
        h.facade.operator_statuses().last().unwrap().0,
        StatusValue::Active
    );

    // Dying: scaled to zero.
    h.facade.set_life("red", Life::Dying);
    h.handle.notify();
    settle().await;
    assert_eq!(h.broker.app.scale_calls(), vec![0]);

    // Dead: deleted, resources released, worker finished.
    h.facade.set_life("red", Life::Dead);
    h.handle.notify();

    let result = tokio::time::timeout(Duration::from_secs(60), h.worker)
        .await
        .expect("worker did not finish")
        .unwrap();
    assert!(result.is_ok(), "worker failed: {result:?}");
    assert_eq!(h.broker.app.delete_calls(), 1);
    assert!(h.facade.resources_cleared());
}

#[tokio::test(start_paused = true)]
async fn worker_scales_up_after_debounced_watcher_events() {
    let h = start_alive_worker("red");
    settle().await;

    h.unit_facade.set_scale(Some(3));
    // A burst of scale events coalesces into one reconciler run.
    h.unit_facade.fire_scale_changed();
    h.unit_facade.fire_scale_changed();
    h.unit_facade.fire_scale_changed();
    settle().await;

    assert_eq!(h.broker.app.scale_calls(), vec![3]);
    assert_eq!(
        h.facade.provisioning_state_calls(),
        vec![
            ProvisioningState {
                scaling: true,
                scale_target: 3
            },
            ProvisioningState::default(),
        ]
    );

    h.shutdown_tx.send(true).unwrap();
    let result = h.worker.await.unwrap();
    assert!(matches!(result.unwrap_err(), Error::Dying));
}

#[tokio::test(start_paused = true)]
async fn worker_applies_trust_changes() {
    let h = start_alive_worker("red");
    settle().await;

    h.unit_facade.set_trust(Some(true));
    h.unit_facade.fire_trust_changed();
    settle().await;

    assert_eq!(h.broker.app.trust_calls(), vec![true]);

    h.shutdown_tx.send(true).unwrap();
    let _ = h.worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn worker_resumes_interrupted_scale_operation() {
    let facade = MockFacade::new();
    let unit_facade = MockUnitFacade::new();
    let broker = MockBroker::new();

    facade.set_life("red", Life::Alive);
    facade.set_application_charm_info(sidecar_charm());
    facade.set_charm_info(sidecar_charm());
    facade.set_provisioning_info(provisioning_info());
    facade.set_oci_resources(oci_resources());

    // A previous worker died mid-scale; the persisted state says so.
    facade.set_stored_provisioning_state(ProvisioningState {
        scaling: true,
        scale_target: 2,
    });
    unit_facade.set_scale(Some(2));

    let h = start_worker("red", &facade, &unit_facade, &broker);
    settle().await;

    // The scale timer fired without any watcher event.
    assert_eq!(h.broker.app.scale_calls(), vec![2]);

    h.shutdown_tx.send(true).unwrap();
    let _ = h.worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn worker_waits_for_charm_upgrade_and_exits_if_application_vanishes() {
    let facade = MockFacade::new();
    facade.set_life("red", Life::Alive);
    facade.set_application_charm_info(CharmInfo {
        format: CharmFormat::V1,
        containers: BTreeMap::new(),
    });

    let h = start_worker("red", &facade, &MockUnitFacade::new(), &MockBroker::new());
    settle().await;

    // Still gated on the upgrade: no credential was published.
    assert_eq!(h.facade.set_password_calls(), 0);

    h.facade.remove_life("red");
    h.facade.fire_application_changed();

    let result = tokio::time::timeout(Duration::from_secs(60), h.worker)
        .await
        .expect("worker did not finish")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(h.facade.set_password_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_reaps_legacy_operator_before_provisioning() {
    let facade = MockFacade::new();
    let unit_facade = MockUnitFacade::new();
    let broker = MockBroker::new();

    facade.set_life("red", Life::Alive);
    facade.set_application_charm_info(sidecar_charm());
    facade.set_charm_info(sidecar_charm());
    facade.set_provisioning_info(provisioning_info());
    facade.set_oci_resources(oci_resources());

    // One leftover operator pod, and one poll's worth of old workload pods.
    broker.push_operator(OperatorState {
        exists: true,
        terminating: false,
    });
    broker.push_workload_units(vec![workload_unit("red-old-0")]);

    let h = start_worker("red", &facade, &unit_facade, &broker);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.broker.deleted_services(), vec!["red".to_string()]);
    assert_eq!(h.broker.deleted_operators(), vec!["red".to_string()]);
    // Provisioning carried on afterwards.
    assert_eq!(h.facade.set_password_calls(), 1);
    assert_eq!(h.broker.app.ensure_calls().len(), 1);

    h.shutdown_tx.send(true).unwrap();
    let _ = h.worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn worker_gives_up_after_bounded_scale_retries() {
    let h = start_alive_worker("red");
    settle().await;

    // Desired scale keeps answering not-found: retry 20 times, then fail.
    h.unit_facade.set_scale(None);
    h.unit_facade.fire_scale_changed();

    let result = tokio::time::timeout(Duration::from_secs(600), h.worker)
        .await
        .expect("worker did not give up")
        .unwrap();
    let err = result.unwrap_err();
    assert!(
        err.to_string().contains("retries ensuring scale"),
        "unexpected error: {err}"
    );
}
