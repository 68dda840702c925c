//! In-memory fakes for the facade and broker contracts.
//!
//! Each fake records the calls it receives and serves canned responses, so
//! tests can prime a scenario, run a decision or a whole worker, and assert
//! on the resulting call pattern. Watcher endpoints hand out real channels;
//! `fire_*` methods push a change notification to every watcher created so
//! far.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::broker::{
    Application, ApplicationConfig, ApplicationExistence, ApplicationState, Broker, BrokerUnit,
    DeploymentType, OperatorState, ServiceInfo, UnitMode,
};
use crate::error::{Error, Result};
use crate::facade::{
    ApplicationUnit, CharmInfo, OciImage, ProvisionerFacade, ProvisioningInfo, ServiceUpdate,
    UnitFacade, UpdateUnitsArgs, UpdateUnitsResult,
};
use crate::life::Life;
use crate::state::ProvisioningState;
use crate::status::StatusValue;
use crate::watcher::{self, NotifyHandle, NotifyWatcher};

/// Error kinds a fake can be primed to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    NotImplemented,
    Forbidden,
    NotLeader,
    TryAgain,
    Fatal,
}

impl Fault {
    pub fn into_error(self, what: &str) -> Error {
        match self {
            Fault::NotFound => Error::not_found(what.to_string()),
            Fault::NotImplemented => Error::NotImplemented(what.to_string()),
            Fault::Forbidden => Error::Forbidden(what.to_string()),
            Fault::NotLeader => Error::NotLeader,
            Fault::TryAgain => Error::TryAgain,
            Fault::Fatal => Error::other(format!("fault injected: {what}")),
        }
    }
}

fn fire_all(handles: &[NotifyHandle]) {
    for handle in handles {
        handle.notify();
    }
}

// ---------------------------------------------------------------------------
// Provisioner facade
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FacadeState {
    life: HashMap<String, Life>,
    stored_provisioning: Option<ProvisioningState>,
    provisioning_info: Option<ProvisioningInfo>,
    charm_info: Option<CharmInfo>,
    application_charm_info: Option<CharmInfo>,
    oci_resources: BTreeMap<String, OciImage>,
    units: Vec<ApplicationUnit>,

    set_provisioning_faults: VecDeque<Fault>,
    update_units_fault: Option<Fault>,
    update_units_result: Option<UpdateUnitsResult>,

    provisioning_state_calls: Vec<ProvisioningState>,
    last_update_units: Option<UpdateUnitsArgs>,
    destroyed_units: Vec<String>,
    removed_units: Vec<String>,
    operator_statuses: Vec<(StatusValue, String)>,
    password: Option<String>,
    set_password_calls: u32,
    resources_cleared: bool,

    application_watchers: Vec<NotifyHandle>,
    unit_watchers: Vec<NotifyHandle>,
    provisioning_watchers: Vec<NotifyHandle>,
}

#[derive(Clone, Default)]
pub struct MockFacade {
    inner: Arc<Mutex<FacadeState>>,
}

impl MockFacade {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FacadeState> {
        self.inner.lock().expect("mock facade lock poisoned")
    }

    pub fn set_life(&self, entity: &str, life: Life) {
        self.lock().life.insert(entity.to_string(), life);
    }

    pub fn remove_life(&self, entity: &str) {
        self.lock().life.remove(entity);
    }

    pub fn set_stored_provisioning_state(&self, state: ProvisioningState) {
        self.lock().stored_provisioning = Some(state);
    }

    pub fn set_provisioning_info(&self, info: ProvisioningInfo) {
        self.lock().provisioning_info = Some(info);
    }

    pub fn set_charm_info(&self, info: CharmInfo) {
        self.lock().charm_info = Some(info);
    }

    pub fn set_application_charm_info(&self, info: CharmInfo) {
        self.lock().application_charm_info = Some(info);
    }

    pub fn clear_application_charm_info(&self) {
        self.lock().application_charm_info = None;
    }

    pub fn set_oci_resources(&self, images: BTreeMap<String, OciImage>) {
        self.lock().oci_resources = images;
    }

    pub fn set_units(&self, units: Vec<ApplicationUnit>) {
        self.lock().units = units;
    }

    pub fn push_set_provisioning_fault(&self, fault: Fault) {
        self.lock().set_provisioning_faults.push_back(fault);
    }

    pub fn set_update_units_fault(&self, fault: Fault) {
        self.lock().update_units_fault = Some(fault);
    }

    pub fn set_update_units_result(&self, result: UpdateUnitsResult) {
        self.lock().update_units_result = Some(result);
    }

    pub fn provisioning_state_calls(&self) -> Vec<ProvisioningState> {
        self.lock().provisioning_state_calls.clone()
    }

    pub fn last_update_units(&self) -> Option<UpdateUnitsArgs> {
        self.lock().last_update_units.clone()
    }

    pub fn destroyed_units(&self) -> Vec<String> {
        self.lock().destroyed_units.clone()
    }

    pub fn removed_units(&self) -> Vec<String> {
        self.lock().removed_units.clone()
    }

    pub fn operator_statuses(&self) -> Vec<(StatusValue, String)> {
        self.lock().operator_statuses.clone()
    }

    pub fn password(&self) -> Option<String> {
        self.lock().password.clone()
    }

    pub fn set_password_calls(&self) -> u32 {
        self.lock().set_password_calls
    }

    pub fn resources_cleared(&self) -> bool {
        self.lock().resources_cleared
    }

    pub fn fire_application_changed(&self) {
        fire_all(&self.lock().application_watchers);
    }

    pub fn fire_units_changed(&self) {
        fire_all(&self.lock().unit_watchers);
    }

    pub fn fire_provisioning_changed(&self) {
        fire_all(&self.lock().provisioning_watchers);
    }
}

#[async_trait]
impl ProvisionerFacade for MockFacade {
    async fn life(&self, entity: &str) -> Result<Life> {
        self.lock()
            .life
            .get(entity)
            .copied()
            .ok_or_else(|| Error::not_found(format!("entity {entity}")))
    }

    async fn watch_application(&self, _name: &str) -> Result<NotifyWatcher> {
        let (handle, watcher) = watcher::channel();
        self.lock().application_watchers.push(handle);
        Ok(watcher)
    }

    async fn watch_units(&self, _name: &str) -> Result<NotifyWatcher> {
        let (handle, watcher) = watcher::channel();
        self.lock().unit_watchers.push(handle);
        Ok(watcher)
    }

    async fn watch_provisioning_info(&self, _name: &str) -> Result<NotifyWatcher> {
        let (handle, watcher) = watcher::channel();
        self.lock().provisioning_watchers.push(handle);
        Ok(watcher)
    }

    async fn provisioning_state(&self, _name: &str) -> Result<Option<ProvisioningState>> {
        Ok(self.lock().stored_provisioning)
    }

    async fn set_provisioning_state(&self, name: &str, state: ProvisioningState) -> Result<()> {
        let mut inner = self.lock();
        if let Some(fault) = inner.set_provisioning_faults.pop_front() {
            return Err(fault.into_error(&format!("setting provisioning state for {name}")));
        }
        inner.provisioning_state_calls.push(state);
        inner.stored_provisioning = Some(state);
        Ok(())
    }

    async fn provisioning_info(&self, name: &str) -> Result<ProvisioningInfo> {
        self.lock()
            .provisioning_info
            .clone()
            .ok_or_else(|| Error::not_found(format!("provisioning info for {name}")))
    }

    async fn charm_info(&self, charm_url: &str) -> Result<CharmInfo> {
        self.lock()
            .charm_info
            .clone()
            .ok_or_else(|| Error::not_found(format!("charm {charm_url}")))
    }

    async fn application_charm_info(&self, name: &str) -> Result<CharmInfo> {
        self.lock()
            .application_charm_info
            .clone()
            .ok_or_else(|| Error::not_found(format!("application {name}")))
    }

    async fn application_oci_resources(
        &self,
        _name: &str,
    ) -> Result<BTreeMap<String, OciImage>> {
        Ok(self.lock().oci_resources.clone())
    }

    async fn set_password(&self, _name: &str, password: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.password = Some(password.to_string());
        inner.set_password_calls += 1;
        Ok(())
    }

    async fn units(&self, _name: &str) -> Result<Vec<ApplicationUnit>> {
        Ok(self.lock().units.clone())
    }

    async fn update_units(&self, args: UpdateUnitsArgs) -> Result<Option<UpdateUnitsResult>> {
        let mut inner = self.lock();
        if let Some(fault) = inner.update_units_fault {
            return Err(fault.into_error("updating units"));
        }
        inner.last_update_units = Some(args);
        Ok(inner.update_units_result.clone())
    }

    async fn destroy_units(&self, units: &[String]) -> Result<()> {
        self.lock().destroyed_units.extend_from_slice(units);
        Ok(())
    }

    async fn remove_unit(&self, unit: &str) -> Result<()> {
        self.lock().removed_units.push(unit.to_string());
        Ok(())
    }

    async fn clear_application_resources(&self, _name: &str) -> Result<()> {
        self.lock().resources_cleared = true;
        Ok(())
    }

    async fn set_operator_status(
        &self,
        _name: &str,
        status: StatusValue,
        message: &str,
        _data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.lock()
            .operator_statuses
            .push((status, message.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit facade
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UnitFacadeState {
    scale: Option<usize>,
    trust: Option<bool>,
    service_updates: Vec<ServiceUpdate>,
    scale_watchers: Vec<NotifyHandle>,
    trust_watchers: Vec<NotifyHandle>,
}

#[derive(Clone, Default)]
pub struct MockUnitFacade {
    inner: Arc<Mutex<UnitFacadeState>>,
}

impl MockUnitFacade {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, UnitFacadeState> {
        self.inner.lock().expect("mock unit facade lock poisoned")
    }

    /// `None` makes `application_scale` answer not-found.
    pub fn set_scale(&self, scale: Option<usize>) {
        self.lock().scale = scale;
    }

    pub fn set_trust(&self, trust: Option<bool>) {
        self.lock().trust = trust;
    }

    pub fn service_updates(&self) -> Vec<ServiceUpdate> {
        self.lock().service_updates.clone()
    }

    pub fn fire_scale_changed(&self) {
        fire_all(&self.lock().scale_watchers);
    }

    pub fn fire_trust_changed(&self) {
        fire_all(&self.lock().trust_watchers);
    }
}

#[async_trait]
impl UnitFacade for MockUnitFacade {
    async fn watch_application_scale(&self, _name: &str) -> Result<NotifyWatcher> {
        let (handle, watcher) = watcher::channel();
        self.lock().scale_watchers.push(handle);
        Ok(watcher)
    }

    async fn watch_application_trust_hash(&self, _name: &str) -> Result<NotifyWatcher> {
        let (handle, watcher) = watcher::channel();
        self.lock().trust_watchers.push(handle);
        Ok(watcher)
    }

    async fn application_scale(&self, name: &str) -> Result<usize> {
        self.lock()
            .scale
            .ok_or_else(|| Error::not_found(format!("application {name} scale")))
    }

    async fn application_trust(&self, name: &str) -> Result<bool> {
        self.lock()
            .trust
            .ok_or_else(|| Error::not_found(format!("application {name} trust")))
    }

    async fn update_application_service(&self, update: ServiceUpdate) -> Result<()> {
        self.lock().service_updates.push(update);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Substrate application
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ApplicationMockState {
    ensure_calls: Vec<ApplicationConfig>,
    ensure_fault: Option<Fault>,
    existence_queue: VecDeque<ApplicationExistence>,
    existence: ApplicationExistence,
    scale_calls: Vec<usize>,
    trust_calls: Vec<bool>,
    units_to_remove: Vec<String>,
    units_to_remove_requests: Vec<usize>,
    state: ApplicationState,
    service: Option<ServiceInfo>,
    units: Vec<BrokerUnit>,
    delete_calls: u32,
    app_watchers: Vec<NotifyHandle>,
    replica_watchers: Vec<NotifyHandle>,
}

#[derive(Clone, Default)]
pub struct MockApplication {
    inner: Arc<Mutex<ApplicationMockState>>,
}

impl MockApplication {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ApplicationMockState> {
        self.inner.lock().expect("mock application lock poisoned")
    }

    pub fn set_ensure_fault(&self, fault: Fault) {
        self.lock().ensure_fault = Some(fault);
    }

    pub fn ensure_calls(&self) -> Vec<ApplicationConfig> {
        self.lock().ensure_calls.clone()
    }

    /// Persistent existence answer once the queue is drained.
    pub fn set_existence(&self, existence: ApplicationExistence) {
        self.lock().existence = existence;
    }

    /// One-shot existence answers, served in order.
    pub fn push_existence(&self, existence: ApplicationExistence) {
        self.lock().existence_queue.push_back(existence);
    }

    pub fn scale_calls(&self) -> Vec<usize> {
        self.lock().scale_calls.clone()
    }

    pub fn trust_calls(&self) -> Vec<bool> {
        self.lock().trust_calls.clone()
    }

    pub fn set_units_to_remove(&self, units: Vec<String>) {
        self.lock().units_to_remove = units;
    }

    pub fn units_to_remove_requests(&self) -> Vec<usize> {
        self.lock().units_to_remove_requests.clone()
    }

    pub fn set_state(&self, state: ApplicationState) {
        self.lock().state = state;
    }

    pub fn set_service(&self, service: Option<ServiceInfo>) {
        self.lock().service = service;
    }

    pub fn set_units(&self, units: Vec<BrokerUnit>) {
        self.lock().units = units;
    }

    pub fn delete_calls(&self) -> u32 {
        self.lock().delete_calls
    }

    pub fn fire_app_changed(&self) {
        fire_all(&self.lock().app_watchers);
    }

    pub fn fire_replicas_changed(&self) {
        fire_all(&self.lock().replica_watchers);
    }
}

#[async_trait]
impl Application for MockApplication {
    async fn watch(&self) -> Result<NotifyWatcher> {
        let (handle, watcher) = watcher::channel();
        self.lock().app_watchers.push(handle);
        Ok(watcher)
    }

    async fn watch_replicas(&self) -> Result<NotifyWatcher> {
        let (handle, watcher) = watcher::channel();
        self.lock().replica_watchers.push(handle);
        Ok(watcher)
    }

    async fn ensure(&self, config: ApplicationConfig) -> Result<()> {
        let mut inner = self.lock();
        if let Some(fault) = inner.ensure_fault {
            return Err(fault.into_error("ensuring application"));
        }
        inner.ensure_calls.push(config);
        Ok(())
    }

    async fn exists(&self) -> Result<ApplicationExistence> {
        let mut inner = self.lock();
        Ok(inner.existence_queue.pop_front().unwrap_or(inner.existence))
    }

    async fn scale(&self, target: usize) -> Result<()> {
        self.lock().scale_calls.push(target);
        Ok(())
    }

    async fn trust(&self, trust: bool) -> Result<()> {
        self.lock().trust_calls.push(trust);
        Ok(())
    }

    async fn units_to_remove(&self, target: usize) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.units_to_remove_requests.push(target);
        Ok(inner.units_to_remove.clone())
    }

    async fn state(&self) -> Result<ApplicationState> {
        Ok(self.lock().state.clone())
    }

    async fn service(&self) -> Result<Option<ServiceInfo>> {
        Ok(self.lock().service.clone())
    }

    async fn units(&self) -> Result<Vec<BrokerUnit>> {
        Ok(self.lock().units.clone())
    }

    async fn delete(&self) -> Result<()> {
        self.lock().delete_calls += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Substrate broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerMockState {
    operator_queue: VecDeque<OperatorState>,
    operator: OperatorState,
    workload_units_queue: VecDeque<Vec<BrokerUnit>>,
    deleted_services: Vec<String>,
    deleted_operators: Vec<String>,
    annotations: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct MockBroker {
    pub app: MockApplication,
    inner: Arc<Mutex<BrokerMockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerMockState> {
        self.inner.lock().expect("mock broker lock poisoned")
    }

    /// One-shot operator probes, served in order; the default (no operator)
    /// applies once drained.
    pub fn push_operator(&self, operator: OperatorState) {
        self.lock().operator_queue.push_back(operator);
    }

    /// One-shot workload unit listings, served in order; empty once drained.
    pub fn push_workload_units(&self, units: Vec<BrokerUnit>) {
        self.lock().workload_units_queue.push_back(units);
    }

    pub fn deleted_services(&self) -> Vec<String> {
        self.lock().deleted_services.clone()
    }

    pub fn deleted_operators(&self) -> Vec<String> {
        self.lock().deleted_operators.clone()
    }

    /// Recorded `(provider_id, unit)` annotation pairs.
    pub fn annotations(&self) -> Vec<(String, String)> {
        self.lock().annotations.clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn application(&self, _name: &str, _deployment_type: DeploymentType) -> Box<dyn Application> {
        Box::new(self.app.clone())
    }

    async fn operator_exists(&self, _name: &str) -> Result<OperatorState> {
        let mut inner = self.lock();
        Ok(inner.operator_queue.pop_front().unwrap_or(inner.operator))
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.lock().deleted_services.push(name.to_string());
        Ok(())
    }

    async fn delete_operator(&self, name: &str) -> Result<()> {
        self.lock().deleted_operators.push(name.to_string());
        Ok(())
    }

    async fn units(&self, _name: &str, _mode: UnitMode) -> Result<Vec<BrokerUnit>> {
        let mut inner = self.lock();
        Ok(inner.workload_units_queue.pop_front().unwrap_or_default())
    }

    async fn annotate_unit(
        &self,
        _app: &str,
        _mode: UnitMode,
        provider_id: &str,
        unit: &str,
    ) -> Result<()> {
        self.lock()
            .annotations
            .push((provider_id.to_string(), unit.to_string()));
        Ok(())
    }
}
