//! Control-plane facade contracts.
//!
//! The worker talks to the control plane through two client surfaces: the
//! provisioner facade (application life, provisioning info, unit records)
//! and the unit facade (declared scale and trust). Both are remote-API
//! clients owned by the embedding process; this crate only defines the
//! contracts it consumes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::life::Life;
use crate::state::ProvisioningState;
use crate::status::{StatusInfo, StatusValue};
use crate::watcher::NotifyWatcher;

/// Declarative packaging format of an application's charm. Sidecar mode
/// requires `V2` or later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharmFormat {
    Unknown,
    V1,
    V2,
}

/// Charm deployment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharmInfo {
    pub format: CharmFormat,
    /// Declared workload containers by name.
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Name of the OCI resource backing this container.
    pub resource: String,
    #[serde(default)]
    pub mounts: Vec<ContainerMount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMount {
    pub storage: String,
    pub location: String,
}

/// An OCI image resolved from a charm resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OciImage {
    pub registry_path: String,
}

/// Registry details for the agent image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDetails {
    pub registry_path: String,
    pub repository: String,
    pub is_private: bool,
}

/// Operating-system base the charm declares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub name: String,
    pub channel: Channel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub track: String,
    pub risk: String,
}

/// Filesystem the application requests from the substrate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemTemplate {
    pub storage_name: String,
    pub size_mib: u64,
    #[serde(default)]
    pub attachment_path: String,
}

/// Device constraint the application requests from the substrate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConstraint {
    pub device_type: String,
    pub count: u64,
}

/// Everything needed to render an application onto the substrate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningInfo {
    pub charm_url: Option<String>,
    pub image_details: ImageDetails,
    pub base: Base,
    /// Agent version to deploy.
    pub version: String,
    pub api_addresses: Vec<String>,
    pub ca_cert: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub constraints: serde_json::Value,
    #[serde(default)]
    pub filesystems: Vec<FilesystemTemplate>,
    #[serde(default)]
    pub devices: Vec<DeviceConstraint>,
    pub charm_modified_version: i32,
    pub trust: bool,
    pub scale: usize,
}

/// A unit as recorded by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUnit {
    pub name: String,
    pub agent_status: StatusInfo,
}

/// Observed state for one unit, pushed back to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitUpdate {
    pub provider_id: String,
    pub address: String,
    pub ports: Vec<String>,
    pub stateful: bool,
    pub status: StatusInfo,
    #[serde(default)]
    pub filesystem_info: Vec<FilesystemUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemUpdate {
    pub storage_name: String,
    pub filesystem_id: String,
    pub size_mib: u64,
    pub mount_point: String,
    pub read_only: bool,
    pub status: StatusInfo,
    pub volume: VolumeUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    pub volume_id: String,
    pub size_mib: u64,
    pub persistent: bool,
    pub status: StatusInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateUnitsArgs {
    pub application: String,
    pub status: Option<StatusInfo>,
    pub units: Vec<UnitUpdate>,
}

/// Units the control plane acknowledged, with the provider ids it assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateUnitsResult {
    pub units: Vec<AcknowledgedUnit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgedUnit {
    pub name: String,
    pub provider_id: String,
}

/// Service address update pushed to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub application: String,
    pub provider_id: String,
    pub addresses: Vec<String>,
}

/// Provisioner-side control-plane client.
#[async_trait]
pub trait ProvisionerFacade: Send + Sync {
    /// Life of an application or unit by name.
    async fn life(&self, entity: &str) -> Result<Life>;

    async fn watch_application(&self, name: &str) -> Result<NotifyWatcher>;
    async fn watch_units(&self, name: &str) -> Result<NotifyWatcher>;
    async fn watch_provisioning_info(&self, name: &str) -> Result<NotifyWatcher>;

    async fn provisioning_state(&self, name: &str) -> Result<Option<ProvisioningState>>;
    async fn set_provisioning_state(&self, name: &str, state: ProvisioningState) -> Result<()>;

    async fn provisioning_info(&self, name: &str) -> Result<ProvisioningInfo>;
    async fn charm_info(&self, charm_url: &str) -> Result<CharmInfo>;
    async fn application_charm_info(&self, name: &str) -> Result<CharmInfo>;
    async fn application_oci_resources(&self, name: &str)
        -> Result<BTreeMap<String, OciImage>>;

    async fn set_password(&self, name: &str, password: &str) -> Result<()>;

    async fn units(&self, name: &str) -> Result<Vec<ApplicationUnit>>;
    async fn update_units(&self, args: UpdateUnitsArgs) -> Result<Option<UpdateUnitsResult>>;
    async fn destroy_units(&self, units: &[String]) -> Result<()>;
    async fn remove_unit(&self, unit: &str) -> Result<()>;

    async fn clear_application_resources(&self, name: &str) -> Result<()>;

    async fn set_operator_status(
        &self,
        name: &str,
        status: StatusValue,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<()>;
}

/// Unit-provisioner-side control-plane client: declared scale and trust.
#[async_trait]
pub trait UnitFacade: Send + Sync {
    async fn watch_application_scale(&self, name: &str) -> Result<NotifyWatcher>;
    async fn watch_application_trust_hash(&self, name: &str) -> Result<NotifyWatcher>;

    async fn application_scale(&self, name: &str) -> Result<usize>;
    async fn application_trust(&self, name: &str) -> Result<bool>;

    async fn update_application_service(&self, update: ServiceUpdate) -> Result<()>;
}
