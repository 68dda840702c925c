//! Substrate broker contracts.
//!
//! The broker renders declarative application configuration into substrate
//! objects (a workload orchestrator backend). The worker never touches the
//! substrate API directly; it drives an [`Application`] handle obtained from
//! the [`Broker`] and assumes the adapter is thread-safe.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::facade::{Base, DeviceConstraint, FilesystemTemplate, OciImage};
use crate::status::StatusInfo;
use crate::watcher::NotifyWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    Stateful,
    Stateless,
    Daemon,
}

/// Which generation of workload a unit query addresses: legacy workload pods
/// or sidecar pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitMode {
    Workload,
    Sidecar,
}

/// The full configuration rendered onto the substrate for one application.
/// Structural equality against the last applied snapshot is what gates
/// re-ensuring, so every field must compare exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub is_private_image_repo: bool,
    pub introduction_secret: String,
    pub agent_version: String,
    pub agent_image_path: String,
    /// Comma-joined controller API addresses.
    pub controller_addresses: String,
    pub controller_cert_bundle: String,
    pub resource_tags: BTreeMap<String, String>,
    pub constraints: serde_json::Value,
    pub filesystems: Vec<FilesystemTemplate>,
    pub devices: Vec<DeviceConstraint>,
    pub charm_base_image_path: String,
    pub containers: BTreeMap<String, ContainerConfig>,
    pub charm_modified_version: i32,
    pub trust: bool,
    pub initial_scale: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub image: OciImage,
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    pub storage_name: String,
    pub path: String,
}

/// Existence probe for an application's substrate objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplicationExistence {
    pub exists: bool,
    pub terminating: bool,
}

/// Existence probe for a legacy operator pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorState {
    pub exists: bool,
    pub terminating: bool,
}

/// Replica bookkeeping as the substrate sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationState {
    pub desired_replicas: usize,
    /// Provider ids of the current replicas.
    pub replicas: Vec<String>,
}

/// The service fronting an application's units.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub id: String,
    pub addresses: Vec<String>,
    pub status: StatusInfo,
}

/// A unit as the substrate reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerUnit {
    /// Provider id, e.g. the pod name.
    pub id: String,
    pub address: String,
    pub ports: Vec<String>,
    pub dying: bool,
    pub stateful: bool,
    pub status: StatusInfo,
    pub filesystem_info: Vec<FilesystemAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilesystemAttachment {
    pub storage_name: String,
    pub filesystem_id: String,
    pub size_mib: u64,
    pub mount_point: String,
    pub read_only: bool,
    pub status: StatusInfo,
    pub volume: VolumeAttachment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub size_mib: u64,
    pub persistent: bool,
    pub status: StatusInfo,
}

/// Substrate adapter entry points not tied to a single application handle.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Obtain a handle on the named application's substrate objects.
    fn application(&self, name: &str, deployment_type: DeploymentType) -> Box<dyn Application>;

    async fn operator_exists(&self, name: &str) -> Result<OperatorState>;
    async fn delete_service(&self, name: &str) -> Result<()>;
    async fn delete_operator(&self, name: &str) -> Result<()>;
    async fn units(&self, name: &str, mode: UnitMode) -> Result<Vec<BrokerUnit>>;
    async fn annotate_unit(
        &self,
        app: &str,
        mode: UnitMode,
        provider_id: &str,
        unit: &str,
    ) -> Result<()>;
}

/// Handle on one application's substrate objects.
#[async_trait]
pub trait Application: Send + Sync {
    async fn watch(&self) -> Result<NotifyWatcher>;
    async fn watch_replicas(&self) -> Result<NotifyWatcher>;

    /// Render the configuration onto the substrate, creating or updating
    /// objects as needed.
    async fn ensure(&self, config: ApplicationConfig) -> Result<()>;

    async fn exists(&self) -> Result<ApplicationExistence>;
    async fn scale(&self, target: usize) -> Result<()>;
    async fn trust(&self, trust: bool) -> Result<()>;

    /// Which units the substrate would remove to reach the target scale.
    async fn units_to_remove(&self, target: usize) -> Result<Vec<String>>;

    async fn state(&self) -> Result<ApplicationState>;
    async fn service(&self) -> Result<Option<ServiceInfo>>;
    async fn units(&self) -> Result<Vec<BrokerUnit>>;
    async fn delete(&self) -> Result<()>;
}

/// Image path for the charm base, derived from the configured repository and
/// the declared base. The risk suffix is omitted for stable channels.
pub fn image_for_base(repository: &str, base: &Base) -> Result<String> {
    if base.name.is_empty() || base.channel.track.is_empty() {
        return Err(Error::other("charm base is missing a name or channel track"));
    }
    let repository = repository.trim_end_matches('/');
    let tag = match base.channel.risk.as_str() {
        "" | "stable" => format!("{}-{}", base.name, base.channel.track),
        risk => format!("{}-{}-{}", base.name, base.channel.track, risk),
    };
    Ok(format!("{repository}/charm-base:{tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::Channel;

    fn base(name: &str, track: &str, risk: &str) -> Base {
        Base {
            name: name.to_string(),
            channel: Channel {
                track: track.to_string(),
                risk: risk.to_string(),
            },
        }
    }

    #[test]
    fn image_for_base_formats_stable_channels() {
        let image = image_for_base("registry.example.com/stratus", &base("ubuntu", "22.04", "stable"))
            .unwrap();
        assert_eq!(image, "registry.example.com/stratus/charm-base:ubuntu-22.04");
    }

    #[test]
    fn image_for_base_appends_non_stable_risk() {
        let image =
            image_for_base("registry.example.com/stratus", &base("ubuntu", "22.04", "edge")).unwrap();
        assert_eq!(
            image,
            "registry.example.com/stratus/charm-base:ubuntu-22.04-edge"
        );
    }

    #[test]
    fn image_for_base_rejects_missing_base() {
        assert!(image_for_base("repo", &base("", "22.04", "stable")).is_err());
        assert!(image_for_base("repo", &base("ubuntu", "", "stable")).is_err());
    }

    #[test]
    fn application_config_compares_structurally() {
        let mut a = ApplicationConfig {
            agent_version: "3.1.0".to_string(),
            initial_scale: 3,
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a, b);

        a.trust = true;
        assert_ne!(a, b);
    }
}
