//! Reconciliation decisions for one application.
//!
//! Each decision compares declared state (from the control plane) with
//! observed state (from the substrate) and performs the minimum work to
//! converge them. Decisions are idempotent: the event loop is free to re-run
//! them until they report no more work, and a [`Error::TryAgain`] outcome
//! asks the caller to re-arm its timer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{
    image_for_base, Application, ApplicationConfig, ApplicationState, Broker, ContainerConfig,
    MountConfig, UnitMode,
};
use crate::error::{Error, Result};
use crate::facade::{
    FilesystemUpdate, ProvisionerFacade, UnitFacade, UnitUpdate, UpdateUnitsArgs, VolumeUpdate,
};
use crate::life::Life;
use crate::retry::{self, RetrySchedule};
use crate::state::{AppState, ProvisioningState};
use crate::status::{StatusInfo, StatusValue};

/// Bounded wait for substrate objects to disappear after a delete.
const TERMINATION_RETRY: RetrySchedule =
    RetrySchedule::new(60, Duration::from_secs(3)).with_max_duration(Duration::from_secs(180));

/// What the charm-format gate recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharmUpgradeAdvice {
    /// The charm speaks the sidecar format; provisioning can proceed.
    Proceed,
    /// The charm is still being upgraded; wait for the next change.
    Wait,
    /// The application is gone or dead; the worker should exit.
    Exit,
}

/// Outcome of [`Reconciler::ensure_alive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureReason {
    Deployed,
    Updated,
    Unchanged,
}

impl std::fmt::Display for EnsureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnsureReason::Deployed => "deployed",
            EnsureReason::Updated => "updated",
            EnsureReason::Unchanged => "unchanged",
        };
        write!(f, "{s}")
    }
}

pub struct Reconciler {
    facade: Arc<dyn ProvisionerFacade>,
    unit_facade: Arc<dyn UnitFacade>,
    broker: Arc<dyn Broker>,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        facade: Arc<dyn ProvisionerFacade>,
        unit_facade: Arc<dyn UnitFacade>,
        broker: Arc<dyn Broker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            facade,
            unit_facade,
            broker,
            shutdown,
        }
    }

    /// Check whether the application's charm has reached the sidecar format.
    pub async fn charm_upgrade_advice(&self, name: &str) -> Result<CharmUpgradeAdvice> {
        let charm = match self.facade.application_charm_info(name).await {
            Err(e) if e.is_not_found() => {
                debug!(app = %name, "application no longer exists");
                return Ok(CharmUpgradeAdvice::Exit);
            }
            Err(e) => {
                return Err(e.annotate(format!("getting charm info for application {name}")))
            }
            Ok(info) => info,
        };
        if charm.format >= crate::facade::CharmFormat::V2 {
            debug!(app = %name, "application charm is at the sidecar format");
            return Ok(CharmUpgradeAdvice::Proceed);
        }

        match self.facade.life(name).await {
            Err(e) if e.is_not_found() => {
                debug!(app = %name, "application no longer exists");
                Ok(CharmUpgradeAdvice::Exit)
            }
            Err(e) => Err(e),
            Ok(Life::Dead) => {
                debug!(app = %name, "application now dead");
                Ok(CharmUpgradeAdvice::Exit)
            }
            Ok(_) => Ok(CharmUpgradeAdvice::Wait),
        }
    }

    /// Make the substrate objects match the declared configuration.
    pub async fn ensure_alive(
        &self,
        state: &mut AppState,
        app: &dyn Application,
    ) -> Result<EnsureReason> {
        let name = state.name.clone();
        debug!(app = %name, "ensuring application exists");

        let info = self
            .facade
            .provisioning_info(&name)
            .await
            .map_err(|e| e.annotate("retrieving provisioning info"))?;
        let charm_url = info
            .charm_url
            .as_deref()
            .ok_or_else(|| Error::other("missing charm url in provisioning info"))?;

        let charm = self
            .facade
            .charm_info(charm_url)
            .await
            .map_err(|e| e.annotate(format!("retrieving charm deployment info for {name}")))?;

        let existence = app
            .exists()
            .await
            .map_err(|e| e.annotate(format!("retrieving application state for {name}")))?;
        if existence.exists && existence.terminating {
            self.wait_for_terminated(&name, app).await.map_err(|e| {
                e.annotate(format!(
                    "{name} was terminating and there was an error waiting for it to stop"
                ))
            })?;
        }

        let images = self
            .facade
            .application_oci_resources(&name)
            .await
            .map_err(|e| e.annotate("getting OCI image resources"))?;

        let charm_base_image = image_for_base(&info.image_details.repository, &info.base)
            .map_err(|e| e.annotate("getting image for base"))?;

        let mut containers = BTreeMap::new();
        for (container_name, spec) in &charm.containers {
            if spec.resource.is_empty() {
                return Err(Error::other(format!(
                    "container {container_name} has an empty resource reference"
                )));
            }
            let image = images.get(&spec.resource).ok_or_else(|| {
                Error::not_found(format!("referenced charm base image resource {}", spec.resource))
            })?;
            containers.insert(
                container_name.clone(),
                ContainerConfig {
                    name: container_name.clone(),
                    image: image.clone(),
                    mounts: spec
                        .mounts
                        .iter()
                        .map(|m| MountConfig {
                            storage_name: m.storage.clone(),
                            path: m.location.clone(),
                        })
                        .collect(),
                },
            );
        }

        let config = ApplicationConfig {
            is_private_image_repo: info.image_details.is_private,
            introduction_secret: state.password.clone().unwrap_or_default(),
            agent_version: info.version.clone(),
            agent_image_path: info.image_details.registry_path.clone(),
            controller_addresses: info.api_addresses.join(","),
            controller_cert_bundle: info.ca_cert.clone(),
            resource_tags: info.tags.clone(),
            constraints: info.constraints.clone(),
            filesystems: info.filesystems.clone(),
            devices: info.devices.clone(),
            charm_base_image_path: charm_base_image,
            containers,
            charm_modified_version: info.charm_modified_version,
            trust: info.trust,
            initial_scale: info.scale,
        };

        let mut reason = EnsureReason::Unchanged;
        if state.last_applied.as_ref() != Some(&config) {
            if let Err(err) = app.ensure(config.clone()).await {
                let _ = self
                    .set_application_status(&name, StatusValue::Error, &err.to_string())
                    .await;
                return Err(err.annotate(format!("ensuring application {name}")));
            }
            state.last_applied = Some(config);
            reason = if existence.exists {
                EnsureReason::Updated
            } else {
                EnsureReason::Deployed
            };
        }
        debug!(app = %name, reason = %reason, "application ensured");
        Ok(reason)
    }

    /// Drive the substrate's replica count toward the declared scale.
    pub async fn ensure_scale(&self, state: &mut AppState, app: &dyn Application) -> Result<()> {
        let name = state.name.clone();
        let desired_scale = match state.life() {
            Life::Alive => self
                .unit_facade
                .application_scale(&name)
                .await
                .map_err(|e| e.annotate(format!("fetching application {name} desired scale")))?,
            Life::Dying | Life::Dead => 0,
        };

        debug!(app = %name, scale = desired_scale, "updating application scale");
        if !state.provisioning.scaling || state.life() != Life::Alive {
            self.update_provisioning_state(state, true, desired_scale)
                .await?;
        }

        let units = self.facade.units(&name).await?;
        if state.provisioning.scale_target >= units.len() {
            info!(app = %name, scale = state.provisioning.scale_target, "scaling application to desired scale");
            app.scale(state.provisioning.scale_target).await?;
            return self.update_provisioning_state(state, false, 0).await;
        }

        let units_to_destroy = match app.units_to_remove(state.provisioning.scale_target).await {
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                return Err(e.annotate(format!(
                    "scaling application {name} to desired scale {}",
                    state.provisioning.scale_target
                )))
            }
            Ok(units) => units,
        };

        if !units_to_destroy.is_empty() {
            self.facade.destroy_units(&units_to_destroy).await?;
        }

        if state.provisioning.scale_target != desired_scale {
            // The pending target is stale; another pass is needed once the
            // current contraction settles.
            debug!(
                app = %name,
                scale_target = state.provisioning.scale_target,
                desired = desired_scale,
                "scale target is stale"
            );
            return Err(Error::TryAgain);
        }

        Ok(())
    }

    /// Finish a scale-down once the substrate has quiesced enough dead units
    /// to match the desired contraction.
    pub async fn reconcile_dead_unit_scale(
        &self,
        state: &mut AppState,
        app: &dyn Application,
    ) -> Result<()> {
        let name = state.name.clone();
        let units = self
            .facade
            .units(&name)
            .await
            .map_err(|e| e.annotate(format!("getting units for application {name}")))?;

        if !state.provisioning.scaling {
            return Ok(());
        }

        let desired_scale = state.provisioning.scale_target;
        let mut units_to_remove = units.len() as i64 - desired_scale as i64;

        let mut dead_units = Vec::new();
        for unit in &units {
            let unit_life = self
                .facade
                .life(&unit.name)
                .await
                .map_err(|e| e.annotate(format!("getting life for unit {}", unit.name)))?;
            if unit_life == Life::Dead {
                dead_units.push(unit.name.clone());
            }
        }

        if units_to_remove <= 0 {
            units_to_remove = dead_units.len() as i64;
        }

        // Not enough units have quiesced to reach the contraction yet.
        if units_to_remove != dead_units.len() as i64 {
            return Ok(());
        }

        info!(app = %name, scale = desired_scale, "scaling application to desired scale");
        match app.scale(desired_scale).await {
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(
                    e.annotate(format!("scaling application {name} to scale {desired_scale}"))
                )
            }
            Ok(()) => {}
        }

        let app_state = match app.state().await {
            Err(e) if e.is_not_found() => ApplicationState::default(),
            Err(e) => return Err(e),
            Ok(s) => s,
        };
        if app_state.replicas.len() > desired_scale {
            return Err(Error::TryAgain);
        }

        for dead_unit in &dead_units {
            info!(unit = %dead_unit, "removing dead unit");
            match self.facade.remove_unit(dead_unit).await {
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.annotate(format!("removing dead unit {dead_unit}"))),
                Ok(()) => {}
            }
        }

        self.update_provisioning_state(state, false, 0).await
    }

    /// Apply the declared trust flag to the substrate.
    pub async fn ensure_trust(&self, state: &AppState, app: &dyn Application) -> Result<()> {
        let name = &state.name;
        let desired_trust = self
            .unit_facade
            .application_trust(name)
            .await
            .map_err(|e| e.annotate(format!("fetching application {name} desired trust")))?;

        debug!(app = %name, trust = desired_trust, "updating application trust");
        app.trust(desired_trust).await.map_err(|e| {
            e.annotate(format!(
                "updating application {name} to desired trust {desired_trust}"
            ))
        })?;
        Ok(())
    }

    /// Scale a dying application down to zero and reap its dead units.
    pub async fn dying(&self, state: &mut AppState, app: &dyn Application) -> Result<()> {
        debug!(app = %state.name, "application dying");
        self.ensure_scale(state, app)
            .await
            .map_err(|e| e.annotate("cannot scale dying application to 0"))?;
        self.reconcile_dead_unit_scale(state, app)
            .await
            .map_err(|e| e.annotate("cannot reconcile dead units in dying application"))?;
        Ok(())
    }

    /// Tear the application down and release its control-plane resources.
    pub async fn dead(&self, state: &mut AppState, app: &dyn Application) -> Result<()> {
        let name = state.name.clone();
        debug!(app = %name, "application dead");
        self.dying(state, app).await?;

        match app.delete().await {
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        self.wait_for_terminated(&name, app)
            .await
            .map_err(|e| e.annotate(format!("waiting for application {name} to terminate")))?;

        // Releases the hold that kept the record alive upstream.
        self.facade.clear_application_resources(&name).await?;

        state.last_reported_unit_status.clear();
        self.update_state(state, app).await?;
        Ok(())
    }

    /// Poll the substrate until the application's objects are gone.
    pub async fn wait_for_terminated(&self, name: &str, app: &dyn Application) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        retry::call(TERMINATION_RETRY, &mut shutdown, move || async move {
            let existence = app.exists().await?;
            if !existence.exists {
                return Ok(());
            }
            if !existence.terminating {
                return Err(Error::other(format!(
                    "application {name} should be terminating but is now running"
                )));
            }
            Err(Error::TryAgain)
        })
        .await
    }

    /// Report Waiting while a scale-up settles, Active otherwise.
    pub async fn refresh_application_status(
        &self,
        state: &AppState,
        app: &dyn Application,
    ) -> Result<()> {
        if state.life() != Life::Alive {
            return Ok(());
        }
        let name = &state.name;
        let substrate_state = match app.state().await {
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
            Ok(s) => s,
        };
        let units = match self.facade.units(name).await {
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
            Ok(units) => units,
        };
        let ready_units = units
            .iter()
            .filter(|u| u.agent_status.status == StatusValue::Active)
            .count();
        if substrate_state.desired_replicas > 0 && substrate_state.desired_replicas > ready_units {
            // Only scale-up waits; on scale-down the surviving units keep
            // running and the application stays active.
            return self
                .set_application_status(name, StatusValue::Waiting, "waiting for units to settle down")
                .await;
        }
        self.set_application_status(name, StatusValue::Active, "")
            .await
    }

    /// Push observed service and unit state back to the control plane, and
    /// annotate acknowledged units on the substrate.
    pub async fn update_state(&self, state: &mut AppState, app: &dyn Application) -> Result<()> {
        let name = state.name.clone();

        let mut app_status = None;
        let service = match app.service().await {
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
            Ok(service) => service,
        };
        if let Some(service) = service {
            app_status = Some(service.status.clone());
            match self
                .unit_facade
                .update_application_service(crate::facade::ServiceUpdate {
                    application: name.clone(),
                    provider_id: service.id,
                    addresses: service.addresses,
                })
                .await
            {
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
                Ok(()) => {}
            }
        }

        let units = app.units().await?;

        let mut reported = std::collections::HashMap::new();
        let mut args = UpdateUnitsArgs {
            application: name.clone(),
            status: app_status,
            units: Vec::new(),
        };
        for unit in units {
            // Units the substrate is already reaping are treated as gone.
            if unit.dying {
                continue;
            }
            let mut unit_status = unit.status.clone();
            let last_status = state.last_reported_unit_status.get(&unit.id);
            reported.insert(unit.id.clone(), unit.status.clone());
            if let Some(last_status) = last_status {
                if *last_status == unit_status {
                    // Unchanged since the last report: demote to unknown so
                    // the control plane keeps its authoritative value.
                    unit_status = StatusInfo::unknown();
                }
            }
            args.units.push(UnitUpdate {
                provider_id: unit.id,
                address: unit.address,
                ports: unit.ports,
                stateful: unit.stateful,
                status: unit_status,
                filesystem_info: unit
                    .filesystem_info
                    .into_iter()
                    .map(|fs| FilesystemUpdate {
                        storage_name: fs.storage_name,
                        filesystem_id: fs.filesystem_id,
                        size_mib: fs.size_mib,
                        mount_point: fs.mount_point,
                        read_only: fs.read_only,
                        status: fs.status,
                        volume: VolumeUpdate {
                            volume_id: fs.volume.volume_id,
                            size_mib: fs.volume.size_mib,
                            persistent: fs.volume.persistent,
                            status: fs.volume.status,
                        },
                    })
                    .collect(),
            });
        }

        let acknowledged = match self.facade.update_units(args).await {
            // The worker will be stopped anyway when the application is
            // gone, and forbidden or not-leader responses are expected when
            // events arrive out of order.
            Err(e)
                if e.is_forbidden() || e.is_not_found() || matches!(e, Error::NotLeader) =>
            {
                warn!(app = %name, error = %e, "update units");
                None
            }
            Err(e) => return Err(e),
            Ok(result) => result,
        };

        if let Some(acknowledged) = acknowledged {
            for unit in acknowledged.units {
                match self
                    .broker
                    .annotate_unit(&name, UnitMode::Sidecar, &unit.provider_id, &unit.name)
                    .await
                {
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                    Ok(()) => {}
                }
            }
        }

        state.last_reported_unit_status = reported;
        Ok(())
    }

    pub async fn set_application_status(
        &self,
        name: &str,
        status: StatusValue,
        message: &str,
    ) -> Result<()> {
        debug!(app = %name, status = ?status, message = %message, "updating application status");
        self.facade
            .set_operator_status(name, status, message, None)
            .await
    }

    async fn update_provisioning_state(
        &self,
        state: &mut AppState,
        scaling: bool,
        scale_target: usize,
    ) -> Result<()> {
        let new_state = ProvisioningState {
            scaling,
            scale_target,
        };
        match self
            .facade
            .set_provisioning_state(&state.name, new_state)
            .await
        {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(e) => Err(e.annotate(format!(
                "setting provisioning state for application {}",
                state.name
            ))),
            Ok(()) => {
                state.provisioning = new_state;
                Ok(())
            }
        }
    }
}
