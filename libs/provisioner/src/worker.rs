//! The per-application provisioning worker.
//!
//! One worker owns one application: it multiplexes watcher notifications,
//! debounce timers, external wake-ups, a shutdown signal and a periodic
//! status refresh, and dispatches each wake-up to the matching
//! reconciliation decision. All application state is owned by this loop;
//! nothing else mutates it.
//!
//! Scale and trust notifications are debounced: a watcher event only arms
//! the matching timer, so bursts coalesce into a single reconciler run.
//! Decisions answering `TryAgain` re-arm their timer at a fixed delay, and
//! not-found answers are retried a bounded number of times before the
//! worker gives up.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::broker::{Application, Broker, DeploymentType, UnitMode};
use crate::error::{Error, Result};
use crate::facade::{ProvisionerFacade, UnitFacade};
use crate::life::Life;
use crate::reconciler::{CharmUpgradeAdvice, Reconciler};
use crate::shutdown;
use crate::state::AppState;
use crate::watcher::NotifyWatcher;

const MAX_RETRIES: u32 = 20;
const RETRY_DELAY: Duration = Duration::from_secs(3);
const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Everything a worker needs to run, minus the notify channel.
pub struct AppWorkerConfig {
    pub name: String,
    pub model_tag: String,
    pub facade: Arc<dyn ProvisionerFacade>,
    pub unit_facade: Arc<dyn UnitFacade>,
    pub broker: Arc<dyn Broker>,
}

/// Handle for waking a worker up after an external lifecycle event.
#[derive(Clone)]
pub struct AppHandle {
    notify_tx: mpsc::Sender<()>,
}

impl AppHandle {
    /// Wake the worker. Non-blocking; coalesces with a pending wake-up.
    pub fn notify(&self) {
        let _ = self.notify_tx.try_send(());
    }
}

/// Create the notify channel for a worker, pre-seeded so the loop runs one
/// reconciliation pass immediately on entry.
pub fn notify_channel() -> (AppHandle, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(());
    (AppHandle { notify_tx: tx }, rx)
}

/// Timers, lazily started watchers and counters local to one loop run.
#[derive(Default)]
struct EventState {
    app_watcher: Option<NotifyWatcher>,
    provision_watcher: Option<NotifyWatcher>,
    replica_watcher: Option<NotifyWatcher>,

    scale_at: Option<Instant>,
    scale_tries: u32,
    trust_at: Option<Instant>,
    trust_tries: u32,
    reconcile_dead_at: Option<Instant>,
    state_changed_at: Option<Instant>,

    initial: bool,
    done: bool,
}

pub struct AppWorker {
    facade: Arc<dyn ProvisionerFacade>,
    unit_facade: Arc<dyn UnitFacade>,
    broker: Arc<dyn Broker>,
    reconciler: Reconciler,
    state: AppState,
    shutdown: watch::Receiver<bool>,
}

impl AppWorker {
    pub fn new(config: AppWorkerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&config.facade),
            Arc::clone(&config.unit_facade),
            Arc::clone(&config.broker),
            shutdown_rx.clone(),
        );
        Self {
            facade: config.facade,
            unit_facade: config.unit_facade,
            broker: config.broker,
            reconciler,
            state: AppState::new(config.name, config.model_tag),
            shutdown: shutdown_rx,
        }
    }

    /// Drive the application until it is removed, dead and torn down, or the
    /// worker is asked to stop ([`Error::Dying`]).
    pub async fn run(mut self, mut notify_rx: mpsc::Receiver<()>) -> Result<()> {
        let name = self.state.name.clone();
        let app = self.broker.application(&name, DeploymentType::Stateful);

        match self.facade.life(&name).await {
            Err(e) if e.is_not_found() => {
                debug!(app = %name, "application no longer exists");
                return Ok(());
            }
            Err(e) => {
                return Err(e.annotate(format!("fetching life status for application {name}")))
            }
            Ok(life) => self.state.observe_life(life),
        }
        if self.state.life() == Life::Dead {
            return self
                .reconciler
                .dead(&mut self.state, app.as_ref())
                .await
                .map_err(|e| e.annotate(format!("deleting application {name}")));
        }

        if self.verify_charm_upgraded().await? {
            return Ok(());
        }

        self.reap_legacy_operator().await?;

        // Set once per worker start so the credential does not churn.
        let password = generate_password();
        self.facade
            .set_password(&name, &password)
            .await
            .map_err(|e| e.annotate("failed to set application api password"))?;
        self.state.password = Some(password);

        let scale_watcher = self
            .unit_facade
            .watch_application_scale(&name)
            .await
            .map_err(|e| e.annotate(format!("creating application {name} scale watcher")))?;
        let trust_watcher = self
            .unit_facade
            .watch_application_trust_hash(&name)
            .await
            .map_err(|e| e.annotate(format!("creating application {name} trust watcher")))?;
        let units_watcher = self
            .facade
            .watch_units(&name)
            .await
            .map_err(|e| e.annotate(format!("creating application {name} units watcher")))?;

        if let Some(provisioning) = self
            .facade
            .provisioning_state(&name)
            .await
            .map_err(|e| e.annotate(format!("getting provisioning state for application {name}")))?
        {
            self.state.provisioning = provisioning;
        }

        self.event_loop(
            app.as_ref(),
            &mut notify_rx,
            scale_watcher,
            trust_watcher,
            units_watcher,
        )
        .await
    }

    async fn event_loop(
        &mut self,
        app: &dyn Application,
        notify_rx: &mut mpsc::Receiver<()>,
        mut scale_watcher: NotifyWatcher,
        mut trust_watcher: NotifyWatcher,
        mut units_watcher: NotifyWatcher,
    ) -> Result<()> {
        let name = self.state.name.clone();
        let mut shutdown_rx = self.shutdown.clone();
        let mut ev = EventState {
            initial: true,
            ..Default::default()
        };

        loop {
            let mut should_refresh = true;
            tokio::select! {
                biased;

                _ = shutdown::wait(&mut shutdown_rx) => {
                    return Err(Error::Dying);
                }

                changed = scale_watcher.changes() => {
                    if changed.is_none() {
                        return Err(Error::other(format!(
                            "application {name} scale watcher closed channel"
                        )));
                    }
                    if ev.scale_at.is_none() {
                        ev.scale_tries = 0;
                        ev.scale_at = Some(Instant::now());
                    }
                    should_refresh = false;
                }

                _ = armed(ev.scale_at) => {
                    match self.reconciler.ensure_scale(&mut self.state, app).await {
                        Err(e) if e.is_not_found() => {
                            if ev.scale_tries >= MAX_RETRIES {
                                return Err(e.annotate(format!(
                                    "more than {MAX_RETRIES} retries ensuring scale"
                                )));
                            }
                            ev.scale_tries += 1;
                            ev.scale_at = Some(Instant::now() + RETRY_DELAY);
                            should_refresh = false;
                        }
                        Err(Error::TryAgain) => {
                            ev.scale_at = Some(Instant::now() + RETRY_DELAY);
                        }
                        Err(e) => return Err(e),
                        Ok(()) => ev.scale_at = None,
                    }
                }

                changed = trust_watcher.changes() => {
                    if changed.is_none() {
                        return Err(Error::other(format!(
                            "application {name} trust watcher closed channel"
                        )));
                    }
                    if ev.trust_at.is_none() {
                        ev.trust_tries = 0;
                        ev.trust_at = Some(Instant::now());
                    }
                    should_refresh = false;
                }

                _ = armed(ev.trust_at) => {
                    match self.reconciler.ensure_trust(&self.state, app).await {
                        Err(e) if e.is_not_found() => {
                            if ev.trust_tries >= MAX_RETRIES {
                                return Err(e.annotate(format!(
                                    "more than {MAX_RETRIES} retries ensuring trust"
                                )));
                            }
                            ev.trust_tries += 1;
                            ev.trust_at = Some(Instant::now() + RETRY_DELAY);
                            should_refresh = false;
                        }
                        Err(e) => return Err(e),
                        Ok(()) => ev.trust_at = None,
                    }
                }

                changed = units_watcher.changes() => {
                    if changed.is_none() {
                        return Err(Error::other(format!(
                            "application {name} units watcher closed channel"
                        )));
                    }
                    if ev.reconcile_dead_at.is_none() {
                        ev.reconcile_dead_at = Some(Instant::now());
                    }
                }

                _ = armed(ev.reconcile_dead_at) => {
                    match self
                        .reconciler
                        .reconcile_dead_unit_scale(&mut self.state, app)
                        .await
                    {
                        Err(e) if e.is_not_found() || e.is_try_again() => {
                            ev.reconcile_dead_at = Some(Instant::now() + RETRY_DELAY);
                        }
                        Err(e) => return Err(e.annotate("reconciling dead unit scale")),
                        Ok(()) => ev.reconcile_dead_at = None,
                    }
                }

                wakeup = notify_rx.recv() => {
                    if wakeup.is_none() {
                        // The supervisor handle is gone; the worker is orphaned.
                        return Err(Error::Dying);
                    }
                    if ev.state_changed_at.is_none() {
                        ev.state_changed_at = Some(Instant::now());
                    }
                }

                changed = optional_changes(&mut ev.provision_watcher) => {
                    if changed.is_none() {
                        return Err(Error::other(format!(
                            "application {name} provisioning watcher closed channel"
                        )));
                    }
                    if ev.state_changed_at.is_none() {
                        ev.state_changed_at = Some(Instant::now());
                    }
                }

                _ = armed(ev.state_changed_at) => {
                    match self.handle_change(app, &mut ev).await {
                        Err(Error::TryAgain) => {
                            ev.state_changed_at = Some(Instant::now() + RETRY_DELAY);
                        }
                        Err(e) => return Err(e),
                        Ok(()) => ev.state_changed_at = None,
                    }
                }

                changed = optional_changes(&mut ev.app_watcher) => {
                    if changed.is_none() {
                        return Err(Error::other(format!(
                            "application {name} watcher closed channel"
                        )));
                    }
                    self.reconciler.update_state(&mut self.state, app).await?;
                }

                changed = optional_changes(&mut ev.replica_watcher) => {
                    if changed.is_none() {
                        return Err(Error::other(format!(
                            "application {name} replica watcher closed channel"
                        )));
                    }
                    self.reconciler.update_state(&mut self.state, app).await?;
                }

                _ = time::sleep(STATUS_REFRESH_INTERVAL) => {
                    // Periodic status refresh independent of watcher activity.
                }
            }

            if ev.done {
                return Ok(());
            }
            if should_refresh {
                self.reconciler
                    .refresh_application_status(&self.state, app)
                    .await
                    .map_err(|e| {
                        e.annotate(format!("refreshing application status for {name}"))
                    })?;
            }
        }
    }

    /// Re-read life and dispatch the matching lifecycle decision, lazily
    /// starting the watchers that only make sense once the application is
    /// alive on the substrate.
    async fn handle_change(&mut self, app: &dyn Application, ev: &mut EventState) -> Result<()> {
        let name = self.state.name.clone();
        match self.facade.life(&name).await {
            Err(e) if e.is_not_found() => self.state.observe_life(Life::Dead),
            Err(e) => return Err(e),
            Ok(life) => self.state.observe_life(life),
        }

        if ev.initial && self.state.provisioning.scaling {
            // A previous worker instance left a scale operation in flight;
            // resume it straight away.
            ev.initial = false;
            ev.scale_at = Some(Instant::now());
            ev.reconcile_dead_at = Some(Instant::now());
        }

        match self.state.life() {
            Life::Alive => {
                if ev.provision_watcher.is_none() {
                    ev.provision_watcher =
                        Some(self.facade.watch_provisioning_info(&name).await.map_err(
                            |e| {
                                e.annotate(format!(
                                    "failed to watch facade for changes to application provisioning {name}"
                                ))
                            },
                        )?);
                }
                self.reconciler.ensure_alive(&mut self.state, app).await?;
                if ev.app_watcher.is_none() {
                    ev.app_watcher = Some(app.watch().await.map_err(|e| {
                        e.annotate(format!("failed to watch for changes to application {name}"))
                    })?);
                }
                if ev.replica_watcher.is_none() {
                    ev.replica_watcher = Some(app.watch_replicas().await.map_err(|e| {
                        e.annotate(format!("failed to watch for changes to replicas {name}"))
                    })?);
                }
            }
            Life::Dying => {
                self.reconciler.dying(&mut self.state, app).await?;
            }
            Life::Dead => {
                self.reconciler.dead(&mut self.state, app).await?;
                ev.done = true;
            }
        }
        Ok(())
    }

    /// Block until the charm advertises the sidecar format. Returns `true`
    /// if the worker should exit instead because the application is gone.
    async fn verify_charm_upgraded(&mut self) -> Result<bool> {
        let name = self.state.name.clone();
        let mut watcher = self.facade.watch_application(&name).await.map_err(|e| {
            e.annotate(format!(
                "failed to watch for changes to application {name} when verifying charm upgrade"
            ))
        })?;
        let mut shutdown_rx = self.shutdown.clone();

        loop {
            match self.reconciler.charm_upgrade_advice(&name).await? {
                CharmUpgradeAdvice::Proceed => return Ok(false),
                CharmUpgradeAdvice::Exit => return Ok(true),
                CharmUpgradeAdvice::Wait => {}
            }
            tokio::select! {
                biased;
                _ = shutdown::wait(&mut shutdown_rx) => return Err(Error::Dying),
                changed = watcher.changes() => {
                    if changed.is_none() {
                        return Err(Error::other(format!(
                            "application {name} watcher closed channel"
                        )));
                    }
                }
            }
        }
    }

    /// Delete the leftovers of an in-place upgrade from an operator-style
    /// charm: the old workload service and the operator pod. Bounded; not
    /// converging within the budget is fatal to this worker.
    async fn reap_legacy_operator(&mut self) -> Result<()> {
        let name = self.state.name.clone();

        for attempt in 0.. {
            if attempt >= MAX_RETRIES {
                return Err(Error::other(format!(
                    "couldn't delete operator and service for {name} with {MAX_RETRIES} tries"
                )));
            }
            if attempt > 0 {
                self.sleep(RETRY_DELAY).await?;
            }

            let operator = self.broker.operator_exists(&name).await.map_err(|e| {
                e.annotate(format!(
                    "checking if application {name} has a legacy operator pod"
                ))
            })?;
            if !operator.exists {
                break;
            }

            info!(
                app = %name,
                "application was upgraded from an operator charm, deleting workload and operator pods"
            );
            match self.broker.delete_service(&name).await {
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(
                        e.annotate(format!("deleting workload pod for application {name}"))
                    )
                }
                Ok(()) => {}
            }

            // Wait until the old workload units are gone so the worker never
            // acts on pre-upgrade pods.
            let mut polls = 0;
            loop {
                if polls >= MAX_RETRIES {
                    return Err(Error::other(format!(
                        "workload pods for {name} still present after {MAX_RETRIES} tries"
                    )));
                }
                let units = match self.broker.units(&name, UnitMode::Workload).await {
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => {
                        return Err(e.annotate(format!(
                            "fetching workload units for application {name}"
                        )))
                    }
                    Ok(units) => units,
                };
                if units.is_empty() {
                    break;
                }
                debug!(app = %name, "waiting for workload pods to be deleted");
                polls += 1;
                self.sleep(RETRY_DELAY).await?;
            }

            match self.broker.delete_operator(&name).await {
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(
                        e.annotate(format!("deleting operator pod for application {name}"))
                    )
                }
                Ok(()) => {}
            }
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        let mut shutdown_rx = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown::wait(&mut shutdown_rx) => Err(Error::Dying),
            _ = time::sleep(duration) => Ok(()),
        }
    }
}

/// Sleep until an armed timer fires; never fires while disarmed.
async fn armed(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Wait on a lazily-started watcher; never fires before it is started.
async fn optional_changes(watcher: &mut Option<NotifyWatcher>) -> Option<()> {
    match watcher {
        Some(watcher) => watcher.changes().await,
        None => std::future::pending().await,
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
