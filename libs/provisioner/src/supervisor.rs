//! Lifecycle glue for the per-application workers.
//!
//! The provisioner owns one worker task per application. It forwards
//! external wake-ups, fans a single shutdown signal out to every worker and
//! its child waits, and propagates the first fatal worker error to the
//! embedding process. A worker stopping with [`Error::Dying`] is a clean
//! stop, not a failure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::facade::{ProvisionerFacade, UnitFacade};
use crate::shutdown;
use crate::status::StatusValue;
use crate::worker::{notify_channel, AppHandle, AppWorker, AppWorkerConfig};

struct WorkerRecord {
    handle: AppHandle,
    task: JoinHandle<Result<()>>,
    started_at: DateTime<Utc>,
}

pub struct Provisioner {
    model_tag: String,
    facade: Arc<dyn ProvisionerFacade>,
    unit_facade: Arc<dyn UnitFacade>,
    broker: Arc<dyn Broker>,
    workers: HashMap<String, WorkerRecord>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Provisioner {
    pub fn new(
        config: &Config,
        facade: Arc<dyn ProvisionerFacade>,
        unit_facade: Arc<dyn UnitFacade>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        Self {
            model_tag: config.model_tag.clone(),
            facade,
            unit_facade,
            broker,
            workers: HashMap::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Start a worker for the named application if one is not already
    /// running, and return its wake-up handle.
    pub fn ensure_worker(&mut self, name: &str) -> AppHandle {
        if let Some(record) = self.workers.get(name) {
            return record.handle.clone();
        }

        info!(app = %name, "starting application worker");
        let worker = AppWorker::new(
            AppWorkerConfig {
                name: name.to_string(),
                model_tag: self.model_tag.clone(),
                facade: Arc::clone(&self.facade),
                unit_facade: Arc::clone(&self.unit_facade),
                broker: Arc::clone(&self.broker),
            },
            self.shutdown_rx.clone(),
        );
        let (handle, notify_rx) = notify_channel();

        let facade = Arc::clone(&self.facade);
        let app_name = name.to_string();
        let task = tokio::spawn(async move {
            let result = worker.run(notify_rx).await;
            match &result {
                Ok(()) => info!(app = %app_name, "application worker finished"),
                Err(Error::Dying) => debug!(app = %app_name, "application worker stopped"),
                Err(e) => {
                    error!(app = %app_name, error = %e, "application worker failed");
                    if let Err(status_err) = facade
                        .set_operator_status(&app_name, StatusValue::Error, &e.to_string(), None)
                        .await
                    {
                        warn!(
                            app = %app_name,
                            error = %status_err,
                            "failed to record worker failure"
                        );
                    }
                }
            }
            result
        });

        let record = WorkerRecord {
            handle: handle.clone(),
            task,
            started_at: Utc::now(),
        };
        self.workers.insert(name.to_string(), record);
        handle
    }

    /// Wake the named application's worker. Returns false if no worker is
    /// running for it.
    pub fn notify(&self, name: &str) -> bool {
        match self.workers.get(name) {
            Some(record) => {
                record.handle.notify();
                true
            }
            None => false,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Remove workers whose task has completed. The first fatal error found
    /// is returned so the embedding process can decide whether to restart.
    pub async fn reap_finished(&mut self) -> Result<()> {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, record)| record.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        let mut first_error = None;
        for name in finished {
            let record = self.workers.remove(&name).expect("worker disappeared");
            let uptime = Utc::now() - record.started_at;
            match record.task.await {
                Ok(Ok(())) | Ok(Err(Error::Dying)) => {
                    debug!(app = %name, uptime_secs = uptime.num_seconds(), "reaped worker");
                }
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(Error::other(format!(
                            "worker for {name} panicked: {join_err}"
                        )));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Signal every worker to stop and wait for them to finish.
    pub async fn stop(&mut self) {
        info!(count = self.workers.len(), "stopping application workers");
        let _ = self.shutdown_tx.send(true);

        for (name, record) in self.workers.drain() {
            match record.task.await {
                Ok(Ok(())) | Ok(Err(Error::Dying)) => {}
                Ok(Err(e)) => warn!(app = %name, error = %e, "worker failed during shutdown"),
                Err(join_err) => warn!(app = %name, error = %join_err, "worker panicked"),
            }
        }
    }
}
