//! stratus application provisioner
//!
//! Supervisory control loops that drive applications on a container
//! substrate from created to alive to dying to dead, keeping their scale,
//! trust flag and unit roster reconciled with declared state while watcher
//! events, external wake-ups and retries race one another.
//!
//! ## Architecture
//!
//! One worker task per application, single-owner state, cooperative
//! scheduling:
//!
//! ```text
//! Provisioner (supervisor glue)
//! └── AppWorker(name)           one event loop per application
//!     ├── Reconciler            idempotent convergence decisions
//!     └── AppState              life, provisioning, last-applied config
//! ```
//!
//! The control-plane facades and the substrate broker are external
//! collaborators; this crate defines their contracts ([`facade`],
//! [`broker`]) and ships in-memory fakes ([`testing`]) for exercising the
//! loops without a cluster.
//!
//! ## Modules
//!
//! - `worker`: the per-application event loop
//! - `reconciler`: desired-vs-observed convergence decisions
//! - `supervisor`: worker lifecycle, shutdown fan-out, error propagation
//! - `state`: the application record owned by the loop
//! - `facade` / `broker`: external contracts

pub mod broker;
pub mod config;
pub mod error;
pub mod facade;
pub mod life;
pub mod reconciler;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod testing;
pub mod watcher;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use life::Life;
pub use state::{AppState, ProvisioningState};
pub use status::{StatusInfo, StatusValue};
pub use supervisor::Provisioner;
pub use worker::{AppHandle, AppWorker, AppWorkerConfig};
