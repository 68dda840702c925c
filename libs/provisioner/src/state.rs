//! In-memory snapshot of one application's provisioning life.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::broker::ApplicationConfig;
use crate::life::Life;
use crate::status::StatusInfo;

/// Scale operation in progress, persisted through the control plane so it
/// survives worker restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningState {
    pub scaling: bool,
    pub scale_target: usize,
}

/// Per-application record, mutated exclusively by the owning worker's event
/// loop. There is at most one live worker per application name.
#[derive(Debug)]
pub struct AppState {
    pub name: String,
    pub model_tag: String,

    /// Introduction password, generated once per worker lifetime.
    pub password: Option<String>,

    life: Life,

    pub provisioning: ProvisioningState,

    /// Snapshot of the last configuration successfully applied to the
    /// substrate; set only after a successful `Ensure`.
    pub last_applied: Option<ApplicationConfig>,

    /// Last status observed per provider unit id, used to demote unchanged
    /// statuses when reporting upstream.
    pub last_reported_unit_status: HashMap<String, StatusInfo>,
}

impl AppState {
    pub fn new(name: impl Into<String>, model_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_tag: model_tag.into(),
            password: None,
            life: Life::Alive,
            provisioning: ProvisioningState::default(),
            last_applied: None,
            last_reported_unit_status: HashMap::new(),
        }
    }

    pub fn life(&self) -> Life {
        self.life
    }

    /// Record an observed life value. Life is monotone: an observation that
    /// would move the application away from `Dead` is ignored.
    pub fn observe_life(&mut self, observed: Life) {
        if observed < self.life {
            warn!(
                app = %self.name,
                current = %self.life,
                observed = %observed,
                "ignoring life regression"
            );
            return;
        }
        self.life = observed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn life_never_regresses() {
        let mut state = AppState::new("red", "model-test");
        assert_eq!(state.life(), Life::Alive);

        state.observe_life(Life::Dying);
        assert_eq!(state.life(), Life::Dying);

        state.observe_life(Life::Alive);
        assert_eq!(state.life(), Life::Dying);

        state.observe_life(Life::Dead);
        state.observe_life(Life::Dying);
        assert_eq!(state.life(), Life::Dead);
    }

    #[test]
    fn provisioning_starts_idle() {
        let state = AppState::new("red", "model-test");
        assert!(!state.provisioning.scaling);
        assert_eq!(state.provisioning.scale_target, 0);
    }
}
