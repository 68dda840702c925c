//! Entity lifecycle values.

use serde::{Deserialize, Serialize};

/// Lifecycle of an application or unit.
///
/// Life only ever moves toward `Dead`; `Dead` is terminal. The derived
/// ordering (`Alive < Dying < Dead`) is what makes the monotonicity check in
/// the application state cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn is_terminal(self) -> bool {
        self == Life::Dead
    }
}

impl std::fmt::Display for Life {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn life_orders_toward_dead() {
        assert!(Life::Alive < Life::Dying);
        assert!(Life::Dying < Life::Dead);
        assert!(Life::Dead.is_terminal());
        assert!(!Life::Dying.is_terminal());
    }
}
