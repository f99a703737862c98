//! Unit states, reconfiguration actions and switch gate states.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lifecycle state of a reconfigurable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Unloaded,
    LoadedInactive,
    LoadedActive,
}

impl UnitState {
    /// Returns true for both loaded states.
    pub fn is_loaded(&self) -> bool {
        !matches!(self, Self::Unloaded)
    }

    /// The state that follows `self` on the reconfiguration cycle
    /// UNLOADED -> LOADED_INACTIVE -> LOADED_ACTIVE -> LOADED_INACTIVE -> UNLOADED.
    ///
    /// LOADED_INACTIVE has two successors, so the previous state decides.
    pub fn successors(&self) -> &'static [UnitState] {
        match self {
            Self::Unloaded => &[Self::LoadedInactive],
            Self::LoadedInactive => &[Self::LoadedActive, Self::Unloaded],
            Self::LoadedActive => &[Self::LoadedInactive],
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unloaded => "UNLOADED",
            Self::LoadedInactive => "LOADED_INACTIVE",
            Self::LoadedActive => "LOADED_ACTIVE",
        };
        f.write_str(s)
    }
}

/// The four reconfiguration actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Load,
    Activate,
    Deactivate,
    Unload,
}

impl Action {
    /// All actions, in cycle order.
    pub fn all() -> [Action; 4] {
        [Self::Load, Self::Activate, Self::Deactivate, Self::Unload]
    }

    /// State the unit must be in for the action to be valid.
    pub fn source(&self) -> UnitState {
        match self {
            Self::Load => UnitState::Unloaded,
            Self::Activate => UnitState::LoadedInactive,
            Self::Deactivate => UnitState::LoadedActive,
            Self::Unload => UnitState::LoadedInactive,
        }
    }

    /// State the unit is in once the action completes.
    pub fn target(&self) -> UnitState {
        match self {
            Self::Load => UnitState::LoadedInactive,
            Self::Activate => UnitState::LoadedActive,
            Self::Deactivate => UnitState::LoadedInactive,
            Self::Unload => UnitState::Unloaded,
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Load => 0,
            Self::Activate => 1,
            Self::Deactivate => 2,
            Self::Unload => 3,
        }
    }

    /// Lowercase action name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Unload => "unload",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Forwarding mode of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// No unit is loaded on the switch. Calls get the fallback answer.
    Undefined,
    /// A unit is loaded but not active. Blocking calls wait.
    Closed,
    /// Calls are forwarded to the active unit.
    Open,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Undefined => "UNDEFINED",
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
        };
        f.write_str(s)
    }
}

/// Direction of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchKind {
    /// Unit-side ports reach a permanent channel.
    Portal,
    /// Permanent-side ports reach a channel exported by the active unit.
    Exportal,
}

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a reconfigurable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(u64);

impl UnitId {
    pub(crate) fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Per-action delays. All zero by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayTable {
    delays: [Duration; 4],
}

impl DelayTable {
    /// Returns the delay of `action`.
    pub fn get(&self, action: Action) -> Duration {
        self.delays[action.index()]
    }

    /// Sets the delay of `action`.
    pub fn set(&mut self, action: Action, delay: Duration) {
        self.delays[action.index()] = delay;
    }

    /// Builder-style setter.
    pub fn with(mut self, action: Action, delay: Duration) -> Self {
        self.set(action, delay);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_walk_the_cycle() {
        let mut state = UnitState::Unloaded;
        for action in Action::all() {
            assert_eq!(action.source(), state);
            assert!(state.successors().contains(&action.target()));
            state = action.target();
        }
        assert_eq!(state, UnitState::Unloaded);
    }

    #[test]
    fn test_delay_table_defaults_to_zero() {
        let table = DelayTable::default().with(Action::Load, Duration::from_nanos(10));
        assert_eq!(table.get(Action::Load), Duration::from_nanos(10));
        assert_eq!(table.get(Action::Activate), Duration::ZERO);
    }

    #[test]
    fn test_unit_ids_are_unique() {
        let a = UnitId::next();
        let b = UnitId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(UnitState::LoadedActive.to_string(), "LOADED_ACTIVE");
        assert_eq!(GateState::Closed.to_string(), "CLOSED");
        assert_eq!(Action::Deactivate.to_string(), "deactivate");
    }
}
