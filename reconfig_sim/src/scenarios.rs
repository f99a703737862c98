//! Conformance scenarios.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// RC-001: two units on one switch, load conflict while the first is active
    ExclusiveSwitch,

    /// RC-002: deactivation waits for the transaction count to drain
    DrainOnDeactivate,

    /// RC-003: every transition resets every registered component once
    ResetRoundTrip,

    /// RC-004: units loaded one after another share one driver identity
    DriverIdentity,

    /// RC-005: two tasks load conflicting units at the same instant
    ConcurrentLoadConflict,

    /// RC-006: permanent side talks to an exportal with no active unit
    ExportalFallback,

    /// RC-007: weighted relay counter spanning two units
    RelayCounter,

    /// RC-008: seeded random control sequence under traffic
    RandomWorkload,

    /// RC-009: a parked permanent-side read follows the unit swap
    BlockingHandover,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ExclusiveSwitch,
            ScenarioId::DrainOnDeactivate,
            ScenarioId::ResetRoundTrip,
            ScenarioId::DriverIdentity,
            ScenarioId::ConcurrentLoadConflict,
            ScenarioId::ExportalFallback,
            ScenarioId::RelayCounter,
            ScenarioId::RandomWorkload,
            ScenarioId::BlockingHandover,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ExclusiveSwitch => "exclusive_switch",
            ScenarioId::DrainOnDeactivate => "drain_on_deactivate",
            ScenarioId::ResetRoundTrip => "reset_round_trip",
            ScenarioId::DriverIdentity => "driver_identity",
            ScenarioId::ConcurrentLoadConflict => "concurrent_load_conflict",
            ScenarioId::ExportalFallback => "exportal_fallback",
            ScenarioId::RelayCounter => "relay_counter",
            ScenarioId::RandomWorkload => "random_workload",
            ScenarioId::BlockingHandover => "blocking_handover",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ExclusiveSwitch => "Load A (10ns), activate A, load B must conflict with state unchanged",
            ScenarioId::DrainOnDeactivate => "Deactivate with N pending transactions completes at the last decrement",
            ScenarioId::ResetRoundTrip => "k components see one reset per transition and end at their initial value",
            ScenarioId::DriverIdentity => "Blocking driver writes from two units reach the bus as one writer",
            ScenarioId::ConcurrentLoadConflict => "Racing loads on a shared switch: exactly one wins",
            ScenarioId::ExportalFallback => "Fallback answers while closed, blocking transfer resumes on activation",
            ScenarioId::RelayCounter => "Relay weights fan out to two units and deactivation waits for its share",
            ScenarioId::RandomWorkload => "Random control operations with producer traffic, checked by the oracle",
            ScenarioId::BlockingHandover => "A reader parked in the old unit's inbox is served by the next unit's process",
        }
    }

    /// Returns true if the scenario draws from the seeded RNG.
    pub fn is_randomized(&self) -> bool {
        matches!(self, ScenarioId::RandomWorkload)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exclusive_switch" | "exclusive" | "rc-001" => Ok(ScenarioId::ExclusiveSwitch),
            "drain_on_deactivate" | "drain" | "rc-002" => Ok(ScenarioId::DrainOnDeactivate),
            "reset_round_trip" | "reset" | "rc-003" => Ok(ScenarioId::ResetRoundTrip),
            "driver_identity" | "driver" | "rc-004" => Ok(ScenarioId::DriverIdentity),
            "concurrent_load_conflict" | "conflict" | "rc-005" => Ok(ScenarioId::ConcurrentLoadConflict),
            "exportal_fallback" | "fallback" | "rc-006" => Ok(ScenarioId::ExportalFallback),
            "relay_counter" | "relay" | "rc-007" => Ok(ScenarioId::RelayCounter),
            "random_workload" | "random" | "rc-008" => Ok(ScenarioId::RandomWorkload),
            "blocking_handover" | "handover" | "rc-009" => Ok(ScenarioId::BlockingHandover),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
