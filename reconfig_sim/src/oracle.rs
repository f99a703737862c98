//! Invariant oracle for simulation runs.
//!
//! The Oracle watches every state change and gate change a control makes
//! and checks, as they happen:
//! - each unit walks the cycle UNLOADED -> LOADED_INACTIVE -> LOADED_ACTIVE
//!   -> LOADED_INACTIVE -> UNLOADED without skipping a step
//! - a unit only becomes LOADED_ACTIVE with every switch OPEN toward it
//! - at most one unit sees a switch OPEN at any instant

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use reconfig_core::{GateState, ReconfigObserver, ReconfigurableUnit, SwitchHandle, UnitId, UnitState};
use serde::{Deserialize, Serialize};
use tracing::error;

/// What happened at one point of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    Transition {
        unit: String,
        from: UnitState,
        to: UnitState,
    },
    Gate {
        switch: String,
        unit: String,
        gate: GateState,
    },
}

/// One recorded event with its simulated time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at_ns: u64,
    #[serde(flatten)]
    pub event: TimelineEvent,
}

/// Records the timeline of a run and the invariant violations seen.
#[derive(Debug, Default)]
pub struct Oracle {
    timeline: RefCell<Vec<TimelineEntry>>,
    states: RefCell<HashMap<UnitId, UnitState>>,
    open: RefCell<HashMap<String, String>>,
    violations: RefCell<Vec<String>>,
}

impl Oracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn violation(&self, at: Duration, message: String) {
        error!(at_ns = at.as_nanos() as u64, "invariant violated: {message}");
        self.violations
            .borrow_mut()
            .push(format!("t={}ns: {message}", at.as_nanos()));
    }

    /// All recorded events, in order.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.timeline.borrow().clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.borrow().clone()
    }

    pub fn is_consistent(&self) -> bool {
        self.violations.borrow().is_empty()
    }

    pub fn transition_count(&self) -> usize {
        self.timeline
            .borrow()
            .iter()
            .filter(|e| matches!(e.event, TimelineEvent::Transition { .. }))
            .count()
    }

    pub fn gate_change_count(&self) -> usize {
        self.timeline
            .borrow()
            .iter()
            .filter(|e| matches!(e.event, TimelineEvent::Gate { .. }))
            .count()
    }

    /// Unit currently holding `switch` OPEN, if any.
    pub fn open_unit(&self, switch: &str) -> Option<String> {
        self.open.borrow().get(switch).cloned()
    }
}

impl ReconfigObserver for Oracle {
    fn on_transition(&self, at: Duration, unit: &ReconfigurableUnit, from: UnitState, to: UnitState) {
        self.timeline.borrow_mut().push(TimelineEntry {
            at_ns: at.as_nanos() as u64,
            event: TimelineEvent::Transition {
                unit: unit.name().to_string(),
                from,
                to,
            },
        });

        let known = self
            .states
            .borrow_mut()
            .insert(unit.id(), to)
            .unwrap_or(UnitState::Unloaded);
        if known != from {
            self.violation(
                at,
                format!("{} left {from} but was last seen {known}", unit.name()),
            );
        }
        if !from.successors().contains(&to) {
            self.violation(at, format!("{} jumped from {from} to {to}", unit.name()));
        }
        if to == UnitState::LoadedActive {
            for switch in unit.switches() {
                if switch.gate_toward(unit.id()) != GateState::Open {
                    self.violation(
                        at,
                        format!("{} active while '{}' is not open toward it", unit.name(), switch.name()),
                    );
                }
            }
        }
    }

    fn on_gate(&self, at: Duration, switch: &SwitchHandle, unit: &ReconfigurableUnit, gate: GateState) {
        self.timeline.borrow_mut().push(TimelineEntry {
            at_ns: at.as_nanos() as u64,
            event: TimelineEvent::Gate {
                switch: switch.name().to_string(),
                unit: unit.name().to_string(),
                gate,
            },
        });

        let mut open = self.open.borrow_mut();
        if gate == GateState::Open {
            if let Some(holder) = open.get(switch.name()) {
                if holder != unit.name() {
                    let message = format!(
                        "'{}' opened toward {} while open toward {holder}",
                        switch.name(),
                        unit.name()
                    );
                    drop(open);
                    self.violation(at, message);
                    return;
                }
            }
            open.insert(switch.name().to_string(), unit.name().to_string());
        } else if open.get(switch.name()).map(String::as_str) == Some(unit.name()) {
            open.remove(switch.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconfig_core::{Action, Control, Portal, Signal, SignalIf};
    use reconfig_env::SimContext;
    use std::rc::Rc;

    #[test]
    fn test_oracle_records_clean_cycle() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let control = Control::new(&ctx, "ctrl");
        let oracle = Rc::new(Oracle::new());
        control.add_observer(oracle.clone());

        let portal: Portal<dyn SignalIf<u32>> = Portal::new(&ctx, "S");
        portal
            .bind_static(Signal::new(&ctx, "sig", 0u32).as_interface())
            .unwrap();
        let unit = ReconfigurableUnit::new("A");
        unit.set_delay(Action::Unload, Duration::from_nanos(3));
        control.add(&unit).unwrap();
        portal.bind(&unit).unwrap();

        let result = sim.block_on({
            let (control, unit) = (control.clone(), unit.clone());
            async move {
                control.load(&unit).await?;
                control.activate(&unit).await?;
                control.deactivate(&unit).await?;
                control.unload(&unit).await
            }
        });
        assert_eq!(result, Ok(Ok(())));
        assert!(oracle.is_consistent(), "{:?}", oracle.violations());
        assert_eq!(oracle.transition_count(), 4);
        assert_eq!(oracle.gate_change_count(), 4);
        assert_eq!(oracle.open_unit("S"), None);

        let last = oracle.timeline().pop().unwrap();
        assert_eq!(last.at_ns, 3);
        assert_eq!(
            last.event,
            TimelineEvent::Transition {
                unit: "A".into(),
                from: UnitState::LoadedInactive,
                to: UnitState::Unloaded,
            }
        );
    }

    #[test]
    fn test_oracle_flags_skipped_state() {
        let oracle = Oracle::new();
        let unit = ReconfigurableUnit::new("A");
        oracle.on_transition(Duration::ZERO, &unit, UnitState::Unloaded, UnitState::LoadedActive);
        assert!(!oracle.is_consistent());
        assert_eq!(oracle.violations().len(), 1);
    }

    #[test]
    fn test_timeline_entry_json_shape() {
        let entry = TimelineEntry {
            at_ns: 10,
            event: TimelineEvent::Gate {
                switch: "S".into(),
                unit: "A".into(),
                gate: GateState::Open,
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "gate");
        assert_eq!(json["at_ns"], 10);
        assert_eq!(json["gate"], "open");
    }
}
