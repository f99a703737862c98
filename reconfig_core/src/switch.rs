//! Switch core.
//!
//! Every switch, whatever interface it carries, shares the same bookkeeping:
//! a gate state, the unit currently occupying it, the units bound to it and
//! a count of blocking calls in flight. The typed half (portal or exportal)
//! sits behind [`SwitchBackend`] and reacts to gate changes by connecting or
//! disconnecting its accessors.
//!
//! Gate changes are only made by [`Control`](crate::Control) as part of a
//! unit transition.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{ReconfigError, Result};
use crate::state::{GateState, SwitchKind, UnitId};
use crate::unit::ReconfigurableUnit;

/// Boundary callbacks of a switch carrying interface `I`.
///
/// `channel` is the channel on the far side of the gate when there is one:
/// the permanent channel for a portal, the occupant's exported channel for
/// an exportal. All methods default to doing nothing.
pub trait SwitchHooks<I: ?Sized> {
    /// The gate became OPEN.
    fn on_open(&self, _switch: &SwitchHandle, _channel: Option<&I>) {}

    /// The gate became CLOSED.
    fn on_close(&self, _switch: &SwitchHandle, _channel: Option<&I>) {}

    /// The gate became UNDEFINED.
    fn on_undefined(&self, _switch: &SwitchHandle, _channel: Option<&I>) {}

    /// [`SwitchHandle::refresh_notify`] was called.
    fn on_refresh(&self, _switch: &SwitchHandle, _channel: Option<&I>) {}
}

/// Typed half of a switch.
pub(crate) trait SwitchBackend {
    fn kind(&self) -> SwitchKind;

    fn interface_name(&self) -> &'static str;

    /// Checks that `unit` can be loaded onto this switch.
    fn check_ready(&self, unit: UnitId) -> std::result::Result<(), String>;

    fn open(&self, switch: &SwitchHandle, unit: UnitId);

    fn close(&self, switch: &SwitchHandle, unit: UnitId);

    fn undefine(&self, switch: &SwitchHandle, unit: UnitId);

    fn refresh(&self, switch: &SwitchHandle);

    fn unbind(&self, unit: UnitId);
}

pub(crate) struct SwitchCore {
    name: String,
    gate: Cell<GateState>,
    occupant: RefCell<Option<(UnitId, String)>>,
    bound: RefCell<Vec<UnitId>>,
    in_flight: Cell<usize>,
    gate_changes: Cell<u64>,
}

impl SwitchCore {
    pub(crate) fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            gate: Cell::new(GateState::Undefined),
            occupant: RefCell::new(None),
            bound: RefCell::new(Vec::new()),
            in_flight: Cell::new(0),
            gate_changes: Cell::new(0),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn gate(&self) -> GateState {
        self.gate.get()
    }

    /// Registers `unit` as a candidate. Fails on a second binding.
    pub(crate) fn add_bound(&self, unit: &ReconfigurableUnit) -> Result<()> {
        let mut bound = self.bound.borrow_mut();
        if bound.contains(&unit.id()) {
            return Err(ReconfigError::binding(
                &self.name,
                format!("unit '{}' is already bound", unit.name()),
            ));
        }
        bound.push(unit.id());
        Ok(())
    }

    pub(crate) fn is_bound(&self, unit: UnitId) -> bool {
        self.bound.borrow().contains(&unit)
    }

    /// Marks a blocking call as in flight until the guard drops.
    pub(crate) fn enter(self: &Rc<Self>) -> InFlight {
        self.in_flight.set(self.in_flight.get() + 1);
        InFlight { core: self.clone() }
    }
}

pub(crate) struct InFlight {
    core: Rc<SwitchCore>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.core
            .in_flight
            .set(self.core.in_flight.get().saturating_sub(1));
    }
}

/// Type-erased handle to a switch.
#[derive(Clone)]
pub struct SwitchHandle {
    core: Rc<SwitchCore>,
    backend: Rc<dyn SwitchBackend>,
}

impl SwitchHandle {
    pub(crate) fn new(core: Rc<SwitchCore>, backend: Rc<dyn SwitchBackend>) -> Self {
        Self { core, backend }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn kind(&self) -> SwitchKind {
        self.backend.kind()
    }

    /// Rust type name of the interface carried by this switch.
    pub fn interface_name(&self) -> &'static str {
        self.backend.interface_name()
    }

    pub fn gate(&self) -> GateState {
        self.core.gate.get()
    }

    /// Gate state as seen by `unit`: the real gate for the occupant,
    /// CLOSED for every other unit while the switch is occupied, and
    /// UNDEFINED otherwise.
    pub fn gate_toward(&self, unit: UnitId) -> GateState {
        match self.occupant_id() {
            Some(id) if id == unit => self.gate(),
            Some(_) => GateState::Closed,
            None => GateState::Undefined,
        }
    }

    /// Name of the unit occupying the switch.
    pub fn occupant(&self) -> Option<String> {
        self.core.occupant.borrow().as_ref().map(|(_, n)| n.clone())
    }

    pub fn occupant_id(&self) -> Option<UnitId> {
        self.core.occupant.borrow().as_ref().map(|(id, _)| *id)
    }

    /// Units bound to this switch, in binding order.
    pub fn bound_units(&self) -> Vec<UnitId> {
        self.core.bound.borrow().clone()
    }

    pub fn is_bound(&self, unit: UnitId) -> bool {
        self.core.is_bound(unit)
    }

    /// Number of blocking forwards currently in flight.
    pub fn in_flight(&self) -> usize {
        self.core.in_flight.get()
    }

    /// Number of gate changes so far.
    pub fn gate_changes(&self) -> u64 {
        self.core.gate_changes.get()
    }

    /// Re-notifies every relayed event and runs the `on_refresh` hooks.
    pub fn refresh_notify(&self) {
        self.backend.refresh(self);
    }

    /// True if both handles refer to the same switch.
    pub fn same_switch(&self, other: &SwitchHandle) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    // ------------------------------------------------------------------
    // Transition support
    // ------------------------------------------------------------------

    pub(crate) fn check_ready(&self, unit: UnitId) -> Result<()> {
        self.backend
            .check_ready(unit)
            .map_err(|reason| ReconfigError::binding(self.name(), reason))
    }

    /// Name of the unit holding the switch, if it is not `unit`.
    pub(crate) fn conflicting_occupant(&self, unit: UnitId) -> Option<String> {
        match &*self.core.occupant.borrow() {
            Some((id, name)) if *id != unit => Some(name.clone()),
            _ => None,
        }
    }

    /// Claims the switch for `unit` and closes the gate toward it.
    pub(crate) fn occupy(&self, unit: &ReconfigurableUnit) {
        *self.core.occupant.borrow_mut() = Some((unit.id(), unit.name().to_string()));
        self.set_gate(GateState::Closed, unit.id());
    }

    /// Gives the switch up if `unit` holds it.
    pub(crate) fn release(&self, unit: UnitId) {
        let mut occupant = self.core.occupant.borrow_mut();
        if matches!(&*occupant, Some((id, _)) if *id == unit) {
            *occupant = None;
        }
    }

    pub(crate) fn set_gate(&self, gate: GateState, unit: UnitId) {
        let previous = self.core.gate.replace(gate);
        self.core
            .gate_changes
            .set(self.core.gate_changes.get() + 1);
        if gate != GateState::Open && self.in_flight() > 0 {
            warn!(
                switch = %self.name(),
                in_flight = self.in_flight(),
                %gate,
                "switch leaves OPEN with communication in flight"
            );
        }
        debug!(switch = %self.name(), %unit, from = %previous, to = %gate, "gate change");
        match gate {
            GateState::Open => self.backend.open(self, unit),
            GateState::Closed => self.backend.close(self, unit),
            GateState::Undefined => self.backend.undefine(self, unit),
        }
    }

    pub(crate) fn unbind(&self, unit: UnitId) {
        self.core.bound.borrow_mut().retain(|id| *id != unit);
        self.backend.unbind(unit);
    }
}

impl std::fmt::Debug for SwitchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchHandle")
            .field("name", &self.core.name)
            .field("gate", &self.core.gate.get())
            .field("occupant", &self.occupant())
            .finish()
    }
}
