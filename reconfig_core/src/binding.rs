//! Positional binding of a unit's ports to a set of switches.
//!
//! A [`PortMap`] lists a unit's connection points in order; a
//! [`SwitchConnector`] lists switches in the same order. Binding pairs
//! them up by position after checking that every pair carries the same
//! interface and the same direction. The check runs over all pairs before
//! anything is bound, so a failed binding leaves the unit untouched.

use std::any::Any;
use std::rc::Rc;

use crate::accessor::AccessorSlot;
use crate::error::{ReconfigError, Result};
use crate::exportal::Exportal;
use crate::filter::{FilterRole, TransactionFilter};
use crate::portal::Portal;
use crate::state::{SwitchKind, UnitState};
use crate::switch::SwitchHandle;
use crate::unit::ReconfigurableUnit;

trait PortEntry {
    fn kind(&self) -> SwitchKind;

    fn interface_name(&self) -> &'static str;

    fn accepts(&self, switch: &dyn Any) -> bool;

    fn bind(&self, unit: &ReconfigurableUnit, switch: &dyn Any) -> Result<()>;
}

fn filter_for(role: FilterRole, unit: &ReconfigurableUnit) -> TransactionFilter {
    match role {
        FilterRole::Input => TransactionFilter::input(unit),
        FilterRole::Output => TransactionFilter::output(unit),
    }
}

/// A unit-side port that calls through a portal.
struct Import<I: ?Sized> {
    slot: AccessorSlot<I>,
    filter: Option<FilterRole>,
}

impl<I: ?Sized + 'static> PortEntry for Import<I> {
    fn kind(&self) -> SwitchKind {
        SwitchKind::Portal
    }

    fn interface_name(&self) -> &'static str {
        std::any::type_name::<I>()
    }

    fn accepts(&self, switch: &dyn Any) -> bool {
        switch.downcast_ref::<Portal<I>>().is_some()
    }

    fn bind(&self, unit: &ReconfigurableUnit, switch: &dyn Any) -> Result<()> {
        let portal = switch.downcast_ref::<Portal<I>>().ok_or_else(|| {
            ReconfigError::binding("port", format!("expected a portal of {}", self.interface_name()))
        })?;
        let accessor = portal.bind(unit)?;
        if let Some(role) = self.filter {
            accessor.add_filter(filter_for(role, unit));
        }
        self.slot.set(accessor);
        Ok(())
    }
}

/// A unit-side channel exported through an exportal.
struct Export<I: ?Sized> {
    channel: Rc<I>,
    filter: Option<FilterRole>,
}

impl<I: ?Sized + 'static> PortEntry for Export<I> {
    fn kind(&self) -> SwitchKind {
        SwitchKind::Exportal
    }

    fn interface_name(&self) -> &'static str {
        std::any::type_name::<I>()
    }

    fn accepts(&self, switch: &dyn Any) -> bool {
        switch.downcast_ref::<Exportal<I>>().is_some()
    }

    fn bind(&self, unit: &ReconfigurableUnit, switch: &dyn Any) -> Result<()> {
        let exportal = switch.downcast_ref::<Exportal<I>>().ok_or_else(|| {
            ReconfigError::binding("port", format!("expected an exportal of {}", self.interface_name()))
        })?;
        exportal.bind(unit, self.channel.clone())?;
        if let Some(role) = self.filter {
            exportal.add_filter(unit, filter_for(role, unit))?;
        }
        Ok(())
    }
}

/// Ordered list of a unit's connection points.
#[derive(Default)]
pub struct PortMap {
    entries: Vec<Box<dyn PortEntry>>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a port calling through a portal of `I`. The accessor is
    /// stored in `slot` when the map is bound.
    pub fn import<I: ?Sized + 'static>(self, slot: &AccessorSlot<I>) -> Self {
        self.push(Import {
            slot: slot.clone(),
            filter: None,
        })
    }

    /// Like [`import`](Self::import), counting transfers with a filter of
    /// `role` on the bound unit.
    pub fn import_filtered<I: ?Sized + 'static>(self, slot: &AccessorSlot<I>, role: FilterRole) -> Self {
        self.push(Import {
            slot: slot.clone(),
            filter: Some(role),
        })
    }

    /// Appends a channel exported through an exportal of `I`.
    pub fn export<I: ?Sized + 'static>(self, channel: Rc<I>) -> Self {
        self.push(Export {
            channel,
            filter: None,
        })
    }

    /// Like [`export`](Self::export), counting transfers with a filter of
    /// `role` on the bound unit.
    pub fn export_filtered<I: ?Sized + 'static>(self, channel: Rc<I>, role: FilterRole) -> Self {
        self.push(Export {
            channel,
            filter: Some(role),
        })
    }

    fn push(mut self, entry: impl PortEntry + 'static) -> Self {
        self.entries.push(Box::new(entry));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(kind, interface)` of every port, in order.
    pub fn signature(&self) -> Vec<(SwitchKind, &'static str)> {
        self.entries
            .iter()
            .map(|e| (e.kind(), e.interface_name()))
            .collect()
    }
}

/// Ordered list of switches a unit binds to.
pub struct SwitchConnector {
    name: String,
    switches: Vec<(SwitchHandle, Box<dyn Any>)>,
}

impl SwitchConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            switches: Vec::new(),
        }
    }

    pub fn portal<I: ?Sized + 'static>(mut self, portal: &Portal<I>) -> Self {
        self.switches.push((portal.switch(), Box::new(portal.clone())));
        self
    }

    pub fn exportal<I: ?Sized + 'static>(mut self, exportal: &Exportal<I>) -> Self {
        self.switches
            .push((exportal.switch(), Box::new(exportal.clone())));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    pub fn switches(&self) -> Vec<SwitchHandle> {
        self.switches.iter().map(|(s, _)| s.clone()).collect()
    }

    /// True if `ports` pairs up with these switches position by position.
    pub fn is_compatible(&self, ports: &PortMap) -> bool {
        self.check_compatible(ports).is_ok()
    }

    pub(crate) fn check_compatible(&self, ports: &PortMap) -> Result<()> {
        if ports.len() != self.switches.len() {
            return Err(ReconfigError::binding(
                &self.name,
                format!(
                    "{} ports cannot bind to {} switches",
                    ports.len(),
                    self.switches.len()
                ),
            ));
        }
        for (index, (entry, (handle, switch))) in
            ports.entries.iter().zip(&self.switches).enumerate()
        {
            if !entry.accepts(switch.as_ref()) {
                return Err(ReconfigError::binding(
                    handle.name(),
                    format!(
                        "port {index} is a {:?} of {} but the switch is a {:?} of {}",
                        entry.kind(),
                        entry.interface_name(),
                        handle.kind(),
                        handle.interface_name()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Binds `unit`'s ports to these switches. The unit must be UNLOADED;
    /// on error nothing is bound.
    pub fn bind(&self, unit: &ReconfigurableUnit, ports: &PortMap) -> Result<()> {
        self.check_bindable(unit, ports, &[])?;
        self.bind_checked(unit, ports)
    }

    /// Runs every check `bind` makes without binding anything. Switches in
    /// `released` are about to be given up by the unit and do not count as
    /// already bound.
    pub(crate) fn check_bindable(
        &self,
        unit: &ReconfigurableUnit,
        ports: &PortMap,
        released: &[SwitchHandle],
    ) -> Result<()> {
        if unit.state() != UnitState::Unloaded || unit.is_changing() {
            return Err(ReconfigError::usage(
                unit.name(),
                "ports can only be bound while UNLOADED",
            ));
        }
        self.check_compatible(ports)?;
        for (index, (handle, _)) in self.switches.iter().enumerate() {
            let repeated = self.switches[..index]
                .iter()
                .any(|(earlier, _)| earlier.same_switch(handle));
            let held = handle.is_bound(unit.id()) && !released.iter().any(|s| s.same_switch(handle));
            if repeated || held {
                return Err(ReconfigError::binding(
                    handle.name(),
                    format!("unit '{}' is already bound", unit.name()),
                ));
            }
        }
        Ok(())
    }

    /// Binds after a successful [`check_bindable`](Self::check_bindable).
    /// A port failing halfway unbinds the ports bound before it.
    pub(crate) fn bind_checked(&self, unit: &ReconfigurableUnit, ports: &PortMap) -> Result<()> {
        let before = unit.switches().len();
        for (entry, (_, switch)) in ports.entries.iter().zip(&self.switches) {
            if let Err(error) = entry.bind(unit, switch.as_ref()) {
                unit.detach_switches_from(before);
                return Err(error);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SwitchConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchConnector")
            .field("name", &self.name)
            .field("switches", &self.switches.iter().map(|(s, _)| s.name()).collect::<Vec<_>>())
            .finish()
    }
}
