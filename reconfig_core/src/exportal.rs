//! Exportals: switches from one permanent port to channels exported by units.
//!
//! The permanent side holds a single [`Accessor`]. While a unit occupies
//! the exportal and its gate is OPEN, the accessor forwards to the channel
//! that unit exported, counting transfers with that unit's filters. There
//! are no driver objects on this side: calls run in the caller's task.

use std::cell::RefCell;
use std::rc::Rc;

use crate::accessor::{Accessor, Forwarder};
use crate::channel::FallbackInterface;
use crate::error::{ReconfigError, Result};
use crate::filter::TransactionFilter;
use crate::state::{SwitchKind, UnitId, UnitState};
use crate::switch::{SwitchBackend, SwitchCore, SwitchHandle, SwitchHooks};
use crate::unit::ReconfigurableUnit;

struct Export<I: ?Sized> {
    unit: UnitId,
    channel: Rc<I>,
    filters: Vec<TransactionFilter>,
}

struct ExportalInner<I: ?Sized> {
    core: Rc<SwitchCore>,
    forwarder: Rc<Forwarder<I>>,
    exports: RefCell<Vec<Export<I>>>,
    hooks: RefCell<Vec<Rc<dyn SwitchHooks<I>>>>,
}

impl<I: ?Sized + 'static> ExportalInner<I> {
    fn export_of(&self, unit: UnitId) -> Option<(Rc<I>, Vec<TransactionFilter>)> {
        self.exports
            .borrow()
            .iter()
            .find(|e| e.unit == unit)
            .map(|e| (e.channel.clone(), e.filters.clone()))
    }

    fn run_hooks(&self, channel: Option<Rc<I>>, f: impl Fn(&dyn SwitchHooks<I>, Option<&I>)) {
        let hooks = self.hooks.borrow().clone();
        for hook in hooks {
            f(hook.as_ref(), channel.as_deref());
        }
    }
}

impl<I: ?Sized + 'static> SwitchBackend for ExportalInner<I> {
    fn kind(&self) -> SwitchKind {
        SwitchKind::Exportal
    }

    fn interface_name(&self) -> &'static str {
        std::any::type_name::<I>()
    }

    fn check_ready(&self, unit: UnitId) -> std::result::Result<(), String> {
        match self.export_of(unit) {
            Some(_) => Ok(()),
            None => Err(format!("{unit} exports no channel")),
        }
    }

    fn open(&self, switch: &SwitchHandle, unit: UnitId) {
        let export = self.export_of(unit);
        if let Some((channel, filters)) = &export {
            self.forwarder.set_filters(filters.clone());
            self.forwarder.connect(channel.clone());
        }
        self.run_hooks(export.map(|(ch, _)| ch), |h, ch| h.on_open(switch, ch));
    }

    fn close(&self, switch: &SwitchHandle, unit: UnitId) {
        self.forwarder.disconnect();
        self.forwarder.set_filters(Vec::new());
        let channel = self.export_of(unit).map(|(ch, _)| ch);
        self.run_hooks(channel, |h, ch| h.on_close(switch, ch));
    }

    fn undefine(&self, switch: &SwitchHandle, unit: UnitId) {
        self.forwarder.disconnect();
        self.forwarder.set_filters(Vec::new());
        let channel = self.export_of(unit).map(|(ch, _)| ch);
        self.run_hooks(channel, |h, ch| h.on_undefined(switch, ch));
    }

    fn refresh(&self, switch: &SwitchHandle) {
        let channel = self.forwarder.current();
        if channel.is_some() {
            self.forwarder.refresh();
        }
        self.run_hooks(channel, |h, ch| h.on_refresh(switch, ch));
    }

    fn unbind(&self, unit: UnitId) {
        self.exports.borrow_mut().retain(|e| e.unit != unit);
    }
}

/// A switch from one permanent port to channels exported by units.
pub struct Exportal<I: ?Sized> {
    inner: Rc<ExportalInner<I>>,
}

impl<I: ?Sized> Clone for Exportal<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: ?Sized + FallbackInterface + 'static> Exportal<I> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_fallback(name, I::fallback())
    }
}

impl<I: ?Sized + 'static> Exportal<I> {
    pub fn with_fallback(name: impl Into<String>, fallback: Rc<I>) -> Self {
        let core = SwitchCore::new(name);
        let forwarder = Forwarder::new(core.clone(), core.name().to_string(), fallback, None);
        Self {
            inner: Rc::new(ExportalInner {
                core,
                forwarder,
                exports: RefCell::new(Vec::new()),
                hooks: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Binds `unit`, which exports `channel` through this exportal. The
    /// unit must be UNLOADED.
    pub fn bind(&self, unit: &ReconfigurableUnit, channel: Rc<I>) -> Result<()> {
        if unit.state() != UnitState::Unloaded || unit.is_changing() {
            return Err(ReconfigError::usage(
                unit.name(),
                format!("cannot bind to switch '{}' unless UNLOADED", self.name()),
            ));
        }
        self.inner.core.add_bound(unit)?;
        self.inner.exports.borrow_mut().push(Export {
            unit: unit.id(),
            channel,
            filters: Vec::new(),
        });
        unit.attach_switch(self.switch());
        Ok(())
    }

    /// Adds a transaction filter that applies while `unit` is connected.
    pub fn add_filter(&self, unit: &ReconfigurableUnit, filter: TransactionFilter) -> Result<()> {
        let mut exports = self.inner.exports.borrow_mut();
        let Some(export) = exports.iter_mut().find(|e| e.unit == unit.id()) else {
            return Err(ReconfigError::binding(
                self.name(),
                format!("unit '{}' is not bound", unit.name()),
            ));
        };
        export.filters.push(filter.clone());
        drop(exports);
        if self.switch().occupant_id() == Some(unit.id()) && self.inner.forwarder.current().is_some() {
            self.inner.forwarder.set_filters(
                self.inner
                    .export_of(unit.id())
                    .map(|(_, f)| f)
                    .unwrap_or_default(),
            );
        }
        Ok(())
    }

    /// The accessor the permanent side calls through.
    pub fn accessor(&self) -> Accessor<I> {
        Accessor::new(self.inner.forwarder.clone())
    }

    pub fn switch(&self) -> SwitchHandle {
        SwitchHandle::new(self.inner.core.clone(), self.inner.clone())
    }

    pub fn add_hooks(&self, hooks: Rc<dyn SwitchHooks<I>>) {
        self.inner.hooks.borrow_mut().push(hooks);
    }

    pub fn refresh_notify(&self) {
        self.switch().refresh_notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Fifo, FifoIf};
    use crate::state::GateState;
    use reconfig_env::SimContext;

    fn unit_with_fifo(exportal: &Exportal<dyn FifoIf<u8>>, name: &str) -> (ReconfigurableUnit, Fifo<u8>) {
        let unit = ReconfigurableUnit::new(name);
        let fifo = Fifo::new(format!("{name}.in"), 4);
        exportal.bind(&unit, fifo.as_interface()).unwrap();
        (unit, fifo)
    }

    #[test]
    fn test_unbound_or_closed_uses_fallback() {
        let exportal: Exportal<dyn FifoIf<u8>> = Exportal::new("x");
        let acc = exportal.accessor();
        assert_eq!(acc.forward_nb(|f| f.num_free()), 0);
        assert_eq!(acc.forward_nb(|f| f.nb_write(3)), Err(3));
    }

    #[test]
    fn test_open_forwards_to_occupant_export() {
        let exportal: Exportal<dyn FifoIf<u8>> = Exportal::new("x");
        let (a, fifo_a) = unit_with_fifo(&exportal, "a");
        let (_b, fifo_b) = unit_with_fifo(&exportal, "b");
        let acc = exportal.accessor();

        let switch = exportal.switch();
        switch.occupy(&a);
        switch.set_gate(GateState::Open, a.id());
        assert_eq!(acc.forward_nb(|f| f.nb_write(9)), Ok(()));
        assert_eq!(fifo_a.snapshot(), vec![9]);
        assert!(fifo_b.snapshot().is_empty());

        switch.set_gate(GateState::Closed, a.id());
        assert_eq!(acc.forward_nb(|f| f.nb_write(1)), Err(1));
    }

    #[test]
    fn test_filters_apply_only_to_connected_unit() {
        let exportal: Exportal<dyn FifoIf<u8>> = Exportal::new("x");
        let (a, _fifo) = unit_with_fifo(&exportal, "a");
        exportal.add_filter(&a, TransactionFilter::input(&a)).unwrap();
        let acc = exportal.accessor();

        let switch = exportal.switch();
        switch.occupy(&a);
        a.set_state(UnitState::LoadedActive);
        switch.set_gate(GateState::Open, a.id());

        assert_eq!(acc.transfer_nb(|f| f.nb_write(5).ok()), Some(()));
        assert_eq!(a.transaction_count(), 1);

        a.set_deactivation_requested(true);
        a.transaction_counter().decrement();
        // refused by the input filter, answered by the fallback
        assert_eq!(acc.transfer_nb(|f| f.nb_write(6).ok()), None);
        assert_eq!(a.transaction_count(), 0);
    }

    #[test]
    fn test_blocking_transfer_waits_for_open_and_active() {
        let sim = SimContext::new(1);
        let exportal: Exportal<dyn FifoIf<u8>> = Exportal::new("x");
        let (a, fifo) = unit_with_fifo(&exportal, "a");
        exportal.add_filter(&a, TransactionFilter::input(&a)).unwrap();
        let acc = exportal.accessor();
        let producer = sim.spawn_with_handle("producer", async move {
            acc.transfer(|f| async move { f.write(4).await }).await
        });
        sim.run();
        assert!(!producer.is_finished());

        let switch = exportal.switch();
        switch.occupy(&a);
        switch.set_gate(GateState::Open, a.id());
        sim.run();
        // connected, but the unit is not active yet
        assert!(!producer.is_finished());
        assert!(fifo.snapshot().is_empty());

        a.set_state(UnitState::LoadedActive);
        a.notify_activated();
        sim.run();
        assert_eq!(producer.take(), Some(()));
        assert_eq!(fifo.snapshot(), vec![4]);
        assert_eq!(a.transaction_count(), 1);
    }

    #[test]
    fn test_parked_read_follows_unit_swap() {
        let sim = SimContext::new(1);
        let exportal: Exportal<dyn FifoIf<u8>> = Exportal::new("x");
        let (a, fifo_a) = unit_with_fifo(&exportal, "a");
        let (b, fifo_b) = unit_with_fifo(&exportal, "b");
        let switch = exportal.switch();
        switch.occupy(&a);
        switch.set_gate(GateState::Open, a.id());

        let acc = exportal.accessor();
        let reader = sim.spawn_with_handle("reader", async move {
            acc.forward(|f| async move { f.read().await }).await
        });
        sim.run();
        assert!(!reader.is_finished());

        // a goes away; a late write into its channel is not seen
        switch.set_gate(GateState::Closed, a.id());
        a.set_state(UnitState::Unloaded);
        switch.set_gate(GateState::Undefined, a.id());
        switch.release(a.id());
        fifo_a.nb_write(7).unwrap();
        sim.run();
        assert!(!reader.is_finished());
        assert_eq!(fifo_a.snapshot(), vec![7]);

        switch.occupy(&b);
        switch.set_gate(GateState::Open, b.id());
        sim.run();
        assert!(!reader.is_finished());
        fifo_b.nb_write(42).unwrap();
        sim.run();
        assert_eq!(reader.take(), Some(42));
        assert_eq!(fifo_a.snapshot(), vec![7]);
    }

    #[test]
    fn test_waiting_transfer_moves_to_new_occupant() {
        let sim = SimContext::new(1);
        let exportal: Exportal<dyn FifoIf<u8>> = Exportal::new("x");
        let (a, fifo_a) = unit_with_fifo(&exportal, "a");
        let (b, fifo_b) = unit_with_fifo(&exportal, "b");
        exportal.add_filter(&a, TransactionFilter::input(&a)).unwrap();
        exportal.add_filter(&b, TransactionFilter::input(&b)).unwrap();
        for _ in 0..4 {
            fifo_a.nb_write(0).unwrap();
        }
        a.set_state(UnitState::LoadedActive);
        b.set_state(UnitState::LoadedActive);
        let switch = exportal.switch();
        switch.occupy(&a);
        switch.set_gate(GateState::Open, a.id());

        let acc = exportal.accessor();
        let writer = sim.spawn_with_handle("writer", async move {
            acc.transfer_when(|f| f.nb_write(5).ok(), |f| f.data_read_event()).await
        });
        sim.run();
        assert!(!writer.is_finished());

        switch.set_gate(GateState::Closed, a.id());
        switch.release(a.id());
        switch.occupy(&b);
        switch.set_gate(GateState::Open, b.id());
        sim.run();
        assert_eq!(writer.take(), Some(()));
        assert_eq!(fifo_b.snapshot(), vec![5]);
        assert_eq!(fifo_a.num_available(), 4);
        assert_eq!((a.transaction_count(), b.transaction_count()), (0, 1));
    }

    #[test]
    fn test_bind_errors() {
        let exportal: Exportal<dyn FifoIf<u8>> = Exportal::new("x");
        let (a, fifo) = unit_with_fifo(&exportal, "a");
        assert!(matches!(
            exportal.bind(&a, fifo.as_interface()),
            Err(ReconfigError::Binding { .. })
        ));
        let stranger = ReconfigurableUnit::new("s");
        assert!(matches!(
            exportal.add_filter(&stranger, TransactionFilter::output(&stranger)),
            Err(ReconfigError::Binding { .. })
        ));
        assert!(exportal.switch().check_ready(a.id()).is_ok());
        assert!(exportal.switch().check_ready(stranger.id()).is_err());
        assert_eq!(exportal.switch().kind(), SwitchKind::Exportal);
    }
}
