//! Reconfiguration control.
//!
//! A [`Control`] owns a group of units and drives their transitions:
//!
//! ```text
//!            load              activate
//! UNLOADED --------> LOADED_INACTIVE ---------> LOADED_ACTIVE
//!     ^                |    ^                        |
//!     +----------------+    +------------------------+
//!          unload                 deactivate
//! ```
//!
//! Every operation runs inside a task of the host context and takes the
//! re-entrant lock of each unit involved, so a caller holding the lock
//! (see [`Control::lock`]) can chain several operations without another
//! task slipping in between. Validation and switch occupation happen
//! before the first suspension point of a transition: a refused operation
//! changes nothing, and of two racing loads onto one switch the later one
//! fails with [`ReconfigError::Conflict`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reconfig_env::{ReconfigContext, SharedContext, TaskId};
use tracing::{debug, info};

use crate::binding::{PortMap, SwitchConnector};
use crate::driver::Completion;
use crate::error::{ReconfigError, Result};
use crate::state::{Action, GateState, UnitState};
use crate::switch::SwitchHandle;
use crate::unit::{Owner, ReconfigurableUnit};

static NEXT_CONTROL_ID: AtomicU64 = AtomicU64::new(1);

/// Computes the delay a unit spends in each action.
pub trait DelayPolicy {
    fn delay(&self, unit: &ReconfigurableUnit, action: Action) -> Duration;
}

/// Uses the delays configured on the unit itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDelayPolicy;

impl DelayPolicy for DefaultDelayPolicy {
    fn delay(&self, unit: &ReconfigurableUnit, action: Action) -> Duration {
        unit.default_delay(action)
    }
}

/// Receives every state change and gate change made by a control.
pub trait ReconfigObserver {
    fn on_transition(
        &self,
        _at: Duration,
        _unit: &ReconfigurableUnit,
        _from: UnitState,
        _to: UnitState,
    ) {
    }

    fn on_gate(
        &self,
        _at: Duration,
        _switch: &SwitchHandle,
        _unit: &ReconfigurableUnit,
        _gate: GateState,
    ) {
    }
}

struct ControlInner {
    id: u64,
    name: String,
    ctx: SharedContext,
    units: RefCell<Vec<ReconfigurableUnit>>,
    policy: RefCell<Rc<dyn DelayPolicy>>,
    observers: RefCell<Vec<Rc<dyn ReconfigObserver>>>,
}

/// Releases unit locks taken by one control operation.
struct LockGuard {
    task: TaskId,
    units: Vec<ReconfigurableUnit>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for unit in self.units.iter().rev() {
            unit.lock().release(self.task);
        }
    }
}

fn lock_order(units: &[ReconfigurableUnit]) -> Vec<ReconfigurableUnit> {
    let mut sorted = units.to_vec();
    sorted.sort_by_key(|u| u.id());
    sorted.dedup_by_key(|u| u.id());
    sorted
}

/// Orchestrates transitions of a group of reconfigurable units.
#[derive(Clone)]
pub struct Control {
    inner: Rc<ControlInner>,
}

impl Control {
    pub fn new(ctx: &SharedContext, name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(ControlInner {
                id: NEXT_CONTROL_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                ctx: ctx.clone(),
                units: RefCell::new(Vec::new()),
                policy: RefCell::new(Rc::new(DefaultDelayPolicy)),
                observers: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn context(&self) -> &SharedContext {
        &self.inner.ctx
    }

    /// Managed units, in registration order.
    pub fn units(&self) -> Vec<ReconfigurableUnit> {
        self.inner.units.borrow().clone()
    }

    pub fn contains(&self, unit: &ReconfigurableUnit) -> bool {
        matches!(unit.owner(), Some(owner) if owner.id == self.inner.id)
    }

    pub fn add_observer(&self, observer: Rc<dyn ReconfigObserver>) {
        self.inner.observers.borrow_mut().push(observer);
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers `unit`. Adding a unit twice is a no-op; adding a unit
    /// owned by another control fails.
    pub fn add(&self, unit: &ReconfigurableUnit) -> Result<()> {
        if let Some(owner) = unit.owner() {
            if owner.id == self.inner.id {
                return Ok(());
            }
            return Err(ReconfigError::ControlConflict {
                unit: unit.name().to_string(),
                owner: owner.name,
            });
        }
        unit.set_owner(Some(Owner {
            id: self.inner.id,
            name: self.inner.name.clone(),
        }));
        self.apply_policy(unit);
        self.inner.units.borrow_mut().push(unit.clone());
        debug!(control = %self.inner.name, unit = %unit.name(), "unit added");
        Ok(())
    }

    /// Deactivates and unloads `unit` as needed, then deregisters it.
    pub async fn remove(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.check_owned(unit)?;
        let _guard = self.acquire(std::slice::from_ref(unit)).await?;
        if unit.is_active() {
            self.do_deactivate(unit).await?;
        }
        if unit.is_loaded() {
            self.do_unload(unit).await?;
        }
        unit.set_owner(None);
        self.inner.units.borrow_mut().retain(|u| u != unit);
        debug!(control = %self.inner.name, unit = %unit.name(), "unit removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delays
    // ------------------------------------------------------------------

    pub fn set_delay_policy(&self, policy: Rc<dyn DelayPolicy>) {
        *self.inner.policy.borrow_mut() = policy;
        self.update_delays();
    }

    /// Recomputes the delays of every managed unit from the policy.
    pub fn update_delays(&self) {
        for unit in self.units() {
            self.apply_policy(&unit);
        }
    }

    fn apply_policy(&self, unit: &ReconfigurableUnit) {
        let policy = self.inner.policy.borrow().clone();
        for action in Action::all() {
            unit.set_effective_delay(action, policy.delay(unit, action));
        }
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    fn current_task(&self, unit: &ReconfigurableUnit) -> Result<TaskId> {
        self.inner.ctx.current_task().ok_or_else(|| {
            ReconfigError::usage(unit.name(), "control operations must run inside a task")
        })
    }

    fn check_owned(&self, unit: &ReconfigurableUnit) -> Result<()> {
        if self.contains(unit) {
            Ok(())
        } else {
            Err(ReconfigError::usage(
                unit.name(),
                format!("not managed by control '{}'", self.inner.name),
            ))
        }
    }

    async fn acquire(&self, units: &[ReconfigurableUnit]) -> Result<LockGuard> {
        let Some(first) = units.first() else {
            return Err(ReconfigError::usage(&self.inner.name, "empty unit set"));
        };
        let task = self.current_task(first)?;
        let mut guard = LockGuard {
            task,
            units: Vec::new(),
        };
        for unit in lock_order(units) {
            unit.lock().acquire(task).await;
            guard.units.push(unit);
        }
        Ok(guard)
    }

    /// Takes the locks of `units` for the calling task, waiting for other
    /// holders. Locks are re-entrant; release with [`unlock`](Self::unlock).
    pub async fn lock(&self, units: &[ReconfigurableUnit]) -> Result<()> {
        for unit in units {
            self.check_owned(unit)?;
        }
        let guard = self.acquire(units).await?;
        std::mem::forget(guard);
        Ok(())
    }

    /// Takes the locks of `units` only if all are free or held by the
    /// calling task.
    pub fn try_lock(&self, units: &[ReconfigurableUnit]) -> Result<bool> {
        let Some(first) = units.first() else {
            return Ok(true);
        };
        for unit in units {
            self.check_owned(unit)?;
        }
        let task = self.current_task(first)?;
        let ordered = lock_order(units);
        if !ordered.iter().all(|u| u.lock().can_acquire(task)) {
            return Ok(false);
        }
        for unit in &ordered {
            unit.lock().try_acquire(task);
        }
        Ok(true)
    }

    /// Releases one level of the calling task's locks on `units`.
    pub fn unlock(&self, units: &[ReconfigurableUnit]) -> Result<()> {
        let Some(first) = units.first() else {
            return Ok(());
        };
        let task = self.current_task(first)?;
        let ordered = lock_order(units);
        if let Some(unit) = ordered.iter().find(|u| u.lock().holder() != Some(task)) {
            return Err(ReconfigError::usage(
                unit.name(),
                format!("lock not held by {task}"),
            ));
        }
        for unit in ordered.iter().rev() {
            unit.lock().release(task);
        }
        Ok(())
    }

    /// True if any of `units` is locked by some task.
    pub fn is_locked(&self, units: &[ReconfigurableUnit]) -> bool {
        units.iter().any(|u| u.is_locked())
    }

    // ------------------------------------------------------------------
    // Single-unit transitions
    // ------------------------------------------------------------------

    /// UNLOADED -> LOADED_INACTIVE.
    pub async fn load(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.locked(unit, Action::Load).await
    }

    /// LOADED_INACTIVE -> LOADED_ACTIVE.
    pub async fn activate(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.locked(unit, Action::Activate).await
    }

    /// LOADED_ACTIVE -> LOADED_INACTIVE, once the unit's transactions
    /// have drained.
    pub async fn deactivate(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.locked(unit, Action::Deactivate).await
    }

    /// LOADED_INACTIVE -> UNLOADED.
    pub async fn unload(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.locked(unit, Action::Unload).await
    }

    async fn locked(&self, unit: &ReconfigurableUnit, action: Action) -> Result<()> {
        self.check_owned(unit)?;
        let _guard = self.acquire(std::slice::from_ref(unit)).await?;
        self.dispatch(unit, action).await
    }

    async fn dispatch(&self, unit: &ReconfigurableUnit, action: Action) -> Result<()> {
        match action {
            Action::Load => self.do_load(unit).await,
            Action::Activate => self.do_activate(unit).await,
            Action::Deactivate => self.do_deactivate(unit).await,
            Action::Unload => self.do_unload(unit).await,
        }
    }

    fn expect_state(&self, unit: &ReconfigurableUnit, action: Action) -> Result<()> {
        if let Some(next) = unit.next_state() {
            return Err(ReconfigError::usage(
                unit.name(),
                format!("cannot {action} while changing to {next}"),
            ));
        }
        if unit.state() != action.source() {
            return Err(ReconfigError::usage(
                unit.name(),
                format!("cannot {action} while {}", unit.state()),
            ));
        }
        Ok(())
    }

    fn check_load(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.expect_state(unit, Action::Load)?;
        let switches = unit.switches();
        for switch in &switches {
            switch.check_ready(unit.id())?;
        }
        for switch in &switches {
            if let Some(occupant) = switch.conflicting_occupant(unit.id()) {
                return Err(ReconfigError::Conflict {
                    switch: switch.name().to_string(),
                    requested: unit.name().to_string(),
                    occupant,
                });
            }
        }
        Ok(())
    }

    async fn do_load(&self, unit: &ReconfigurableUnit) -> Result<()> {
        if let Err(error) = self.check_load(unit) {
            debug!(control = %self.inner.name, unit = %unit.name(), %error, "load refused");
            return Err(error);
        }
        unit.begin(UnitState::LoadedInactive);
        for switch in unit.switches() {
            switch.occupy(unit);
            self.gate_changed(&switch, unit, GateState::Closed);
        }
        unit.reset_components();
        self.pause(unit, Action::Load).await;
        self.finish(unit, UnitState::LoadedInactive);
        unit.run_hooks(Action::Load);
        Ok(())
    }

    async fn do_activate(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.expect_state(unit, Action::Activate)?;
        unit.begin(UnitState::LoadedActive);
        self.set_gates(unit, GateState::Open);
        unit.reset_components();
        self.pause(unit, Action::Activate).await;
        self.finish(unit, UnitState::LoadedActive);
        let started = unit.start_processes();
        if started > 0 {
            debug!(unit = %unit.name(), started, "unit processes started");
        }
        unit.notify_activated();
        unit.run_hooks(Action::Activate);
        Ok(())
    }

    async fn do_deactivate(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.expect_state(unit, Action::Deactivate)?;
        unit.begin(UnitState::LoadedInactive);
        unit.set_deactivation_requested(true);
        if unit.transaction_count() != 0 {
            debug!(
                unit = %unit.name(),
                pending = unit.transaction_count(),
                "deactivation waits for transactions to drain"
            );
        }
        unit.wait_transactions_drained().await;
        // No suspension between closing the gates and leaving ACTIVE.
        self.set_gates(unit, GateState::Closed);
        self.finish(unit, UnitState::LoadedInactive);
        let killed = unit.stop_processes();
        if killed > 0 {
            debug!(unit = %unit.name(), killed, "unit processes killed");
        }
        unit.notify_deactivated();
        unit.reset_components();
        self.pause(unit, Action::Deactivate).await;
        unit.run_hooks(Action::Deactivate);
        unit.set_deactivation_requested(false);
        Ok(())
    }

    async fn do_unload(&self, unit: &ReconfigurableUnit) -> Result<()> {
        self.expect_state(unit, Action::Unload)?;
        unit.begin(UnitState::Unloaded);
        self.set_gates(unit, GateState::Undefined);
        unit.reset_components();
        self.pause(unit, Action::Unload).await;
        unit.stop_processes();
        for switch in unit.switches() {
            switch.release(unit.id());
        }
        self.finish(unit, UnitState::Unloaded);
        unit.run_hooks(Action::Unload);
        Ok(())
    }

    fn set_gates(&self, unit: &ReconfigurableUnit, gate: GateState) {
        for switch in unit.switches() {
            switch.set_gate(gate, unit.id());
            self.gate_changed(&switch, unit, gate);
        }
    }

    fn gate_changed(&self, switch: &SwitchHandle, unit: &ReconfigurableUnit, gate: GateState) {
        let now = self.inner.ctx.now();
        let observers = self.inner.observers.borrow().clone();
        for observer in observers {
            observer.on_gate(now, switch, unit, gate);
        }
    }

    async fn pause(&self, unit: &ReconfigurableUnit, action: Action) {
        let delay = unit.delay(action);
        if !delay.is_zero() {
            self.inner.ctx.sleep(delay).await;
        }
    }

    fn finish(&self, unit: &ReconfigurableUnit, to: UnitState) {
        let from = unit.state();
        unit.set_state(to);
        let now = self.inner.ctx.now();
        info!(
            control = %self.inner.name,
            unit = %unit.name(),
            %from,
            %to,
            at_ns = now.as_nanos() as u64,
            "unit transition"
        );
        let observers = self.inner.observers.borrow().clone();
        for observer in observers {
            observer.on_transition(now, unit, from, to);
        }
    }

    // ------------------------------------------------------------------
    // Multi-unit transitions
    // ------------------------------------------------------------------

    pub async fn load_all(&self, units: &[ReconfigurableUnit]) -> Result<()> {
        self.run_all(units, Action::Load).await
    }

    pub async fn activate_all(&self, units: &[ReconfigurableUnit]) -> Result<()> {
        self.run_all(units, Action::Activate).await
    }

    pub async fn deactivate_all(&self, units: &[ReconfigurableUnit]) -> Result<()> {
        self.run_all(units, Action::Deactivate).await
    }

    pub async fn unload_all(&self, units: &[ReconfigurableUnit]) -> Result<()> {
        self.run_all(units, Action::Unload).await
    }

    /// Locks the whole set, then runs `action` on every unit not already
    /// in its target state, one task per unit.
    async fn run_all(&self, units: &[ReconfigurableUnit], action: Action) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        for unit in units {
            self.check_owned(unit)?;
        }
        let _guard = self.acquire(units).await?;

        let todo: Vec<ReconfigurableUnit> = lock_order(units)
            .into_iter()
            .filter(|u| u.is_changing() || u.state() != action.target())
            .collect();
        for unit in &todo {
            match action {
                Action::Load => self.check_load(unit)?,
                _ => self.expect_state(unit, action)?,
            }
        }
        if action == Action::Load {
            check_disjoint(&todo)?;
        }

        let mut pending = Vec::with_capacity(todo.len());
        for unit in todo {
            let done = Completion::new(format!("{}.{}_done", unit.name(), action));
            let this = self.clone();
            let task_done = done.clone();
            self.inner.ctx.spawn(
                &format!("{}.{}", self.inner.name, action),
                Box::pin(async move {
                    let result = this.dispatch(&unit, action).await;
                    task_done.complete(result);
                }),
            );
            pending.push(done);
        }

        let mut first_error = None;
        for done in pending {
            if let Err(error) = done.wait().await {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------
    // Rebinding
    // ------------------------------------------------------------------

    /// Rebinds an UNLOADED unit to a different set of switches.
    pub async fn move_unit(
        &self,
        unit: &ReconfigurableUnit,
        ports: &PortMap,
        connector: &SwitchConnector,
    ) -> Result<()> {
        self.check_owned(unit)?;
        let _guard = self.acquire(std::slice::from_ref(unit)).await?;
        if unit.state() != UnitState::Unloaded || unit.is_changing() {
            return Err(ReconfigError::usage(
                unit.name(),
                format!("cannot move while {}", unit.state()),
            ));
        }
        connector.check_bindable(unit, ports, &unit.switches())?;
        unit.detach_switches();
        connector.bind_checked(unit, ports)?;
        info!(
            control = %self.inner.name,
            unit = %unit.name(),
            connector = %connector.name(),
            "unit moved"
        );
        Ok(())
    }
}

/// Fails if two units of the set share a switch.
fn check_disjoint(units: &[ReconfigurableUnit]) -> Result<()> {
    for (index, unit) in units.iter().enumerate() {
        for other in &units[index + 1..] {
            for switch in unit.switches() {
                if other.switches().iter().any(|s| s.same_switch(&switch)) {
                    return Err(ReconfigError::Conflict {
                        switch: switch.name().to_string(),
                        requested: other.name().to_string(),
                        occupant: unit.name().to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("name", &self.inner.name)
            .field("units", &self.inner.units.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{Accessor, AccessorSlot};
    use crate::channel::{Signal, SignalIf};
    use crate::error::CallError;
    use crate::portal::Portal;
    use crate::resettable::ResettableVar;
    use crate::unit::UnitHooks;
    use reconfig_env::{Event, SimContext};
    use std::cell::Cell;

    fn ns(n: u64) -> Duration {
        Duration::from_nanos(n)
    }

    struct Rig {
        sim: SimContext,
        ctx: SharedContext,
        control: Control,
        portal: Portal<dyn SignalIf<u32>>,
        signal: Signal<u32>,
        a: ReconfigurableUnit,
        b: ReconfigurableUnit,
        acc_a: Accessor<dyn SignalIf<u32>>,
        acc_b: Accessor<dyn SignalIf<u32>>,
    }

    fn rig() -> Rig {
        let sim = SimContext::new(7);
        let ctx = sim.handle();
        let control = Control::new(&ctx, "ctrl");
        let signal = Signal::new(&ctx, "bus", 0u32);
        let portal: Portal<dyn SignalIf<u32>> = Portal::new(&ctx, "S");
        portal.bind_static(signal.as_interface()).unwrap();
        let a = ReconfigurableUnit::new("A");
        let b = ReconfigurableUnit::new("B");
        for unit in [&a, &b] {
            unit.set_delay(Action::Load, ns(10));
            control.add(unit).unwrap();
        }
        let acc_a = portal.bind(&a).unwrap();
        let acc_b = portal.bind(&b).unwrap();
        Rig {
            sim,
            ctx,
            control,
            portal,
            signal,
            a,
            b,
            acc_a,
            acc_b,
        }
    }

    #[derive(Default)]
    struct Recorder {
        transitions: RefCell<Vec<(Duration, String, UnitState, UnitState)>>,
        gates: RefCell<Vec<(Duration, String, String, GateState)>>,
    }

    impl ReconfigObserver for Recorder {
        fn on_transition(&self, at: Duration, unit: &ReconfigurableUnit, from: UnitState, to: UnitState) {
            self.transitions
                .borrow_mut()
                .push((at, unit.name().to_string(), from, to));
        }

        fn on_gate(&self, at: Duration, switch: &SwitchHandle, unit: &ReconfigurableUnit, gate: GateState) {
            self.gates
                .borrow_mut()
                .push((at, switch.name().to_string(), unit.name().to_string(), gate));
        }
    }

    #[test]
    fn test_exclusive_switch_scenario() {
        let r = rig();
        let recorder = Rc::new(Recorder::default());
        r.control.add_observer(recorder.clone());

        let run = {
            let (control, ctx, a, b) = (r.control.clone(), r.ctx.clone(), r.a.clone(), r.b.clone());
            let switch = r.portal.switch();
            r.sim.spawn_with_handle("scenario", async move {
                control.load(&a).await.unwrap();
                let loaded = (ctx.now(), a.state());
                control.activate(&a).await.unwrap();
                let activated = (ctx.now(), switch.gate(), switch.occupant());
                let refused = control.load(&b).await;
                (loaded, activated, refused)
            })
        };
        r.sim.run();

        let (loaded, activated, refused) = run.take().unwrap();
        assert_eq!(loaded, (ns(10), UnitState::LoadedInactive));
        assert_eq!(activated, (ns(10), GateState::Open, Some("A".to_string())));
        assert!(matches!(
            refused,
            Err(ReconfigError::Conflict { ref switch, ref occupant, .. }) if switch == "S" && occupant == "A"
        ));
        assert_eq!(r.b.state(), UnitState::Unloaded);
        assert_eq!(r.a.state(), UnitState::LoadedActive);
        assert_eq!(r.portal.switch().gate_toward(r.a.id()), GateState::Open);
        assert_eq!(r.portal.switch().gate_toward(r.b.id()), GateState::Closed);

        let transitions = recorder.transitions.borrow();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0], (ns(10), "A".into(), UnitState::Unloaded, UnitState::LoadedInactive));
        assert_eq!(transitions[1], (ns(10), "A".into(), UnitState::LoadedInactive, UnitState::LoadedActive));
        let gates = recorder.gates.borrow();
        assert_eq!(gates[0], (ns(0), "S".into(), "A".into(), GateState::Closed));
        assert_eq!(gates[1], (ns(10), "S".into(), "A".into(), GateState::Open));
    }

    #[test]
    fn test_racing_loads_later_one_conflicts() {
        let r = rig();
        let first = {
            let (control, a) = (r.control.clone(), r.a.clone());
            r.sim.spawn_with_handle("first", async move { control.load(&a).await })
        };
        let second = {
            let (control, b, ctx) = (r.control.clone(), r.b.clone(), r.ctx.clone());
            r.sim.spawn_with_handle("second", async move {
                let result = control.load(&b).await;
                (result, ctx.now())
            })
        };
        r.sim.run();
        assert_eq!(first.take(), Some(Ok(())));
        let (result, at) = second.take().unwrap();
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(at, ns(0));
        assert_eq!(r.b.state(), UnitState::Unloaded);
    }

    #[test]
    fn test_deactivate_waits_for_drain() {
        let r = rig();
        let counter = r.a.transaction_counter();
        let setup = {
            let (control, a) = (r.control.clone(), r.a.clone());
            r.sim.spawn_with_handle("setup", async move {
                control.load(&a).await.unwrap();
                control.activate(&a).await.unwrap();
            })
        };
        r.sim.run();
        assert!(setup.is_finished());
        counter.modify(3);

        let deactivation = {
            let (control, a, ctx) = (r.control.clone(), r.a.clone(), r.ctx.clone());
            r.sim.spawn_with_handle("deactivate", async move {
                control.deactivate(&a).await.unwrap();
                ctx.now()
            })
        };
        {
            let (counter, ctx) = (counter.clone(), r.ctx.clone());
            r.sim.spawn_with_handle("drain", async move {
                for _ in 0..3 {
                    ctx.sleep(ns(5)).await;
                    counter.modify(-1);
                }
            });
        }

        r.sim.run_until(ns(24));
        assert!(!deactivation.is_finished());
        assert!(r.a.is_active());
        assert!(r.a.is_deactivation_requested());
        assert!(!r.a.blocks_new_transactions());

        r.sim.run();
        assert_eq!(deactivation.take(), Some(ns(25)));
        assert_eq!(r.a.state(), UnitState::LoadedInactive);
        assert!(!r.a.is_deactivation_requested());
        assert_eq!(r.portal.switch().gate(), GateState::Closed);
    }

    #[test]
    fn test_reset_round_trip() {
        let r = rig();
        let x = ResettableVar::new(5u32, Some(&r.a));
        let y = ResettableVar::new(String::from("idle"), Some(&r.a));

        let phase = |action: Action| {
            let (control, a) = (r.control.clone(), r.a.clone());
            let handle = r.sim.spawn_with_handle("op", async move {
                match action {
                    Action::Load => control.load(&a).await,
                    Action::Activate => control.activate(&a).await,
                    Action::Deactivate => control.deactivate(&a).await,
                    Action::Unload => control.unload(&a).await,
                }
            });
            r.sim.run();
            handle.take()
        };

        assert_eq!(phase(Action::Load), Some(Ok(())));
        assert_eq!(r.a.reset_count(), 2);
        x.set(9);
        y.set("busy".into());
        assert_eq!(phase(Action::Unload), Some(Ok(())));
        assert_eq!(r.a.reset_count(), 4);
        assert_eq!(x.get(), 5);
        assert_eq!(y.get(), "idle");

        assert_eq!(phase(Action::Load), Some(Ok(())));
        assert_eq!(phase(Action::Activate), Some(Ok(())));
        x.set(1);
        assert_eq!(phase(Action::Deactivate), Some(Ok(())));
        assert_eq!(x.get(), 5);
        assert_eq!(r.a.reset_count(), 10);
        assert_eq!(x.initial(), Some(5));
    }

    fn run_op<T: 'static>(
        sim: &SimContext,
        fut: impl std::future::Future<Output = T> + 'static,
    ) -> Option<T> {
        let handle = sim.spawn_with_handle("op", fut);
        sim.run();
        handle.take()
    }

    fn swap_to(r: &Rig, from: Option<&ReconfigurableUnit>, to: &ReconfigurableUnit) {
        let (control, to) = (r.control.clone(), to.clone());
        let from = from.cloned();
        let result = run_op(&r.sim, async move {
            if let Some(from) = from {
                control.deactivate(&from).await?;
                control.unload(&from).await?;
            }
            control.load(&to).await?;
            control.activate(&to).await
        });
        assert_eq!(result, Some(Ok(())));
    }

    #[test]
    fn test_driver_identity_across_units() {
        let r = rig();
        swap_to(&r, None, &r.a);
        let acc_a = r.acc_a.clone();
        let first = run_op(&r.sim, async move {
            acc_a
                .forward_driver(|s| async move { s.write(1) })
                .await
        });
        assert_eq!(first, Some(Ok(())));

        swap_to(&r, Some(&r.a), &r.b);
        let acc_b = r.acc_b.clone();
        let second = run_op(&r.sim, async move {
            acc_b
                .forward_driver(|s| async move { s.write(2) })
                .await
        });
        assert_eq!(second, Some(Ok(())));
        assert_eq!(r.signal.read(), 2);
        assert_eq!(r.signal.writer(), r.portal.driver_stats().blocking_task);
        assert_eq!(r.portal.driver_stats().blocking_replayed, 2);
    }

    #[test]
    fn test_direct_forward_from_two_units_is_multiple_drivers() {
        let r = rig();
        swap_to(&r, None, &r.a);
        let acc_a = r.acc_a.clone();
        let first = run_op(&r.sim, async move {
            acc_a.forward(|s| async move { s.write(1) }).await
        });
        assert_eq!(first, Some(Ok(())));

        swap_to(&r, Some(&r.a), &r.b);
        let acc_b = r.acc_b.clone();
        let second = run_op(&r.sim, async move {
            acc_b.forward(|s| async move { s.write(2) }).await
        });
        assert!(matches!(second, Some(Err(CallError::MultipleDrivers { .. }))));
        assert_eq!(r.signal.read(), 1);
    }

    #[test]
    fn test_wrong_state_is_usage_error() {
        let r = rig();
        let (control, a) = (r.control.clone(), r.a.clone());
        let results = run_op(&r.sim, async move {
            let activate = control.activate(&a).await;
            let unload = control.unload(&a).await;
            let deactivate = control.deactivate(&a).await;
            control.load(&a).await.unwrap();
            let reload = control.load(&a).await;
            (activate, unload, deactivate, reload)
        })
        .unwrap();
        assert!(matches!(results.0, Err(ReconfigError::Usage { .. })));
        assert!(matches!(results.1, Err(ReconfigError::Usage { .. })));
        assert!(matches!(results.2, Err(ReconfigError::Usage { .. })));
        assert!(matches!(results.3, Err(ReconfigError::Usage { .. })));
        assert_eq!(r.a.state(), UnitState::LoadedInactive);
    }

    #[test]
    fn test_registration_rules() {
        let r = rig();
        let other = Control::new(&r.ctx, "other");
        assert!(matches!(
            other.add(&r.a),
            Err(ReconfigError::ControlConflict { ref owner, .. }) if owner == "ctrl"
        ));
        assert!(r.control.add(&r.a).is_ok());
        assert_eq!(r.control.units().len(), 2);

        let stray = ReconfigurableUnit::new("stray");
        let control = r.control.clone();
        let result = run_op(&r.sim, async move { control.load(&stray).await });
        assert!(matches!(result, Some(Err(ReconfigError::Usage { .. }))));
    }

    #[test]
    fn test_operation_outside_task_is_usage_error() {
        let r = rig();
        assert!(matches!(
            r.control.try_lock(&[r.a.clone()]),
            Err(ReconfigError::Usage { .. })
        ));
        let result = futures::executor::block_on(r.control.load(&r.a));
        assert!(matches!(result, Err(ReconfigError::Usage { .. })));
        assert_eq!(r.a.state(), UnitState::Unloaded);
        assert!(!r.a.is_locked());
    }

    #[test]
    fn test_lock_serializes_tasks() {
        let r = rig();
        let holder = {
            let (control, a, ctx) = (r.control.clone(), r.a.clone(), r.ctx.clone());
            r.sim.spawn_with_handle("holder", async move {
                control.lock(&[a.clone()]).await.unwrap();
                ctx.sleep(ns(5)).await;
                control.load(&a).await.unwrap();
                control.unlock(&[a.clone()]).unwrap();
                ctx.now()
            })
        };
        let waiter = {
            let (control, a, ctx) = (r.control.clone(), r.a.clone(), r.ctx.clone());
            r.sim.spawn_with_handle("waiter", async move {
                ctx.sleep(ns(1)).await;
                let locked = control.try_lock(&[a.clone()]).unwrap();
                control.activate(&a).await.unwrap();
                (locked, ctx.now())
            })
        };
        r.sim.run();
        assert_eq!(holder.take(), Some(ns(15)));
        assert_eq!(waiter.take(), Some((false, ns(15))));
        assert!(r.a.is_active());
        assert!(!r.control.is_locked(&[r.a.clone(), r.b.clone()]));
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let r = rig();
        let (control, a) = (r.control.clone(), r.a.clone());
        let result = run_op(&r.sim, async move { control.unlock(&[a]) });
        assert!(matches!(result, Some(Err(ReconfigError::Usage { .. }))));
    }

    #[test]
    fn test_all_operations_run_concurrently() {
        let sim = SimContext::new(3);
        let ctx = sim.handle();
        let control = Control::new(&ctx, "ctrl");
        let mut units = Vec::new();
        let mut portals = Vec::new();
        for name in ["u0", "u1", "u2"] {
            let portal: Portal<dyn SignalIf<u32>> = Portal::new(&ctx, format!("{name}.sw"));
            portal
                .bind_static(Signal::new(&ctx, format!("{name}.sig"), 0u32).as_interface())
                .unwrap();
            let unit = ReconfigurableUnit::new(name);
            unit.set_delay(Action::Load, ns(10));
            unit.set_delay(Action::Unload, ns(4));
            control.add(&unit).unwrap();
            portal.bind(&unit).unwrap();
            units.push(unit);
            portals.push(portal);
        }

        let times = {
            let (control, units, ctx) = (control.clone(), units.clone(), ctx.clone());
            run_op(&sim, async move {
                control.load(&units[0]).await.unwrap();
                let t0 = ctx.now();
                control.load_all(&units).await.unwrap();
                let t1 = ctx.now();
                control.activate_all(&units).await.unwrap();
                control.activate_all(&units).await.unwrap();
                control.deactivate_all(&units).await.unwrap();
                control.unload_all(&units).await.unwrap();
                (t0, t1, ctx.now())
            })
        };
        assert_eq!(times, Some((ns(10), ns(20), ns(24))));
        assert!(units.iter().all(|u| u.state() == UnitState::Unloaded));
        assert!(portals.iter().all(|p| p.switch().occupant().is_none()));
    }

    #[test]
    fn test_load_all_on_shared_switch_changes_nothing() {
        let r = rig();
        let (control, a, b) = (r.control.clone(), r.a.clone(), r.b.clone());
        let result = run_op(&r.sim, async move { control.load_all(&[a, b]).await });
        assert!(matches!(result, Some(Err(ReconfigError::Conflict { .. }))));
        assert_eq!(r.a.state(), UnitState::Unloaded);
        assert_eq!(r.b.state(), UnitState::Unloaded);
        assert_eq!(r.portal.switch().occupant(), None);
    }

    #[test]
    fn test_remove_tears_down() {
        let r = rig();
        swap_to(&r, None, &r.a);
        let (control, a) = (r.control.clone(), r.a.clone());
        let result = run_op(&r.sim, async move { control.remove(&a).await });
        assert_eq!(result, Some(Ok(())));
        assert_eq!(r.a.state(), UnitState::Unloaded);
        assert_eq!(r.a.control_name(), None);
        assert_eq!(r.control.units(), vec![r.b.clone()]);
        assert_eq!(r.portal.switch().occupant(), None);
    }

    #[test]
    fn test_move_only_while_unloaded() {
        let r = rig();
        let target: Portal<dyn SignalIf<u32>> = Portal::new(&r.ctx, "T");
        target
            .bind_static(Signal::new(&r.ctx, "t.sig", 0u32).as_interface())
            .unwrap();
        let connector = Rc::new(SwitchConnector::new("group2").portal(&target));
        let slot = AccessorSlot::<dyn SignalIf<u32>>::new();

        swap_to(&r, None, &r.a);
        let moved_while_active = {
            let (control, a, connector) = (r.control.clone(), r.a.clone(), connector.clone());
            let ports = PortMap::new().import(&slot);
            run_op(&r.sim, async move { control.move_unit(&a, &ports, &connector).await })
        };
        assert!(matches!(moved_while_active, Some(Err(ReconfigError::Usage { .. }))));

        let moved = {
            let (control, b, connector) = (r.control.clone(), r.b.clone(), connector.clone());
            let ports = PortMap::new().import(&slot);
            run_op(&r.sim, async move { control.move_unit(&b, &ports, &connector).await })
        };
        assert_eq!(moved, Some(Ok(())));
        assert!(slot.is_bound());
        assert!(!r.portal.switch().is_bound(r.b.id()));
        assert!(target.switch().is_bound(r.b.id()));
        assert_eq!(r.b.switches().len(), 1);
        assert_eq!(r.b.switches()[0].name(), "T");
    }

    #[test]
    fn test_failed_move_keeps_old_binding() {
        let r = rig();
        let target: Portal<dyn SignalIf<u32>> = Portal::new(&r.ctx, "T");
        target
            .bind_static(Signal::new(&r.ctx, "t.sig", 0u32).as_interface())
            .unwrap();
        let connector = Rc::new(SwitchConnector::new("twice").portal(&target).portal(&target));
        let first = AccessorSlot::<dyn SignalIf<u32>>::new();
        let second = AccessorSlot::<dyn SignalIf<u32>>::new();

        let moved = {
            let (control, b, connector) = (r.control.clone(), r.b.clone(), connector.clone());
            let ports = PortMap::new().import(&first).import(&second);
            run_op(&r.sim, async move { control.move_unit(&b, &ports, &connector).await })
        };
        assert!(matches!(moved, Some(Err(ReconfigError::Binding { .. }))));
        assert!(!first.is_bound());
        assert!(!target.switch().is_bound(r.b.id()));
        assert_eq!(r.b.switches().len(), 1);
        assert!(r.b.switches()[0].same_switch(&r.portal.switch()));
        assert!(r.portal.switch().is_bound(r.b.id()));

        // still usable on the old switch
        let (control, b) = (r.control.clone(), r.b.clone());
        let loaded = run_op(&r.sim, async move { control.load(&b).await });
        assert_eq!(loaded, Some(Ok(())));
        assert_eq!(r.portal.switch().occupant(), Some("B".to_string()));
    }

    #[test]
    fn test_unit_process_restarts_on_each_activation() {
        let r = rig();
        let starts = Rc::new(Cell::new(0u32));
        let ticks = Rc::new(Cell::new(0u32));
        let tick = Event::new("tick");
        let process = {
            let (starts, ticks, tick) = (starts.clone(), ticks.clone(), tick.clone());
            r.a.spawn_process(&r.ctx, "worker", move || {
                let (starts, ticks, tick) = (starts.clone(), ticks.clone(), tick.clone());
                async move {
                    starts.set(starts.get() + 1);
                    loop {
                        tick.wait().await;
                        ticks.set(ticks.get() + 1);
                    }
                }
            })
        };
        assert!(!process.is_running());
        assert!(process.is_restartable());
        assert_eq!(r.a.process_count(), 1);

        swap_to(&r, None, &r.a);
        assert!(process.is_running());
        assert_eq!(starts.get(), 1);
        tick.notify();
        r.sim.run();
        assert_eq!(ticks.get(), 1);

        let (control, a) = (r.control.clone(), r.a.clone());
        assert_eq!(run_op(&r.sim, async move { control.deactivate(&a).await }), Some(Ok(())));
        assert!(!process.is_running());
        assert_eq!(process.kill_count(), 1);
        tick.notify();
        r.sim.run();
        assert_eq!(ticks.get(), 1);

        let (control, a) = (r.control.clone(), r.a.clone());
        assert_eq!(run_op(&r.sim, async move { control.activate(&a).await }), Some(Ok(())));
        assert!(process.is_running());
        assert_eq!((starts.get(), process.start_count()), (2, 2));
        tick.notify();
        r.sim.run();
        assert_eq!(ticks.get(), 2);
    }

    #[test]
    fn test_transient_process_dies_with_deactivation() {
        let r = rig();
        let spawned = r.a.spawn_transient(&r.ctx, "early", async {});
        assert!(matches!(spawned, Err(ReconfigError::Usage { .. })));

        swap_to(&r, None, &r.a);
        let process = r
            .a
            .spawn_transient(&r.ctx, "job", futures::future::pending::<()>())
            .unwrap();
        r.sim.run();
        assert!(process.is_running());
        assert!(!process.is_restartable());
        assert_eq!(process.name(), "A.job");

        // registered while active: starts right away
        let late = r.a.spawn_process(&r.ctx, "late", || futures::future::pending::<()>());
        assert!(late.is_running());
        assert_eq!(r.a.process_count(), 2);

        let (control, a) = (r.control.clone(), r.a.clone());
        let cycled = run_op(&r.sim, async move {
            control.deactivate(&a).await?;
            control.activate(&a).await
        });
        assert_eq!(cycled, Some(Ok(())));
        assert!(!process.is_running());
        assert_eq!(process.start_count(), 1);
        assert_eq!(r.a.process_count(), 1);
        assert!(late.is_running());
        assert_eq!(late.start_count(), 2);
    }

    struct HookLog {
        ctx: SharedContext,
        entries: RefCell<Vec<(Action, Duration, UnitState, bool)>>,
    }

    impl UnitHooks for HookLog {
        fn on_load(&self, unit: &ReconfigurableUnit) {
            self.record(Action::Load, unit);
        }

        fn on_activate(&self, unit: &ReconfigurableUnit) {
            self.record(Action::Activate, unit);
        }

        fn on_deactivate(&self, unit: &ReconfigurableUnit) {
            self.record(Action::Deactivate, unit);
        }

        fn on_unload(&self, unit: &ReconfigurableUnit) {
            self.record(Action::Unload, unit);
        }
    }

    impl HookLog {
        fn record(&self, action: Action, unit: &ReconfigurableUnit) {
            self.entries.borrow_mut().push((
                action,
                self.ctx.now(),
                unit.state(),
                unit.is_deactivation_requested(),
            ));
        }
    }

    #[test]
    fn test_unit_hooks_follow_transitions() {
        let r = rig();
        let log = Rc::new(HookLog {
            ctx: r.ctx.clone(),
            entries: RefCell::new(Vec::new()),
        });
        r.a.add_hooks(log.clone());
        r.a.set_delay(Action::Deactivate, ns(3));
        r.a.set_delay(Action::Unload, ns(2));

        swap_to(&r, None, &r.a);
        swap_to(&r, Some(&r.a), &r.b);
        assert_eq!(
            *log.entries.borrow(),
            vec![
                (Action::Load, ns(10), UnitState::LoadedInactive, false),
                (Action::Activate, ns(10), UnitState::LoadedActive, false),
                (Action::Deactivate, ns(13), UnitState::LoadedInactive, true),
                (Action::Unload, ns(15), UnitState::Unloaded, false),
            ]
        );
        assert_eq!(r.portal.switch().occupant(), Some("B".to_string()));
    }

    struct Doubling;

    impl DelayPolicy for Doubling {
        fn delay(&self, unit: &ReconfigurableUnit, action: Action) -> Duration {
            unit.default_delay(action) * 2
        }
    }

    #[test]
    fn test_delay_policy_applies_to_all_units() {
        let r = rig();
        r.control.set_delay_policy(Rc::new(Doubling));
        assert_eq!(r.a.delay(Action::Load), ns(20));
        assert_eq!(r.b.delay(Action::Load), ns(20));
        assert_eq!(r.a.default_delay(Action::Load), ns(10));

        let (control, a, ctx) = (r.control.clone(), r.a.clone(), r.ctx.clone());
        let at = run_op(&r.sim, async move {
            control.load(&a).await.unwrap();
            ctx.now()
        });
        assert_eq!(at, Some(ns(20)));
    }
}
