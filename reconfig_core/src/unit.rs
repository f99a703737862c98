//! Reconfigurable units.
//!
//! A [`ReconfigurableUnit`] is one candidate occupant of a set of switches.
//! It owns its state, its per-action delays, its resettable components, its
//! transaction counters and the re-entrant lock that serializes control
//! operations on it. The transitions themselves are driven by a
//! [`Control`](crate::Control); the unit only exposes what unit-side code
//! needs to cooperate with them, plus the processes and hooks that follow
//! its life cycle.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use reconfig_env::{Event, SharedContext, TaskId};

use crate::counter::{Aggregate, CounterArena, TransactionCounter};
use crate::error::{ReconfigError, Result};
use crate::process::{ProcessTable, UnitProcess};
use crate::resettable::{Registration, ResetRegistry, Resettable};
use crate::state::{Action, DelayTable, UnitId, UnitState};
use crate::switch::SwitchHandle;

/// Callbacks run by the control at the end of each of the unit's
/// transitions. All methods default to doing nothing.
pub trait UnitHooks {
    /// The unit is LOADED_INACTIVE after a load.
    fn on_load(&self, _unit: &ReconfigurableUnit) {}

    /// The unit is LOADED_ACTIVE and its processes run.
    fn on_activate(&self, _unit: &ReconfigurableUnit) {}

    /// The deactivation delay has passed, before the request clears.
    fn on_deactivate(&self, _unit: &ReconfigurableUnit) {}

    /// The unit is UNLOADED and its switches are released.
    fn on_unload(&self, _unit: &ReconfigurableUnit) {}
}

/// Owning control, identified by id so the unit does not keep it alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Owner {
    pub(crate) id: u64,
    pub(crate) name: String,
}

/// Re-entrant lock keyed by task identity.
pub(crate) struct UnitLock {
    holder: Cell<Option<TaskId>>,
    depth: Cell<u32>,
    released: Event,
}

impl UnitLock {
    fn new(unit_name: &str) -> Self {
        Self {
            holder: Cell::new(None),
            depth: Cell::new(0),
            released: Event::new(format!("{unit_name}.lock_released")),
        }
    }

    pub(crate) fn can_acquire(&self, task: TaskId) -> bool {
        match self.holder.get() {
            None => true,
            Some(holder) => holder == task,
        }
    }

    pub(crate) fn try_acquire(&self, task: TaskId) -> bool {
        if !self.can_acquire(task) {
            return false;
        }
        self.holder.set(Some(task));
        self.depth.set(self.depth.get() + 1);
        true
    }

    pub(crate) async fn acquire(&self, task: TaskId) {
        while !self.try_acquire(task) {
            self.released.wait().await;
        }
    }

    /// Releases one level. Returns false if `task` does not hold the lock.
    pub(crate) fn release(&self, task: TaskId) -> bool {
        if self.holder.get() != Some(task) {
            return false;
        }
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            self.holder.set(None);
            self.released.notify();
        }
        true
    }

    pub(crate) fn holder(&self) -> Option<TaskId> {
        self.holder.get()
    }
}

pub(crate) struct UnitInner {
    id: UnitId,
    name: String,
    state: Cell<UnitState>,
    next_state: Cell<Option<UnitState>>,
    delays: Cell<DelayTable>,
    default_delays: Cell<DelayTable>,
    owner: RefCell<Option<Owner>>,
    switches: RefCell<Vec<SwitchHandle>>,
    resettables: Rc<ResetRegistry>,
    arena: Rc<CounterArena>,
    aggregate: Rc<Aggregate>,
    counter: TransactionCounter,
    deactivation_requested: Cell<bool>,
    activated: Event,
    deactivated: Event,
    lock: UnitLock,
    processes: ProcessTable,
    hooks: RefCell<Vec<Rc<dyn UnitHooks>>>,
}

/// Handle to a reconfigurable unit. Clones refer to the same unit.
#[derive(Clone)]
pub struct ReconfigurableUnit {
    inner: Rc<UnitInner>,
}

impl ReconfigurableUnit {
    /// Creates an UNLOADED unit with its own counter arena.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_counter_arena(name, CounterArena::new())
    }

    /// Creates an UNLOADED unit whose counters live in `arena`, so relay
    /// counters may span several units.
    pub fn with_counter_arena(name: impl Into<String>, arena: Rc<CounterArena>) -> Self {
        let name = name.into();
        let aggregate = Rc::new(Aggregate::new(&name));
        let counter = arena.leaf_for(&aggregate);
        Self {
            inner: Rc::new(UnitInner {
                id: UnitId::next(),
                state: Cell::new(UnitState::Unloaded),
                next_state: Cell::new(None),
                delays: Cell::new(DelayTable::default()),
                default_delays: Cell::new(DelayTable::default()),
                owner: RefCell::new(None),
                switches: RefCell::new(Vec::new()),
                resettables: Rc::new(ResetRegistry::default()),
                arena,
                aggregate,
                counter,
                deactivation_requested: Cell::new(false),
                activated: Event::new(format!("{name}.activated")),
                deactivated: Event::new(format!("{name}.deactivated")),
                lock: UnitLock::new(&name),
                processes: ProcessTable::default(),
                hooks: RefCell::new(Vec::new()),
                name,
            }),
        }
    }

    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> UnitState {
        self.inner.state.get()
    }

    /// Target state of the transition in progress, if any.
    pub fn next_state(&self) -> Option<UnitState> {
        self.inner.next_state.get()
    }

    pub fn is_changing(&self) -> bool {
        self.inner.next_state.get().is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    pub fn is_active(&self) -> bool {
        self.state() == UnitState::LoadedActive
    }

    // ------------------------------------------------------------------
    // Delays
    // ------------------------------------------------------------------

    /// Sets the delay of `action`, both as the unit's default and as the
    /// delay currently in effect.
    pub fn set_delay(&self, action: Action, delay: Duration) {
        let mut defaults = self.inner.default_delays.get();
        defaults.set(action, delay);
        self.inner.default_delays.set(defaults);
        self.set_effective_delay(action, delay);
    }

    /// Delay currently in effect for `action`.
    pub fn delay(&self, action: Action) -> Duration {
        self.inner.delays.get().get(action)
    }

    /// Delay configured on the unit itself, before any delay policy.
    pub fn default_delay(&self, action: Action) -> Duration {
        self.inner.default_delays.get().get(action)
    }

    pub fn delays(&self) -> DelayTable {
        self.inner.delays.get()
    }

    pub(crate) fn set_effective_delay(&self, action: Action, delay: Duration) {
        let mut delays = self.inner.delays.get();
        delays.set(action, delay);
        self.inner.delays.set(delays);
    }

    // ------------------------------------------------------------------
    // Ownership and switches
    // ------------------------------------------------------------------

    /// Name of the owning control, if registered.
    pub fn control_name(&self) -> Option<String> {
        self.inner.owner.borrow().as_ref().map(|o| o.name.clone())
    }

    pub(crate) fn owner(&self) -> Option<Owner> {
        self.inner.owner.borrow().clone()
    }

    pub(crate) fn set_owner(&self, owner: Option<Owner>) {
        *self.inner.owner.borrow_mut() = owner;
    }

    /// Switches this unit is bound to, in binding order.
    pub fn switches(&self) -> Vec<SwitchHandle> {
        self.inner.switches.borrow().clone()
    }

    pub(crate) fn attach_switch(&self, switch: SwitchHandle) {
        self.inner.switches.borrow_mut().push(switch);
    }

    /// Unbinds the unit from every switch. Only valid while UNLOADED.
    pub(crate) fn detach_switches(&self) -> Vec<SwitchHandle> {
        let switches = std::mem::take(&mut *self.inner.switches.borrow_mut());
        for switch in &switches {
            switch.unbind(self.id());
        }
        switches
    }

    /// Unbinds the switches attached after the first `keep`.
    pub(crate) fn detach_switches_from(&self, keep: usize) {
        let dropped: Vec<SwitchHandle> = {
            let mut switches = self.inner.switches.borrow_mut();
            let keep = keep.min(switches.len());
            switches.drain(keep..).collect()
        };
        for switch in &dropped {
            switch.unbind(self.id());
        }
    }

    /// Notifies every switch's relayed events so unit-side and
    /// permanent-side waiters re-check the channel state.
    pub fn refresh_notify_all(&self) {
        for switch in self.switches() {
            switch.refresh_notify();
        }
    }

    // ------------------------------------------------------------------
    // Resettable components
    // ------------------------------------------------------------------

    /// Registers a resettable component with this unit. The component
    /// stays registered until the returned guard is dropped.
    pub fn register_resettable<R: Resettable + 'static>(&self, component: &Rc<R>) -> Registration {
        let component: Rc<dyn Resettable> = component.clone();
        self.inner.resettables.register(component)
    }

    /// Number of live registered components.
    pub fn resettable_count(&self) -> usize {
        self.inner.resettables.len()
    }

    /// Total number of component resets performed so far.
    pub fn reset_count(&self) -> u64 {
        self.inner.resettables.reset_count()
    }

    pub(crate) fn reset_components(&self) -> usize {
        self.inner.resettables.reset_all()
    }

    // ------------------------------------------------------------------
    // Transaction accounting
    // ------------------------------------------------------------------

    /// The unit's root leaf counter.
    pub fn transaction_counter(&self) -> TransactionCounter {
        self.inner.counter.clone()
    }

    /// Allocates another leaf counter feeding this unit.
    pub fn new_counter(&self) -> TransactionCounter {
        self.inner.arena.leaf_for(&self.inner.aggregate)
    }

    pub fn counter_arena(&self) -> Rc<CounterArena> {
        self.inner.arena.clone()
    }

    /// Aggregate number of in-flight transactions.
    pub fn transaction_count(&self) -> i64 {
        self.inner.aggregate.count()
    }

    /// Forces the aggregate count to zero. Meant for teardown; a pending
    /// deactivation proceeds.
    pub fn reset_transaction_count(&self) {
        self.inner.aggregate.reset();
    }

    pub(crate) async fn wait_transactions_drained(&self) {
        while self.inner.aggregate.count() != 0 {
            self.inner.aggregate.zero_event().wait().await;
        }
    }

    // ------------------------------------------------------------------
    // Unit-side cooperation
    // ------------------------------------------------------------------

    /// True between a deactivation request and its completion.
    pub fn is_deactivation_requested(&self) -> bool {
        self.inner.deactivation_requested.get()
    }

    /// Notified each time the unit becomes LOADED_ACTIVE.
    pub fn activation_event(&self) -> Event {
        self.inner.activated.clone()
    }

    /// Notified each time the unit leaves LOADED_ACTIVE.
    pub fn deactivation_event(&self) -> Event {
        self.inner.deactivated.clone()
    }

    /// Suspends until the unit is LOADED_ACTIVE.
    pub async fn wait_active(&self) {
        while !self.is_active() {
            self.inner.activated.wait().await;
        }
    }

    /// True if a new transaction must not start now: the unit is not
    /// active, or a deactivation is waiting for the count to stay at zero.
    pub fn blocks_new_transactions(&self) -> bool {
        !self.is_active() || (self.is_deactivation_requested() && self.transaction_count() == 0)
    }

    /// Gives a pending deactivation the chance to complete. Suspends while
    /// [`blocks_new_transactions`](Self::blocks_new_transactions) holds and
    /// resumes once the unit is active again.
    pub async fn possible_deactivation(&self) {
        while self.blocks_new_transactions() {
            self.inner.activated.wait().await;
        }
    }

    // ------------------------------------------------------------------
    // Processes and hooks
    // ------------------------------------------------------------------

    /// Registers a process that runs while the unit is LOADED_ACTIVE.
    ///
    /// `body` is called for every run: once now if the unit is already
    /// active, and again on each activation. Each deactivation or unload
    /// kills the current run.
    pub fn spawn_process<F, Fut>(&self, ctx: &SharedContext, name: &str, body: F) -> UnitProcess
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let body = Rc::new(move || -> LocalBoxFuture<'static, ()> { body().boxed_local() });
        self.inner.processes.add_restartable(
            ctx,
            format!("{}.{name}", self.name()),
            body,
            self.is_active(),
        )
    }

    /// Spawns a process that lives until the next deactivation and is not
    /// restarted. Only allowed while LOADED_ACTIVE.
    pub fn spawn_transient<Fut>(&self, ctx: &SharedContext, name: &str, future: Fut) -> Result<UnitProcess>
    where
        Fut: Future<Output = ()> + 'static,
    {
        if !self.is_active() {
            return Err(ReconfigError::usage(
                self.name(),
                format!("cannot spawn '{name}' while {}", self.state()),
            ));
        }
        Ok(self.inner.processes.add_transient(
            ctx,
            format!("{}.{name}", self.name()),
            future.boxed_local(),
        ))
    }

    /// Number of registered processes. Transient ones count until killed.
    pub fn process_count(&self) -> usize {
        self.inner.processes.len()
    }

    /// Adds transition callbacks, run in registration order.
    pub fn add_hooks(&self, hooks: Rc<dyn UnitHooks>) {
        self.inner.hooks.borrow_mut().push(hooks);
    }

    pub(crate) fn start_processes(&self) -> usize {
        self.inner.processes.start_all()
    }

    pub(crate) fn stop_processes(&self) -> usize {
        self.inner.processes.stop_all()
    }

    pub(crate) fn run_hooks(&self, action: Action) {
        let hooks = self.inner.hooks.borrow().clone();
        for hook in hooks {
            match action {
                Action::Load => hook.on_load(self),
                Action::Activate => hook.on_activate(self),
                Action::Deactivate => hook.on_deactivate(self),
                Action::Unload => hook.on_unload(self),
            }
        }
    }

    // ------------------------------------------------------------------
    // Transition bookkeeping (driven by Control)
    // ------------------------------------------------------------------

    pub(crate) fn begin(&self, next: UnitState) {
        self.inner.next_state.set(Some(next));
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        self.inner.state.set(state);
        if self.inner.next_state.get() == Some(state) {
            self.inner.next_state.set(None);
        }
    }

    pub(crate) fn set_deactivation_requested(&self, requested: bool) {
        self.inner.deactivation_requested.set(requested);
    }

    pub(crate) fn notify_activated(&self) {
        self.inner.activated.notify();
    }

    pub(crate) fn notify_deactivated(&self) {
        self.inner.deactivated.notify();
    }

    pub(crate) fn lock(&self) -> &UnitLock {
        &self.inner.lock
    }

    /// True while some task holds the unit's control lock.
    pub fn is_locked(&self) -> bool {
        self.inner.lock.holder().is_some()
    }

    pub(crate) fn downgrade(&self) -> WeakUnit {
        WeakUnit(Rc::downgrade(&self.inner))
    }
}

impl PartialEq for ReconfigurableUnit {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ReconfigurableUnit {}

impl std::fmt::Debug for ReconfigurableUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurableUnit")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

/// Non-owning unit handle, held by filters and accessors.
#[derive(Clone)]
pub(crate) struct WeakUnit(Weak<UnitInner>);

impl WeakUnit {
    pub(crate) fn upgrade(&self) -> Option<ReconfigurableUnit> {
        self.0.upgrade().map(|inner| ReconfigurableUnit { inner })
    }
}
