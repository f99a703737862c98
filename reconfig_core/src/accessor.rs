//! Accessors: the forwarding policy of a switch.
//!
//! An [`Accessor<I>`] is what code on one side of a switch calls instead of
//! the channel on the other side. While the switch is OPEN toward it the
//! accessor has a *target* and forwards; otherwise:
//!
//! - non-blocking calls are answered by the fallback interface, the fixed
//!   "unavailable" implementation of `I`,
//! - blocking calls wait until a target is set again, which for a closed
//!   unit means forever.
//!
//! A blocking call already parked inside a target is abandoned when that
//! connection ends and restarted against the next one, so it never
//! completes on a channel the switch no longer exposes.
//!
//! Calls through a driver object (`forward_driver*`) are replayed by the
//! portal's driver task, so the permanent channel sees one stable caller.
//! Events declared with [`Accessor::declare_event`] are relayed only while
//! the accessor is connected.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;

use futures::future::{select, Either};
use reconfig_env::{Event, ForwardHandle};
use tracing::{debug, warn};

use crate::driver::PortalDrivers;
use crate::error::CallError;
use crate::filter::TransactionFilter;
use crate::switch::SwitchCore;

struct EventRelay<I: ?Sized> {
    getter: Box<dyn Fn(&I) -> Event>,
    relay: Event,
    link: Option<ForwardHandle>,
}

pub(crate) struct Forwarder<I: ?Sized> {
    core: Rc<SwitchCore>,
    label: String,
    target: RefCell<Option<Rc<I>>>,
    fallback: Rc<I>,
    target_set: Event,
    /// Bumped on every connect and disconnect.
    epoch: Cell<u64>,
    lost: Event,
    relays: RefCell<Vec<EventRelay<I>>>,
    filters: RefCell<Vec<TransactionFilter>>,
    drivers: Option<Rc<PortalDrivers>>,
    warned: Cell<bool>,
}

impl<I: ?Sized + 'static> Forwarder<I> {
    pub(crate) fn new(
        core: Rc<SwitchCore>,
        label: impl Into<String>,
        fallback: Rc<I>,
        drivers: Option<Rc<PortalDrivers>>,
    ) -> Rc<Self> {
        let label = label.into();
        Rc::new(Self {
            target_set: Event::new(format!("{label}.target_set")),
            epoch: Cell::new(0),
            lost: Event::new(format!("{label}.connection_lost")),
            core,
            label,
            target: RefCell::new(None),
            fallback,
            relays: RefCell::new(Vec::new()),
            filters: RefCell::new(Vec::new()),
            drivers,
            warned: Cell::new(false),
        })
    }

    pub(crate) fn current(&self) -> Option<Rc<I>> {
        self.target.borrow().clone()
    }

    /// Starts forwarding to `target` and links every declared event.
    pub(crate) fn connect(&self, target: Rc<I>) {
        for relay in self.relays.borrow_mut().iter_mut() {
            relay.link = Some((relay.getter)(&*target).forward_to(&relay.relay));
        }
        *self.target.borrow_mut() = Some(target);
        self.warned.set(false);
        self.end_connection();
        self.target_set.notify();
    }

    /// Stops forwarding. Relayed events go quiet.
    pub(crate) fn disconnect(&self) {
        for relay in self.relays.borrow_mut().iter_mut() {
            relay.link = None;
        }
        *self.target.borrow_mut() = None;
        self.end_connection();
    }

    fn end_connection(&self) {
        self.epoch.set(self.epoch.get() + 1);
        self.lost.notify();
    }

    /// Completes once connection `epoch` is over.
    async fn connection_lost(&self, epoch: u64) {
        while self.epoch.get() == epoch {
            self.lost.wait().await;
        }
    }

    /// Notifies every relay event once.
    pub(crate) fn refresh(&self) {
        let relays: Vec<Event> = self
            .relays
            .borrow()
            .iter()
            .map(|r| r.relay.clone())
            .collect();
        for relay in relays {
            relay.notify();
        }
    }

    pub(crate) fn set_filters(&self, filters: Vec<TransactionFilter>) {
        *self.filters.borrow_mut() = filters;
    }

    fn filters(&self) -> Vec<TransactionFilter> {
        self.filters.borrow().clone()
    }

    fn note_fallback(&self, what: &str) {
        if !self.warned.replace(true) {
            warn!(
                switch = %self.core.name(),
                accessor = %self.label,
                gate = %self.core.gate(),
                "{what} answered by fallback interface"
            );
        } else {
            debug!(accessor = %self.label, "{what} answered by fallback interface");
        }
    }

    /// Waits until a target is set and returns it with its connection
    /// epoch.
    async fn acquire_target(&self) -> (Rc<I>, u64) {
        loop {
            if let Some(target) = self.current() {
                return (target, self.epoch.get());
            }
            if !self.warned.replace(true) {
                warn!(
                    switch = %self.core.name(),
                    accessor = %self.label,
                    gate = %self.core.gate(),
                    "blocking call suspended until the switch opens"
                );
            }
            self.target_set.wait().await;
        }
    }
}

/// Forwarding handle for one side of a switch.
pub struct Accessor<I: ?Sized> {
    fwd: Rc<Forwarder<I>>,
}

impl<I: ?Sized> Clone for Accessor<I> {
    fn clone(&self) -> Self {
        Self {
            fwd: self.fwd.clone(),
        }
    }
}

impl<I: ?Sized + 'static> Accessor<I> {
    pub(crate) fn new(fwd: Rc<Forwarder<I>>) -> Self {
        Self { fwd }
    }

    /// True while calls are forwarded to a real channel.
    pub fn is_connected(&self) -> bool {
        self.fwd.target.borrow().is_some()
    }

    /// Name of the switch this accessor belongs to.
    pub fn switch_name(&self) -> &str {
        self.fwd.core.name()
    }

    /// Counts transfers made through this accessor.
    pub fn add_filter(&self, filter: TransactionFilter) {
        self.fwd.filters.borrow_mut().push(filter);
    }

    /// Declares a boundary-crossing event.
    ///
    /// Returns a relay event that is notified whenever the event selected
    /// by `getter` on the current target is notified, and only while this
    /// accessor is connected.
    pub fn declare_event(&self, getter: impl Fn(&I) -> Event + 'static) -> Event {
        let relay = Event::new(format!("{}.relay", self.fwd.label));
        let link = self
            .fwd
            .current()
            .map(|target| getter(&*target).forward_to(&relay));
        self.fwd.relays.borrow_mut().push(EventRelay {
            getter: Box::new(getter),
            relay: relay.clone(),
            link,
        });
        relay
    }

    /// Non-blocking call. Answered by the fallback interface when not
    /// connected.
    pub fn forward_nb<R>(&self, f: impl FnOnce(&I) -> R) -> R {
        match self.fwd.current() {
            Some(target) => f(&*target),
            None => {
                self.fwd.note_fallback("non-blocking call");
                f(&*self.fwd.fallback)
            }
        }
    }

    /// Runs `call` until it completes or connection `epoch` ends.
    async fn while_connected<R>(&self, epoch: u64, call: impl Future<Output = R>) -> Option<R> {
        let call = pin!(call);
        let lost = pin!(self.fwd.connection_lost(epoch));
        match select(call, lost).await {
            Either::Left((out, _)) => Some(out),
            Either::Right(_) => {
                debug!(accessor = %self.fwd.label, "connection lost, blocking call restarted");
                None
            }
        }
    }

    /// Blocking call. Suspends until connected.
    ///
    /// `f` is called again for each new connection if the previous one
    /// ends before the call completes.
    pub async fn forward<R, F, Fut>(&self, f: F) -> R
    where
        F: Fn(Rc<I>) -> Fut,
        Fut: Future<Output = R>,
    {
        loop {
            let (target, epoch) = self.fwd.acquire_target().await;
            let _guard = self.fwd.core.enter();
            if let Some(out) = self.while_connected(epoch, f(target)).await {
                return out;
            }
        }
    }

    /// Non-blocking filtered transfer. `f` returns `Some` when a data item
    /// actually moved, which is what the filters count.
    ///
    /// Refused by an input filter, the call goes to the fallback interface.
    pub fn transfer_nb<R>(&self, f: impl FnOnce(&I) -> Option<R>) -> Option<R> {
        let filters = self.fwd.filters();
        match self.fwd.current() {
            Some(target) if filters.iter().all(|flt| flt.admits()) => {
                let out = f(&*target);
                if out.is_some() {
                    filters.iter().for_each(|flt| flt.after_transfer());
                }
                out
            }
            _ => {
                self.fwd.note_fallback("filtered non-blocking transfer");
                f(&*self.fwd.fallback)
            }
        }
    }

    /// Blocking filtered transfer.
    ///
    /// Waits for a target and for the input filters to admit a transfer,
    /// then forwards. Restarted like [`forward`](Self::forward) when the
    /// connection ends first; only a completed call is counted.
    pub async fn transfer<R, F, Fut>(&self, f: F) -> R
    where
        F: Fn(Rc<I>) -> Fut,
        Fut: Future<Output = R>,
    {
        loop {
            let (target, filters, epoch) = self.admitted_target().await;
            let out = {
                let _guard = self.fwd.core.enter();
                self.while_connected(epoch, f(target)).await
            };
            if let Some(out) = out {
                filters.iter().for_each(|flt| flt.after_transfer());
                return out;
            }
        }
    }

    /// Blocking filtered transfer built from a non-blocking attempt.
    ///
    /// Retries `attempt` each time the event chosen by `ready` fires,
    /// re-checking the filters first, so no item is consumed while the
    /// unit cannot take new transactions.
    pub async fn transfer_when<R>(
        &self,
        attempt: impl Fn(&I) -> Option<R>,
        ready: impl Fn(&I) -> Event,
    ) -> R {
        loop {
            let (target, filters, epoch) = self.admitted_target().await;
            if let Some(out) = attempt(&*target) {
                filters.iter().for_each(|flt| flt.after_transfer());
                return out;
            }
            let event = ready(&*target);
            let _guard = self.fwd.core.enter();
            self.while_connected(epoch, event.wait()).await;
        }
    }

    /// Waits until there is a target whose filters admit a transfer.
    /// Filters are read once the target is known, since an exportal only
    /// installs them when it opens.
    async fn admitted_target(&self) -> (Rc<I>, Vec<TransactionFilter>, u64) {
        loop {
            let (target, epoch) = self.fwd.acquire_target().await;
            let filters = self.fwd.filters();
            if filters.iter().all(|flt| flt.admits()) {
                return (target, filters, epoch);
            }
            for flt in &filters {
                flt.before_transfer().await;
            }
        }
    }

    /// Non-blocking call replayed by the portal's non-blocking driver.
    ///
    /// The call runs later, in the driver task, against the channel that
    /// was connected when it was queued. Errors are only logged. Without a
    /// target the call goes to the fallback interface right away.
    pub fn forward_driver_nb<F>(&self, f: F)
    where
        F: FnOnce(&I) -> Result<(), CallError> + 'static,
    {
        let Some(target) = self.fwd.current() else {
            self.fwd.note_fallback("non-blocking driver call");
            if let Err(error) = f(&*self.fwd.fallback) {
                debug!(accessor = %self.fwd.label, %error, "fallback call failed");
            }
            return;
        };
        match &self.fwd.drivers {
            Some(drivers) => drivers.nb.enqueue(Box::new(move || f(&*target))),
            None => {
                if let Err(error) = f(&*target) {
                    warn!(accessor = %self.fwd.label, %error, "non-blocking call failed");
                }
            }
        }
    }

    /// Blocking call replayed by the portal's blocking driver. Errors
    /// raised during the replay are returned to the caller.
    pub async fn forward_driver<R, F, Fut>(&self, f: F) -> Result<R, CallError>
    where
        R: 'static,
        F: FnOnce(Rc<I>) -> Fut + 'static,
        Fut: Future<Output = Result<R, CallError>> + 'static,
    {
        let (target, _) = self.fwd.acquire_target().await;
        let _guard = self.fwd.core.enter();
        match &self.fwd.drivers {
            Some(drivers) => drivers.blocking.call(move || f(target)).await,
            None => f(target).await,
        }
    }
}

/// A cell receiving the accessor created by positional binding.
pub struct AccessorSlot<I: ?Sized> {
    cell: Rc<RefCell<Option<Accessor<I>>>>,
}

impl<I: ?Sized> Clone for AccessorSlot<I> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<I: ?Sized> Default for AccessorSlot<I> {
    fn default() -> Self {
        Self {
            cell: Rc::new(RefCell::new(None)),
        }
    }
}

impl<I: ?Sized + 'static> AccessorSlot<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bound accessor, if binding has happened.
    pub fn get(&self) -> Option<Accessor<I>> {
        self.cell.borrow().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.cell.borrow().is_some()
    }

    pub(crate) fn set(&self, accessor: Accessor<I>) {
        *self.cell.borrow_mut() = Some(accessor);
    }
}
