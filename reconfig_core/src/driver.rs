//! Driver objects.
//!
//! A driver object replays calls on behalf of whichever unit issued them,
//! so that a shared permanent channel always sees the same caller: the
//! driver's replay task. Units loaded one after another can then write to
//! a single-writer channel without tripping its multiple-driver check.
//!
//! Two kinds exist per portal:
//!
//! - the **non-blocking** driver queues `FnOnce` calls and drains the whole
//!   queue in one scheduler step. It cannot return values and its errors
//!   can only be logged.
//! - the **blocking** driver queues async calls, runs them one at a time,
//!   and hands each result (or error) back to the suspended caller.
//!
//! Non-blocking drivers may share one replay task ([`SharedReplayer`]) at
//! the price of all portals using it presenting the same identity.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use reconfig_env::{Event, ReconfigContext, SharedContext, TaskId};
use tracing::{debug, warn};

use crate::error::CallError;

pub(crate) type NbCall = Box<dyn FnOnce() -> Result<(), CallError>>;

type BlockingCall = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()>>;

/// One-shot result slot with a completion event.
pub(crate) struct Completion<T> {
    slot: Rc<RefCell<Option<T>>>,
    done: Event,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            done: self.done.clone(),
        }
    }
}

impl<T> Completion<T> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
            done: Event::new(name),
        }
    }

    pub(crate) fn complete(&self, value: T) {
        *self.slot.borrow_mut() = Some(value);
        self.done.notify();
    }

    pub(crate) async fn wait(&self) -> T {
        loop {
            let ready = self.slot.borrow_mut().take();
            if let Some(value) = ready {
                return value;
            }
            self.done.wait().await;
        }
    }
}

/// Queue drained by one non-blocking replay task.
pub(crate) struct ReplayQueue {
    name: String,
    ctx: SharedContext,
    calls: RefCell<VecDeque<NbCall>>,
    wake: Event,
    pending: Cell<bool>,
    task: Cell<Option<TaskId>>,
    replayed: Cell<u64>,
    failures: Cell<u64>,
}

impl ReplayQueue {
    pub(crate) fn new(ctx: &SharedContext, name: impl Into<String>) -> Rc<Self> {
        let name = name.into();
        Rc::new(Self {
            wake: Event::new(format!("{name}.wake")),
            ctx: ctx.clone(),
            calls: RefCell::new(VecDeque::new()),
            pending: Cell::new(false),
            task: Cell::new(None),
            replayed: Cell::new(0),
            failures: Cell::new(0),
            name,
        })
    }

    pub(crate) fn enqueue(self: &Rc<Self>, call: NbCall) {
        self.calls.borrow_mut().push_back(call);
        self.ensure_task();
        if !self.pending.replace(true) {
            self.wake.notify();
        }
    }

    fn ensure_task(self: &Rc<Self>) {
        if self.task.get().is_some() {
            return;
        }
        let queue = self.clone();
        let id = self
            .ctx
            .spawn(&self.name, Box::pin(async move { queue.replay_loop().await }));
        debug!(driver = %self.name, task = %id, "non-blocking driver task started");
        self.task.set(Some(id));
    }

    async fn replay_loop(self: Rc<Self>) {
        loop {
            self.drain();
            self.pending.set(false);
            self.wake.wait().await;
        }
    }

    /// Runs every queued call in FIFO order without yielding.
    fn drain(&self) {
        let mut count = 0u64;
        loop {
            let next = self.calls.borrow_mut().pop_front();
            let Some(call) = next else {
                break;
            };
            count += 1;
            if let Err(error) = call() {
                self.failures.set(self.failures.get() + 1);
                warn!(driver = %self.name, %error, "non-blocking driver call failed");
            }
        }
        if count > 0 {
            self.replayed.set(self.replayed.get() + count);
            debug!(driver = %self.name, count, "replayed queued calls");
        }
    }

    pub(crate) fn task_id(&self) -> Option<TaskId> {
        self.task.get()
    }

    pub(crate) fn queued(&self) -> usize {
        self.calls.borrow().len()
    }
}

/// Serially replays blocking calls from one dedicated task.
pub(crate) struct BlockingDriver {
    name: String,
    ctx: SharedContext,
    calls: RefCell<VecDeque<BlockingCall>>,
    wake: Event,
    pending: Cell<bool>,
    task: Cell<Option<TaskId>>,
    replayed: Cell<u64>,
}

impl BlockingDriver {
    pub(crate) fn new(ctx: &SharedContext, name: impl Into<String>) -> Rc<Self> {
        let name = name.into();
        Rc::new(Self {
            wake: Event::new(format!("{name}.wake")),
            ctx: ctx.clone(),
            calls: RefCell::new(VecDeque::new()),
            pending: Cell::new(false),
            task: Cell::new(None),
            replayed: Cell::new(0),
            name,
        })
    }

    /// Queues `job` and suspends until the replay task has run it.
    pub(crate) async fn call<R, F, Fut>(self: &Rc<Self>, job: F) -> Result<R, CallError>
    where
        R: 'static,
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<R, CallError>> + 'static,
    {
        let completion = Completion::new(format!("{}.done", self.name));
        let sink = completion.clone();
        self.enqueue(Box::new(move || {
            Box::pin(async move {
                let result = job().await;
                sink.complete(result);
            })
        }));
        completion.wait().await
    }

    fn enqueue(self: &Rc<Self>, call: BlockingCall) {
        self.calls.borrow_mut().push_back(call);
        self.ensure_task();
        if !self.pending.replace(true) {
            self.wake.notify();
        }
    }

    fn ensure_task(self: &Rc<Self>) {
        if self.task.get().is_some() {
            return;
        }
        let driver = self.clone();
        let id = self
            .ctx
            .spawn(&self.name, Box::pin(async move { driver.replay_loop().await }));
        debug!(driver = %self.name, task = %id, "blocking driver task started");
        self.task.set(Some(id));
    }

    async fn replay_loop(self: Rc<Self>) {
        loop {
            loop {
                let next = self.calls.borrow_mut().pop_front();
                let Some(call) = next else {
                    break;
                };
                call().await;
                self.replayed.set(self.replayed.get() + 1);
            }
            self.pending.set(false);
            self.wake.wait().await;
        }
    }

    pub(crate) fn task_id(&self) -> Option<TaskId> {
        self.task.get()
    }
}

/// A non-blocking replay task shared by several portals.
#[derive(Clone)]
pub struct SharedReplayer {
    queue: Rc<ReplayQueue>,
}

impl SharedReplayer {
    pub fn new(ctx: &SharedContext, name: impl Into<String>) -> Self {
        Self {
            queue: ReplayQueue::new(ctx, name),
        }
    }

    /// Identity of the replay task, once it has been started.
    pub fn task_id(&self) -> Option<TaskId> {
        self.queue.task_id()
    }

    /// Total number of calls replayed.
    pub fn replayed(&self) -> u64 {
        self.queue.replayed.get()
    }
}

/// How a portal replays its non-blocking driver calls.
#[derive(Clone, Default)]
pub enum DriverMode {
    /// One replay task per portal.
    #[default]
    Dedicated,
    /// A replay task shared with other portals.
    Shared(SharedReplayer),
}

/// The driver objects of one portal.
pub(crate) struct PortalDrivers {
    pub(crate) nb: Rc<ReplayQueue>,
    pub(crate) blocking: Rc<BlockingDriver>,
}

impl PortalDrivers {
    pub(crate) fn new(ctx: &SharedContext, portal: &str, mode: DriverMode) -> Self {
        let nb = match mode {
            DriverMode::Dedicated => ReplayQueue::new(ctx, format!("{portal}.nb_driver")),
            DriverMode::Shared(replayer) => replayer.queue,
        };
        Self {
            nb,
            blocking: BlockingDriver::new(ctx, format!("{portal}.driver")),
        }
    }
}

/// Statistics of a portal's driver objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub nb_task: Option<TaskId>,
    pub blocking_task: Option<TaskId>,
    pub nb_replayed: u64,
    pub nb_failures: u64,
    pub nb_queued: usize,
    pub blocking_replayed: u64,
}

impl PortalDrivers {
    pub(crate) fn stats(&self) -> DriverStats {
        DriverStats {
            nb_task: self.nb.task_id(),
            blocking_task: self.blocking.task_id(),
            nb_replayed: self.nb.replayed.get(),
            nb_failures: self.nb.failures.get(),
            nb_queued: self.nb.queued(),
            blocking_replayed: self.blocking.replayed.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconfig_env::{ReconfigContext, SimContext};
    use std::time::Duration;

    #[test]
    fn test_nb_queue_replays_in_order_from_one_task() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let queue = ReplayQueue::new(&ctx, "q");
        let seen = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            let ctx = ctx.clone();
            queue.enqueue(Box::new(move || {
                seen.borrow_mut().push((i, ctx.current_task()));
                Ok(())
            }));
        }
        assert_eq!(queue.queued(), 3);
        sim.run();

        let task = queue.task_id();
        assert!(task.is_some());
        assert_eq!(*seen.borrow(), vec![(0, task), (1, task), (2, task)]);
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.replayed.get(), 3);
    }

    #[test]
    fn test_nb_queue_failures_are_counted_not_raised() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let queue = ReplayQueue::new(&ctx, "q");
        queue.enqueue(Box::new(|| Err(CallError::channel("boom"))));
        queue.enqueue(Box::new(|| Ok(())));
        sim.run();
        assert_eq!(queue.failures.get(), 1);
        assert_eq!(queue.replayed.get(), 2);
    }

    #[test]
    fn test_nb_queue_task_survives_idle_periods() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let queue = ReplayQueue::new(&ctx, "q");
        queue.enqueue(Box::new(|| Ok(())));
        sim.run();
        let first = queue.task_id();

        let later = queue.clone();
        let c = ctx.clone();
        sim.spawn_with_handle("later", async move {
            c.sleep(Duration::from_nanos(5)).await;
            later.enqueue(Box::new(|| Ok(())));
        });
        sim.run();
        assert_eq!(queue.task_id(), first);
        assert_eq!(queue.replayed.get(), 2);
    }

    #[test]
    fn test_blocking_driver_returns_results_and_errors() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let driver = BlockingDriver::new(&ctx, "d");

        let caller = {
            let driver = driver.clone();
            let ctx = ctx.clone();
            sim.spawn_with_handle("caller", async move {
                let inner = ctx.clone();
                let ok = driver
                    .call(move || async move {
                        inner.sleep(Duration::from_nanos(3)).await;
                        Ok::<_, CallError>(inner.current_task())
                    })
                    .await;
                let err = driver
                    .call(|| async { Err::<(), _>(CallError::channel("nope")) })
                    .await;
                (ok, err, ctx.now())
            })
        };
        sim.run();

        let (ok, err, at) = caller.take().unwrap();
        assert_eq!(ok, Ok(driver.task_id()));
        assert_eq!(err, Err(CallError::channel("nope")));
        assert_eq!(at, Duration::from_nanos(3));
        assert_eq!(driver.replayed.get(), 2);
    }

    #[test]
    fn test_shared_replayer_is_one_task_for_many_portals() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let shared = SharedReplayer::new(&ctx, "shared");
        let a = PortalDrivers::new(&ctx, "a", DriverMode::Shared(shared.clone()));
        let b = PortalDrivers::new(&ctx, "b", DriverMode::Shared(shared.clone()));

        a.nb.enqueue(Box::new(|| Ok(())));
        b.nb.enqueue(Box::new(|| Ok(())));
        sim.run();

        assert_eq!(a.stats().nb_task, shared.task_id());
        assert_eq!(b.stats().nb_task, shared.task_id());
        assert_eq!(shared.replayed(), 2);
    }
}
