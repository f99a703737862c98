//! Deterministic simulation context.
//!
//! `SimContext` is a small discrete-event kernel:
//!
//! - a FIFO ready queue of task ids (woken tasks run in wake order),
//! - a timer heap ordered by `(deadline, sequence)`,
//! - a virtual clock that only moves when the ready queue is empty.
//!
//! One *delta step* is a drain of the ready queue. Timers that expire at the
//! current instant (including `sleep(Duration::ZERO)`) fire only after that
//! drain, which gives zero-delay notifications their "next delta" meaning.

use std::cell::{Cell, RefCell};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context as TaskCx, Poll, Wake, Waker};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use tracing::{debug, trace};

use crate::context::{ReconfigContext, SharedContext};
use crate::error::EnvError;
use crate::event::Event;
use crate::types::TaskId;

/// Outcome of a bounded kernel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No runnable task and no pending timer is left. `blocked` tasks are
    /// still alive, waiting on events nobody scheduled.
    Idle { blocked: usize },

    /// The time limit was reached while timers were still pending.
    Paused,
}

type ReadyQueue = Arc<Mutex<VecDeque<TaskId>>>;

struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
    queued: AtomicBool,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, AtomicOrdering::SeqCst) {
            self.ready
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(self.id);
        }
    }
}

struct TaskSlot {
    name: String,

    /// `None` while the task is being polled.
    future: Option<LocalBoxFuture<'static, ()>>,

    waker: Arc<TaskWaker>,
}

struct SleepState {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

enum TimerAction {
    Wake(Rc<SleepState>),
    Notify(Event),
}

struct Timer {
    deadline: Duration,
    seq: u64,
    action: TimerAction,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct Kernel {
    seed: u64,
    now: Cell<Duration>,
    next_task: Cell<u64>,
    next_timer: Cell<u64>,
    tasks: RefCell<HashMap<TaskId, TaskSlot>>,
    ready: ReadyQueue,
    timers: RefCell<BinaryHeap<Reverse<Timer>>>,
    current: Cell<Option<TaskId>>,
    polls: Cell<u64>,
}

impl Kernel {
    fn push_timer(&self, deadline: Duration, action: TimerAction) {
        let seq = self.next_timer.get();
        self.next_timer.set(seq + 1);
        self.timers.borrow_mut().push(Reverse(Timer {
            deadline,
            seq,
            action,
        }));
    }

    fn pop_ready(&self) -> Option<TaskId> {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn poll_task(&self, id: TaskId) {
        let taken = {
            let mut tasks = self.tasks.borrow_mut();
            match tasks.get_mut(&id) {
                Some(slot) => slot.future.take().map(|f| (f, slot.waker.clone())),
                None => None,
            }
        };
        let Some((mut future, task_waker)) = taken else {
            return;
        };

        task_waker.queued.store(false, AtomicOrdering::SeqCst);
        let waker = Waker::from(task_waker);
        let mut cx = TaskCx::from_waker(&waker);

        self.current.set(Some(id));
        self.polls.set(self.polls.get() + 1);
        let poll = future.as_mut().poll(&mut cx);
        self.current.set(None);

        let mut tasks = self.tasks.borrow_mut();
        match poll {
            Poll::Ready(()) => {
                if let Some(slot) = tasks.remove(&id) {
                    trace!(task = %id, name = %slot.name, "task finished");
                }
            }
            Poll::Pending => {
                if let Some(slot) = tasks.get_mut(&id) {
                    slot.future = Some(future);
                }
            }
        }
    }

    /// Runs one delta step: every task that is runnable now, plus the ones
    /// they wake, until the queue is empty.
    fn drain_ready(&self) {
        while let Some(id) = self.pop_ready() {
            self.poll_task(id);
        }
    }

    fn fire_due_timers(&self) {
        loop {
            let timer = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(Reverse(t)) if t.deadline <= self.now.get() => timers.pop(),
                    _ => None,
                }
            };
            let Some(Reverse(timer)) = timer else {
                break;
            };
            match timer.action {
                TimerAction::Wake(state) => {
                    state.fired.set(true);
                    if let Some(waker) = state.waker.borrow_mut().take() {
                        waker.wake();
                    }
                }
                TimerAction::Notify(event) => event.notify(),
            }
        }
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timers.borrow().peek().map(|Reverse(t)| t.deadline)
    }
}

/// Deterministic simulation context.
///
/// Cloning yields another handle to the same kernel.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use reconfig_env::{ReconfigContext, SimContext};
///
/// let sim = SimContext::new(42);
/// let ctx = sim.handle();
/// let handle = sim.spawn_with_handle("sleeper", async move {
///     ctx.sleep(Duration::from_nanos(10)).await;
///     ctx.now()
/// });
/// sim.run();
/// assert_eq!(handle.take(), Some(Duration::from_nanos(10)));
/// ```
#[derive(Clone)]
pub struct SimContext {
    inner: Rc<Kernel>,
}

impl SimContext {
    /// Creates a new simulation context at time zero.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Rc::new(Kernel {
                seed,
                now: Cell::new(Duration::ZERO),
                next_task: Cell::new(1),
                next_timer: Cell::new(0),
                tasks: RefCell::new(HashMap::new()),
                ready: Arc::new(Mutex::new(VecDeque::new())),
                timers: RefCell::new(BinaryHeap::new()),
                current: Cell::new(None),
                polls: Cell::new(0),
            }),
        }
    }

    /// Returns this kernel as a shared trait object.
    pub fn handle(&self) -> SharedContext {
        Rc::new(self.clone())
    }

    /// Number of tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Total number of task polls so far (for metrics).
    pub fn poll_count(&self) -> u64 {
        self.inner.polls.get()
    }

    /// Spawns a task and returns a handle to its output.
    pub fn spawn_with_handle<T, F>(&self, name: &str, future: F) -> JoinHandle<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        let id = self.spawn(
            name,
            Box::pin(async move {
                let value = future.await;
                *out.borrow_mut() = Some(value);
            }),
        );
        JoinHandle { id, slot }
    }

    /// Runs until no runnable task and no timer is left.
    pub fn run(&self) -> RunStatus {
        self.run_until(Duration::MAX)
    }

    /// Runs for `span` of simulated time from now.
    pub fn run_for(&self, span: Duration) -> RunStatus {
        self.run_until(self.now().saturating_add(span))
    }

    /// Runs every event up to and including `limit`.
    ///
    /// When timers remain beyond the limit, the clock is left at `limit`.
    pub fn run_until(&self, limit: Duration) -> RunStatus {
        let kernel = &self.inner;
        loop {
            kernel.drain_ready();
            match kernel.next_deadline() {
                None => {
                    let blocked = self.pending_tasks();
                    if blocked > 0 {
                        debug!(blocked, now = ?kernel.now.get(), "simulation idle");
                    }
                    return RunStatus::Idle { blocked };
                }
                Some(deadline) if deadline > limit => {
                    if limit > kernel.now.get() {
                        kernel.now.set(limit);
                    }
                    return RunStatus::Paused;
                }
                Some(deadline) => {
                    if deadline > kernel.now.get() {
                        kernel.now.set(deadline);
                    }
                    kernel.fire_due_timers();
                }
            }
        }
    }

    /// Spawns `future`, runs the kernel until it finishes, and returns its
    /// output. Fails if the kernel goes idle first.
    pub fn block_on<T, F>(&self, future: F) -> Result<T, EnvError>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let handle = self.spawn_with_handle("block_on", future);
        self.run();
        handle
            .take()
            .ok_or_else(|| EnvError::stalled(self.pending_tasks()))
    }

    /// Like [`block_on`](Self::block_on) but gives up at `limit`.
    pub fn block_on_until<T, F>(&self, future: F, limit: Duration) -> Result<T, EnvError>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let handle = self.spawn_with_handle("block_on", future);
        match self.run_until(limit) {
            RunStatus::Paused => handle.take().ok_or_else(|| EnvError::time_limit(limit)),
            RunStatus::Idle { blocked } => handle.take().ok_or(EnvError::stalled(blocked)),
        }
    }
}

#[async_trait(?Send)]
impl ReconfigContext for SimContext {
    fn now(&self) -> Duration {
        self.inner.now.get()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now().saturating_add(duration);
        Sleep {
            kernel: self.inner.clone(),
            deadline,
            state: None,
        }
        .await
    }

    fn spawn(&self, name: &str, future: LocalBoxFuture<'static, ()>) -> TaskId {
        let kernel = &self.inner;
        let id = TaskId(kernel.next_task.get());
        kernel.next_task.set(id.0 + 1);

        let waker = Arc::new(TaskWaker {
            id,
            ready: kernel.ready.clone(),
            queued: AtomicBool::new(false),
        });
        kernel.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                name: name.to_string(),
                future: Some(future),
                waker: waker.clone(),
            },
        );
        waker.wake_by_ref();
        trace!(task = %id, name, "task spawned");
        id
    }

    fn current_task(&self) -> Option<TaskId> {
        self.inner.current.get()
    }

    fn notify_after(&self, event: &Event, delay: Duration) {
        let deadline = self.now().saturating_add(delay);
        self.inner
            .push_timer(deadline, TimerAction::Notify(event.clone()));
    }

    fn seed(&self) -> u64 {
        self.inner.seed
    }
}

struct Sleep {
    kernel: Rc<Kernel>,
    deadline: Duration,
    state: Option<Rc<SleepState>>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskCx<'_>) -> Poll<()> {
        let this = self.get_mut();
        match &this.state {
            None => {
                let state = Rc::new(SleepState {
                    fired: Cell::new(false),
                    waker: RefCell::new(Some(cx.waker().clone())),
                });
                this.kernel
                    .push_timer(this.deadline, TimerAction::Wake(state.clone()));
                this.state = Some(state);
                Poll::Pending
            }
            Some(state) if state.fired.get() => Poll::Ready(()),
            Some(state) => {
                *state.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Handle to the output of a task spawned with
/// [`SimContext::spawn_with_handle`].
pub struct JoinHandle<T> {
    id: TaskId,
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> JoinHandle<T> {
    /// Identity of the spawned task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the task has produced its output (and it was not taken).
    pub fn is_finished(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Takes the output, if the task has finished.
    pub fn take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(n: u64) -> Duration {
        Duration::from_nanos(n)
    }

    #[test]
    fn test_sim_context_starts_at_zero() {
        let sim = SimContext::new(42);
        assert_eq!(sim.now(), Duration::ZERO);
        assert_eq!(sim.seed(), 42);
        assert_eq!(sim.run(), RunStatus::Idle { blocked: 0 });
    }

    #[test]
    fn test_sleep_advances_virtual_time() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let handle = sim.spawn_with_handle("sleeper", async move {
            ctx.sleep(ns(10)).await;
            let first = ctx.now();
            ctx.sleep(ns(5)).await;
            (first, ctx.now())
        });
        sim.run();
        assert_eq!(handle.take(), Some((ns(10), ns(15))));
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let sim = SimContext::new(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            sim.spawn(&format!("t{i}"), Box::pin(async move { log.borrow_mut().push(i) }));
        }
        sim.run();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_zero_sleep_yields_one_delta() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l1 = log.clone();
        let c1 = ctx.clone();
        sim.spawn(
            "a",
            Box::pin(async move {
                l1.borrow_mut().push("a0");
                c1.sleep(Duration::ZERO).await;
                l1.borrow_mut().push("a1");
            }),
        );
        let l2 = log.clone();
        sim.spawn("b", Box::pin(async move { l2.borrow_mut().push("b0") }));

        sim.run();
        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1"]);
        assert_eq!(sim.now(), Duration::ZERO);
    }

    #[test]
    fn test_event_wakes_waiting_task() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let ev = Event::new("go");
        let waiter = {
            let ev = ev.clone();
            let ctx = ctx.clone();
            sim.spawn_with_handle("waiter", async move {
                ev.wait().await;
                ctx.now()
            })
        };
        ctx.notify_after(&ev, ns(7));
        sim.run();
        assert_eq!(waiter.take(), Some(ns(7)));
    }

    #[test]
    fn test_current_task_is_visible_inside_task() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let handle = sim.spawn_with_handle("who", async move { ctx.current_task() });
        let id = handle.id();
        sim.run();
        assert_eq!(handle.take(), Some(Some(id)));
        assert_eq!(sim.current_task(), None);
    }

    #[test]
    fn test_run_until_pauses_at_limit() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let handle = sim.spawn_with_handle("late", async move {
            ctx.sleep(ns(100)).await;
        });
        assert_eq!(sim.run_until(ns(40)), RunStatus::Paused);
        assert_eq!(sim.now(), ns(40));
        assert!(!handle.is_finished());

        assert_eq!(sim.run_for(ns(60)), RunStatus::Idle { blocked: 0 });
        assert!(handle.is_finished());
    }

    #[test]
    fn test_block_on_reports_stall() {
        let sim = SimContext::new(1);
        let never = Event::new("never");
        let result = sim.block_on(async move { never.wait().await });
        assert_eq!(result, Err(EnvError::Stalled { pending: 1 }));
    }

    #[test]
    fn test_same_seed_same_interleaving() {
        fn trace_for(seed: u64) -> Vec<(u64, u128)> {
            let sim = SimContext::new(seed);
            let ctx = sim.handle();
            let log = Rc::new(RefCell::new(Vec::new()));
            for i in 0..4u64 {
                let log = log.clone();
                let ctx = ctx.clone();
                sim.spawn(
                    "worker",
                    Box::pin(async move {
                        for step in 0..3u64 {
                            ctx.sleep(ns((i * 7 + step * 3) % 5)).await;
                            log.borrow_mut().push((i, ctx.now().as_nanos()));
                        }
                    }),
                );
            }
            sim.run();
            let out = log.borrow().clone();
            out
        }
        assert_eq!(trace_for(9), trace_for(9));
    }
}
