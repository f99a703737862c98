//! Unit-owned processes.
//!
//! A unit's behavior usually runs in tasks of its own. Those tasks follow
//! the unit's life cycle:
//!
//! - a *restartable* process ([`ReconfigurableUnit::spawn_process`]) runs
//!   while the unit is LOADED_ACTIVE. It is killed when the unit leaves
//!   LOADED_ACTIVE and started again from its body on the next activation,
//!   so every activation sees a freshly reset process.
//! - a *transient* process ([`ReconfigurableUnit::spawn_transient`]) is
//!   spawned while active and killed with the next deactivation. It is
//!   never restarted.
//!
//! Killing aborts the task's future at its next poll; anything the future
//! owns is dropped, including blocking calls parked in a switch. A process
//! must not drive transitions of its own unit, since the deactivation would
//! kill the task running it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::future::{AbortHandle, Abortable, LocalBoxFuture};
use reconfig_env::{SharedContext, TaskId};
use tracing::debug;

/// Produces the future of one run of a restartable process.
pub(crate) type ProcessBody = Rc<dyn Fn() -> LocalBoxFuture<'static, ()>>;

struct ProcessState {
    name: String,
    ctx: SharedContext,
    body: Option<ProcessBody>,
    abort: RefCell<Option<AbortHandle>>,
    task: Cell<Option<TaskId>>,
    /// Run number of the live task, cleared when that task ends.
    running: Rc<Cell<Option<u64>>>,
    starts: Cell<u64>,
    kills: Cell<u64>,
}

impl ProcessState {
    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        let (abort, registration) = AbortHandle::new_pair();
        let run = self.starts.get() + 1;
        let running = self.running.clone();
        running.set(Some(run));
        let id = self.ctx.spawn(
            &self.name,
            Box::pin(async move {
                let _ = Abortable::new(future, registration).await;
                if running.get() == Some(run) {
                    running.set(None);
                }
            }),
        );
        *self.abort.borrow_mut() = Some(abort);
        self.task.set(Some(id));
        self.starts.set(run);
        debug!(process = %self.name, task = %id, "process started");
    }

    fn start(&self) {
        let Some(body) = &self.body else {
            return;
        };
        self.kill();
        self.spawn(body());
    }

    /// Aborts the current run. Returns false if nothing was running.
    fn kill(&self) -> bool {
        let Some(abort) = self.abort.borrow_mut().take() else {
            return false;
        };
        abort.abort();
        if self.running.take().is_none() {
            return false;
        }
        self.kills.set(self.kills.get() + 1);
        debug!(process = %self.name, "process killed");
        true
    }
}

/// Handle to a unit-owned process.
#[derive(Clone)]
pub struct UnitProcess {
    state: Rc<ProcessState>,
}

impl UnitProcess {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// True from a start until the task has finished or been killed.
    pub fn is_running(&self) -> bool {
        self.state.running.get().is_some()
    }

    /// True for processes that restart on each activation.
    pub fn is_restartable(&self) -> bool {
        self.state.body.is_some()
    }

    /// Task of the latest run.
    pub fn task_id(&self) -> Option<TaskId> {
        self.state.task.get()
    }

    /// Number of times the process was started.
    pub fn start_count(&self) -> u64 {
        self.state.starts.get()
    }

    /// Number of times a run was killed by a transition.
    pub fn kill_count(&self) -> u64 {
        self.state.kills.get()
    }
}

impl std::fmt::Debug for UnitProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitProcess")
            .field("name", &self.state.name)
            .field("running", &self.is_running())
            .field("starts", &self.start_count())
            .finish()
    }
}

/// The processes of one unit.
#[derive(Default)]
pub(crate) struct ProcessTable {
    processes: RefCell<Vec<Rc<ProcessState>>>,
}

impl ProcessTable {
    pub(crate) fn add_restartable(
        &self,
        ctx: &SharedContext,
        name: String,
        body: ProcessBody,
        start_now: bool,
    ) -> UnitProcess {
        let state = Rc::new(ProcessState {
            name,
            ctx: ctx.clone(),
            body: Some(body),
            abort: RefCell::new(None),
            task: Cell::new(None),
            running: Rc::new(Cell::new(None)),
            starts: Cell::new(0),
            kills: Cell::new(0),
        });
        if start_now {
            state.start();
        }
        self.processes.borrow_mut().push(state.clone());
        UnitProcess { state }
    }

    pub(crate) fn add_transient(
        &self,
        ctx: &SharedContext,
        name: String,
        future: LocalBoxFuture<'static, ()>,
    ) -> UnitProcess {
        let state = Rc::new(ProcessState {
            name,
            ctx: ctx.clone(),
            body: None,
            abort: RefCell::new(None),
            task: Cell::new(None),
            running: Rc::new(Cell::new(None)),
            starts: Cell::new(0),
            kills: Cell::new(0),
        });
        state.spawn(future);
        self.processes.borrow_mut().push(state.clone());
        UnitProcess { state }
    }

    /// Starts every restartable process afresh.
    pub(crate) fn start_all(&self) -> usize {
        let processes = self.processes.borrow().clone();
        let mut started = 0;
        for process in processes.iter().filter(|p| p.body.is_some()) {
            process.start();
            started += 1;
        }
        started
    }

    /// Kills every run and forgets transient processes.
    pub(crate) fn stop_all(&self) -> usize {
        let processes = std::mem::take(&mut *self.processes.borrow_mut());
        let mut killed = 0;
        for process in &processes {
            if process.kill() {
                killed += 1;
            }
        }
        let kept = processes.into_iter().filter(|p| p.body.is_some()).collect();
        *self.processes.borrow_mut() = kept;
        killed
    }

    pub(crate) fn len(&self) -> usize {
        self.processes.borrow().len()
    }
}
