//! Core environment context trait for the reconfiguration engine.

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use std::rc::Rc;
use std::time::Duration;

use crate::event::Event;
use crate::types::TaskId;

/// Shared handle to the environment, as held by units, controls and switches.
pub type SharedContext = Rc<dyn ReconfigContext>;

/// The central interface for environment interaction.
///
/// This trait abstracts the discrete-event kernel so that the engine can run
/// in both a deterministic simulation and on a tokio `LocalSet`.
///
/// # Implementations
///
/// - **Simulation**: `SimContext` - virtual clock, FIFO ready queue, seeded
/// - **Production**: `TokioContext` - wraps `tokio::time` and `spawn_local`
///
/// # Determinism
///
/// Everything the engine does is driven by `sleep`, `spawn` and event
/// notification. With `SimContext` two runs from the same seed produce the
/// same interleaving, so any failure is reproducible from its seed number.
///
/// The engine is single-threaded: handles are `Rc` based and futures are
/// not `Send`.
#[async_trait(?Send)]
pub trait ReconfigContext: 'static {
    /// Returns the current simulated time since context creation.
    ///
    /// In simulation, this is the virtual clock.
    fn now(&self) -> Duration;

    /// Suspends the calling task for the given duration.
    ///
    /// `Duration::ZERO` still yields: the task resumes after every task that
    /// is already runnable has had its turn (one delta step).
    async fn sleep(&self, duration: Duration);

    /// Spawns a cooperative task and returns its identity.
    ///
    /// The task first runs once the spawner yields.
    fn spawn(&self, name: &str, future: LocalBoxFuture<'static, ()>) -> TaskId;

    /// Returns the identity of the task currently being polled, if any.
    fn current_task(&self) -> Option<TaskId>;

    /// Notifies `event` after `delay`. A zero delay notifies in the next
    /// delta step rather than immediately.
    fn notify_after(&self, event: &Event, delay: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
