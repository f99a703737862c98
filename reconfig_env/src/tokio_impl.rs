//! Production implementation of ReconfigContext using Tokio.

use crate::{Event, ReconfigContext, TaskId};
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

tokio::task_local! {
    static CURRENT_TASK: TaskId;
}

/// Production context backed by a Tokio `LocalSet`.
///
/// Tasks are spawned with `tokio::task::spawn_local`, so every call that
/// spawns must happen inside a `LocalSet` (or a `#[tokio::test]` body run
/// through one). Time comes from `tokio::time`, which means paused test
/// clocks work as expected.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    next_task: Cell<u64>,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            next_task: Cell::new(1),
        }
    }

    /// Creates an Rc-wrapped context for sharing across tasks.
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl ReconfigContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }

    fn spawn(&self, name: &str, future: LocalBoxFuture<'static, ()>) -> TaskId {
        let id = TaskId(self.next_task.get());
        self.next_task.set(id.0 + 1);
        let name = name.to_string();
        tokio::task::spawn_local(CURRENT_TASK.scope(id, async move {
            trace!(task = %id, name = %name, "task started");
            future.await;
        }));
        id
    }

    fn current_task(&self) -> Option<TaskId> {
        CURRENT_TASK.try_with(|id| *id).ok()
    }

    fn notify_after(&self, event: &Event, delay: Duration) {
        let event = event.clone();
        tokio::task::spawn_local(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            event.notify();
        });
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_context_spawn_and_task_identity() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let ctx = TokioContext::shared();
                assert_eq!(ctx.current_task(), None);

                let seen = Rc::new(Cell::new(None));
                let inner_ctx = ctx.clone();
                let out = seen.clone();
                let id = ctx.spawn(
                    "identity",
                    Box::pin(async move {
                        out.set(inner_ctx.current_task());
                    }),
                );
                ctx.sleep(Duration::from_millis(1)).await;
                assert_eq!(seen.get(), Some(id));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_context_notify_after() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let ctx = TokioContext::new();
                let ev = Event::new("tick");
                ctx.notify_after(&ev, Duration::from_millis(5));
                ev.wait().await;
                assert!(ctx.now() >= Duration::from_millis(5));
                assert_eq!(ev.notify_count(), 1);
            })
            .await;
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
