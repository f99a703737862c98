//! Notification events.
//!
//! An [`Event`] is the only synchronization primitive the engine needs:
//! tasks await it, anybody may notify it, and an event can be *forwarded*
//! to other events so that a notification on a permanent channel reaches
//! whatever a switch currently exposes.
//!
//! Events are single-threaded (`Rc`) and executor-agnostic: waiting only
//! stores the task's [`Waker`], so the same event works on the
//! deterministic [`SimContext`](crate::SimContext) and inside a tokio
//! `LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// A notifiable event.
///
/// Cloning an `Event` yields another handle to the same event.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

struct EventInner {
    name: String,

    /// Bumped on every notification; waiters compare against the value
    /// they saw when they armed.
    generation: Cell<u64>,

    next_key: Cell<u64>,

    waiters: RefCell<BTreeMap<u64, Waker>>,

    forwards: RefCell<Vec<(u64, Weak<EventInner>)>>,

    /// Set while this event is propagating, breaks forwarding cycles.
    notifying: Cell<bool>,
}

impl EventInner {
    fn next_key(&self) -> u64 {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        key
    }
}

impl Event {
    /// Creates a new event with a diagnostic name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(EventInner {
                name: name.into(),
                generation: Cell::new(0),
                next_key: Cell::new(0),
                waiters: RefCell::new(BTreeMap::new()),
                forwards: RefCell::new(Vec::new()),
                notifying: Cell::new(false),
            }),
        }
    }

    /// Diagnostic name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of notifications so far.
    pub fn notify_count(&self) -> u64 {
        self.inner.generation.get()
    }

    /// Number of tasks currently parked on this event.
    pub fn waiter_count(&self) -> usize {
        self.inner.waiters.borrow().len()
    }

    /// Returns true if both handles refer to the same event.
    pub fn same_event(&self, other: &Event) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Notifies the event immediately.
    ///
    /// All current waiters become runnable and every live forwarding target
    /// is notified in registration order.
    pub fn notify(&self) {
        let inner = &self.inner;
        if inner.notifying.get() {
            return;
        }
        inner.notifying.set(true);
        inner.generation.set(inner.generation.get() + 1);

        let waiters = std::mem::take(&mut *inner.waiters.borrow_mut());
        for (_, waker) in waiters {
            waker.wake();
        }

        let targets: Vec<Rc<EventInner>> = {
            let mut forwards = inner.forwards.borrow_mut();
            forwards.retain(|(_, weak)| weak.strong_count() > 0);
            forwards.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for target in targets {
            Event { inner: target }.notify();
        }

        inner.notifying.set(false);
    }

    /// Returns a future that completes on the next notification.
    pub fn wait(&self) -> EventWait {
        EventWait {
            event: self.inner.clone(),
            armed: None,
        }
    }

    /// Forwards every future notification of `self` to `target`.
    ///
    /// The forwarding stays in place for as long as the returned handle
    /// lives (or until [`ForwardHandle::cancel`]). The target is held weakly.
    pub fn forward_to(&self, target: &Event) -> ForwardHandle {
        let key = self.inner.next_key();
        self.inner
            .forwards
            .borrow_mut()
            .push((key, Rc::downgrade(&target.inner)));
        ForwardHandle {
            source: Rc::downgrade(&self.inner),
            key,
        }
    }

    /// Number of live forwarding targets.
    pub fn forward_count(&self) -> usize {
        self.inner
            .forwards
            .borrow()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.inner.name)
            .field("notified", &self.inner.generation.get())
            .finish()
    }
}

/// Future returned by [`Event::wait`].
pub struct EventWait {
    event: Rc<EventInner>,

    /// (generation seen when armed, waiter key)
    armed: Option<(u64, u64)>,
}

impl Future for EventWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.armed {
            None => {
                let key = this.event.next_key();
                this.event
                    .waiters
                    .borrow_mut()
                    .insert(key, cx.waker().clone());
                this.armed = Some((this.event.generation.get(), key));
                Poll::Pending
            }
            Some((seen, key)) => {
                if this.event.generation.get() != seen {
                    this.event.waiters.borrow_mut().remove(&key);
                    this.armed = None;
                    return Poll::Ready(());
                }
                this.event
                    .waiters
                    .borrow_mut()
                    .insert(key, cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        if let Some((_, key)) = self.armed {
            self.event.waiters.borrow_mut().remove(&key);
        }
    }
}

/// Keeps an event forwarding alive. Dropping it removes the forwarding.
pub struct ForwardHandle {
    source: Weak<EventInner>,
    key: u64,
}

impl ForwardHandle {
    /// Removes the forwarding now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.forwards.borrow_mut().retain(|(k, _)| *k != self.key);
        }
    }
}

impl std::fmt::Debug for ForwardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandle").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    fn poll_once(fut: &mut EventWait) -> Poll<()> {
        let mut cx = Context::from_waker(noop_waker_ref());
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn test_wait_completes_after_notify() {
        let ev = Event::new("ev");
        let mut wait = ev.wait();
        assert!(poll_once(&mut wait).is_pending());
        assert_eq!(ev.waiter_count(), 1);

        ev.notify();
        assert!(poll_once(&mut wait).is_ready());
        assert_eq!(ev.waiter_count(), 0);
    }

    #[test]
    fn test_notify_before_wait_is_not_remembered() {
        let ev = Event::new("ev");
        ev.notify();
        let mut wait = ev.wait();
        assert!(poll_once(&mut wait).is_pending());
    }

    #[test]
    fn test_dropped_wait_unregisters() {
        let ev = Event::new("ev");
        let mut wait = ev.wait();
        assert!(poll_once(&mut wait).is_pending());
        drop(wait);
        assert_eq!(ev.waiter_count(), 0);
    }

    #[test]
    fn test_forwarding_follows_handle() {
        let source = Event::new("source");
        let target = Event::new("target");

        let handle = source.forward_to(&target);
        source.notify();
        assert_eq!(target.notify_count(), 1);

        handle.cancel();
        source.notify();
        assert_eq!(target.notify_count(), 1);
        assert_eq!(source.forward_count(), 0);
    }

    #[test]
    fn test_forwarding_cycle_terminates() {
        let a = Event::new("a");
        let b = Event::new("b");
        let _ab = a.forward_to(&b);
        let _ba = b.forward_to(&a);

        a.notify();
        assert_eq!(a.notify_count(), 1);
        assert_eq!(b.notify_count(), 1);
    }

    #[test]
    fn test_dead_target_is_skipped() {
        let source = Event::new("source");
        let handle = {
            let target = Event::new("target");
            source.forward_to(&target)
        };
        source.notify();
        assert_eq!(source.forward_count(), 0);
        drop(handle);
    }
}
