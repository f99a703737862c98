//! Reference channels.
//!
//! [`Signal<T>`] and [`Fifo<T>`] are the two channel kinds the engine's own
//! tests and the simulation harness use across switches. Both are
//! resettable components, and each interface has a fallback
//! implementation that answers the fixed "unavailable" value.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;

use async_trait::async_trait;
use reconfig_env::{Event, ReconfigContext, SharedContext, TaskId};

use crate::error::CallError;
use crate::resettable::{Registration, Resettable};
use crate::unit::ReconfigurableUnit;

/// Interfaces that have a fixed fallback implementation.
pub trait FallbackInterface {
    /// The implementation answering calls while a switch is not open.
    fn fallback() -> Rc<Self>;
}

// ============================================================================
// Signal
// ============================================================================

/// A single-writer value channel.
pub trait SignalIf<T> {
    fn read(&self) -> T;

    /// Writes a value. Fails if another task already wrote to the signal.
    fn write(&self, value: T) -> Result<(), CallError>;

    /// Notified whenever a write changes the value.
    fn value_changed_event(&self) -> Event;
}

struct SignalState<T> {
    name: String,
    ctx: SharedContext,
    value: RefCell<T>,
    initial: RefCell<Option<T>>,
    writer: Cell<Option<TaskId>>,
    changed: Event,
    writes: Cell<u64>,
}

impl<T: Clone> Resettable for SignalState<T> {
    fn capture_initial(&self) {
        *self.initial.borrow_mut() = Some(self.value.borrow().clone());
    }

    fn reset(&self) {
        let initial = self.initial.borrow().clone();
        if let Some(initial) = initial {
            *self.value.borrow_mut() = initial;
        }
    }
}

/// A value channel that enforces a single writer task.
///
/// Writes from outside any task (set-up code) are not attributed to a
/// writer.
pub struct Signal<T> {
    state: Rc<SignalState<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Signal<T> {
    pub fn new(ctx: &SharedContext, name: impl Into<String>, initial: T) -> Self {
        let name = name.into();
        Self {
            state: Rc::new(SignalState {
                changed: Event::new(format!("{name}.value_changed")),
                name,
                ctx: ctx.clone(),
                value: RefCell::new(initial),
                initial: RefCell::new(None),
                writer: Cell::new(None),
                writes: Cell::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The task recorded as the signal's writer.
    pub fn writer(&self) -> Option<TaskId> {
        self.state.writer.get()
    }

    /// Number of accepted writes.
    pub fn write_count(&self) -> u64 {
        self.state.writes.get()
    }

    /// Makes the signal a resettable component of `unit`.
    pub fn register_with(&self, unit: &ReconfigurableUnit) -> Registration {
        unit.register_resettable(&self.state)
    }

    /// Returns the signal as an interface object.
    pub fn as_interface(&self) -> Rc<dyn SignalIf<T>> {
        Rc::new(self.clone())
    }
}

impl<T: Clone + PartialEq + 'static> SignalIf<T> for Signal<T> {
    fn read(&self) -> T {
        self.state.value.borrow().clone()
    }

    fn write(&self, value: T) -> Result<(), CallError> {
        let state = &self.state;
        if let Some(task) = state.ctx.current_task() {
            match state.writer.get() {
                None => state.writer.set(Some(task)),
                Some(first) if first != task => {
                    return Err(CallError::MultipleDrivers {
                        channel: state.name.clone(),
                        first,
                        second: task,
                    });
                }
                Some(_) => {}
            }
        }
        state.writes.set(state.writes.get() + 1);
        let changed = *state.value.borrow() != value;
        if changed {
            *state.value.borrow_mut() = value;
            state.changed.notify();
        }
        Ok(())
    }

    fn value_changed_event(&self) -> Event {
        self.state.changed.clone()
    }
}

/// Signal fallback: reads the default value, refuses writes, never notifies.
pub struct SignalFallback<T> {
    never: Event,
    _marker: PhantomData<T>,
}

impl<T> Default for SignalFallback<T> {
    fn default() -> Self {
        Self {
            never: Event::new("signal_fallback.never"),
            _marker: PhantomData,
        }
    }
}

impl<T: Default> SignalIf<T> for SignalFallback<T> {
    fn read(&self) -> T {
        T::default()
    }

    fn write(&self, _value: T) -> Result<(), CallError> {
        Err(CallError::Unavailable("signal write".into()))
    }

    fn value_changed_event(&self) -> Event {
        self.never.clone()
    }
}

impl<T: Default + 'static> FallbackInterface for dyn SignalIf<T> {
    fn fallback() -> Rc<Self> {
        let fallback: Rc<dyn SignalIf<T>> = Rc::new(SignalFallback::<T>::default());
        fallback
    }
}

// ============================================================================
// FIFO
// ============================================================================

/// A bounded FIFO channel.
#[async_trait(?Send)]
pub trait FifoIf<T> {
    /// Blocking read.
    async fn read(&self) -> T;

    /// Blocking write.
    async fn write(&self, value: T);

    /// Non-blocking read. `None` if empty or unavailable.
    fn nb_read(&self) -> Option<T>;

    /// Non-blocking write. Hands the value back if full or unavailable.
    fn nb_write(&self, value: T) -> Result<(), T>;

    fn num_available(&self) -> usize;

    fn num_free(&self) -> usize;

    fn data_written_event(&self) -> Event;

    fn data_read_event(&self) -> Event;
}

struct FifoState<T> {
    name: String,
    capacity: usize,
    items: RefCell<VecDeque<T>>,
    initial: RefCell<Option<VecDeque<T>>>,
    written: Event,
    read: Event,
}

impl<T: Clone> Resettable for FifoState<T> {
    fn capture_initial(&self) {
        *self.initial.borrow_mut() = Some(self.items.borrow().clone());
    }

    fn reset(&self) {
        let initial = self.initial.borrow().clone();
        if let Some(initial) = initial {
            *self.items.borrow_mut() = initial;
            self.read.notify();
        }
    }
}

/// A bounded FIFO.
pub struct Fifo<T> {
    state: Rc<FifoState<T>>,
}

impl<T> Clone for Fifo<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Fifo<T> {
    /// Creates an empty FIFO holding at most `capacity` items (at least 1).
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        Self {
            state: Rc::new(FifoState {
                written: Event::new(format!("{name}.data_written")),
                read: Event::new(format!("{name}.data_read")),
                name,
                capacity: capacity.max(1),
                items: RefCell::new(VecDeque::new()),
                initial: RefCell::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Current contents, front first.
    pub fn snapshot(&self) -> Vec<T> {
        self.state.items.borrow().iter().cloned().collect()
    }

    /// Makes the FIFO a resettable component of `unit`.
    pub fn register_with(&self, unit: &ReconfigurableUnit) -> Registration {
        unit.register_resettable(&self.state)
    }

    /// Returns the FIFO as an interface object.
    pub fn as_interface(&self) -> Rc<dyn FifoIf<T>> {
        Rc::new(self.clone())
    }
}

#[async_trait(?Send)]
impl<T: Clone + 'static> FifoIf<T> for Fifo<T> {
    async fn read(&self) -> T {
        loop {
            if let Some(value) = self.nb_read() {
                return value;
            }
            self.state.written.wait().await;
        }
    }

    async fn write(&self, value: T) {
        let mut value = value;
        loop {
            match self.nb_write(value) {
                Ok(()) => return,
                Err(back) => value = back,
            }
            self.state.read.wait().await;
        }
    }

    fn nb_read(&self) -> Option<T> {
        let value = self.state.items.borrow_mut().pop_front();
        if value.is_some() {
            self.state.read.notify();
        }
        value
    }

    fn nb_write(&self, value: T) -> Result<(), T> {
        {
            let mut items = self.state.items.borrow_mut();
            if items.len() >= self.state.capacity {
                return Err(value);
            }
            items.push_back(value);
        }
        self.state.written.notify();
        Ok(())
    }

    fn num_available(&self) -> usize {
        self.state.items.borrow().len()
    }

    fn num_free(&self) -> usize {
        self.state.capacity - self.state.items.borrow().len()
    }

    fn data_written_event(&self) -> Event {
        self.state.written.clone()
    }

    fn data_read_event(&self) -> Event {
        self.state.read.clone()
    }
}

/// FIFO fallback: always empty and always full.
pub struct FifoFallback<T> {
    never: Event,
    _marker: PhantomData<T>,
}

impl<T> Default for FifoFallback<T> {
    fn default() -> Self {
        Self {
            never: Event::new("fifo_fallback.never"),
            _marker: PhantomData,
        }
    }
}

#[async_trait(?Send)]
impl<T: 'static> FifoIf<T> for FifoFallback<T> {
    async fn read(&self) -> T {
        futures::future::pending().await
    }

    async fn write(&self, _value: T) {
        futures::future::pending::<()>().await
    }

    fn nb_read(&self) -> Option<T> {
        None
    }

    fn nb_write(&self, value: T) -> Result<(), T> {
        Err(value)
    }

    fn num_available(&self) -> usize {
        0
    }

    fn num_free(&self) -> usize {
        0
    }

    fn data_written_event(&self) -> Event {
        self.never.clone()
    }

    fn data_read_event(&self) -> Event {
        self.never.clone()
    }
}

impl<T: 'static> FallbackInterface for dyn FifoIf<T> {
    fn fallback() -> Rc<Self> {
        let fallback: Rc<dyn FifoIf<T>> = Rc::new(FifoFallback::<T>::default());
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconfig_env::{ReconfigContext, SimContext};

    #[test]
    fn test_signal_single_writer() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let sig = Signal::new(&ctx, "sig", 0u32);

        let first = {
            let sig = sig.clone();
            sim.spawn_with_handle("first", async move { sig.write(1) })
        };
        sim.run();
        assert_eq!(first.take(), Some(Ok(())));
        assert_eq!(sig.writer(), Some(first.id()));

        let second = {
            let sig = sig.clone();
            sim.spawn_with_handle("second", async move { sig.write(2) })
        };
        let second_id = second.id();
        sim.run();
        assert_eq!(
            second.take(),
            Some(Err(CallError::MultipleDrivers {
                channel: "sig".into(),
                first: first.id(),
                second: second_id,
            }))
        );
        assert_eq!(sig.read(), 1);
    }

    #[test]
    fn test_signal_notifies_only_on_change() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let sig = Signal::new(&ctx, "sig", 5u32);
        sig.write(5).unwrap();
        assert_eq!(sig.value_changed_event().notify_count(), 0);
        sig.write(6).unwrap();
        assert_eq!(sig.value_changed_event().notify_count(), 1);
        assert_eq!(sig.write_count(), 2);
        assert_eq!(sig.writer(), None);
    }

    #[test]
    fn test_signal_resets_with_unit() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let unit = ReconfigurableUnit::new("u");
        let sig = Signal::new(&ctx, "sig", 3u32);
        let _reg = sig.register_with(&unit);

        unit.reset_components();
        sig.write(8).unwrap();
        unit.reset_components();
        assert_eq!(sig.read(), 3);
    }

    #[test]
    fn test_signal_fallback_answers_default() {
        let fb = <dyn SignalIf<u32> as FallbackInterface>::fallback();
        assert_eq!(fb.read(), 0);
        assert_eq!(fb.write(4), Err(CallError::Unavailable("signal write".into())));
        assert_eq!(fb.read(), 0);
    }

    #[test]
    fn test_fifo_blocking_read_waits_for_write() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let fifo = Fifo::new("f", 2);

        let reader = {
            let fifo = fifo.clone();
            let ctx = ctx.clone();
            sim.spawn_with_handle("reader", async move {
                let v = fifo.read().await;
                (v, ctx.now())
            })
        };
        {
            let fifo = fifo.clone();
            let ctx = ctx.clone();
            sim.spawn("writer", Box::pin(async move {
                ctx.sleep(std::time::Duration::from_nanos(5)).await;
                fifo.write(42u8).await;
            }));
        }
        sim.run();
        assert_eq!(reader.take(), Some((42, std::time::Duration::from_nanos(5))));
    }

    #[test]
    fn test_fifo_capacity() {
        let fifo = Fifo::new("f", 2);
        assert_eq!(fifo.nb_write(1), Ok(()));
        assert_eq!(fifo.nb_write(2), Ok(()));
        assert_eq!(fifo.nb_write(3), Err(3));
        assert_eq!(fifo.num_available(), 2);
        assert_eq!(fifo.num_free(), 0);
        assert_eq!(fifo.nb_read(), Some(1));
        assert_eq!(fifo.snapshot(), vec![2]);
    }

    #[test]
    fn test_fifo_blocking_write_waits_for_space() {
        let sim = SimContext::new(1);
        let ctx = sim.handle();
        let fifo = Fifo::new("f", 1);
        fifo.nb_write(1u8).unwrap();

        let writer = {
            let fifo = fifo.clone();
            let ctx = ctx.clone();
            sim.spawn_with_handle("writer", async move {
                fifo.write(2).await;
                ctx.now()
            })
        };
        {
            let fifo = fifo.clone();
            let ctx = ctx.clone();
            sim.spawn("drain", Box::pin(async move {
                ctx.sleep(std::time::Duration::from_nanos(3)).await;
                fifo.nb_read();
            }));
        }
        sim.run();
        assert_eq!(writer.take(), Some(std::time::Duration::from_nanos(3)));
        assert_eq!(fifo.snapshot(), vec![2]);
    }

    #[test]
    fn test_fifo_fallback_is_unavailable() {
        let fb = <dyn FifoIf<u8> as FallbackInterface>::fallback();
        assert_eq!(fb.nb_read(), None);
        assert_eq!(fb.nb_write(1), Err(1));
        assert_eq!(fb.num_free(), 0);
    }

    #[test]
    fn test_fifo_resets_to_captured_contents() {
        let unit = ReconfigurableUnit::new("u");
        let fifo = Fifo::new("f", 4);
        let _reg = fifo.register_with(&unit);
        unit.reset_components();
        fifo.nb_write(7u8).unwrap();
        unit.reset_components();
        assert_eq!(fifo.num_available(), 0);
    }
}
