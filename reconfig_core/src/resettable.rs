//! Resettable components.
//!
//! A resettable component snapshots its initial value once and is restored
//! to it on every transition of its owning unit. Components register with
//! a unit explicitly (the unit handle is passed to the constructor) and
//! stay registered for as long as the returned [`Registration`] lives.
//!
//! Components are reset in registration order. Callbacks run inside a
//! transition and must not suspend, which the synchronous signatures
//! enforce.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::unit::ReconfigurableUnit;

/// A stateful object restorable to a captured initial value.
pub trait Resettable {
    /// Snapshots the initial state. Called exactly once, right before the
    /// first reset.
    fn capture_initial(&self);

    /// Restores the captured initial state.
    fn reset(&self);
}

struct Entry {
    id: u64,
    component: Weak<dyn Resettable>,
    captured: bool,
}

/// Ordered set of components owned by one unit.
#[derive(Default)]
pub(crate) struct ResetRegistry {
    next_id: Cell<u64>,
    entries: RefCell<Vec<Entry>>,
    resets: Cell<u64>,
}

impl ResetRegistry {
    pub(crate) fn register(self: &Rc<Self>, component: Rc<dyn Resettable>) -> Registration {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push(Entry {
            id,
            component: Rc::downgrade(&component),
            captured: false,
        });
        Registration {
            registry: Rc::downgrade(self),
            id,
        }
    }

    fn unregister(&self, id: u64) {
        self.entries.borrow_mut().retain(|e| e.id != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|e| e.component.strong_count() > 0)
            .count()
    }

    /// Total number of component resets performed.
    pub(crate) fn reset_count(&self) -> u64 {
        self.resets.get()
    }

    /// Resets every live component once, capturing initial values first
    /// where that has not happened yet. Returns the number of components.
    pub(crate) fn reset_all(&self) -> usize {
        let pending: Vec<(Rc<dyn Resettable>, bool)> = {
            let mut entries = self.entries.borrow_mut();
            entries.retain(|e| e.component.strong_count() > 0);
            entries
                .iter_mut()
                .filter_map(|e| {
                    e.component.upgrade().map(|c| {
                        let first = !e.captured;
                        e.captured = true;
                        (c, first)
                    })
                })
                .collect()
        };
        for (component, first) in &pending {
            if *first {
                component.capture_initial();
            }
            component.reset();
        }
        self.resets.set(self.resets.get() + pending.len() as u64);
        pending.len()
    }
}

/// Keeps a component registered with its unit. Dropping it unregisters.
pub struct Registration {
    registry: Weak<ResetRegistry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

struct VarCell<T> {
    value: RefCell<T>,
    initial: RefCell<Option<T>>,
}

impl<T: Clone> Resettable for VarCell<T> {
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

/// A plain value that is a resettable component of a unit.
///
/// The initial value is whatever the variable holds when its unit is first
/// reset (normally the value it was created with).
pub struct ResettableVar<T> {
    cell: Rc<VarCell<T>>,
    _registration: Option<Registration>,
}

impl<T: Clone + 'static> ResettableVar<T> {
    /// Creates a variable, registered with `unit` if one is given.
    pub fn new(value: T, unit: Option<&ReconfigurableUnit>) -> Self {
        let cell = Rc::new(VarCell {
            value: RefCell::new(value),
            initial: RefCell::new(None),
        });
        let registration = unit.map(|u| u.register_resettable(&cell));
        Self {
            cell,
            _registration: registration,
        }
    }

    pub fn get(&self) -> T {
        self.cell.value.borrow().clone()
    }

    pub fn set(&self, value: T) {
        *self.cell.value.borrow_mut() = value;
    }

    /// Applies `f` to the value in place.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.cell.value.borrow_mut());
    }

    /// The captured initial value, once the first reset has happened.
    pub fn initial(&self) -> Option<T> {
        self.cell.initial.borrow().clone()
    }

    /// True if the variable is registered with a unit.
    pub fn is_registered(&self) -> bool {
        self._registration.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Component {
        captures: Cell<u32>,
        resets: Cell<u32>,
        log: Rc<RefCell<Vec<&'static str>>>,
        tag: &'static str,
    }

    impl Resettable for Component {
        fn capture_initial(&self) {
            self.captures.set(self.captures.get() + 1);
        }

        fn reset(&self) {
            self.resets.set(self.resets.get() + 1);
            self.log.borrow_mut().push(self.tag);
        }
    }

    fn component(tag: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Rc<Component> {
        Rc::new(Component {
            captures: Cell::new(0),
            resets: Cell::new(0),
            log: log.clone(),
            tag,
        })
    }

    #[test]
    fn test_capture_once_then_reset_every_time() {
        let registry = Rc::new(ResetRegistry::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let p = component("p", &log);
        let _reg = registry.register(p.clone());

        registry.reset_all();
        registry.reset_all();
        registry.reset_all();

        assert_eq!(p.captures.get(), 1);
        assert_eq!(p.resets.get(), 3);
        assert_eq!(registry.reset_count(), 3);
    }

    #[test]
    fn test_resets_follow_registration_order() {
        let registry = Rc::new(ResetRegistry::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = component("a", &log);
        let b = component("b", &log);
        let c = component("c", &log);
        let _ra = registry.register(a);
        let _rb = registry.register(b);
        let _rc = registry.register(c);

        assert_eq!(registry.reset_all(), 3);
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dropped_registration_unregisters() {
        let registry = Rc::new(ResetRegistry::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let p = component("p", &log);
        let reg = registry.register(p.clone());
        assert_eq!(registry.len(), 1);

        drop(reg);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.reset_all(), 0);
        assert_eq!(p.resets.get(), 0);
    }

    #[test]
    fn test_dropped_component_is_skipped() {
        let registry = Rc::new(ResetRegistry::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let reg = registry.register(component("gone", &log));
        assert_eq!(registry.reset_all(), 0);
        drop(reg);
    }

    #[test]
    fn test_resettable_var_restores_initial() {
        let unit = ReconfigurableUnit::new("u");
        let var = ResettableVar::new(5u32, Some(&unit));
        assert!(var.is_registered());
        assert_eq!(unit.resettable_count(), 1);

        unit.reset_components();
        assert_eq!(var.initial(), Some(5));

        var.set(9);
        var.update(|v| *v += 1);
        assert_eq!(var.get(), 10);

        unit.reset_components();
        assert_eq!(var.get(), 5);
    }

    #[test]
    fn test_unregistered_var_is_plain_value() {
        let var = ResettableVar::new(String::from("x"), None);
        assert!(!var.is_registered());
        var.set("y".into());
        assert_eq!(var.get(), "y");
        assert_eq!(var.initial(), None);
    }
}
