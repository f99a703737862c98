//! Transaction counters.
//!
//! Counters live in a [`CounterArena`] and are addressed by
//! [`TransactionCounter`] handles (arena + index), so relay edges are plain
//! indices and a counter can never outlive the storage it points into.
//!
//! A *leaf* counter keeps its own count and feeds the aggregate transaction
//! count of the unit it belongs to. A *relay* counter has weighted children
//! and only redistributes: `modify(n)` becomes `modify(n * weight)` on each
//! child.
//!
//! The unit aggregate only sees the non-negative part of each leaf: a leaf
//! may go negative (more completions than starts were counted through it),
//! but the aggregate never drops below zero and reaching zero wakes a
//! pending deactivation.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use reconfig_env::Event;

use crate::error::{ReconfigError, Result};

/// In-flight transaction count of one unit, as seen by `deactivate`.
pub(crate) struct Aggregate {
    count: Cell<i64>,
    zero: Event,
}

impl Aggregate {
    pub(crate) fn new(unit_name: &str) -> Self {
        Self {
            count: Cell::new(0),
            zero: Event::new(format!("{unit_name}.transactions_zero")),
        }
    }

    pub(crate) fn count(&self) -> i64 {
        self.count.get()
    }

    pub(crate) fn zero_event(&self) -> &Event {
        &self.zero
    }

    pub(crate) fn apply(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        // i64::MIN has no negation and always empties the aggregate
        let floor = amount.checked_neg().unwrap_or(i64::MAX);
        if self.count.get() > floor {
            self.count.set(self.count.get().saturating_add(amount));
        } else {
            self.reset();
        }
    }

    pub(crate) fn reset(&self) {
        self.count.set(0);
        self.zero.notify();
    }
}

/// Index of a counter inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterId(usize);

struct Node {
    count: i64,
    children: Vec<(CounterId, i64)>,
    sink: Option<Weak<Aggregate>>,
}

/// Storage for a tree of counters.
#[derive(Default)]
pub struct CounterArena {
    nodes: RefCell<Vec<Node>>,
}

impl CounterArena {
    /// Creates an empty, shareable arena.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Number of counters allocated so far.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(self: &Rc<Self>, node: Node) -> TransactionCounter {
        let mut nodes = self.nodes.borrow_mut();
        let id = CounterId(nodes.len());
        nodes.push(node);
        TransactionCounter {
            arena: self.clone(),
            id,
        }
    }

    /// Allocates a leaf counter not attached to any unit.
    pub fn leaf(self: &Rc<Self>) -> TransactionCounter {
        self.push(Node {
            count: 0,
            children: Vec::new(),
            sink: None,
        })
    }

    pub(crate) fn leaf_for(self: &Rc<Self>, aggregate: &Rc<Aggregate>) -> TransactionCounter {
        self.push(Node {
            count: 0,
            children: Vec::new(),
            sink: Some(Rc::downgrade(aggregate)),
        })
    }

    fn modify(&self, id: CounterId, amount: i64) {
        let mut sinks = Vec::new();
        {
            let mut nodes = self.nodes.borrow_mut();
            Self::modify_node(&mut nodes, id, amount, &mut sinks);
        }
        for (sink, amount) in sinks {
            if let Some(aggregate) = sink.upgrade() {
                aggregate.apply(amount);
            }
        }
    }

    fn modify_node(
        nodes: &mut [Node],
        id: CounterId,
        mut amount: i64,
        sinks: &mut Vec<(Weak<Aggregate>, i64)>,
    ) {
        if amount == 0 {
            return;
        }
        if !nodes[id.0].children.is_empty() {
            let children = nodes[id.0].children.clone();
            for (child, factor) in children {
                if factor != 0 {
                    Self::modify_node(nodes, child, amount.saturating_mul(factor), sinks);
                }
            }
            return;
        }

        let node = &mut nodes[id.0];
        let prev = node.count;
        node.count = node.count.saturating_add(amount);
        if prev >= 0 {
            if node.count < 0 {
                amount = amount.saturating_sub(node.count);
            }
        } else {
            amount = node.count.max(0);
        }
        if amount != 0 {
            if let Some(sink) = &node.sink {
                sinks.push((sink.clone(), amount));
            }
        }
    }
}

/// Handle to one counter in an arena.
#[derive(Clone)]
pub struct TransactionCounter {
    arena: Rc<CounterArena>,
    id: CounterId,
}

impl TransactionCounter {
    /// Creates a relay counter redistributing to `children` with the given
    /// weights. All children must live in the same arena.
    pub fn relay(children: &[(&TransactionCounter, i64)]) -> Result<TransactionCounter> {
        let Some((first, _)) = children.first() else {
            return Err(ReconfigError::usage(
                "transaction counter",
                "a relay counter needs at least one child",
            ));
        };
        let arena = first.arena.clone();
        if children.iter().any(|(c, _)| !Rc::ptr_eq(&c.arena, &arena)) {
            return Err(ReconfigError::usage(
                "transaction counter",
                "relay children must share one counter arena",
            ));
        }
        let edges = children.iter().map(|(c, w)| (c.id, *w)).collect();
        Ok(arena.push(Node {
            count: 0,
            children: edges,
            sink: None,
        }))
    }

    pub fn id(&self) -> CounterId {
        self.id
    }

    /// True if this counter redistributes to children.
    pub fn is_relay(&self) -> bool {
        !self.arena.nodes.borrow()[self.id.0].children.is_empty()
    }

    /// Current count. Always zero for relays.
    pub fn count(&self) -> i64 {
        self.arena.nodes.borrow()[self.id.0].count
    }

    /// Adds `amount` (which may be negative).
    pub fn modify(&self, amount: i64) {
        self.arena.modify(self.id, amount);
    }

    /// Counts one transaction in.
    pub fn increment(&self) {
        self.modify(1);
    }

    /// Counts one transaction out.
    pub fn decrement(&self) {
        self.modify(-1);
    }

    /// Brings a leaf back to zero, passing the difference on to its unit.
    /// Relays are left alone.
    pub fn reset(&self) {
        if self.is_relay() {
            return;
        }
        let count = self.count();
        if count != 0 {
            self.modify(count.saturating_neg());
        }
    }

    /// Weight of the child at `index`, or 0 when out of range.
    pub fn relay_factor(&self, index: usize) -> i64 {
        self.arena.nodes.borrow()[self.id.0]
            .children
            .get(index)
            .map(|(_, w)| *w)
            .unwrap_or(0)
    }

    /// Changes the weight of the child at `index`. Out of range is ignored.
    pub fn set_relay_factor(&self, index: usize, factor: i64) {
        if let Some(edge) = self.arena.nodes.borrow_mut()[self.id.0]
            .children
            .get_mut(index)
        {
            edge.1 = factor;
        }
    }

    /// Changes the weight of every edge to `child`.
    pub fn set_relay_factor_for(&self, child: &TransactionCounter, factor: i64) {
        let mut nodes = self.arena.nodes.borrow_mut();
        for edge in nodes[self.id.0].children.iter_mut() {
            if edge.0 == child.id {
                edge.1 = factor;
            }
        }
    }
}

impl std::fmt::Debug for TransactionCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCounter")
            .field("id", &self.id)
            .field("count", &self.count())
            .finish()
    }
}
