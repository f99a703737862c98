//! Transaction filters.
//!
//! A filter sits on a unit-side connection point and counts data transfers
//! into the unit's transaction counter:
//!
//! - an **input** filter guards transfers that hand the unit new work. A
//!   transfer may only start when the unit can take new transactions (see
//!   [`ReconfigurableUnit::blocks_new_transactions`]); once it happened, the
//!   counter goes up.
//! - an **output** filter counts a transfer that completes work, so the
//!   counter goes down.
//!
//! Deactivation waits for the counter to reach zero, so no data item is
//! left half-processed across a reconfiguration.

use crate::counter::TransactionCounter;
use crate::unit::{ReconfigurableUnit, WeakUnit};

/// Direction of a filtered transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRole {
    Input,
    Output,
}

/// Counts transfers through an accessor.
#[derive(Clone)]
pub struct TransactionFilter {
    role: FilterRole,
    unit: WeakUnit,
    counter: TransactionCounter,
    weight: i64,
}

impl TransactionFilter {
    /// Input filter on `unit`'s root counter.
    pub fn input(unit: &ReconfigurableUnit) -> Self {
        Self::new(FilterRole::Input, unit)
    }

    /// Output filter on `unit`'s root counter.
    pub fn output(unit: &ReconfigurableUnit) -> Self {
        Self::new(FilterRole::Output, unit)
    }

    fn new(role: FilterRole, unit: &ReconfigurableUnit) -> Self {
        Self {
            role,
            unit: unit.downgrade(),
            counter: unit.transaction_counter(),
            weight: 1,
        }
    }

    /// Counts into `counter` instead of the unit's root counter.
    pub fn with_counter(mut self, counter: TransactionCounter) -> Self {
        self.counter = counter;
        self
    }

    /// Counts `weight` per transfer instead of one.
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn role(&self) -> FilterRole {
        self.role
    }

    pub fn counter(&self) -> &TransactionCounter {
        &self.counter
    }

    /// True if a transfer may start without waiting.
    pub fn admits(&self) -> bool {
        match self.role {
            FilterRole::Output => true,
            FilterRole::Input => self
                .unit
                .upgrade()
                .map_or(true, |u| !u.blocks_new_transactions()),
        }
    }

    /// Suspends until a transfer may start.
    pub async fn before_transfer(&self) {
        if self.role == FilterRole::Input {
            if let Some(unit) = self.unit.upgrade() {
                unit.possible_deactivation().await;
            }
        }
    }

    /// Accounts for one completed transfer.
    pub fn after_transfer(&self) {
        match self.role {
            FilterRole::Input => self.counter.modify(self.weight),
            FilterRole::Output => self.counter.modify(-self.weight),
        }
    }
}

impl std::fmt::Debug for TransactionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionFilter")
            .field("role", &self.role)
            .field("weight", &self.weight)
            .finish()
    }
}
