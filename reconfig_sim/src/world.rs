//! SimWorld - The simulation bench.
//!
//! A fixed design used by every scenario:
//!
//! ```text
//!   producer ──► [input_sw exportal] ──► unitN.inbox ──► unitN worker
//!                                                            │
//!   bus signal ◄── [bus_sw portal, driver objects] ◄────────┘
//! ```
//!
//! Each unit exports a FIFO inbox (counted by an input filter) and imports
//! the permanent `bus` signal. Its worker pops an item, processes it for a
//! while, writes the result to the bus through the non-blocking driver and
//! counts the transaction out.

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use reconfig_core::{
    AccessorSlot, Action, Control, CounterArena, DelayTable, DriverMode, Exportal, Fifo, FifoIf,
    FilterRole, PortMap, Portal, ReconfigError, ReconfigurableUnit, Registration, ResettableVar,
    SharedReplayer, Signal, SignalIf, SwitchConnector,
};
use reconfig_env::{JoinHandle, ReconfigContext, SharedContext, SimContext};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::oracle::Oracle;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-action delays in simulated nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    pub load_ns: u64,
    pub activate_ns: u64,
    pub deactivate_ns: u64,
    pub unload_ns: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            load_ns: 10,
            activate_ns: 0,
            deactivate_ns: 2,
            unload_ns: 5,
        }
    }
}

impl DelayConfig {
    pub fn table(&self) -> DelayTable {
        DelayTable::default()
            .with(Action::Load, Duration::from_nanos(self.load_ns))
            .with(Action::Activate, Duration::from_nanos(self.activate_ns))
            .with(Action::Deactivate, Duration::from_nanos(self.deactivate_ns))
            .with(Action::Unload, Duration::from_nanos(self.unload_ns))
    }
}

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of reconfigurable units sharing the switches
    pub num_units: usize,

    /// Reconfiguration delays
    pub delays: DelayConfig,

    /// Number of random control operations in a workload
    pub workload_steps: usize,

    /// Number of items the producer offers
    pub workload_items: usize,

    /// Time a worker spends on one item
    pub process_ns: u64,

    /// Capacity of each unit's inbox
    pub fifo_capacity: usize,

    /// Share one non-blocking replay task across portals
    pub shared_driver: bool,

    /// Give up after this much simulated time
    pub time_limit_ns: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_units: 3,
            delays: DelayConfig::default(),
            workload_steps: 40,
            workload_items: 60,
            process_ns: 3,
            fifo_capacity: 4,
            shared_driver: false,
            time_limit_ns: 1_000_000,
        }
    }
}

impl SimConfig {
    /// Loads a configuration from a JSON file. Missing fields keep their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_nanos(self.time_limit_ns)
    }
}

/// One unit of the bench with its unit-side endpoints.
pub struct UnitSlot {
    pub unit: ReconfigurableUnit,
    pub bus: AccessorSlot<dyn SignalIf<u32>>,
    pub inbox: Fifo<u32>,
    /// Last item taken by the worker; reset on every transition.
    pub register: Rc<ResettableVar<u32>>,
    pub processed: Rc<Cell<u64>>,
    _inbox_registration: Registration,
}

/// Producer results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub offered: u64,
    pub accepted: u64,
    pub refused: u64,
}

/// The SimWorld - container for one simulation run.
pub struct SimWorld {
    pub config: SimConfig,
    pub sim: SimContext,
    pub ctx: SharedContext,
    pub control: Control,
    pub oracle: Rc<Oracle>,
    pub bus: Signal<u32>,
    pub bus_portal: Portal<dyn SignalIf<u32>>,
    pub input: Exportal<dyn FifoIf<u32>>,
    pub arena: Rc<CounterArena>,
    pub units: Vec<UnitSlot>,
}

impl SimWorld {
    /// Builds and binds the bench. Workers are not started.
    pub fn new(config: SimConfig) -> Result<Self, ReconfigError> {
        let sim = SimContext::new(config.seed);
        let ctx = sim.handle();
        let control = Control::new(&ctx, "control");
        let oracle = Rc::new(Oracle::new());
        control.add_observer(oracle.clone());

        let mode = if config.shared_driver {
            DriverMode::Shared(SharedReplayer::new(&ctx, "shared_nb_driver"))
        } else {
            DriverMode::Dedicated
        };
        let bus = Signal::new(&ctx, "bus", 0u32);
        let bus_portal: Portal<dyn SignalIf<u32>> = Portal::with_driver_mode(&ctx, "bus_sw", mode);
        bus_portal.bind_static(bus.as_interface())?;
        let input: Exportal<dyn FifoIf<u32>> = Exportal::new("input_sw");
        let connector = SwitchConnector::new("slot")
            .portal(&bus_portal)
            .exportal(&input);

        let arena = CounterArena::new();
        let delays = config.delays.table();
        let mut units = Vec::with_capacity(config.num_units);
        for index in 0..config.num_units {
            let unit = ReconfigurableUnit::with_counter_arena(format!("unit{index}"), arena.clone());
            for action in Action::all() {
                unit.set_delay(action, delays.get(action));
            }
            control.add(&unit)?;

            let bus_slot = AccessorSlot::new();
            let inbox = Fifo::new(format!("unit{index}.inbox"), config.fifo_capacity);
            let inbox_registration = inbox.register_with(&unit);
            let register = Rc::new(ResettableVar::new(0u32, Some(&unit)));
            let ports = PortMap::new()
                .import(&bus_slot)
                .export_filtered(inbox.as_interface(), FilterRole::Input);
            connector.bind(&unit, &ports)?;

            units.push(UnitSlot {
                unit,
                bus: bus_slot,
                inbox,
                register,
                processed: Rc::new(Cell::new(0)),
                _inbox_registration: inbox_registration,
            });
        }

        Ok(Self {
            config,
            sim,
            ctx,
            control,
            oracle,
            bus,
            bus_portal,
            input,
            arena,
            units,
        })
    }

    pub fn unit(&self, index: usize) -> &ReconfigurableUnit {
        &self.units[index].unit
    }

    /// Value unit `index` writes to the bus for `item`.
    pub fn result_for(index: usize, item: u32) -> u32 {
        item.wrapping_add(1000 * (index as u32 + 1))
    }

    /// Starts one worker task per unit.
    pub fn start_workers(&self) {
        let process = Duration::from_nanos(self.config.process_ns);
        for (index, slot) in self.units.iter().enumerate() {
            let ctx = self.ctx.clone();
            let unit = slot.unit.clone();
            let bus = slot.bus.clone();
            let inbox = slot.inbox.clone();
            let register = slot.register.clone();
            let processed = slot.processed.clone();
            self.ctx.spawn(
                &format!("{}.worker", unit.name()),
                Box::pin(async move {
                    loop {
                        let item = inbox.read().await;
                        register.set(item);
                        ctx.sleep(process).await;
                        if let Some(bus) = bus.get() {
                            let value = SimWorld::result_for(index, item);
                            bus.forward_driver_nb(move |b| b.write(value));
                        }
                        processed.set(processed.get() + 1);
                        unit.transaction_counter().decrement();
                        debug!(unit = %unit.name(), item, "item processed");
                    }
                }),
            );
        }
    }

    /// Offers `items` to the input exportal, waiting `gaps[i]` before
    /// item `i`.
    pub fn spawn_producer(&self, gaps: Vec<u64>) -> JoinHandle<ProducerStats> {
        let ctx = self.ctx.clone();
        let accessor = self.input.accessor();
        self.sim.spawn_with_handle("producer", async move {
            let mut stats = ProducerStats::default();
            for (item, gap) in gaps.into_iter().enumerate() {
                ctx.sleep(Duration::from_nanos(gap)).await;
                stats.offered += 1;
                let item = item as u32;
                match accessor.transfer_nb(|inbox| inbox.nb_write(item).ok()) {
                    Some(()) => stats.accepted += 1,
                    None => stats.refused += 1,
                }
            }
            stats
        })
    }

    /// Total items processed by all workers.
    pub fn processed(&self) -> u64 {
        self.units.iter().map(|s| s.processed.get()).sum()
    }

    /// Index of the LOADED_ACTIVE unit, if any.
    pub fn active_unit(&self) -> Option<usize> {
        self.units.iter().position(|s| s.unit.is_active())
    }
}

/// Runs one control action on `unit`.
pub async fn perform(control: &Control, unit: &ReconfigurableUnit, action: Action) -> Result<(), ReconfigError> {
    match action {
        Action::Load => control.load(unit).await,
        Action::Activate => control.activate(unit).await,
        Action::Deactivate => control.deactivate(unit).await,
        Action::Unload => control.unload(unit).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconfig_core::{SwitchKind, UnitState};

    #[test]
    fn test_sim_world_creation() {
        let world = SimWorld::new(SimConfig::default()).unwrap();
        assert_eq!(world.units.len(), 3);
        assert_eq!(world.control.units().len(), 3);
        for slot in &world.units {
            assert_eq!(slot.unit.state(), UnitState::Unloaded);
            assert!(slot.bus.is_bound());
            assert_eq!(slot.unit.switches().len(), 2);
            assert_eq!(slot.unit.switches()[1].kind(), SwitchKind::Exportal);
            assert_eq!(slot.unit.delay(Action::Load), Duration::from_nanos(10));
            assert_eq!(slot.unit.resettable_count(), 2);
        }
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: SimConfig = serde_json::from_str(r#"{"seed": 7, "delays": {"load_ns": 4}}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.delays.load_ns, 4);
        assert_eq!(config.delays.unload_ns, 5);
        assert_eq!(config.num_units, 3);
    }

    #[test]
    fn test_items_flow_to_bus_while_active() {
        let world = SimWorld::new(SimConfig::default()).unwrap();
        world.start_workers();
        let (control, unit) = (world.control.clone(), world.unit(1).clone());
        world
            .sim
            .block_on(async move {
                control.load(&unit).await?;
                control.activate(&unit).await
            })
            .unwrap()
            .unwrap();

        let producer = world.spawn_producer(vec![1, 1, 1]);
        world.sim.run();
        let stats = producer.take().unwrap();
        assert_eq!(stats.accepted, 3);
        assert_eq!(world.processed(), 3);
        assert_eq!(world.bus.read(), SimWorld::result_for(1, 2));
        assert_eq!(world.unit(1).transaction_count(), 0);
        assert_eq!(world.bus.writer(), world.bus_portal.driver_stats().nb_task);
    }

    #[test]
    fn test_producer_refused_without_active_unit() {
        let world = SimWorld::new(SimConfig::default()).unwrap();
        let producer = world.spawn_producer(vec![1, 2]);
        world.sim.run();
        assert_eq!(
            producer.take(),
            Some(ProducerStats {
                offered: 2,
                accepted: 0,
                refused: 2
            })
        );
    }
}
