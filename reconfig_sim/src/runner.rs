//! Scenario runner - executes the reconfiguration conformance scenarios.

use crate::oracle::{TimelineEntry, TimelineEvent};
use crate::scenarios::ScenarioId;
use crate::world::{perform, SimConfig, SimWorld};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use reconfig_core::{Action, FifoIf, GateState, ReconfigError, ResettableVar, SignalIf, TransactionCounter, UnitState};
use reconfig_env::{JoinHandle, ReconfigContext};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Returns early with a formatted failure reason unless `$cond` holds.
macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(format!($($arg)+));
        }
    };
}

type Outcome = Result<(), String>;

fn ns(n: u64) -> Duration {
    Duration::from_nanos(n)
}

/// Results from running a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Simulated time when the run ended
    pub final_time_ns: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Unit state changes seen by the oracle
    pub transitions: usize,

    /// Gate changes seen by the oracle
    pub gate_changes: usize,

    /// Operations refused because a switch was occupied
    pub conflicts: u64,

    /// Operations rejected as invalid in the unit's state
    pub usage_errors: u64,

    /// Items offered by the producer
    pub items_offered: u64,

    /// Items taken by a unit's inbox
    pub items_accepted: u64,

    /// Items answered by the fallback
    pub items_refused: u64,

    /// Items fully processed by a worker
    pub items_processed: u64,

    /// Calls replayed by the bus portal's non-blocking driver
    pub nb_replayed: u64,

    /// Calls replayed by the bus portal's blocking driver
    pub blocking_replayed: u64,

    /// Task polls performed by the kernel
    pub kernel_polls: u64,
}

/// Tally of the control operations issued by one workload controller.
#[derive(Debug, Clone, Copy, Default)]
struct ControlTally {
    applied: u64,
    conflicts: u64,
    usage_errors: u64,
}

/// Runs conformance scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Bench configuration; its seed is replaced by the runner's
    config: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            config: SimConfig::default(),
        }
    }

    /// Sets the bench configuration.
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the reconfiguration delays.
    pub fn with_delays(mut self, delays: crate::world::DelayConfig) -> Self {
        self.config.delays = delays;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_traced(scenario).0
    }

    /// Runs a scenario and also returns the oracle's timeline.
    pub fn run_traced(&self, scenario: ScenarioId) -> (ScenarioResult, Vec<TimelineEntry>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut config = self.config.clone();
        config.seed = self.seed;
        config.num_units = config.num_units.max(2);

        let world = match SimWorld::new(config) {
            Ok(world) => world,
            Err(error) => {
                warn!("Bench setup failed: {}", error);
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    final_time_ns: 0,
                    failure_reason: Some(format!("bench setup failed: {error}")),
                    metrics: ScenarioMetrics::default(),
                };
                return (result, Vec::new());
            }
        };

        let mut metrics = ScenarioMetrics::default();
        let outcome = match scenario {
            ScenarioId::ExclusiveSwitch => self.run_exclusive_switch(&world, &mut metrics),
            ScenarioId::DrainOnDeactivate => self.run_drain_on_deactivate(&world),
            ScenarioId::ResetRoundTrip => self.run_reset_round_trip(&world),
            ScenarioId::DriverIdentity => self.run_driver_identity(&world),
            ScenarioId::ConcurrentLoadConflict => self.run_concurrent_load_conflict(&world, &mut metrics),
            ScenarioId::ExportalFallback => self.run_exportal_fallback(&world, &mut metrics),
            ScenarioId::RelayCounter => self.run_relay_counter(&world),
            ScenarioId::RandomWorkload => self.run_random_workload(&world, &mut metrics),
            ScenarioId::BlockingHandover => self.run_blocking_handover(&world),
        };
        let outcome = outcome.and_then(|()| {
            let violations = world.oracle.violations();
            if violations.is_empty() {
                Ok(())
            } else {
                Err(format!("oracle: {}", violations.join("; ")))
            }
        });

        let drivers = world.bus_portal.driver_stats();
        metrics.transitions = world.oracle.transition_count();
        metrics.gate_changes = world.oracle.gate_change_count();
        metrics.items_processed = world.processed();
        metrics.nb_replayed = drivers.nb_replayed;
        metrics.blocking_replayed = drivers.blocking_replayed;
        metrics.kernel_polls = world.sim.poll_count();

        let final_time_ns = world.ctx.now().as_nanos() as u64;
        match &outcome {
            Ok(()) => info!("✓ {} passed at t={}ns", scenario.name(), final_time_ns),
            Err(reason) => warn!("✗ {} failed at t={}ns: {}", scenario.name(), final_time_ns, reason),
        }

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            final_time_ns,
            failure_reason: outcome.err(),
            metrics,
        };
        (result, world.oracle.timeline())
    }

    /// RC-001: ExclusiveSwitch - a second unit cannot load onto a switch
    /// the first one occupies.
    fn run_exclusive_switch(&self, world: &SimWorld, metrics: &mut ScenarioMetrics) -> Outcome {
        info!("RC-001: ExclusiveSwitch - load conflict on an occupied switch");

        let (a, b) = (world.unit(0), world.unit(1));
        let delays = world.config.delays;
        let (loaded_at, active_at, refused) = settle(world, {
            let (control, a, b, ctx) = (world.control.clone(), a.clone(), b.clone(), world.ctx.clone());
            async move {
                control.load(&a).await?;
                let loaded_at = ctx.now();
                control.activate(&a).await?;
                let active_at = ctx.now();
                let refused = control.load(&b).await;
                Ok::<_, ReconfigError>((loaded_at, active_at, refused))
            }
        })?
        .map_err(|e| e.to_string())?;

        check!(
            loaded_at == ns(delays.load_ns),
            "{} loaded at {:?}, expected {}ns",
            a.name(),
            loaded_at,
            delays.load_ns
        );
        check!(
            active_at == ns(delays.load_ns + delays.activate_ns),
            "{} active at {:?}",
            a.name(),
            active_at
        );
        match refused {
            Err(ReconfigError::Conflict { switch, occupant, .. }) => {
                metrics.conflicts += 1;
                info!("  load of {} refused: '{}' held by {}", b.name(), switch, occupant);
                check!(occupant == a.name(), "conflict names {} as occupant", occupant);
            }
            other => return Err(format!("loading {} next to an active unit returned {:?}", b.name(), other)),
        }

        check!(a.is_active(), "{} is no longer active", a.name());
        check!(b.state() == UnitState::Unloaded, "{} left UNLOADED: {}", b.name(), b.state());
        for switch in a.switches() {
            check!(
                switch.gate_toward(a.id()) == GateState::Open,
                "'{}' is {} toward {}",
                switch.name(),
                switch.gate_toward(a.id()),
                a.name()
            );
            check!(switch.occupant_id() == Some(a.id()), "'{}' changed hands", switch.name());
        }
        Ok(())
    }

    /// RC-002: DrainOnDeactivate - deactivation completes only once the
    /// transaction count is back to zero.
    fn run_drain_on_deactivate(&self, world: &SimWorld) -> Outcome {
        const PENDING: u64 = 4;
        const STEP_NS: u64 = 5;
        info!("RC-002: DrainOnDeactivate - {} pending transactions", PENDING);

        let unit = world.unit(0);
        activate(world, 0)?;

        let start = world.ctx.now();
        let counter = unit.transaction_counter();
        counter.modify(PENDING as i64);

        let deactivation = world.sim.spawn_with_handle("deactivate", {
            let (control, unit, ctx) = (world.control.clone(), unit.clone(), world.ctx.clone());
            async move { control.deactivate(&unit).await.map(|()| ctx.now()) }
        });
        let drainer = world.sim.spawn_with_handle("drain", {
            let ctx = world.ctx.clone();
            async move {
                for _ in 0..PENDING {
                    ctx.sleep(ns(STEP_NS)).await;
                    counter.decrement();
                }
                ctx.now()
            }
        });

        let last = start + ns(STEP_NS * PENDING);
        world.sim.run_until(last - ns(1));
        check!(!deactivation.is_finished(), "deactivation finished with transactions pending");
        check!(unit.is_active(), "{} left LOADED_ACTIVE before draining", unit.name());
        check!(unit.is_deactivation_requested(), "deactivation request not visible");
        check!(unit.transaction_count() == 1, "count is {} one step before the end", unit.transaction_count());

        world.sim.run_until(world.config.time_limit());
        let drained_at = finished(&drainer, "drainer")?;
        let done_at = finished(&deactivation, "deactivation")?.map_err(|e| e.to_string())?;
        let expected = drained_at + ns(world.config.delays.deactivate_ns);

        check!(drained_at == last, "last decrement at {:?}, expected {:?}", drained_at, last);
        check!(done_at == expected, "deactivation returned at {:?}, expected {:?}", done_at, expected);
        check!(!unit.is_deactivation_requested(), "deactivation request left set");

        let switched_at = world.oracle.timeline().iter().rev().find_map(|entry| match &entry.event {
            TimelineEvent::Transition {
                from: UnitState::LoadedActive,
                to: UnitState::LoadedInactive,
                ..
            } => Some(entry.at_ns),
            _ => None,
        });
        check!(
            switched_at == Some(drained_at.as_nanos() as u64),
            "LOADED_INACTIVE reached at {:?}ns, expected {:?}",
            switched_at,
            drained_at
        );
        Ok(())
    }

    /// RC-003: ResetRoundTrip - a full cycle resets every component once per
    /// transition and leaves each at its initial value.
    fn run_reset_round_trip(&self, world: &SimWorld) -> Outcome {
        const EXTRA: u32 = 3;
        info!("RC-003: ResetRoundTrip - {} extra components", EXTRA);

        let unit = world.unit(0);
        let vars: Vec<Rc<ResettableVar<u32>>> = (0..EXTRA)
            .map(|i| Rc::new(ResettableVar::new(i * 10, Some(unit))))
            .collect();
        let components = unit.resettable_count() as u64;
        check!(components == EXTRA as u64 + 2, "{} components registered", components);
        let resets_before = unit.reset_count();

        settle(world, {
            let (control, unit, vars) = (world.control.clone(), unit.clone(), vars.clone());
            async move {
                for action in Action::all() {
                    if action != Action::Load {
                        vars.iter().for_each(|v| v.update(|x| *x += 1));
                    }
                    perform(&control, &unit, action).await?;
                    debug!("  {} done, reset_count={}", action.name(), unit.reset_count());
                }
                Ok::<_, ReconfigError>(())
            }
        })?
        .map_err(|e| e.to_string())?;

        let resets = unit.reset_count() - resets_before;
        check!(resets == 4 * components, "{} resets for {} components", resets, components);
        for (i, var) in vars.iter().enumerate() {
            check!(var.get() == i as u32 * 10, "component {} ended at {}", i, var.get());
        }
        check!(world.units[0].register.get() == 0, "worker register not restored");
        check!(unit.state() == UnitState::Unloaded, "{} ended {}", unit.name(), unit.state());
        Ok(())
    }

    /// RC-004: DriverIdentity - two units loaded one after the other write
    /// the bus through the same blocking driver, so the single-writer rule
    /// holds.
    fn run_driver_identity(&self, world: &SimWorld) -> Outcome {
        info!("RC-004: DriverIdentity - two units, one bus writer");

        let bus_of = |index: usize| {
            world.units[index]
                .bus
                .get()
                .ok_or_else(|| format!("{} has no bus accessor", world.unit(index).name()))
        };

        activate(world, 0)?;
        let first = world.sim.spawn_with_handle("unit0.proc", {
            let bus = bus_of(0)?;
            async move { bus.forward_driver(|b| async move { b.write(7) }).await }
        });
        world.sim.run_until(world.config.time_limit());
        finished(&first, "unit0 write")?.map_err(|e| e.to_string())?;

        settle(world, {
            let control = world.control.clone();
            let (a, b) = (world.unit(0).clone(), world.unit(1).clone());
            async move {
                control.deactivate(&a).await?;
                control.unload(&a).await?;
                control.load(&b).await?;
                control.activate(&b).await
            }
        })?
        .map_err(|e| e.to_string())?;

        let second = world.sim.spawn_with_handle("unit1.proc", {
            let bus = bus_of(1)?;
            async move {
                let driven = bus.forward_driver(|b| async move { b.write(8) }).await;
                let direct = bus.forward(|b| async move { b.write(9) }).await;
                (driven, direct)
            }
        });
        world.sim.run_until(world.config.time_limit());
        let (driven, direct) = finished(&second, "unit1 write")?;
        driven.map_err(|e| e.to_string())?;

        let stats = world.bus_portal.driver_stats();
        check!(world.bus.read() == 8, "bus holds {}", world.bus.read());
        check!(stats.blocking_task.is_some(), "blocking driver never started");
        check!(
            world.bus.writer() == stats.blocking_task,
            "bus writer {:?} is not the driver {:?}",
            world.bus.writer(),
            stats.blocking_task
        );
        check!(stats.blocking_replayed == 2, "{} replayed calls", stats.blocking_replayed);
        check!(
            matches!(direct, Err(reconfig_core::CallError::MultipleDrivers { .. })),
            "direct write bypassing the driver returned {:?}",
            direct
        );
        Ok(())
    }

    /// RC-005: ConcurrentLoadConflict - two tasks load conflicting units in
    /// the same instant; exactly one wins.
    fn run_concurrent_load_conflict(&self, world: &SimWorld, metrics: &mut ScenarioMetrics) -> Outcome {
        info!("RC-005: ConcurrentLoadConflict - racing loads");

        let order = if self.seed % 2 == 0 { [0, 1] } else { [1, 0] };
        let loaders: Vec<JoinHandle<Result<(), ReconfigError>>> = order
            .iter()
            .map(|&index| {
                let (control, unit) = (world.control.clone(), world.unit(index).clone());
                world
                    .sim
                    .spawn_with_handle(&format!("loader{index}"), async move { control.load(&unit).await })
            })
            .collect();
        world.sim.run_until(world.config.time_limit());

        let mut winners = Vec::new();
        for (handle, &index) in loaders.iter().zip(order.iter()) {
            match finished(handle, "loader")? {
                Ok(()) => winners.push(index),
                Err(error) if error.is_conflict() => {
                    metrics.conflicts += 1;
                    debug!("  {}: {}", world.unit(index).name(), error);
                }
                Err(error) => return Err(format!("unexpected load error: {error}")),
            }
        }
        check!(winners.len() == 1, "{} loads succeeded", winners.len());
        check!(metrics.conflicts == 1, "{} conflicts reported", metrics.conflicts);

        let winner = world.unit(winners[0]);
        let loser = world.unit(1 - winners[0]);
        info!("  {} won the race", winner.name());
        check!(winner.state() == UnitState::LoadedInactive, "winner is {}", winner.state());
        check!(loser.state() == UnitState::Unloaded, "loser is {}", loser.state());
        check!(!loser.is_changing(), "loser left in transition");
        for switch in winner.switches() {
            check!(switch.occupant_id() == Some(winner.id()), "'{}' not held by the winner", switch.name());
        }
        Ok(())
    }

    /// RC-006: ExportalFallback - with no active unit the permanent side
    /// gets fallback answers, and a blocking transfer resumes on activation.
    fn run_exportal_fallback(&self, world: &SimWorld, metrics: &mut ScenarioMetrics) -> Outcome {
        const ITEM: u32 = 5;
        info!("RC-006: ExportalFallback - permanent side without a unit");

        world.start_workers();
        let input = world.input.accessor();
        check!(input.forward_nb(|f| f.num_free()) == 0, "fallback reported free space");
        check!(
            input.transfer_nb(|f| f.nb_write(ITEM).ok()).is_none(),
            "write accepted with no active unit"
        );
        metrics.items_offered += 1;
        metrics.items_refused += 1;

        let blocked = world.sim.spawn_with_handle("producer", {
            let (input, ctx) = (input.clone(), world.ctx.clone());
            async move {
                input
                    .transfer_when(|f| f.nb_write(ITEM).ok(), |f| f.data_read_event())
                    .await;
                ctx.now()
            }
        });
        world.sim.run_until(ns(1));
        check!(!blocked.is_finished(), "blocking transfer finished with the exportal closed");
        metrics.items_offered += 1;

        activate(world, 0)?;
        let delivered_at = finished(&blocked, "blocking transfer")?;
        metrics.items_accepted += 1;
        let delays = world.config.delays;
        let active_at = ns(delays.load_ns + delays.activate_ns);

        check!(delivered_at == active_at, "transfer resumed at {:?}, unit active at {:?}", delivered_at, active_at);
        check!(world.processed() == 1, "{} items processed", world.processed());
        check!(
            world.bus.read() == SimWorld::result_for(0, ITEM),
            "bus holds {}",
            world.bus.read()
        );
        check!(world.unit(0).transaction_count() == 0, "count left at {}", world.unit(0).transaction_count());
        Ok(())
    }

    /// RC-007: RelayCounter - a weighted relay fans out to two units, and
    /// deactivation waits only for the active unit's share.
    fn run_relay_counter(&self, world: &SimWorld) -> Outcome {
        const STEP_NS: u64 = 5;
        info!("RC-007: RelayCounter - weights 1 and 2");

        let (a, b) = (world.unit(0), world.unit(1));
        let relay = TransactionCounter::relay(&[(&a.transaction_counter(), 1), (&b.transaction_counter(), 2)])
            .map_err(|e| e.to_string())?;
        activate(world, 0)?;

        relay.modify(2);
        check!(a.transaction_count() == 2, "{} counts {}", a.name(), a.transaction_count());
        check!(b.transaction_count() == 4, "{} counts {}", b.name(), b.transaction_count());
        check!(relay.count() == 0, "relay holds a count of its own");

        let start = world.ctx.now();
        let deactivation = world.sim.spawn_with_handle("deactivate", {
            let (control, unit, ctx) = (world.control.clone(), a.clone(), world.ctx.clone());
            async move { control.deactivate(&unit).await.map(|()| ctx.now()) }
        });
        world.sim.spawn_with_handle("feeder", {
            let (relay, ctx) = (relay.clone(), world.ctx.clone());
            async move {
                for _ in 0..2 {
                    ctx.sleep(ns(STEP_NS)).await;
                    relay.modify(-1);
                }
            }
        });
        world.sim.run_until(world.config.time_limit());

        let done_at = finished(&deactivation, "deactivation")?.map_err(|e| e.to_string())?;
        let expected = start + ns(2 * STEP_NS + world.config.delays.deactivate_ns);
        check!(done_at == expected, "deactivation returned at {:?}, expected {:?}", done_at, expected);
        check!(b.transaction_count() == 0, "{} counts {}", b.name(), b.transaction_count());

        relay.set_relay_factor_for(&b.transaction_counter(), 3);
        relay.modify(1);
        check!(b.transaction_count() == 3, "reweighted {} counts {}", b.name(), b.transaction_count());
        relay.modify(-1);
        check!(a.transaction_count() == 0 && b.transaction_count() == 0, "counts not back to zero");
        Ok(())
    }

    /// RC-008: RandomWorkload - seeded control operations from two
    /// controllers while a producer feeds the input exportal.
    fn run_random_workload(&self, world: &SimWorld, metrics: &mut ScenarioMetrics) -> Outcome {
        info!(
            "RC-008: RandomWorkload - {} steps, {} items, {} units",
            world.config.workload_steps,
            world.config.workload_items,
            world.units.len()
        );

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let unit_count = world.units.len();
        let plan: Vec<(u64, usize, Action)> = (0..world.config.workload_steps)
            .map(|_| {
                let gap = rng.gen_range(0..8);
                let unit = rng.gen_range(0..unit_count);
                let action = Action::all()[rng.gen_range(0..4)];
                (gap, unit, action)
            })
            .collect();
        let gaps: Vec<u64> = (0..world.config.workload_items)
            .map(|_| rng.gen_range(1..6))
            .collect();

        world.start_workers();
        let producer = world.spawn_producer(gaps);
        let units: Vec<_> = world.units.iter().map(|slot| slot.unit.clone()).collect();

        let controllers: Vec<JoinHandle<Result<ControlTally, ReconfigError>>> = (0..2)
            .map(|lane| {
                let steps: Vec<_> = plan.iter().skip(lane).step_by(2).copied().collect();
                let (control, units, ctx) = (world.control.clone(), units.clone(), world.ctx.clone());
                world.sim.spawn_with_handle(&format!("controller{lane}"), async move {
                    let mut tally = ControlTally::default();
                    for (gap, index, action) in steps {
                        ctx.sleep(ns(gap)).await;
                        match perform(&control, &units[index], action).await {
                            Ok(()) => tally.applied += 1,
                            Err(error) if error.is_conflict() => tally.conflicts += 1,
                            Err(ReconfigError::Usage { .. }) => tally.usage_errors += 1,
                            Err(error) => return Err(error),
                        }
                    }
                    Ok(tally)
                })
            })
            .collect();
        world.sim.run_until(world.config.time_limit());

        let mut applied = 0;
        for handle in &controllers {
            let tally = finished(handle, "controller")?.map_err(|e| e.to_string())?;
            applied += tally.applied;
            metrics.conflicts += tally.conflicts;
            metrics.usage_errors += tally.usage_errors;
        }
        debug!(
            "  {} applied, {} conflicts, {} usage errors",
            applied, metrics.conflicts, metrics.usage_errors
        );

        settle(world, {
            let (control, units) = (world.control.clone(), units.clone());
            async move {
                for unit in &units {
                    if unit.is_active() {
                        control.deactivate(unit).await?;
                    }
                    if unit.is_loaded() {
                        control.unload(unit).await?;
                    }
                }
                Ok::<_, ReconfigError>(())
            }
        })?
        .map_err(|e| e.to_string())?;

        let stats = finished(&producer, "producer")?;
        metrics.items_offered = stats.offered;
        metrics.items_accepted = stats.accepted;
        metrics.items_refused = stats.refused;

        check!(stats.offered == world.config.workload_items as u64, "{} items offered", stats.offered);
        check!(stats.accepted + stats.refused == stats.offered, "producer lost items: {:?}", stats);
        check!(
            world.processed() == stats.accepted,
            "{} accepted but {} processed",
            stats.accepted,
            world.processed()
        );
        for unit in &units {
            check!(unit.state() == UnitState::Unloaded, "{} ended {}", unit.name(), unit.state());
            check!(unit.transaction_count() == 0, "{} counts {}", unit.name(), unit.transaction_count());
        }
        check!(world.bus_portal.switch().occupant().is_none(), "bus switch still occupied");
        check!(world.input.switch().occupant().is_none(), "input switch still occupied");
        Ok(())
    }

    /// RC-009: BlockingHandover - a blocking read parked in the active
    /// unit's inbox survives a swap and is served by the next unit.
    fn run_blocking_handover(&self, world: &SimWorld) -> Outcome {
        const STALE: u32 = 7;
        const FRESH: u32 = 42;
        const ANNOUNCE_NS: u64 = 3;
        info!("RC-009: BlockingHandover - reader parked across unit0 -> unit1");

        let (old, new) = (world.unit(0), world.unit(1));
        let announcer = {
            let (ctx, inbox) = (world.ctx.clone(), world.units[1].inbox.clone());
            new.spawn_process(&world.ctx, "announcer", move || {
                let (ctx, inbox) = (ctx.clone(), inbox.clone());
                async move {
                    ctx.sleep(ns(ANNOUNCE_NS)).await;
                    if inbox.nb_write(FRESH).is_err() {
                        warn!("announcer found the inbox full");
                    }
                }
            })
        };
        activate(world, 0)?;

        let reader = world.sim.spawn_with_handle("reader", {
            let (input, ctx) = (world.input.accessor(), world.ctx.clone());
            async move {
                let value = input.forward(|inbox| async move { inbox.read().await }).await;
                (value, ctx.now())
            }
        });
        world.sim.run();
        check!(!reader.is_finished(), "reader finished with an empty inbox");
        check!(world.input.switch().in_flight() == 1, "reader not parked in the exportal");

        let swap_start = world.ctx.now();
        settle(world, {
            let (control, old, new) = (world.control.clone(), old.clone(), new.clone());
            let stale_inbox = world.units[0].inbox.clone();
            async move {
                control.deactivate(&old).await?;
                control.unload(&old).await?;
                // too late for the reader: unit0 is gone
                stale_inbox.nb_write(STALE).map_err(|_| {
                    ReconfigError::usage(old.name(), "inbox full after unload")
                })?;
                control.load(&new).await?;
                control.activate(&new).await
            }
        })?
        .map_err(|e| e.to_string())?;

        let delays = world.config.delays;
        let expected = swap_start
            + ns(delays.deactivate_ns + delays.unload_ns + delays.load_ns + delays.activate_ns + ANNOUNCE_NS);
        let (value, at) = finished(&reader, "reader")?;
        check!(value == FRESH, "reader got {} instead of {}", value, FRESH);
        check!(at == expected, "reader served at {:?}, expected {:?}", at, expected);
        check!(
            world.units[0].inbox.snapshot() == vec![STALE],
            "stale inbox holds {:?}",
            world.units[0].inbox.snapshot()
        );
        check!(old.state() == UnitState::Unloaded, "{} is {}", old.name(), old.state());
        check!(announcer.start_count() == 1, "announcer started {} times", announcer.start_count());
        check!(!announcer.is_running(), "announcer still running");
        check!(world.input.switch().in_flight() == 0, "exportal still has calls in flight");
        Ok(())
    }
}

/// Runs `future` to completion on the bench kernel within the time limit.
fn settle<T, F>(world: &SimWorld, future: F) -> Result<T, String>
where
    T: 'static,
    F: Future<Output = T> + 'static,
{
    world
        .sim
        .block_on_until(future, world.config.time_limit())
        .map_err(|e| e.to_string())
}

/// Loads and activates unit `index`.
fn activate(world: &SimWorld, index: usize) -> Outcome {
    let (control, unit) = (world.control.clone(), world.unit(index).clone());
    settle(world, async move {
        control.load(&unit).await?;
        control.activate(&unit).await
    })?
    .map_err(|e| e.to_string())
}

fn finished<T>(handle: &JoinHandle<T>, what: &str) -> Result<T, String> {
    handle.take().ok_or_else(|| format!("{what} did not finish"))
}
