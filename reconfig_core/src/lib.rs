//! Reconfig Core - Dynamic Reconfiguration Engine
//!
//! Emulates dynamic reconfiguration inside a discrete-event simulation:
//! several interchangeable units share one set of connection points, and at
//! most one of them is present and operating at any simulated instant.
//!
//! 1. **Units & Control**: a run-time-checked state machine per unit,
//!    driven by a [`Control`] that enforces switch exclusivity and
//!    serializes overlapping operations.
//! 2. **Switches**: [`Portal`] and [`Exportal`] gate and forward calls
//!    crossing the boundary, through [`Accessor`]s and driver objects that
//!    give a shared channel one stable caller identity.
//! 3. **Reset & accounting**: resettable components are restored on every
//!    transition, unit processes restart on every activation, and
//!    transaction counters keep deactivation from cutting a data transfer
//!    in half.
//!
//! ```no_run
//! use std::time::Duration;
//! use reconfig_core::{Action, Control, Portal, ReconfigurableUnit, Signal, SignalIf};
//! use reconfig_env::SimContext;
//!
//! let sim = SimContext::new(0);
//! let ctx = sim.handle();
//! let control = Control::new(&ctx, "ctrl");
//! let bus = Signal::new(&ctx, "bus", 0u32);
//! let portal: Portal<dyn SignalIf<u32>> = Portal::new(&ctx, "S");
//! portal.bind_static(bus.as_interface()).unwrap();
//!
//! let unit = ReconfigurableUnit::new("A");
//! unit.set_delay(Action::Load, Duration::from_nanos(10));
//! control.add(&unit).unwrap();
//! let port = portal.bind(&unit).unwrap();
//!
//! let result = sim.block_on(async move {
//!     control.load(&unit).await?;
//!     control.activate(&unit).await?;
//!     port.forward_driver(|bus| async move { bus.write(1) }).await?;
//!     Ok::<_, reconfig_core::ReconfigError>(())
//! });
//! assert!(matches!(result, Ok(Ok(()))));
//! ```

pub mod accessor;
pub mod binding;
pub mod channel;
pub mod control;
pub mod counter;
pub mod driver;
pub mod error;
pub mod exportal;
pub mod filter;
pub mod portal;
pub mod process;
pub mod resettable;
pub mod state;
pub mod switch;
pub mod unit;

// Re-export key types for convenience
pub use accessor::{Accessor, AccessorSlot};
pub use binding::{PortMap, SwitchConnector};
pub use channel::{FallbackInterface, Fifo, FifoFallback, FifoIf, Signal, SignalFallback, SignalIf};
pub use control::{Control, DefaultDelayPolicy, DelayPolicy, ReconfigObserver};
pub use counter::{CounterArena, CounterId, TransactionCounter};
pub use driver::{DriverMode, DriverStats, SharedReplayer};
pub use error::{CallError, ReconfigError, Result};
pub use exportal::Exportal;
pub use filter::{FilterRole, TransactionFilter};
pub use portal::Portal;
pub use process::UnitProcess;
pub use resettable::{Registration, Resettable, ResettableVar};
pub use state::{Action, DelayTable, GateState, SwitchKind, UnitId, UnitState};
pub use switch::{SwitchHandle, SwitchHooks};
pub use unit::{ReconfigurableUnit, UnitHooks};
