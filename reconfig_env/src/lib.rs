//! Reconfig Environment Abstraction Layer
//!
//! This crate provides the host scheduler the reconfiguration engine runs
//! on, so that the same engine code works in both a **Simulation**
//! (deterministic virtual-time kernel) and **Production** (tokio `LocalSet`)
//! environment.
//!
//! # Core Concept: Cooperative Tasks and Events
//!
//! The engine only needs four things from its host:
//! - Time (`now()`, `sleep()`)
//! - Tasks (`spawn()`, `current_task()`)
//! - Events (`Event::notify()`, `Event::wait()`, `notify_after()`)
//! - A seed for reproducible runs
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use reconfig_env::{Event, ReconfigContext, SimContext};
//!
//! let sim = SimContext::new(7);
//! let ctx = sim.handle();
//! let ready = Event::new("ready");
//!
//! let waiter = {
//!     let ready = ready.clone();
//!     sim.spawn_with_handle("waiter", async move { ready.wait().await })
//! };
//! ctx.notify_after(&ready, Duration::from_nanos(3));
//! sim.run();
//! assert!(waiter.is_finished());
//! ```

mod context;
mod error;
mod event;
mod sim_impl;
mod tokio_impl;
mod types;

pub use context::{ReconfigContext, SharedContext};
pub use error::EnvError;
pub use event::{Event, EventWait, ForwardHandle};
pub use sim_impl::{JoinHandle, RunStatus, SimContext};
pub use tokio_impl::TokioContext;
pub use types::TaskId;
