//! Reconfig Deterministic Simulation Harness
//!
//! A fixed bench on which the reconfiguration engine runs under the
//! deterministic kernel from `reconfig_env`: same seed, same timeline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (virtual clock + ready queue + timers)    │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                                                             │
//! │  producer ─► input_sw ─► unitN inbox ─► worker ─► bus_sw    │
//! │                  ▲                                  │       │
//! │                  └──────────── Control ─────────────┘       │
//! │                                   │                         │
//! │                          ┌────────▼────────┐                │
//! │                          │     Oracle      │                │
//! │                          │ (state & gates) │                │
//! │                          └─────────────────┘                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use reconfig_sim::{ScenarioRunner, SimConfig};
//! use reconfig_sim::scenarios::ScenarioId;
//!
//! let config = SimConfig {
//!     num_units: 4,
//!     ..Default::default()
//! };
//!
//! let result = ScenarioRunner::new(42)
//!     .with_config(config)
//!     .run(ScenarioId::RandomWorkload);
//! assert!(result.passed);
//! ```

mod exporter;
mod oracle;
mod runner;
pub mod scenarios;
mod world;

pub use exporter::TraceExport;
pub use oracle::{Oracle, TimelineEntry, TimelineEvent};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{perform, ConfigError, DelayConfig, ProducerStats, SimConfig, SimWorld, UnitSlot};
