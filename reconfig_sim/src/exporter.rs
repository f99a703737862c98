//! JSON exporter for run traces.
//!
//! Exports a scenario's timeline of state and gate changes so a run can be
//! inspected, diffed against another seed, or plotted offline.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::oracle::TimelineEntry;
use crate::runner::{ScenarioMetrics, ScenarioResult};

/// Complete trace of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Simulated time when the run ended
    pub final_time_ns: u64,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,

    /// Every state and gate change, in order
    pub timeline: Vec<TimelineEntry>,
}

impl TraceExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            final_time_ns: 0,
            passed: false,
            failure_reason: None,
            metrics: ScenarioMetrics::default(),
            timeline: Vec::new(),
        }
    }

    /// Builds an export from a finished run.
    pub fn from_run(result: &ScenarioResult, timeline: Vec<TimelineEntry>) -> Self {
        let mut export = Self::new(result.scenario.name(), result.seed);
        export.extend(timeline);
        export.finalize(result);
        export
    }

    /// Adds timeline entries.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = TimelineEntry>) {
        self.timeline.extend(entries);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, result: &ScenarioResult) {
        self.final_time_ns = result.final_time_ns;
        self.passed = result.passed;
        self.failure_reason = result.failure_reason.clone();
        self.metrics = result.metrics.clone();
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
