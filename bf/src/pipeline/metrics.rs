//! Execution metrics

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::JobState;
use crate::transform::CacheStats;

/// Timing and failure counts of one phase run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: JobState,
    /// Threshold attempt the run belonged to (0 for the first)
    pub attempt: u32,
    pub records: u64,
    pub errors: u64,
    pub warnings: u64,
    pub duration_ms: u64,
}

/// Per-execution performance figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub phases: Vec<PhaseTiming>,
    pub lookup_cache: CacheStats,
    pub reference_cache: CacheStats,
    /// Wall-clock time of the loader step, retries included
    pub loader_ms: u64,
}

impl ExecutionMetrics {
    pub fn record_phase(
        &mut self,
        phase: JobState,
        attempt: u32,
        records: u64,
        errors: u64,
        warnings: u64,
        elapsed: Duration,
    ) -> &PhaseTiming {
        self.phases.push(PhaseTiming {
            phase,
            attempt,
            records,
            errors,
            warnings,
            duration_ms: elapsed.as_millis() as u64,
        });
        &self.phases[self.phases.len() - 1]
    }

    /// Total time spent in record processing phases
    pub fn processing_ms(&self) -> u64 {
        self.phases.iter().map(|p| p.duration_ms).sum()
    }

    /// Records processed per second in the last attempt's phases
    pub fn throughput(&self) -> f64 {
        let Some(last) = self.phases.last() else {
            return 0.0;
        };
        let ms: u64 = self
            .phases
            .iter()
            .filter(|p| p.attempt == last.attempt)
            .map(|p| p.duration_ms)
            .sum();
        if ms == 0 {
            0.0
        } else {
            last.records as f64 * 1000.0 / ms as f64
        }
    }
}
