//! Query execution metadata

use std::time::Duration;

/// Counters reported by the engine for one or more query executions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMetadata {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub wrote_rows: u64,
    pub wrote_bytes: u64,
    pub elapsed: Duration,
    pub memory_peak_usage: u64,
}

impl QueryMetadata {
    /// Fold another execution into this aggregate: counters add up, peak memory is the max
    pub fn merge(&mut self, other: &QueryMetadata) {
        self.rows += other.rows;
        self.bytes += other.bytes;
        self.total_rows += other.total_rows;
        self.wrote_rows += other.wrote_rows;
        self.wrote_bytes += other.wrote_bytes;
        self.elapsed += other.elapsed;
        self.memory_peak_usage = self.memory_peak_usage.max(other.memory_peak_usage);
    }
}
