/// Per-listener accumulation state for one flush interval.

use std::collections::HashMap;

use tallier_protocol::{Sample, SampleKind};

/// Counter keys under this prefix carry exact per-key observation counts
/// and feed the master's frequency tracker.
pub const KEY_COUNT_PREFIX: &str = "tallier._key_counts.";

/// One worker's accumulated stats between two flushes: counter sums and
/// raw timer observations in arrival order.
#[derive(Debug, Default)]
pub struct AccumulationBundle {
    pub counters: HashMap<String, f64>,
    pub timers: HashMap<String, Vec<f64>>,
}

impl AccumulationBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one sample in. Counters are scaled by the client sample
    /// rate; timers keep the raw value. Every sample also bumps the
    /// exact observation count for its key.
    pub fn accumulate(&mut self, sample: &Sample) {
        match sample.kind {
            SampleKind::Counter => {
                *self.counters.entry(sample.key.clone()).or_insert(0.0) +=
                    sample.value / sample.sample_rate;
            }
            SampleKind::Timer => {
                self.timers
                    .entry(sample.key.clone())
                    .or_default()
                    .push(sample.value);
            }
        }
        *self
            .counters
            .entry(format!("{KEY_COUNT_PREFIX}{}", sample.key))
            .or_insert(0.0) += 1.0;
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.timers.is_empty()
    }
}
