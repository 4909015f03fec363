/// Approximate top-K tracking of stat keys.
///
/// The key space is unbounded, so only a sample biased toward the most
/// frequently seen keys is kept. The table is allowed to grow to twice
/// the configured size between cleanups; a cleanup evicts the
/// lowest-count entries.

use std::collections::HashMap;

use tracing::debug;

pub struct FrequencyCounter {
    size: usize,
    oversample_size: usize,
    total_observed: u64,
    frequencies: HashMap<String, u64>,
}

impl FrequencyCounter {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            oversample_size: size,
            total_observed: 0,
            frequencies: HashMap::new(),
        }
    }

    /// Counts a chunk of raw key observations and folds them in as one
    /// batch.
    pub fn sample<I, S>(&mut self, chunk: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut batch: HashMap<String, u64> = HashMap::new();
        for key in chunk {
            *batch.entry(key.into()).or_insert(0) += 1;
        }
        self.sample_batch(batch);
    }

    /// Folds pre-counted (key, count) pairs into the table, largest
    /// counts first, then evicts down to the allowed size.
    pub fn sample_batch<I>(&mut self, batch: I)
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut entries: Vec<(String, u64)> = batch.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, count) in entries {
            self.total_observed += count;
            *self.frequencies.entry(key).or_insert(0) += count;
        }

        let cap = self.size + self.oversample_size;
        if self.frequencies.len() > cap {
            let overrun = self.frequencies.len() - cap;
            self.cleanup(overrun);
        }
    }

    fn cleanup(&mut self, num: usize) {
        let mut entries: Vec<(String, u64)> = self
            .frequencies
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        for (key, _) in entries.into_iter().take(num) {
            self.frequencies.remove(&key);
        }
        debug!(
            removed = num,
            remaining = self.frequencies.len(),
            "evicted low-frequency stat keys"
        );
    }

    /// The `n` highest-count keys, descending.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .frequencies
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }

    /// (count still retained in the table, count ever observed) — the
    /// fraction of traffic the top-K sample still accounts for.
    pub fn coverage(&self) -> (u64, u64) {
        (self.frequencies.values().sum(), self.total_observed)
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }
}
