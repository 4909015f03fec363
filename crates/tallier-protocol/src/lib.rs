pub mod freq;
pub mod sample;

pub use freq::FrequencyCounter;
pub use sample::{Sample, SampleKind};

/// Receive buffer size for stat datagrams; anything longer is truncated
/// by the kernel.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Default UDP port for stat datagrams
pub const DEFAULT_STATS_PORT: u16 = 8125;

/// Default seconds between flushes to graphite
pub const DEFAULT_FLUSH_INTERVAL: f64 = 10.0;

/// Default capacity of the stat key frequency tracker
pub const DEFAULT_FREQUENCY_SIZE: usize = 1000;

/// Percentile reported for timer keys
pub const TIMER_PERCENTILE: u32 = 90;
