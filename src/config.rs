use serde::Deserialize;

/// Store configuration
///
/// `buffer_rollover_size` is a target, not a hard limit: the actual
/// threshold is re-drawn with ±25% jitter for every new head buffer so
/// that many stores sharing a host do not seal and convert in lockstep.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Target head-buffer log size in bytes before rollover
    pub buffer_rollover_size: u64,
    /// Per-compaction cap on the number of candidate segments
    pub max_compact_segments: usize,
    /// Target byte size of a shared segment block
    pub segment_block_size: u64,
    /// Fsync the buffer log on every write batch
    pub fsync_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            buffer_rollover_size: 1024 * 1024, // 1MB
            max_compact_segments: 20,
            segment_block_size: 32 * 1024, // 32KB
            fsync_on_write: false,
        }
    }
}

/// Fraction of `buffer_rollover_size` the jitter may add or remove
pub const ROLLOVER_FUZZ: f64 = 0.25;

impl StoreConfig {
    /// Draw a fuzzed rollover threshold for a fresh head buffer
    pub fn fuzzed_rollover_size<R: rand::Rng>(&self, rng: &mut R) -> u64 {
        let jitter = rng.gen_range(-ROLLOVER_FUZZ..=ROLLOVER_FUZZ);
        let fuzzed = self.buffer_rollover_size as f64 * (1.0 + jitter);
        fuzzed.max(1.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.buffer_rollover_size, 1024 * 1024);
        assert_eq!(config.max_compact_segments, 20);
        assert!(!config.fsync_on_write);
    }

    #[test]
    fn test_fuzzed_rollover_within_bounds() {
        let config = StoreConfig::default();
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let size = config.fuzzed_rollover_size(&mut rng);
            assert!(size >= (config.buffer_rollover_size as f64 * 0.75) as u64);
            assert!(size <= (config.buffer_rollover_size as f64 * 1.25) as u64 + 1);
        }
    }
}
