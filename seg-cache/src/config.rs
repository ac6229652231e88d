//! Engine configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SegError};

/// Strategy used to pick the next segment to reclaim when the heap is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Pick a segment uniformly at random.
    Random,
    /// Oldest segment first.
    Fifo,
    /// Segment whose expiration is nearest first.
    ClosestToExpiration,
    /// Least occupied segment first.
    Utilization,
    /// Fewest hits in the previous ranking window first.
    Learned,
    /// Compact runs of segments within a TTL list instead of dropping
    /// whole segments.
    MergeFifo,
}

/// Configuration for the segment cache engine.
#[derive(Debug, Clone)]
pub struct SegConfig {
    /// Bytes per segment; must be a power of two (default: 1 MiB).
    pub segment_size: usize,
    /// Total payload bytes; rounded down to a multiple of `segment_size`
    /// (default: 64 MiB).
    pub heap_size: usize,
    /// log2 of the hash table bucket count (default: 16).
    pub hash_power: u32,
    /// Segment reclamation strategy (default: closest to expiration).
    pub eviction_policy: EvictionPolicy,
    /// Minimum run length for a merge pass (default: 4).
    pub merge_min: usize,
    /// Maximum run length for a merge pass (default: 8).
    pub merge_max: usize,
    /// Fraction of scanned bytes the merge aims to keep per source segment
    /// (default: 0.25).
    pub merge_target_ratio: f64,
    /// Destination fill fraction at which a merge run stops (default: 0.9).
    pub merge_stop_ratio: f64,
    /// Minimum segment age before it is eligible for merging (default: 20 s).
    pub segment_mature_seconds: u32,
    /// Publish CAS generation counters on lookups (default: true).
    pub use_cas: bool,
    /// Touch every page of the datapool at open (default: false).
    pub prefault: bool,
    /// Backing file for the datapool; anonymous memory when `None`.
    pub datapool_path: Option<PathBuf>,
    /// User signature stored in the datapool header.
    pub datapool_name: String,
    /// Tick interval of the background expiration worker (default: 100 ms).
    pub reap_interval: Duration,
    /// Minimum seconds between two eviction re-rankings (default: 5 s).
    pub rerank_interval_seconds: u32,
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            segment_size: 1024 * 1024,
            heap_size: 64 * 1024 * 1024,
            hash_power: 16,
            eviction_policy: EvictionPolicy::ClosestToExpiration,
            merge_min: 4,
            merge_max: 8,
            merge_target_ratio: 0.25,
            merge_stop_ratio: 0.9,
            segment_mature_seconds: 20,
            use_cas: true,
            prefault: false,
            datapool_path: None,
            datapool_name: "seg_datapool".to_string(),
            reap_interval: Duration::from_millis(100),
            rerank_interval_seconds: 5,
        }
    }
}

impl SegConfig {
    /// Number of segments the heap will hold.
    pub fn max_segments(&self) -> usize {
        self.heap_size / self.segment_size
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.segment_size.is_power_of_two() {
            return Err(SegError::InvalidConfig(format!(
                "segment_size {} is not a power of two",
                self.segment_size
            )));
        }
        // The hash index stores intra-segment offsets in 20 bits of 8-byte
        // units, and segment ids in 24 bits.
        if self.segment_size > 8 * 1024 * 1024 {
            return Err(SegError::InvalidConfig(format!(
                "segment_size {} exceeds the addressable maximum of 8 MiB",
                self.segment_size
            )));
        }
        if self.segment_size < 4096 {
            return Err(SegError::InvalidConfig(format!(
                "segment_size {} is below the minimum of 4 KiB",
                self.segment_size
            )));
        }
        if self.heap_size < self.segment_size {
            return Err(SegError::InvalidConfig(format!(
                "heap_size {} is smaller than one segment",
                self.heap_size
            )));
        }
        if self.max_segments() > (1 << 24) {
            return Err(SegError::InvalidConfig(format!(
                "{} segments exceed the addressable maximum of 2^24",
                self.max_segments()
            )));
        }
        if self.hash_power == 0 || self.hash_power > 28 {
            return Err(SegError::InvalidConfig(format!(
                "hash_power {} outside the supported range 1..=28",
                self.hash_power
            )));
        }
        if self.merge_min < 2 || self.merge_max < self.merge_min {
            return Err(SegError::InvalidConfig(format!(
                "merge run bounds {}..{} are invalid",
                self.merge_min, self.merge_max
            )));
        }
        if !(self.merge_target_ratio > 0.0 && self.merge_target_ratio <= 1.0) {
            return Err(SegError::InvalidConfig(format!(
                "merge_target_ratio {} outside (0, 1]",
                self.merge_target_ratio
            )));
        }
        if !(self.merge_stop_ratio > 0.0 && self.merge_stop_ratio <= 1.0) {
            return Err(SegError::InvalidConfig(format!(
                "merge_stop_ratio {} outside (0, 1]",
                self.merge_stop_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SegConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_segments(), 64);
    }

    #[test]
    fn test_rejects_non_power_of_two_segment() {
        let config = SegConfig {
            segment_size: 1000 * 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_segment() {
        let config = SegConfig {
            segment_size: 16 * 1024 * 1024,
            heap_size: 64 * 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_heap() {
        let config = SegConfig {
            heap_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
