//! Configuration types for vbstore
//!
//! Every struct derives serde with `#[serde(default)]`, so a config file only
//! needs to name the knobs it changes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the storage engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the underlying store and the mutation log
    pub data_dir: PathBuf,
    /// Number of vbucket slots
    pub max_vbuckets: u16,
    /// Memory quota for stored entries, in bytes
    pub max_size: usize,
    /// Item pager stops ejecting below this many bytes (default 60% of `max_size`)
    pub mem_low_wat: Option<usize>,
    /// Item pager starts ejecting above this many bytes (default 75% of `max_size`)
    pub mem_high_wat: Option<usize>,
    /// Fraction of `max_size` above which mutations fail with out-of-memory
    pub mutation_mem_threshold: f64,
    /// Number of lock stripes per vbucket hash table
    pub ht_locks: usize,
    /// Items after which the open checkpoint is closed
    pub chk_max_items: usize,
    /// Entries expiring within this many seconds are not persisted
    pub expiry_window: u32,
    /// Warmup settings
    pub warmup: WarmupConfig,
    /// Flusher settings
    pub flusher: FlusherConfig,
    /// Background fetch settings
    pub bg_fetch: BgFetchConfig,
    /// Item and expiry pager settings
    pub pager: PagerConfig,
    /// Mutation log settings
    pub klog: MutationLogConfig,
    /// Abandon queued writes on shutdown
    pub force_shutdown: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./vbstore-data"),
            max_vbuckets: 1024,
            max_size: 1024 * 1024 * 1024, // 1 GB
            mem_low_wat: None,
            mem_high_wat: None,
            mutation_mem_threshold: 0.9,
            ht_locks: 47,
            chk_max_items: 500,
            expiry_window: 3,
            warmup: WarmupConfig::default(),
            flusher: FlusherConfig::default(),
            bg_fetch: BgFetchConfig::default(),
            pager: PagerConfig::default(),
            klog: MutationLogConfig::default(),
            force_shutdown: false,
        }
    }
}

impl EngineConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            klog: MutationLogConfig {
                path: Some(data_dir.join("mutation.log")),
                ..Default::default()
            },
            data_dir,
            ..Default::default()
        }
    }

    /// Low memory watermark in bytes
    #[must_use]
    pub fn low_watermark(&self) -> usize {
        self.mem_low_wat
            .unwrap_or_else(|| fraction_of(self.max_size, 0.6))
    }

    /// High memory watermark in bytes
    #[must_use]
    pub fn high_watermark(&self) -> usize {
        self.mem_high_wat
            .unwrap_or_else(|| fraction_of(self.max_size, 0.75))
    }

    /// Memory usage above which new mutations are refused
    #[must_use]
    pub fn mutation_memory_limit(&self) -> usize {
        fraction_of(self.max_size, self.mutation_mem_threshold)
    }

    /// Reject values that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.max_vbuckets == 0 {
            return Err(Error::configuration("max_vbuckets must be positive"));
        }
        if self.ht_locks == 0 {
            return Err(Error::configuration("ht_locks must be positive"));
        }
        if !(0.0..=1.0).contains(&self.mutation_mem_threshold) {
            return Err(Error::configuration(
                "mutation_mem_threshold must be within [0, 1]",
            ));
        }
        if self.low_watermark() > self.high_watermark() {
            return Err(Error::configuration(format!(
                "mem_low_wat ({}) exceeds mem_high_wat ({})",
                self.low_watermark(),
                self.high_watermark()
            )));
        }
        if self.high_watermark() > self.max_size {
            return Err(Error::configuration("mem_high_wat exceeds max_size"));
        }
        if self.flusher.max_txn_size == 0 {
            return Err(Error::configuration("max_txn_size must be positive"));
        }
        self.klog.validate()
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fraction_of(total: usize, fraction: f64) -> usize {
    (total as f64 * fraction) as usize
}

/// Warmup configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// Load persisted data on startup; when off the store starts empty
    pub enabled: bool,
    /// Block `initialize` until warmup has finished
    pub wait_for_warmup: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_for_warmup: true,
        }
    }
}

/// Flusher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherConfig {
    /// Mutations written per underlying transaction
    pub max_txn_size: usize,
    /// Backoff between failed begin/commit attempts, in milliseconds
    pub commit_retry_backoff_ms: u64,
    /// Sleep when there is nothing to flush, in milliseconds
    pub idle_sleep_ms: u64,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            max_txn_size: 250,
            commit_retry_backoff_ms: 1000,
            idle_sleep_ms: 1000,
        }
    }
}

impl FlusherConfig {
    #[must_use]
    pub const fn commit_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.commit_retry_backoff_ms)
    }

    #[must_use]
    pub const fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

/// Background fetch configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BgFetchConfig {
    /// Batch fetches per vbucket when the underlying store supports it
    pub multi_fetch: bool,
    /// Delay before a single-key fetch runs, in seconds
    pub delay_secs: u32,
    /// Sleep when no fetches are pending, in milliseconds
    pub idle_sleep_ms: u64,
}

impl Default for BgFetchConfig {
    fn default() -> Self {
        Self {
            multi_fetch: true,
            delay_secs: 0,
            idle_sleep_ms: 1000,
        }
    }
}

/// Item pager and expiry pager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerConfig {
    /// Seconds between memory pressure checks
    pub item_pager_secs: u64,
    /// Seconds between expiry sweeps
    pub exp_pager_stime: u64,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            item_pager_secs: 5,
            exp_pager_stime: 3600,
        }
    }
}

/// Mutation log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationLogConfig {
    /// Log file; `None` disables the log
    pub path: Option<PathBuf>,
    /// Size of each log block in bytes
    pub block_size: usize,
    /// When to fsync the log
    pub sync: LogSyncMode,
    /// Compact only once the log exceeds this many bytes
    pub max_log_size: u64,
    /// Compact once logged entries exceed live entries by this factor
    pub max_entry_ratio: u64,
    /// Compact only while fewer writes than this are queued
    pub queue_cap: usize,
    /// Seconds between compaction checks
    pub compactor_sleep_secs: u64,
}

impl Default for MutationLogConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_size: 4096,
            sync: LogSyncMode::Commit2,
            max_log_size: 32 * 1024 * 1024, // 32 MB
            max_entry_ratio: 10,
            queue_cap: 1000,
            compactor_sleep_secs: 3600,
        }
    }
}

impl MutationLogConfig {
    fn validate(&self) -> Result<()> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "klog block_size must be a power of two >= 512, got {}",
                self.block_size
            )));
        }
        if self.max_entry_ratio == 0 {
            return Err(Error::configuration("klog max_entry_ratio must be positive"));
        }
        Ok(())
    }
}

/// Mutation log synchronization mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSyncMode {
    /// Never fsync (fastest, the log may lose its tail)
    Off,
    /// Fsync after the first commit marker
    Commit1,
    /// Fsync after the second commit marker
    #[default]
    Commit2,
    /// Fsync after both commit markers
    Full,
}

impl LogSyncMode {
    #[must_use]
    pub const fn sync_on_commit1(self) -> bool {
        matches!(self, Self::Commit1 | Self::Full)
    }

    #[must_use]
    pub const fn sync_on_commit2(self) -> bool {
        matches!(self, Self::Commit2 | Self::Full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.low_watermark(), 644_245_094);
        assert_eq!(config.high_watermark(), 805_306_368);
        assert!(config.klog.path.is_none());
    }

    #[test]
    fn test_with_data_dir_enables_log() {
        let config = EngineConfig::with_data_dir("/tmp/vb");
        assert_eq!(
            config.klog.path.as_deref(),
            Some(std::path::Path::new("/tmp/vb/mutation.log"))
        );
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let config = EngineConfig {
            mem_low_wat: Some(900),
            mem_high_wat: Some(100),
            max_size: 1000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_bad_block_size_rejected() {
        let mut config = EngineConfig::default();
        config.klog.block_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_deserializes() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_vbuckets": 16, "klog": {"sync": "full"}}"#).unwrap();
        assert_eq!(config.max_vbuckets, 16);
        assert_eq!(config.klog.sync, LogSyncMode::Full);
        assert_eq!(config.klog.block_size, 4096);
        assert_eq!(config.flusher.max_txn_size, 250);
    }

    #[test]
    fn test_sync_modes() {
        assert!(LogSyncMode::Full.sync_on_commit1());
        assert!(LogSyncMode::Full.sync_on_commit2());
        assert!(!LogSyncMode::Commit2.sync_on_commit1());
        assert!(!LogSyncMode::Off.sync_on_commit2());
    }
}
