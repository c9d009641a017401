//! Storage Configuration
//!
//! Configuration for the store facade and its background machinery.
//!
//! - **sync_policy**: when appends reach durable storage. `Immediate`
//!   fsyncs on every append; `Batched` flushes on a timer and whenever the
//!   pending-write count reaches `batch_size`
//! - **max_segment_size / max_segment_age**: WAL rotation thresholds
//!   (default: 64 MiB, age disabled)
//! - **manifest**: in-memory for dev/tests, or a transactional handle
//! - **compaction**: scheduling and sizing for the background compactor

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vectorhouse_metadata::ManifestStore;

use crate::segment::DEFAULT_MAX_SEGMENT_SIZE;

/// When WAL appends are fsynced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Sync after every append (safest, slowest). Makes `append` and
    /// `append_sync` equivalent.
    Immediate,

    /// Sync on a timer and after every `batch_size` pending appends.
    /// An acknowledged write may be lost on crash, bounded by these knobs;
    /// recovery stays consistent either way.
    Batched {
        #[serde(with = "duration_ms")]
        interval: Duration,
        batch_size: usize,
    },
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

impl SyncPolicy {
    pub fn is_immediate(&self) -> bool {
        matches!(self, SyncPolicy::Immediate)
    }

    /// A balanced batched policy: 100 ms timer, 100-write batches.
    pub fn default_batched() -> Self {
        SyncPolicy::Batched {
            interval: Duration::from_millis(100),
            batch_size: 100,
        }
    }
}

/// Compactor scheduling and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Minimum number of sealed WAL segments before a timed run does work.
    #[serde(default = "default_min_segments")]
    pub min_segments_to_compact: usize,

    /// Upper bound on how many segments one run merges.
    #[serde(default = "default_max_segments")]
    pub max_segments_per_compaction: usize,

    /// How often the background loop looks for work.
    #[serde(default = "default_compaction_interval", with = "duration_ms")]
    pub interval: Duration,

    /// Scratch directory for in-progress merges. Defaults to
    /// `<wal_dir>/.tmp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<PathBuf>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_segments_to_compact: default_min_segments(),
            max_segments_per_compaction: default_max_segments(),
            interval: default_compaction_interval(),
            tmp_dir: None,
        }
    }
}

fn default_min_segments() -> usize {
    2
}

fn default_max_segments() -> usize {
    10
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Which manifest backend the store binds to.
#[derive(Clone)]
pub enum ManifestConfig {
    /// Process-local catalog. Not durable; recovery is file-driven anyway.
    InMemory,
    /// A transactional backend supplied by the host (e.g.
    /// `SqliteManifestStore`).
    Transactional(Arc<dyn ManifestStore>),
}

impl std::fmt::Debug for ManifestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestConfig::InMemory => f.write_str("InMemory"),
            ManifestConfig::Transactional(_) => f.write_str("Transactional(..)"),
        }
    }
}

/// Full store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base data directory.
    pub data_dir: PathBuf,

    /// WAL directory override. Defaults to `data_dir/wal`.
    pub wal_dir: Option<PathBuf>,

    pub manifest: ManifestConfig,

    pub sync_policy: SyncPolicy,

    /// Segment rotation size threshold.
    pub max_segment_size: u64,

    /// Segment rotation age threshold. `None` disables age rotation.
    pub max_segment_age: Option<Duration>,

    /// Run the background compactor.
    pub enable_compaction: bool,

    pub compaction: CompactionConfig,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            wal_dir: None,
            manifest: ManifestConfig::InMemory,
            sync_policy: SyncPolicy::Immediate,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_segment_age: None,
            enable_compaction: false,
            compaction: CompactionConfig::default(),
        }
    }

    /// The effective WAL directory.
    pub fn resolved_wal_dir(&self) -> PathBuf {
        self.wal_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wal"))
    }
}

/// Serde helper: durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::new("/data");
        assert!(config.sync_policy.is_immediate());
        assert_eq!(config.max_segment_size, DEFAULT_MAX_SEGMENT_SIZE);
        assert!(!config.enable_compaction);
        assert_eq!(config.resolved_wal_dir(), PathBuf::from("/data/wal"));
    }

    #[test]
    fn test_wal_dir_override() {
        let mut config = StoreConfig::new("/data");
        config.wal_dir = Some(PathBuf::from("/fast-disk/wal"));
        assert_eq!(config.resolved_wal_dir(), PathBuf::from("/fast-disk/wal"));
    }

    #[test]
    fn test_sync_policy_serde_roundtrip() {
        let policy = SyncPolicy::Batched {
            interval: Duration::from_millis(250),
            batch_size: 64,
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"batched\""));
        assert!(json.contains("250"));
        let back: SyncPolicy = serde_json::from_str(&json).unwrap();
        match back {
            SyncPolicy::Batched {
                interval,
                batch_size,
            } => {
                assert_eq!(interval, Duration::from_millis(250));
                assert_eq!(batch_size, 64);
            }
            _ => panic!("expected batched policy"),
        }
    }

    #[test]
    fn test_compaction_defaults() {
        let c = CompactionConfig::default();
        assert_eq!(c.min_segments_to_compact, 2);
        assert_eq!(c.max_segments_per_compaction, 10);
        assert_eq!(c.interval, Duration::from_secs(300));
        assert!(c.tmp_dir.is_none());
    }
}
