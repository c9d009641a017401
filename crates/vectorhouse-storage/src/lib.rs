//! VectorHouse Storage Engine
//!
//! A durable, crash-recoverable document store: every mutation is
//! appended to a write-ahead log before it touches the in-memory index,
//! the index is rebuilt from the log on restart, and a background
//! compactor folds sealed log segments down to the latest version of each
//! document.
//!
//! ## Data Flow
//!
//! ```text
//! add(doc) ──► encode payload ──► WalWriter.append ──► MemIndex.set
//!                                     │ (lsn, fsync, rotation)
//!                                     ▼
//!                       wal_000000000001.seg  wal_000000000002.seg ...
//!                                     │
//!                (sealed)             ▼
//!              Compactor ──► cmp_000000000003.seg + manifest swap
//!
//! restart ──► RecoveryManager.replay ──► MemIndex (LSN last-write-wins)
//! ```
//!
//! ## Main Components
//!
//! - [`writer::WalWriter`]: serialized append path with LSN assignment,
//!   sync policy, rotation and open-time tail repair
//! - [`segment`]: segment file naming, the validating iterator and the
//!   checksummed segment writer
//! - [`recovery::RecoveryManager`]: manifest-assisted and file-driven
//!   replay
//! - [`compactor::Compactor`]: merges sealed WAL segments, preserving
//!   tombstones, with an atomic catalog swap
//! - [`index::MemIndex`]: thread-safe map with brute-force cosine search
//! - [`store::WalStore`]: the facade binding all of the above

pub mod compactor;
pub mod config;
pub mod error;
pub mod index;
pub mod recovery;
pub mod segment;
pub mod store;
pub mod writer;

pub use compactor::Compactor;
pub use config::{CompactionConfig, ManifestConfig, StoreConfig, SyncPolicy};
pub use error::{Error, Result};
pub use index::{MemIndex, SearchResult};
pub use recovery::{RecoveryManager, RecoveryStats};
pub use store::WalStore;
pub use writer::{WalWriter, WalWriterConfig};
