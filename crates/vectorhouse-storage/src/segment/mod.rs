//! Segment Files
//!
//! A segment is an append-only file holding a sequence of WAL records in
//! strictly increasing LSN order. Two filename namespaces share the WAL
//! directory:
//!
//! - `wal_NNNNNNNNNNNN.seg`: written live by the WAL writer
//! - `cmp_NNNNNNNNNNNN.seg`: produced by the compactor
//!
//! The namespaces carry independent id counters. Keeping them apart
//! matters: if compacted ids could advance the writer's allocator, a
//! freshly compacted segment would collide with the next rotation.
//!
//! Submodules: [`writer`] appends records with a rolling checksum,
//! [`reader`] streams them back with full validation.

pub mod reader;
pub mod writer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use vectorhouse_core::Error as CoreError;

use crate::error::{Error, Result};

/// Default max segment size before rotation (64 MiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

const WAL_PREFIX: &str = "wal_";
const CMP_PREFIX: &str = "cmp_";
const SEGMENT_SUFFIX: &str = ".seg";

/// Filename for a live WAL segment.
pub fn wal_filename(segment_id: u64) -> String {
    format!("{WAL_PREFIX}{segment_id:012}{SEGMENT_SUFFIX}")
}

/// Filename for a compacted segment.
pub fn cmp_filename(segment_id: u64) -> String {
    format!("{CMP_PREFIX}{segment_id:012}{SEGMENT_SUFFIX}")
}

/// Extract the numeric segment id from either namespace.
pub fn parse_segment_id(path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| bad_name(path))?;

    let digits = name
        .strip_prefix(WAL_PREFIX)
        .or_else(|| name.strip_prefix(CMP_PREFIX))
        .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        .ok_or_else(|| bad_name(path))?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad_name(path));
    }
    digits.parse::<u64>().map_err(|_| bad_name(path))
}

fn bad_name(path: &Path) -> Error {
    Error::Record(CoreError::BadSegmentName(path.display().to_string()))
}

fn is_segment_name(name: &str) -> bool {
    (name.starts_with(WAL_PREFIX) || name.starts_with(CMP_PREFIX))
        && name.ends_with(SEGMENT_SUFFIX)
}

/// All segment files (both namespaces) in a directory, sorted by numeric
/// id ascending. A missing directory yields an empty list.
pub async fn list_all_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    list_segments(dir, |_| true).await
}

/// WAL segment files only, sorted by numeric id ascending.
pub async fn list_wal_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    list_segments(dir, |name| name.starts_with(WAL_PREFIX)).await
}

async fn list_segments(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, e)),
    };

    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(dir, e))? {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_segment_name(name) && keep(name) {
            segments.push(path);
        }
    }

    segments.sort_by_key(|p| (parse_segment_id(p).unwrap_or(u64::MAX), p.clone()));
    Ok(segments)
}

/// The highest-id WAL segment in a directory, ignoring compacted
/// segments so their ids never advance the writer's allocator.
pub async fn find_latest_wal_segment(dir: &Path) -> Result<Option<(PathBuf, u64)>> {
    let segments = list_wal_segments(dir).await?;
    match segments.last() {
        Some(path) => {
            let id = parse_segment_id(path)?;
            Ok(Some((path.clone(), id)))
        }
        None => Ok(None),
    }
}

/// Rotation policy: rotate when the segment is at least `max_size` bytes,
/// or at least `max_age` old when an age bound is set.
pub fn should_rotate(
    size_bytes: u64,
    age: Duration,
    max_size: u64,
    max_age: Option<Duration>,
) -> bool {
    if size_bytes >= max_size {
        return true;
    }
    match max_age {
        Some(max_age) if !max_age.is_zero() => age >= max_age,
        _ => false,
    }
}
