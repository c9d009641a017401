//! SQLite Manifest Backend
//!
//! Persistent manifest implementation on SQLite via SQLx.
//!
//! ## Why SQLite?
//!
//! The engine is single-node with exclusive ownership of its WAL
//! directory, so an embedded database is the right weight: zero
//! configuration, ACID transactions for the compaction swap, and easy
//! migration to a server database later since the trait hides the backend.
//!
//! ## Implementation Notes
//!
//! - Uses **runtime queries** (`sqlx::query` + `.bind()`), not the
//!   compile-time `sqlx::query!` macros, so building does not require a
//!   live `DATABASE_URL`
//! - Schema is applied by `sqlx::migrate!` on open
//! - Timestamps are stored as integer milliseconds since the epoch
//! - `u64` ids and LSNs are stored as `i64` columns

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::error::{ManifestError, Result};
use crate::types::{
    NewCompactedSegment, RecoveryInfo, SegmentInfo, SegmentKind, SegmentStatus, WalState,
};
use crate::ManifestStore;

const SELECT_SEGMENT_COLUMNS: &str = "SELECT segment_kind, segment_id, filename, size_bytes, \
     record_count, min_lsn, max_lsn, status, created_at, sealed_at, checksum FROM wal_segments";

/// SQLite-backed manifest store.
pub struct SqliteManifestStore {
    pool: SqlitePool,
}

impl SqliteManifestStore {
    /// Open (or create) a manifest database at the given path.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    ///
    /// Pinned to a single connection: every `sqlite::memory:` connection
    /// is its own database, so pooling more than one would shear the data.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn from_ms(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    }

    fn segment_from_row(row: &SqliteRow) -> Result<SegmentInfo> {
        let kind_text: String = row.try_get("segment_kind")?;
        let status_text: String = row.try_get("status")?;
        let kind = SegmentKind::parse(&kind_text)
            .ok_or_else(|| ManifestError::Migration(format!("unknown segment kind {kind_text}")))?;
        let status = SegmentStatus::parse(&status_text)
            .ok_or_else(|| ManifestError::Migration(format!("unknown status {status_text}")))?;

        Ok(SegmentInfo {
            kind,
            segment_id: row.try_get::<i64, _>("segment_id")? as u64,
            filename: row.try_get("filename")?,
            size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
            record_count: row.try_get::<i64, _>("record_count")? as u64,
            min_lsn: row.try_get::<Option<i64>, _>("min_lsn")?.map(|v| v as u64),
            max_lsn: row.try_get::<Option<i64>, _>("max_lsn")?.map(|v| v as u64),
            status,
            created_at: Self::from_ms(row.try_get("created_at")?),
            sealed_at: row
                .try_get::<Option<i64>, _>("sealed_at")?
                .map(Self::from_ms),
            checksum: row.try_get("checksum")?,
        })
    }

    /// Resolve a zero-row WAL update into the precise catalog error.
    async fn wal_status_error(
        &self,
        segment_id: u64,
        expected: SegmentStatus,
    ) -> ManifestError {
        let row = sqlx::query(
            "SELECT status FROM wal_segments WHERE segment_kind = 'wal' AND segment_id = ?",
        )
        .bind(segment_id as i64)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => {
                let status_text: String = row.try_get("status").unwrap_or_default();
                match SegmentStatus::parse(&status_text) {
                    Some(actual) => ManifestError::SegmentWrongStatus {
                        kind: SegmentKind::Wal,
                        segment_id,
                        expected,
                        actual,
                    },
                    None => ManifestError::SegmentNotFound {
                        kind: SegmentKind::Wal,
                        segment_id,
                    },
                }
            }
            Ok(None) => ManifestError::SegmentNotFound {
                kind: SegmentKind::Wal,
                segment_id,
            },
            Err(e) => ManifestError::Database(e),
        }
    }

    fn map_insert_error(kind: SegmentKind, segment_id: u64, e: sqlx::Error) -> ManifestError {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return ManifestError::UniqueViolation { kind, segment_id };
            }
        }
        ManifestError::Database(e)
    }
}

#[async_trait]
impl ManifestStore for SqliteManifestStore {
    async fn create_wal(&self, segment_id: u64, filename: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO wal_segments (segment_kind, segment_id, filename, status, created_at) \
             VALUES ('wal', ?, ?, 'active', ?)",
        )
        .bind(segment_id as i64)
        .bind(filename)
        .bind(Self::now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_error(SegmentKind::Wal, segment_id, e))?;
        Ok(())
    }

    async fn create_cmp(&self, segment: NewCompactedSegment) -> Result<()> {
        let now = Self::now_ms();
        sqlx::query(
            "INSERT INTO wal_segments (segment_kind, segment_id, filename, size_bytes, \
             record_count, min_lsn, max_lsn, status, checksum, created_at, sealed_at) \
             VALUES ('cmp', ?, ?, ?, ?, ?, ?, 'sealed', ?, ?, ?)",
        )
        .bind(segment.segment_id as i64)
        .bind(&segment.filename)
        .bind(segment.size_bytes as i64)
        .bind(segment.record_count as i64)
        .bind(segment.min_lsn as i64)
        .bind(segment.max_lsn as i64)
        .bind(&segment.checksum)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_error(SegmentKind::Cmp, segment.segment_id, e))?;
        Ok(())
    }

    async fn seal_wal(&self, segment_id: u64, checksum: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE wal_segments SET status = 'sealed', sealed_at = ?, checksum = ? \
             WHERE segment_kind = 'wal' AND segment_id = ? AND status = 'active'",
        )
        .bind(Self::now_ms())
        .bind(checksum)
        .bind(segment_id as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.wal_status_error(segment_id, SegmentStatus::Active).await);
        }
        Ok(())
    }

    async fn update_wal_stats(
        &self,
        segment_id: u64,
        size_bytes: u64,
        record_count: u64,
        min_lsn: u64,
        max_lsn: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE wal_segments SET size_bytes = ?, record_count = ?, min_lsn = ?, max_lsn = ? \
             WHERE segment_kind = 'wal' AND segment_id = ?",
        )
        .bind(size_bytes as i64)
        .bind(record_count as i64)
        .bind(min_lsn as i64)
        .bind(max_lsn as i64)
        .bind(segment_id as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ManifestError::SegmentNotFound {
                kind: SegmentKind::Wal,
                segment_id,
            });
        }
        Ok(())
    }

    async fn set_wal_status(&self, segment_id: u64, status: SegmentStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE wal_segments SET status = ? WHERE segment_kind = 'wal' AND segment_id = ?",
        )
        .bind(status.as_str())
        .bind(segment_id as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ManifestError::SegmentNotFound {
                kind: SegmentKind::Wal,
                segment_id,
            });
        }
        Ok(())
    }

    async fn list_by_status(&self, status: SegmentStatus) -> Result<Vec<SegmentInfo>> {
        let rows = sqlx::query(&format!(
            "{SELECT_SEGMENT_COLUMNS} WHERE status = ? ORDER BY segment_id ASC, segment_kind ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::segment_from_row).collect()
    }

    async fn list_sealed_wal(&self) -> Result<Vec<SegmentInfo>> {
        let rows = sqlx::query(&format!(
            "{SELECT_SEGMENT_COLUMNS} WHERE segment_kind = 'wal' AND status = 'sealed' \
             ORDER BY segment_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::segment_from_row).collect()
    }

    async fn archive_wal(&self, segment_ids: &[u64]) -> Result<()> {
        if segment_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in segment_ids {
            sqlx::query(
                "UPDATE wal_segments SET status = 'archived' \
                 WHERE segment_kind = 'wal' AND segment_id = ?",
            )
            .bind(*id as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit()
            .await
            .map_err(|e| ManifestError::TransactionFailed(e.to_string()))?;
        Ok(())
    }

    async fn wal_state(&self) -> Result<WalState> {
        let row = sqlx::query(
            "SELECT current_segment_id, next_lsn, checkpoint_lsn, updated_at \
             FROM wal_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(WalState {
                current_segment_id: row.try_get::<i64, _>("current_segment_id")? as u64,
                next_lsn: row.try_get::<i64, _>("next_lsn")? as u64,
                checkpoint_lsn: row.try_get::<i64, _>("checkpoint_lsn")? as u64,
                updated_at: Self::from_ms(row.try_get("updated_at")?),
            }),
            None => Ok(WalState::initial()),
        }
    }

    async fn set_wal_state(&self, current_segment_id: u64, next_lsn: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO wal_state (id, current_segment_id, next_lsn, updated_at) \
             VALUES (1, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET current_segment_id = excluded.current_segment_id, \
             next_lsn = excluded.next_lsn, updated_at = excluded.updated_at",
        )
        .bind(current_segment_id as i64)
        .bind(next_lsn as i64)
        .bind(Self::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_checkpoint_lsn(&self, lsn: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO wal_state (id, current_segment_id, next_lsn, checkpoint_lsn, updated_at) \
             VALUES (1, 1, 1, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET checkpoint_lsn = excluded.checkpoint_lsn, \
             updated_at = excluded.updated_at",
        )
        .bind(lsn as i64)
        .bind(Self::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recovery_info(&self) -> Result<RecoveryInfo> {
        let state = self.wal_state().await?;
        let rows = sqlx::query(&format!(
            "{SELECT_SEGMENT_COLUMNS} WHERE status != 'archived' \
             ORDER BY segment_id ASC, segment_kind ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(RecoveryInfo {
            state,
            segments: rows
                .iter()
                .map(Self::segment_from_row)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    async fn commit_compaction_swap(
        &self,
        archive_wal_ids: &[u64],
        new_segment: NewCompactedSegment,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for id in archive_wal_ids {
            sqlx::query(
                "UPDATE wal_segments SET status = 'archived' \
                 WHERE segment_kind = 'wal' AND segment_id = ?",
            )
            .bind(*id as i64)
            .execute(&mut *tx)
            .await?;
        }

        let now = Self::now_ms();
        sqlx::query(
            "INSERT INTO wal_segments (segment_kind, segment_id, filename, size_bytes, \
             record_count, min_lsn, max_lsn, status, checksum, created_at, sealed_at) \
             VALUES ('cmp', ?, ?, ?, ?, ?, ?, 'sealed', ?, ?, ?)",
        )
        .bind(new_segment.segment_id as i64)
        .bind(&new_segment.filename)
        .bind(new_segment.size_bytes as i64)
        .bind(new_segment.record_count as i64)
        .bind(new_segment.min_lsn as i64)
        .bind(new_segment.max_lsn as i64)
        .bind(&new_segment.checksum)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::map_insert_error(SegmentKind::Cmp, new_segment.segment_id, e))?;

        tx.commit()
            .await
            .map_err(|e| ManifestError::TransactionFailed(e.to_string()))?;

        debug!(
            archived = archive_wal_ids.len(),
            cmp_segment_id = new_segment.segment_id,
            "compaction swap committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteManifestStore {
        SqliteManifestStore::new_in_memory().await.unwrap()
    }

    fn cmp_segment(id: u64) -> NewCompactedSegment {
        NewCompactedSegment {
            segment_id: id,
            filename: format!("/wal/cmp_{id:012}.seg"),
            size_bytes: 1024,
            record_count: 8,
            min_lsn: 1,
            max_lsn: 8,
            checksum: "cafebabe".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_seal() {
        let m = store().await;
        m.create_wal(1, "/wal/wal_000000000001.seg").await.unwrap();
        m.seal_wal(1, "00112233").await.unwrap();

        let sealed = m.list_sealed_wal().await.unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].segment_id, 1);
        assert_eq!(sealed[0].status, SegmentStatus::Sealed);
        assert_eq!(sealed[0].checksum.as_deref(), Some("00112233"));
        assert!(sealed[0].sealed_at.is_some());
    }

    #[tokio::test]
    async fn test_seal_twice_reports_wrong_status() {
        let m = store().await;
        m.create_wal(1, "a").await.unwrap();
        m.seal_wal(1, "aa").await.unwrap();
        let err = m.seal_wal(1, "bb").await.unwrap_err();
        match err {
            ManifestError::SegmentWrongStatus { actual, .. } => {
                assert_eq!(actual, SegmentStatus::Sealed)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_seal_missing_segment() {
        let m = store().await;
        let err = m.seal_wal(7, "aa").await.unwrap_err();
        assert!(matches!(err, ManifestError::SegmentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_unique_violation() {
        let m = store().await;
        m.create_wal(1, "a").await.unwrap();
        let err = m.create_wal(1, "b").await.unwrap_err();
        assert!(matches!(err, ManifestError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_same_id_across_namespaces_allowed() {
        let m = store().await;
        m.create_wal(9, "/wal/wal_000000000009.seg").await.unwrap();
        m.create_cmp(cmp_segment(9)).await.unwrap();

        let info = m.recovery_info().await.unwrap();
        assert_eq!(info.segments.len(), 2);
        // Only the WAL row is eligible as compaction input once sealed.
        assert!(m.list_sealed_wal().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_update_roundtrip() {
        let m = store().await;
        m.create_wal(2, "a").await.unwrap();
        m.update_wal_stats(2, 4096, 33, 5, 37).await.unwrap();

        let info = m.recovery_info().await.unwrap();
        let seg = &info.segments[0];
        assert_eq!(seg.size_bytes, 4096);
        assert_eq!(seg.record_count, 33);
        assert_eq!(seg.min_lsn, Some(5));
        assert_eq!(seg.max_lsn, Some(37));
    }

    #[tokio::test]
    async fn test_wal_state_defaults_then_persists() {
        let m = store().await;
        let state = m.wal_state().await.unwrap();
        assert_eq!(state.current_segment_id, 1);
        assert_eq!(state.next_lsn, 1);

        m.set_wal_state(3, 250).await.unwrap();
        m.set_checkpoint_lsn(99).await.unwrap();

        let state = m.wal_state().await.unwrap();
        assert_eq!(state.current_segment_id, 3);
        assert_eq!(state.next_lsn, 250);
        assert_eq!(state.checkpoint_lsn, 99);
    }

    #[tokio::test]
    async fn test_checkpoint_lsn_without_prior_state() {
        let m = store().await;
        m.set_checkpoint_lsn(12).await.unwrap();
        assert_eq!(m.wal_state().await.unwrap().checkpoint_lsn, 12);
    }

    #[tokio::test]
    async fn test_archive_filters_recovery_info() {
        let m = store().await;
        m.create_wal(1, "a").await.unwrap();
        m.create_wal(2, "b").await.unwrap();
        m.archive_wal(&[1]).await.unwrap();

        let info = m.recovery_info().await.unwrap();
        assert_eq!(info.segments.len(), 1);
        assert_eq!(info.segments[0].segment_id, 2);
    }

    #[tokio::test]
    async fn test_swap_commits_atomically() {
        let m = store().await;
        m.create_wal(1, "a").await.unwrap();
        m.create_wal(2, "b").await.unwrap();
        m.seal_wal(1, "c1").await.unwrap();
        m.seal_wal(2, "c2").await.unwrap();
        m.set_wal_status(1, SegmentStatus::Compacting).await.unwrap();
        m.set_wal_status(2, SegmentStatus::Compacting).await.unwrap();

        m.commit_compaction_swap(&[1, 2], cmp_segment(3)).await.unwrap();

        let archived = m.list_by_status(SegmentStatus::Archived).await.unwrap();
        assert_eq!(archived.len(), 2);
        let sealed = m.list_by_status(SegmentStatus::Sealed).await.unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].kind, SegmentKind::Cmp);
        assert_eq!(sealed[0].record_count, 8);
    }

    #[tokio::test]
    async fn test_swap_rolls_back_on_duplicate_cmp() {
        let m = store().await;
        m.create_wal(1, "a").await.unwrap();
        m.seal_wal(1, "c1").await.unwrap();
        m.create_cmp(cmp_segment(5)).await.unwrap();

        // Registering cmp id 5 again must fail and leave the input sealed.
        let err = m.commit_compaction_swap(&[1], cmp_segment(5)).await.unwrap_err();
        assert!(matches!(err, ManifestError::UniqueViolation { .. }));
        assert_eq!(m.list_sealed_wal().await.unwrap().len(), 1);
        assert!(m.list_by_status(SegmentStatus::Archived).await.unwrap().is_empty());
    }
}
