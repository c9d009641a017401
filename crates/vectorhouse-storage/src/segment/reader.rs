//! Segment Iterator and Checksum Helpers
//!
//! Streams validated records out of a segment file. Every step validates
//! magic bytes, the header CRC, the payload length bound and the payload
//! CRC; the first failure is terminal for the iterator. `valid_offset()`
//! reports the byte offset just past the last fully valid record: the
//! WAL writer uses exactly this scan to truncate a corrupt tail on open,
//! which is what keeps the "no partial records" invariant across crashes.
//!
//! Also provides whole-file checksum helpers (the sealed-segment catalog
//! checksum) and bulk readers used by recovery tests and the compactor.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use vectorhouse_core::record::{RecordHeader, HEADER_SIZE};
use vectorhouse_core::{Error as CoreError, Record};

use crate::error::{Error, Result};

/// Streaming reader over one segment file.
pub struct SegmentIterator {
    reader: BufReader<File>,
    path: PathBuf,
    file_len: u64,
    offset: u64,
    from_lsn: u64,
}

impl SegmentIterator {
    /// Open a segment for scanning from offset 0.
    pub async fn open(path: impl Into<PathBuf>) -> Result<SegmentIterator> {
        Self::open_from_lsn(path, 0).await
    }

    /// Open a segment, silently dropping records with `lsn < from_lsn`.
    pub async fn open_from_lsn(path: impl Into<PathBuf>, from_lsn: u64) -> Result<SegmentIterator> {
        let path = path.into();
        let file = File::open(&path).await.map_err(|e| Error::io(&path, e))?;
        let file_len = file
            .metadata()
            .await
            .map_err(|e| Error::io(&path, e))?
            .len();
        Ok(SegmentIterator {
            reader: BufReader::new(file),
            path,
            file_len,
            offset: 0,
            from_lsn,
        })
    }

    /// Advance to the next record. `Ok(None)` at clean end-of-file; any
    /// validation failure is returned with file and offset context and
    /// ends the iteration.
    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            let remaining = self.file_len - self.offset;
            if remaining == 0 {
                return Ok(None);
            }
            if remaining < HEADER_SIZE as u64 {
                return Err(self.corrupt(CoreError::Truncated {
                    needed: HEADER_SIZE,
                    available: remaining as usize,
                }));
            }

            let mut header_buf = [0u8; HEADER_SIZE];
            self.reader
                .read_exact(&mut header_buf)
                .await
                .map_err(|e| Error::io(&self.path, e))?;
            let header = RecordHeader::decode(&header_buf).map_err(|e| self.corrupt(e))?;

            let body_len = header.payload_len as usize + 4;
            if remaining < (HEADER_SIZE + body_len) as u64 {
                return Err(self.corrupt(CoreError::Truncated {
                    needed: HEADER_SIZE + body_len,
                    available: remaining as usize,
                }));
            }

            let mut body = vec![0u8; body_len];
            self.reader
                .read_exact(&mut body)
                .await
                .map_err(|e| Error::io(&self.path, e))?;

            let payload_len = header.payload_len as usize;
            let stored_crc = u32::from_le_bytes([
                body[payload_len],
                body[payload_len + 1],
                body[payload_len + 2],
                body[payload_len + 3],
            ]);
            let computed_crc = crc32fast::hash(&body[..payload_len]);
            if stored_crc != computed_crc {
                return Err(self.corrupt(CoreError::PayloadCrcMismatch {
                    expected: computed_crc,
                    actual: stored_crc,
                }));
            }

            self.offset += (HEADER_SIZE + body_len) as u64;

            if self.from_lsn > 0 && header.lsn < self.from_lsn {
                continue;
            }

            body.truncate(payload_len);
            return Ok(Some(Record {
                record_type: header.record_type,
                flags: header.flags,
                reserved: header.reserved,
                lsn: header.lsn,
                payload: Bytes::from(body),
            }));
        }
    }

    /// Byte offset just past the last fully valid record consumed so far.
    pub fn valid_offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, source: CoreError) -> Error {
        Error::CorruptRecord {
            path: self.path.clone(),
            offset: self.offset,
            source,
        }
    }
}

/// IEEE CRC32 over an entire file, as lowercase 8-char hex. This is the
/// checksum stored in the catalog for sealed segments.
pub async fn segment_checksum(path: &Path) -> Result<String> {
    let file = File::open(path).await.map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:08x}", hasher.finalize()))
}

/// Compare a segment file against an expected catalog checksum.
pub async fn verify_segment_checksum(path: &Path, expected: &str) -> Result<bool> {
    Ok(segment_checksum(path).await? == expected)
}

/// Record count and LSN range of a segment. Zeroes for an empty file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentStats {
    pub record_count: u64,
    pub min_lsn: u64,
    pub max_lsn: u64,
}

/// Scan a segment for its stats. Fails on corruption.
pub async fn segment_stats(path: &Path) -> Result<SegmentStats> {
    let mut iter = SegmentIterator::open(path).await?;
    let mut stats = SegmentStats::default();
    while let Some(record) = iter.next().await? {
        if stats.record_count == 0 {
            stats.min_lsn = record.lsn;
            stats.max_lsn = record.lsn;
        } else {
            stats.min_lsn = stats.min_lsn.min(record.lsn);
            stats.max_lsn = stats.max_lsn.max(record.lsn);
        }
        stats.record_count += 1;
    }
    Ok(stats)
}

/// Read every record in a segment. Fails on corruption.
pub async fn read_all_records(path: &Path) -> Result<Vec<Record>> {
    read_records_from_lsn(path, 0).await
}

/// Read records with `lsn >= from_lsn`. Fails on corruption.
pub async fn read_records_from_lsn(path: &Path, from_lsn: u64) -> Result<Vec<Record>> {
    let mut iter = SegmentIterator::open_from_lsn(path, from_lsn).await?;
    let mut records = Vec::new();
    while let Some(record) = iter.next().await? {
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use vectorhouse_core::RecordType;

    use super::*;
    use crate::segment::writer::SegmentWriter;

    async fn build_segment(path: &Path, lsns: &[u64]) {
        let mut writer = SegmentWriter::create(path).await.unwrap();
        for lsn in lsns {
            let rec = Record::new(
                RecordType::Insert,
                *lsn,
                Bytes::from(format!("payload-{lsn}")),
            )
            .unwrap();
            writer.write(&rec).await.unwrap();
        }
        writer.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_iterates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        build_segment(&path, &[1, 2, 3, 4, 5]).await;

        let mut iter = SegmentIterator::open(&path).await.unwrap();
        let mut lsns = Vec::new();
        while let Some(rec) = iter.next().await.unwrap() {
            lsns.push(rec.lsn);
        }
        assert_eq!(lsns, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_from_lsn_skips_older_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        build_segment(&path, &[10, 11, 12, 13]).await;

        let records = read_records_from_lsn(&path, 12).await.unwrap();
        let lsns: Vec<u64> = records.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![12, 13]);
    }

    #[tokio::test]
    async fn test_empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        tokio::fs::write(&path, b"").await.unwrap();

        let mut iter = SegmentIterator::open(&path).await.unwrap();
        assert!(iter.next().await.unwrap().is_none());
        assert_eq!(iter.valid_offset(), 0);
    }

    #[tokio::test]
    async fn test_garbage_tail_reports_valid_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        build_segment(&path, &[1, 2]).await;

        let clean_len = tokio::fs::metadata(&path).await.unwrap().len();
        let mut data = tokio::fs::read(&path).await.unwrap();
        data.extend_from_slice(b"CRASH");
        tokio::fs::write(&path, &data).await.unwrap();

        let mut iter = SegmentIterator::open(&path).await.unwrap();
        assert!(iter.next().await.unwrap().is_some());
        assert!(iter.next().await.unwrap().is_some());
        let err = iter.next().await.unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
        assert_eq!(iter.valid_offset(), clean_len);
    }

    #[tokio::test]
    async fn test_bitflip_in_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        build_segment(&path, &[1]).await;

        let mut data = tokio::fs::read(&path).await.unwrap();
        let idx = data.len() - 6; // inside the payload
        data[idx] ^= 0xff;
        tokio::fs::write(&path, &data).await.unwrap();

        let mut iter = SegmentIterator::open(&path).await.unwrap();
        let err = iter.next().await.unwrap_err();
        match err {
            Error::CorruptRecord { offset, source, .. } => {
                assert_eq!(offset, 0);
                assert!(matches!(source, CoreError::PayloadCrcMismatch { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        build_segment(&path, &[1]).await;

        let data = tokio::fs::read(&path).await.unwrap();
        tokio::fs::write(&path, &data[..data.len() - 3]).await.unwrap();

        let mut iter = SegmentIterator::open(&path).await.unwrap();
        let err = iter.next().await.unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptRecord {
                source: CoreError::Truncated { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_segment_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        build_segment(&path, &[7, 8, 9]).await;

        let stats = segment_stats(&path).await.unwrap();
        assert_eq!(stats.record_count, 3);
        assert_eq!(stats.min_lsn, 7);
        assert_eq!(stats.max_lsn, 9);
    }

    #[tokio::test]
    async fn test_verify_checksum_detects_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_000000000001.seg");
        build_segment(&path, &[1, 2, 3]).await;

        let checksum = segment_checksum(&path).await.unwrap();
        assert!(verify_segment_checksum(&path, &checksum).await.unwrap());

        let mut data = tokio::fs::read(&path).await.unwrap();
        data[0] ^= 0x01;
        tokio::fs::write(&path, &data).await.unwrap();
        assert!(!verify_segment_checksum(&path, &checksum).await.unwrap());
    }
}
