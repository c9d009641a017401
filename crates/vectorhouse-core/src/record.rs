//! WAL Record Codec
//!
//! This module implements the binary format for a single write-ahead-log
//! entry. Every mutation to the store is one record.
//!
//! ## Record Layout (little-endian)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Magic (4B)  │ Type (1B) │ Flags (1B) │ Reserved (2B)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ LSN (8B, u64) - Log Sequence Number                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ PayloadLen (4B, u32)                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ HeaderCRC32 (4B) - IEEE checksum of bytes [0, 20)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Payload (variable)                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ PayloadCRC32 (4B) - IEEE checksum of payload                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Payload Encodings
//!
//! - INSERT/UPDATE: `doc_id_len:u16 | doc_id | meta_len:u32 | meta JSON |
//!   128 × f32`: the JSON slot carries source/title/text/metadata map and
//!   an RFC-3339 `created_at`
//! - DELETE: `doc_id_len:u16 | doc_id`
//! - CHECKPOINT: `checkpoint_lsn:u64`
//!
//! Flags are reserved; this version never compresses payloads.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{Embedding, EMBEDDING_DIM};
use crate::error::{Error, Result};

/// Magic bytes identifying a WAL record ("WALR").
pub const MAGIC: u32 = 0x5741_4C52;

/// Fixed size of the record header.
pub const HEADER_SIZE: usize = 24;

/// Size of an embedding on the wire (128 × f32).
pub const EMBEDDING_BYTES: usize = EMBEDDING_DIM * 4;

/// Maximum size of an individual record payload (10 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Maximum document ID length in bytes (bounded by the u16 length prefix).
pub const MAX_DOC_ID_LEN: usize = u16::MAX as usize;

/// Reserved flag bit for payload compression. Not produced by this version.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// The kind of mutation a record carries.
///
/// Unknown type bytes decode to `Unknown` rather than failing, so readers
/// can skip records written by a newer version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Insert,
    Update,
    Delete,
    Checkpoint,
    Unknown(u8),
}

impl RecordType {
    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::Insert => 0x01,
            RecordType::Update => 0x02,
            RecordType::Delete => 0x03,
            RecordType::Checkpoint => 0x04,
            RecordType::Unknown(b) => b,
        }
    }

    pub fn from_u8(b: u8) -> Self {
        match b {
            0x01 => RecordType::Insert,
            0x02 => RecordType::Update,
            0x03 => RecordType::Delete,
            0x04 => RecordType::Checkpoint,
            other => RecordType::Unknown(other),
        }
    }

    /// True for INSERT and UPDATE records.
    pub fn is_write(self) -> bool {
        matches!(self, RecordType::Insert | RecordType::Update)
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordType::Insert => write!(f, "INSERT"),
            RecordType::Update => write!(f, "UPDATE"),
            RecordType::Delete => write!(f, "DELETE"),
            RecordType::Checkpoint => write!(f, "CHECKPOINT"),
            RecordType::Unknown(b) => write!(f, "UNKNOWN({b})"),
        }
    }
}

/// A decoded record header, used when streaming a segment so the payload
/// can be read after the header is validated.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub flags: u8,
    pub reserved: u16,
    pub lsn: u64,
    pub payload_len: u32,
}

impl RecordHeader {
    /// Parse and validate a 24-byte header: magic, header CRC and the
    /// payload length bound.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<RecordHeader> {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(Error::BadMagic {
                expected: MAGIC,
                actual: magic,
            });
        }

        let stored_crc = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let computed_crc = crc32fast::hash(&buf[..20]);
        if stored_crc != computed_crc {
            return Err(Error::HeaderCrcMismatch {
                expected: computed_crc,
                actual: stored_crc,
            });
        }

        let payload_len = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                len: payload_len as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(RecordHeader {
            record_type: RecordType::from_u8(buf[4]),
            flags: buf[5],
            reserved: u16::from_le_bytes([buf[6], buf[7]]),
            lsn: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            payload_len,
        })
    }
}

/// A WAL record: header fields plus payload. The magic and both CRCs are
/// derived at encode time, so two records with equal fields are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub record_type: RecordType,
    pub flags: u8,
    pub reserved: u16,
    pub lsn: u64,
    pub payload: Bytes,
}

impl Record {
    /// Create a record, validating the payload size bound.
    pub fn new(record_type: RecordType, lsn: u64, payload: Bytes) -> Result<Record> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Record {
            record_type,
            flags: 0,
            reserved: 0,
            lsn,
            payload,
        })
    }

    /// Total size of the encoded record in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + 4
    }

    /// Serialize the record: header (with computed header CRC), payload,
    /// trailing payload CRC.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(MAGIC);
        buf.put_u8(self.record_type.as_u8());
        buf.put_u8(self.flags);
        buf.put_u16_le(self.reserved);
        buf.put_u64_le(self.lsn);
        buf.put_u32_le(self.payload.len() as u32);
        let header_crc = crc32fast::hash(&buf[..20]);
        buf.put_u32_le(header_crc);
        buf.put_slice(&self.payload);
        buf.put_u32_le(crc32fast::hash(&self.payload));
        buf.freeze()
    }

    /// Deserialize and fully validate a record from a byte slice.
    pub fn decode(data: &[u8]) -> Result<Record> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Truncated {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }
        let mut header_buf = [0u8; HEADER_SIZE];
        header_buf.copy_from_slice(&data[..HEADER_SIZE]);
        let header = RecordHeader::decode(&header_buf)?;

        let total = HEADER_SIZE + header.payload_len as usize + 4;
        if data.len() < total {
            return Err(Error::Truncated {
                needed: total,
                available: data.len(),
            });
        }

        let payload = &data[HEADER_SIZE..HEADER_SIZE + header.payload_len as usize];
        let stored_crc = u32::from_le_bytes([
            data[total - 4],
            data[total - 3],
            data[total - 2],
            data[total - 1],
        ]);
        let computed_crc = crc32fast::hash(payload);
        if stored_crc != computed_crc {
            return Err(Error::PayloadCrcMismatch {
                expected: computed_crc,
                actual: stored_crc,
            });
        }

        Ok(Record {
            record_type: header.record_type,
            flags: header.flags,
            reserved: header.reserved,
            lsn: header.lsn,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Document metadata stored as JSON inside INSERT/UPDATE payloads.
///
/// The field set is the contract; `created_at` serializes as RFC-3339 UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMetadata {
    pub source: String,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Serialize a document payload for INSERT/UPDATE records.
pub fn encode_doc_payload(
    doc_id: &str,
    meta: &DocMetadata,
    embedding: &Embedding,
) -> Result<Bytes> {
    if doc_id.len() > MAX_DOC_ID_LEN {
        return Err(Error::BadPayload(format!(
            "doc id too long: {} > {}",
            doc_id.len(),
            MAX_DOC_ID_LEN
        )));
    }

    let meta_json =
        serde_json::to_vec(meta).map_err(|e| Error::BadPayload(format!("metadata: {e}")))?;

    let mut buf =
        BytesMut::with_capacity(2 + doc_id.len() + 4 + meta_json.len() + EMBEDDING_BYTES);
    buf.put_u16_le(doc_id.len() as u16);
    buf.put_slice(doc_id.as_bytes());
    buf.put_u32_le(meta_json.len() as u32);
    buf.put_slice(&meta_json);
    for v in embedding.as_slice() {
        buf.put_f32_le(*v);
    }
    Ok(buf.freeze())
}

/// Deserialize a document payload from an INSERT/UPDATE record.
pub fn decode_doc_payload(data: &[u8]) -> Result<(String, DocMetadata, Embedding)> {
    let (doc_id, rest) = split_doc_id(data)?;

    if rest.len() < 4 {
        return Err(Error::BadPayload(format!(
            "short metadata length: {} bytes left",
            rest.len()
        )));
    }
    let meta_len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let rest = &rest[4..];
    if rest.len() < meta_len + EMBEDDING_BYTES {
        return Err(Error::BadPayload(format!(
            "short metadata/embedding: need {}, have {}",
            meta_len + EMBEDDING_BYTES,
            rest.len()
        )));
    }

    let meta: DocMetadata = serde_json::from_slice(&rest[..meta_len])
        .map_err(|e| Error::BadPayload(format!("metadata: {e}")))?;

    let mut embedding = Embedding::zeroed();
    let vec_bytes = &rest[meta_len..meta_len + EMBEDDING_BYTES];
    for (i, chunk) in vec_bytes.chunks_exact(4).enumerate() {
        embedding.0[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    Ok((doc_id, meta, embedding))
}

/// Serialize a tombstone payload (just the document ID).
pub fn encode_delete_payload(doc_id: &str) -> Result<Bytes> {
    if doc_id.len() > MAX_DOC_ID_LEN {
        return Err(Error::BadPayload(format!(
            "doc id too long: {} > {}",
            doc_id.len(),
            MAX_DOC_ID_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(2 + doc_id.len());
    buf.put_u16_le(doc_id.len() as u16);
    buf.put_slice(doc_id.as_bytes());
    Ok(buf.freeze())
}

/// Deserialize a tombstone payload.
pub fn decode_delete_payload(data: &[u8]) -> Result<String> {
    let (doc_id, _) = split_doc_id(data)?;
    Ok(doc_id)
}

/// Serialize a checkpoint payload.
pub fn encode_checkpoint_payload(checkpoint_lsn: u64) -> Bytes {
    Bytes::copy_from_slice(&checkpoint_lsn.to_le_bytes())
}

/// Deserialize a checkpoint payload.
pub fn decode_checkpoint_payload(data: &[u8]) -> Result<u64> {
    if data.len() < 8 {
        return Err(Error::BadPayload(format!(
            "checkpoint payload too short: {}",
            data.len()
        )));
    }
    Ok(u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]))
}

/// Read the length-prefixed doc ID at the front of a payload, returning
/// the ID and the remaining bytes.
fn split_doc_id(data: &[u8]) -> Result<(String, &[u8])> {
    if data.len() < 2 {
        return Err(Error::BadPayload(format!("payload too short: {}", data.len())));
    }
    let id_len = u16::from_le_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + id_len {
        return Err(Error::BadPayload(format!(
            "short doc id: need {}, have {}",
            id_len,
            data.len() - 2
        )));
    }
    let doc_id = std::str::from_utf8(&data[2..2 + id_len])
        .map_err(|e| Error::BadPayload(format!("doc id not UTF-8: {e}")))?
        .to_string();
    Ok((doc_id, &data[2 + id_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> DocMetadata {
        let mut metadata = HashMap::new();
        metadata.insert("lang".to_string(), "en".to_string());
        DocMetadata {
            source: "unit-test".into(),
            title: "A Title".into(),
            text: "Some body text".into(),
            metadata,
            created_at: "2024-05-01T12:00:00Z".parse().unwrap(),
        }
    }

    // ---------------------------------------------------------------
    // Record round-trip
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip_all_types() {
        for rec_type in [
            RecordType::Insert,
            RecordType::Update,
            RecordType::Delete,
            RecordType::Checkpoint,
        ] {
            let rec = Record::new(rec_type, 42, Bytes::from_static(b"payload")).unwrap();
            let decoded = Record::decode(&rec.encode()).unwrap();
            assert_eq!(rec, decoded);
        }
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let rec = Record::new(RecordType::Checkpoint, 7, Bytes::new()).unwrap();
        let decoded = Record::decode(&rec.encode()).unwrap();
        assert_eq!(rec, decoded);
        assert_eq!(decoded.payload.len(), 0);
    }

    #[test]
    fn test_roundtrip_max_lsn() {
        let rec = Record::new(RecordType::Insert, u64::MAX, Bytes::from_static(b"x")).unwrap();
        assert_eq!(Record::decode(&rec.encode()).unwrap().lsn, u64::MAX);
    }

    #[test]
    fn test_encoded_len_matches() {
        let rec = Record::new(RecordType::Insert, 1, Bytes::from_static(b"abcde")).unwrap();
        assert_eq!(rec.encode().len(), rec.encoded_len());
        assert_eq!(rec.encoded_len(), HEADER_SIZE + 5 + 4);
    }

    #[test]
    fn test_unknown_type_survives_roundtrip() {
        let rec = Record::new(RecordType::Unknown(0x7f), 9, Bytes::from_static(b"z")).unwrap();
        let decoded = Record::decode(&rec.encode()).unwrap();
        assert_eq!(decoded.record_type, RecordType::Unknown(0x7f));
    }

    // ---------------------------------------------------------------
    // Validation failures
    // ---------------------------------------------------------------

    #[test]
    fn test_payload_too_large_rejected() {
        let big = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let err = Record::new(RecordType::Insert, 1, big).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_decode_short_buffer_truncated() {
        let err = Record::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn test_decode_bad_magic() {
        let rec = Record::new(RecordType::Insert, 1, Bytes::from_static(b"p")).unwrap();
        let mut data = rec.encode().to_vec();
        data[0] ^= 0xff;
        let err = Record::decode(&data).unwrap_err();
        assert!(matches!(err, Error::BadMagic { .. }));
    }

    #[test]
    fn test_decode_header_bitflip_detected() {
        let rec = Record::new(RecordType::Insert, 123, Bytes::from_static(b"p")).unwrap();
        let mut data = rec.encode().to_vec();
        data[9] ^= 0x01; // LSN byte
        let err = Record::decode(&data).unwrap_err();
        assert!(matches!(err, Error::HeaderCrcMismatch { .. }));
    }

    #[test]
    fn test_decode_payload_bitflip_detected() {
        let rec = Record::new(RecordType::Insert, 1, Bytes::from_static(b"payload")).unwrap();
        let mut data = rec.encode().to_vec();
        data[HEADER_SIZE] ^= 0x01;
        let err = Record::decode(&data).unwrap_err();
        assert!(matches!(err, Error::PayloadCrcMismatch { .. }));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let rec = Record::new(RecordType::Insert, 1, Bytes::from_static(b"payload")).unwrap();
        let data = rec.encode();
        let err = Record::decode(&data[..data.len() - 5]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        // Flip each bit of a small encoded record; decode must never
        // silently succeed with different content.
        let rec = Record::new(RecordType::Update, 99, Bytes::from_static(b"abc")).unwrap();
        let encoded = rec.encode();
        for byte in 0..encoded.len() {
            for bit in 0..8 {
                let mut data = encoded.to_vec();
                data[byte] ^= 1 << bit;
                match Record::decode(&data) {
                    Ok(decoded) => assert_eq!(decoded, rec, "bit {bit} of byte {byte}"),
                    Err(_) => {}
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Doc payload codec
    // ---------------------------------------------------------------

    #[test]
    fn test_doc_payload_roundtrip() {
        let meta = sample_meta();
        let embedding = Embedding::deterministic("doc payload");
        let payload = encode_doc_payload("doc-123", &meta, &embedding).unwrap();
        let (id, got_meta, got_embedding) = decode_doc_payload(&payload).unwrap();
        assert_eq!(id, "doc-123");
        assert_eq!(got_meta, meta);
        assert_eq!(got_embedding, embedding);
    }

    #[test]
    fn test_doc_payload_unicode_id() {
        let meta = sample_meta();
        let payload = encode_doc_payload("doc-\u{00e9}\u{1F600}", &meta, &Embedding::zeroed()).unwrap();
        let (id, _, _) = decode_doc_payload(&payload).unwrap();
        assert_eq!(id, "doc-\u{00e9}\u{1F600}");
    }

    #[test]
    fn test_doc_payload_rejects_long_id() {
        let long_id = "x".repeat(MAX_DOC_ID_LEN + 1);
        let err = encode_doc_payload(&long_id, &sample_meta(), &Embedding::zeroed()).unwrap_err();
        assert!(matches!(err, Error::BadPayload(_)));
    }

    #[test]
    fn test_doc_payload_rejects_short_buffer() {
        assert!(matches!(
            decode_doc_payload(&[0x02, 0x00, b'a']).unwrap_err(),
            Error::BadPayload(_)
        ));
    }

    #[test]
    fn test_doc_payload_rejects_missing_embedding() {
        let meta = sample_meta();
        let payload = encode_doc_payload("id", &meta, &Embedding::zeroed()).unwrap();
        let err = decode_doc_payload(&payload[..payload.len() - 10]).unwrap_err();
        assert!(matches!(err, Error::BadPayload(_)));
    }

    #[test]
    fn test_doc_metadata_created_at_is_rfc3339() {
        let json = serde_json::to_value(sample_meta()).unwrap();
        assert_eq!(json["created_at"], "2024-05-01T12:00:00Z");
    }

    // ---------------------------------------------------------------
    // Delete / checkpoint payload codecs
    // ---------------------------------------------------------------

    #[test]
    fn test_delete_payload_roundtrip() {
        let payload = encode_delete_payload("gone").unwrap();
        assert_eq!(decode_delete_payload(&payload).unwrap(), "gone");
    }

    #[test]
    fn test_delete_payload_rejects_long_id() {
        let long_id = "x".repeat(MAX_DOC_ID_LEN + 1);
        assert!(matches!(
            encode_delete_payload(&long_id).unwrap_err(),
            Error::BadPayload(_)
        ));
    }

    #[test]
    fn test_delete_payload_rejects_empty_buffer() {
        assert!(matches!(
            decode_delete_payload(&[]).unwrap_err(),
            Error::BadPayload(_)
        ));
    }

    #[test]
    fn test_checkpoint_payload_roundtrip() {
        let payload = encode_checkpoint_payload(123_456);
        assert_eq!(decode_checkpoint_payload(&payload).unwrap(), 123_456);
    }

    #[test]
    fn test_checkpoint_payload_rejects_short() {
        assert!(matches!(
            decode_checkpoint_payload(&[1, 2, 3]).unwrap_err(),
            Error::BadPayload(_)
        ));
    }
}
