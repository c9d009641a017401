//! Format Error Types
//!
//! This module defines all error types that can occur while encoding or
//! decoding WAL records and segment names.
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `BadMagic`: record doesn't start with the expected magic bytes
//! - `HeaderCrcMismatch` / `PayloadCrcMismatch`: corruption detected via checksum
//! - `Truncated`: buffer ends mid-record
//!
//! ### Bound Errors
//! - `PayloadTooLarge`: payload exceeds the 10 MiB record limit
//! - `BadPayload`: payload body is malformed (short field, bad JSON, bad UTF-8)
//!
//! ### Naming Errors
//! - `BadSegmentName`: filename is neither `wal_NNNNNNNNNNNN.seg` nor
//!   `cmp_NNNNNNNNNNNN.seg`
//!
//! ## Usage
//!
//! All codec functions return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows clean error propagation with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid magic: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("header CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    HeaderCrcMismatch { expected: u32, actual: u32 },

    #[error("payload CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    PayloadCrcMismatch { expected: u32, actual: u32 },

    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed payload: {0}")]
    BadPayload(String),

    #[error("invalid segment filename: {0}")]
    BadSegmentName(String),
}
