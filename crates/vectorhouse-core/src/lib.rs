//! VectorHouse Core Types
//!
//! This crate defines the data model and wire format shared by every
//! VectorHouse component:
//!
//! - **Document**: a string-keyed document with a fixed 128-dimension
//!   embedding, the unit of storage and search
//! - **Record**: a CRC32-protected WAL entry (24-byte header + payload)
//! - **Payload codecs**: binary encodings for document, tombstone and
//!   checkpoint payloads
//!
//! ## Why a Separate Crate?
//!
//! The storage engine, the manifest and any hosting process all need to
//! agree on these types without dragging in each other's dependencies
//! (tokio, sqlx). Keeping the codec dependency-light also makes it easy
//! to fuzz and property-test in isolation.

pub mod document;
pub mod error;
pub mod record;

pub use document::{Document, Embedding, EMBEDDING_DIM};
pub use error::{Error, Result};
pub use record::{DocMetadata, Record, RecordType};
