//! # bucketlog Protocol
//!
//! Manifest log types and pure algorithms for bucketlog.
//!
//! This crate provides:
//! - Order-preserving key encoding for timestamps ([`encode`], [`encode_desc`])
//! - RFC 7386 merge patch and diff over JSON documents ([`merge`], [`diff`])
//! - Replication provenance bitsets ([`Provenance`])
//! - References and manifest log keys ([`Reference`], [`LogKey`])
//! - The `ManifestFile` wire format with validated decode ([`ManifestFile`])
//! - Content hashing ([`content_hash`])
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod hash;
mod key;
mod log_key;
mod manifest_file;
mod merge;
mod provenance;
mod reference;

pub use error::{ProtocolError, ProtocolResult};
pub use hash::content_hash;
pub use key::{decode, decode_desc, encode, encode_desc, encoded_width, ALPHABET};
pub use log_key::{LogKey, SEQUENCE_BITS, TIMESTAMP_BITS};
pub use manifest_file::{FileState, ManifestFile, ManifestState, ManifestUpdate};
pub use merge::{compose, diff, merge};
pub use provenance::Provenance;
pub use reference::{Reference, ResolvedReference};
