//! Manifest log keys.
//!
//! Every log entry lives at `<manifest>@<time>_<session>_<sequence>`.
//! Time and sequence use the descending encoder, so ascending string
//! order is newest first: a `LIST` with `StartAfter` set to the cursor of
//! some instant returns every entry at or before that instant, newest
//! first.

use crate::error::{ProtocolError, ProtocolResult};
use crate::key::{decode_desc, encode_desc, encoded_width};
use std::fmt;

/// Bits of the millisecond timestamp (good until the year 2527).
pub const TIMESTAMP_BITS: u32 = 44;

/// Bits of the per-session sequence number.
pub const SEQUENCE_BITS: u32 = 32;

const MAX_SESSION_LEN: usize = 32;

/// A parsed manifest log key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey {
    /// Key of the manifest this entry belongs to.
    pub manifest: String,
    /// Writer's (clock-adjusted) time in milliseconds since the epoch.
    pub timestamp: u64,
    /// Writer session, disambiguating equal timestamps across writers.
    pub session: String,
    /// Per-session counter, disambiguating equal timestamps within a writer.
    pub sequence: u32,
}

impl LogKey {
    /// Creates a log key.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not 1-32 characters of `[0-9a-z]`
    /// or the timestamp does not fit [`TIMESTAMP_BITS`].
    pub fn new(
        manifest: impl Into<String>,
        timestamp: u64,
        session: impl Into<String>,
        sequence: u32,
    ) -> ProtocolResult<Self> {
        let key = Self {
            manifest: manifest.into(),
            timestamp,
            session: session.into(),
            sequence,
        };
        if !valid_session(&key.session) {
            return Err(ProtocolError::InvalidLogKey(format!(
                "bad session id {:?}",
                key.session
            )));
        }
        encode_desc(timestamp, TIMESTAMP_BITS)?;
        Ok(key)
    }

    /// Returns the listing prefix shared by all entries of a manifest.
    pub fn prefix(manifest: &str) -> String {
        format!("{manifest}@")
    }

    /// Returns a `StartAfter` cursor that lists entries at or before
    /// `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp does not fit [`TIMESTAMP_BITS`].
    pub fn cursor(manifest: &str, timestamp: u64) -> ProtocolResult<String> {
        Ok(format!(
            "{}{}",
            Self::prefix(manifest),
            encode_desc(timestamp, TIMESTAMP_BITS)?
        ))
    }

    /// Parses `key` as an entry of `manifest`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidLogKey`] if the key has any other shape.
    pub fn parse(manifest: &str, key: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidLogKey(key.to_string());

        let rest = key.strip_prefix(&Self::prefix(manifest)).ok_or_else(invalid)?;
        let ts_width = encoded_width(TIMESTAMP_BITS);
        let time = rest.get(..ts_width).ok_or_else(invalid)?;
        let tail = rest
            .get(ts_width..)
            .and_then(|t| t.strip_prefix('_'))
            .ok_or_else(invalid)?;
        let (session, seq) = tail.rsplit_once('_').ok_or_else(invalid)?;

        if !valid_session(session) || seq.len() != encoded_width(SEQUENCE_BITS) {
            return Err(invalid());
        }

        let timestamp = decode_desc(time, TIMESTAMP_BITS).map_err(|_| invalid())?;
        let sequence = decode_desc(seq, SEQUENCE_BITS).map_err(|_| invalid())?;

        Ok(Self {
            manifest: manifest.to_string(),
            timestamp,
            session: session.to_string(),
            sequence: u32::try_from(sequence).map_err(|_| invalid())?,
        })
    }
}

fn valid_session(session: &str) -> bool {
    !session.is_empty()
        && session.len() <= MAX_SESSION_LEN
        && session
            .bytes()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Both fields were range-checked at construction.
        let time = encode_desc(self.timestamp, TIMESTAMP_BITS).map_err(|_| fmt::Error)?;
        let seq = encode_desc(u64::from(self.sequence), SEQUENCE_BITS).map_err(|_| fmt::Error)?;
        write!(f, "{}@{}_{}_{}", self.manifest, time, self.session, seq)
    }
}
