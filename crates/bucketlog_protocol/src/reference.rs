//! References to logical storage locations.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical location, possibly without a bucket.
///
/// Callers usually name keys relative to a client's default bucket; the
/// client resolves them before anything reaches the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Bucket, if given explicitly.
    pub bucket: Option<String>,
    /// Object key.
    pub key: String,
}

impl Reference {
    /// Creates a reference relative to the default bucket.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            bucket: None,
            key: key.into(),
        }
    }

    /// Creates a reference into a specific bucket.
    pub fn in_bucket(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            key: key.into(),
        }
    }

    /// Fills in the bucket when absent.
    pub fn resolve(&self, default_bucket: &str) -> ResolvedReference {
        ResolvedReference {
            bucket: self
                .bucket
                .clone()
                .unwrap_or_else(|| default_bucket.to_string()),
            key: self.key.clone(),
        }
    }
}

impl From<&str> for Reference {
    fn from(key: &str) -> Self {
        Reference::key(key)
    }
}

impl From<ResolvedReference> for Reference {
    fn from(r: ResolvedReference) -> Self {
        Reference {
            bucket: Some(r.bucket),
            key: r.key,
        }
    }
}

/// A reference that carries both bucket and key.
///
/// The string form `bucket/key` is the key of the manifest `files` map.
/// Bucket names cannot contain `/`, so the first slash separates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedReference {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl ResolvedReference {
    /// Creates a resolved reference.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses the `bucket/key` form.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is empty or the slash is missing.
    pub fn parse(s: &str) -> ProtocolResult<Self> {
        match s.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(ProtocolError::InvalidReference(s.to_string())),
        }
    }

    /// Returns the same key in another bucket.
    #[must_use]
    pub fn with_bucket(&self, bucket: &str) -> Self {
        Self::new(bucket, self.key.clone())
    }
}

impl fmt::Display for ResolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_uses_default_only_when_missing() {
        assert_eq!(
            Reference::key("a/b").resolve("home"),
            ResolvedReference::new("home", "a/b")
        );
        assert_eq!(
            Reference::in_bucket("other", "k").resolve("home"),
            ResolvedReference::new("other", "k")
        );
    }

    #[test]
    fn string_form_roundtrip() {
        let r = ResolvedReference::new("bucket", "dir/file.json");
        assert_eq!(r.to_string(), "bucket/dir/file.json");
        assert_eq!(ResolvedReference::parse(&r.to_string()).unwrap(), r);
    }

    #[test]
    fn parse_rejects_partial() {
        assert!(ResolvedReference::parse("nobucket").is_err());
        assert!(ResolvedReference::parse("/key").is_err());
        assert!(ResolvedReference::parse("bucket/").is_err());
    }
}
