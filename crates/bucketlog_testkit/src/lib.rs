//! # bucketlog Testkit
//!
//! Test utilities for bucketlog.
//!
//! This crate provides:
//! - Shared in-memory buckets with clients attached to them
//! - Clients with skewed clocks and durable local stores
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bucketlog_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn readers_see_writes() {
//!     let bucket = TestBucket::new("photos");
//!     let writer = bucket.client();
//!     writer.put("k", serde_json::json!(1)).await.unwrap();
//!     assert!(bucket.client().get("k").await.unwrap().is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
