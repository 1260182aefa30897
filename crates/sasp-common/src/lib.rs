//! SASP Common Library
//!
//! Shared utilities for the SASP ingestion workspace.
//!
//! - **Checksums**: canonical JSON serialization and content hashing
//! - **Logging**: tracing subscriber setup driven by environment variables
//!
//! # Example
//!
//! ```
//! use sasp_common::checksum::content_hash;
//! use serde_json::json;
//!
//! let a = content_hash(&json!({"id": 1, "name": "Eagles"}));
//! let b = content_hash(&json!({"name": "Eagles", "id": 1}));
//! assert_eq!(a, b);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod logging;
