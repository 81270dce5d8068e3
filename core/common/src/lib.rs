//! Common utilities and types shared across OmniStore crates.
//!
//! This module provides the error type every backend reports through and the
//! name-safety value types that keep bucket names and object keys portable
//! across storage vendors.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{slugify, BucketName, ByteRange, ObjectKey, Secret};
