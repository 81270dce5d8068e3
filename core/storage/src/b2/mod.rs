//! Backblaze B2 backend, on the native B2 API.

pub mod client;
pub mod store;

pub use client::{B2Bucket, B2Client, B2File, Session};
pub use store::B2Store;
