//! Google Cloud Storage backend.
//!
//! Authenticates with a service account key (JWT bearer flow) and talks to
//! the JSON API over reqwest.

pub mod auth;
pub mod client;
pub mod store;

pub use auth::{ServiceAccountKey, TokenManager, Tokens};
pub use client::GcsClient;
pub use store::GcsStore;
