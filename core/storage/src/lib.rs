//! Uniform file storage over heterogeneous backends.
//!
//! Callers write backend-agnostic code against [`Storage`]; a configuration
//! value (descriptor string, structured config or JSON) selects the backend:
//! the local filesystem, an in-process store, Google Cloud Storage, Amazon S3
//! or Backblaze B2.
//!
//! # Layers
//! - [`ConfigParser`] normalizes every configuration input into a validated
//!   [`StorageConfig`]
//! - [`StorageBackend`] is the operation contract callers see
//! - [`ObjectStore`] is the thin per-vendor capability provider
//! - [`ManagedBackend`] implements the contract once over any store: selected
//!   bucket, [`BucketState`] cache, idempotent create and delete
//! - [`ApiResponse`] turns results into errors-as-data payloads

pub mod api;
pub mod b2;
pub mod backend;
pub mod config;
pub mod facade;
pub mod gcs;
pub mod local;
pub mod managed;
pub mod memory;
pub mod registry;
pub mod s3;
pub mod state;
pub mod store;

pub use api::{ApiError, ApiResponse};
pub use backend::{FileListing, Introspection, StorageBackend, DEFAULT_LIST_LIMIT};
pub use config::{
    parse_descriptor, B2Config, ConfigInput, ConfigParser, Descriptor, GcsConfig, LocalConfig,
    MemoryConfig, S3Config, StorageConfig, StorageType,
};
pub use facade::Storage;
pub use local::LocalStore;
pub use managed::ManagedBackend;
pub use memory::MemoryStore;
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
pub use state::{BackendState, BucketState};
pub use store::{reader_stream, BucketInfo, ByteStream, ObjectBody, ObjectMeta, ObjectPage, ObjectStore};

pub use omnistore_common::{BucketName, ByteRange, Error, ObjectKey, Result};
