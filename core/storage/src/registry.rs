//! Backend registry for dynamic backend resolution.

use std::collections::HashMap;
use std::sync::Arc;

use omnistore_common::{Error, Result};

use crate::backend::StorageBackend;
use crate::b2::B2Store;
use crate::config::{StorageConfig, StorageType};
use crate::gcs::GcsStore;
use crate::local::LocalStore;
use crate::managed::ManagedBackend;
use crate::memory::MemoryStore;
use crate::s3::S3Store;

/// Factory function type for creating backends.
pub type BackendFactory =
    Box<dyn Fn(StorageConfig) -> Result<Arc<dyn StorageBackend>> + Send + Sync>;

/// Registry for storage backend factories.
///
/// Maps each backend type tag to the factory that builds it from a
/// validated config.
pub struct BackendRegistry {
    factories: HashMap<StorageType, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if a factory is already registered for `storage_type`
    pub fn register(&mut self, storage_type: StorageType, factory: BackendFactory) -> Result<()> {
        if self.factories.contains_key(&storage_type) {
            return Err(Error::Validation(format!(
                "Backend '{}' is already registered",
                storage_type
            )));
        }
        self.factories.insert(storage_type, factory);
        Ok(())
    }

    /// Register a factory, replacing any previous one for the same type.
    pub fn with_backend(mut self, storage_type: StorageType, factory: BackendFactory) -> Self {
        self.factories.insert(storage_type, factory);
        self
    }

    /// Build the backend a config is meant for.
    ///
    /// # Errors
    /// - No factory is registered for the config's type
    /// - The factory rejects the config
    pub fn resolve(&self, config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
        let storage_type = config.storage_type();
        let factory = self.factories.get(&storage_type).ok_or_else(|| {
            Error::Validation(format!("Backend '{}' is not registered", storage_type))
        })?;
        factory(config)
    }

    /// Get list of registered backend types.
    pub fn backends(&self) -> Vec<StorageType> {
        let mut types: Vec<StorageType> = self.factories.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Check if a backend type is registered.
    pub fn has_backend(&self, storage_type: StorageType) -> bool {
        self.factories.contains_key(&storage_type)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn mismatch(expected: StorageType, config: &StorageConfig) -> Error {
    Error::ConfigMismatch {
        expected: expected.to_string(),
        found: config.storage_type().to_string(),
    }
}

fn local_backend(config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Local(c) => Ok(Arc::new(ManagedBackend::new(
            LocalStore::new(&c.directory),
            StorageType::Local,
            c.bucket_name.as_deref(),
        )?)),
        other => Err(mismatch(StorageType::Local, &other)),
    }
}

fn memory_backend(config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Memory(c) => Ok(Arc::new(ManagedBackend::new(
            MemoryStore::new(),
            StorageType::Memory,
            c.bucket_name.as_deref(),
        )?)),
        other => Err(mismatch(StorageType::Memory, &other)),
    }
}

fn gcs_backend(config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Gcs(c) => {
            let bucket = c.bucket_name.clone();
            Ok(Arc::new(ManagedBackend::new(
                GcsStore::new(c)?,
                StorageType::Gcs,
                bucket.as_deref(),
            )?))
        }
        other => Err(mismatch(StorageType::Gcs, &other)),
    }
}

fn s3_backend(config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::S3(c) => Ok(Arc::new(ManagedBackend::new(
            S3Store::new(&c)?,
            StorageType::S3,
            c.bucket_name.as_deref(),
        )?)),
        other => Err(mismatch(StorageType::S3, &other)),
    }
}

fn b2_backend(config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::B2(c) => Ok(Arc::new(ManagedBackend::new(
            B2Store::new(&c)?,
            StorageType::B2,
            c.bucket_name.as_deref(),
        )?)),
        other => Err(mismatch(StorageType::B2, &other)),
    }
}

/// Create a registry with every built-in backend.
pub fn create_default_registry() -> BackendRegistry {
    BackendRegistry::new()
        .with_backend(StorageType::Local, Box::new(local_backend))
        .with_backend(StorageType::Memory, Box::new(memory_backend))
        .with_backend(StorageType::Gcs, Box::new(gcs_backend))
        .with_backend(StorageType::S3, Box::new(s3_backend))
        .with_backend(StorageType::B2, Box::new(b2_backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn memory_config() -> StorageConfig {
        StorageConfig::Memory(MemoryConfig::default())
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = BackendRegistry::new();
        registry
            .register(StorageType::Memory, Box::new(memory_backend))
            .unwrap();

        let backend = registry.resolve(memory_config()).unwrap();
        assert_eq!(backend.storage_type(), StorageType::Memory);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = BackendRegistry::new();
        registry
            .register(StorageType::Memory, Box::new(memory_backend))
            .unwrap();

        let result = registry.register(StorageType::Memory, Box::new(memory_backend));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_resolve_unregistered_fails() {
        let registry = BackendRegistry::new();
        assert!(registry.resolve(memory_config()).is_err());
    }

    #[test]
    fn test_factory_rejects_foreign_config() {
        let Err(err) = local_backend(memory_config()) else {
            panic!("local factory accepted a memory config");
        };
        assert_eq!(
            err.to_string(),
            "Config mismatch: expecting type \"local\" but found type \"memory\""
        );
    }

    #[test]
    fn test_default_registry_has_all_backends() {
        let registry = create_default_registry();
        for storage_type in StorageType::all() {
            assert!(registry.has_backend(storage_type));
        }
        assert_eq!(registry.backends().len(), 5);
    }
}
