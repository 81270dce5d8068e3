//! In-memory bookkeeping of buckets and files.
//!
//! The cache mirrors remote state on a best-effort basis. It is consulted to
//! skip redundant "does this bucket exist" round trips and never decides the
//! outcome of a destructive operation.

use std::collections::{BTreeMap, HashMap};

use omnistore_common::BucketName;

use crate::store::{BucketInfo, ObjectMeta};

/// Last-known buckets and file sizes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketState {
    buckets: BTreeMap<String, BucketInfo>,
    files: HashMap<String, BTreeMap<String, u64>>,
}

impl BucketState {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a bucket is known.
    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// Get cached bucket metadata.
    pub fn bucket(&self, name: &str) -> Option<&BucketInfo> {
        self.buckets.get(name)
    }

    /// Names of all known buckets, sorted.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    /// Remember a bucket.
    pub fn record_bucket(&mut self, info: BucketInfo) {
        self.buckets.insert(info.name.clone(), info);
    }

    /// Replace the bucket map with a fresh remote listing.
    ///
    /// File entries of buckets missing from the listing are dropped.
    pub fn merge_bucket_listing(&mut self, listing: &[BucketInfo]) {
        self.buckets = listing
            .iter()
            .map(|info| (info.name.clone(), info.clone()))
            .collect();
        let buckets = &self.buckets;
        self.files.retain(|name, _| buckets.contains_key(name));
    }

    /// Forget a bucket and its files.
    pub fn evict_bucket(&mut self, name: &str) {
        self.buckets.remove(name);
        self.files.remove(name);
    }

    /// Replace the file map of `bucket` with the first page of a listing.
    pub fn replace_files(&mut self, bucket: &BucketName, objects: &[ObjectMeta]) {
        let files = objects.iter().map(|o| (o.key.clone(), o.size)).collect();
        self.files.insert(bucket.to_string(), files);
    }

    /// Add a continuation page of a listing to the file map of `bucket`.
    pub fn extend_files(&mut self, bucket: &BucketName, objects: &[ObjectMeta]) {
        self.files
            .entry(bucket.to_string())
            .or_default()
            .extend(objects.iter().map(|o| (o.key.clone(), o.size)));
    }

    /// Remember a single file.
    pub fn record_file(&mut self, bucket: &BucketName, key: &str, size: u64) {
        self.files
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), size);
    }

    /// Forget a single file.
    pub fn evict_file(&mut self, bucket: &BucketName, key: &str) {
        if let Some(files) = self.files.get_mut(bucket.as_str()) {
            files.remove(key);
        }
    }

    /// Forget every file of `bucket`, keeping the bucket itself.
    pub fn clear_files(&mut self, bucket: &BucketName) {
        self.files.remove(bucket.as_str());
    }

    /// Last-known size of a file.
    pub fn cached_size(&self, bucket: &BucketName, key: &str) -> Option<u64> {
        self.files.get(bucket.as_str())?.get(key).copied()
    }

    /// Number of files known for `bucket`.
    pub fn file_count(&self, bucket: &BucketName) -> usize {
        self.files.get(bucket.as_str()).map_or(0, BTreeMap::len)
    }
}

/// Mutable state of a backend instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendState {
    /// Whether the authorization handshake completed.
    pub initialized: bool,
    /// Bucket file operations target.
    pub selected: Option<BucketName>,
    /// Best-effort mirror of remote buckets and files.
    pub cache: BucketState,
    /// Token left by the last file listing that stopped early.
    pub continuation: Option<String>,
}

impl BackendState {
    /// State with an optional pre-selected bucket.
    pub fn with_selection(selected: Option<BucketName>) -> Self {
        Self {
            selected,
            ..Self::default()
        }
    }

    /// Clear the selection if it points at `bucket`.
    pub fn unselect(&mut self, bucket: &BucketName) {
        if self.selected.as_ref() == Some(bucket) {
            self.selected = None;
            self.continuation = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(name: &str) -> BucketName {
        BucketName::new(name).unwrap()
    }

    #[test]
    fn test_merge_bucket_listing_drops_stale_files() {
        let mut state = BucketState::new();
        state.record_bucket(BucketInfo::named("old"));
        state.record_file(&bucket("old"), "a.jpg", 10);

        state.merge_bucket_listing(&[BucketInfo::named("new")]);

        assert!(!state.has_bucket("old"));
        assert!(state.has_bucket("new"));
        assert_eq!(state.cached_size(&bucket("old"), "a.jpg"), None);
    }

    #[test]
    fn test_replace_and_extend_files() {
        let mut state = BucketState::new();
        let b = bucket("photos");
        state.record_file(&b, "stale.jpg", 1);

        state.replace_files(&b, &[ObjectMeta::sized("a.jpg", 5)]);
        assert_eq!(state.file_count(&b), 1);
        assert_eq!(state.cached_size(&b, "stale.jpg"), None);

        state.extend_files(&b, &[ObjectMeta::sized("b.jpg", 7)]);
        assert_eq!(state.file_count(&b), 2);
        assert_eq!(state.cached_size(&b, "b.jpg"), Some(7));
    }

    #[test]
    fn test_evict_bucket() {
        let mut state = BucketState::new();
        let b = bucket("photos");
        state.record_bucket(BucketInfo::named("photos"));
        state.record_file(&b, "a.jpg", 5);

        state.evict_bucket("photos");

        assert!(!state.has_bucket("photos"));
        assert_eq!(state.file_count(&b), 0);
    }

    #[test]
    fn test_unselect_only_matching_bucket() {
        let mut state = BackendState::with_selection(Some(bucket("a")));
        state.unselect(&bucket("b"));
        assert_eq!(state.selected, Some(bucket("a")));

        state.unselect(&bucket("a"));
        assert_eq!(state.selected, None);
    }
}
