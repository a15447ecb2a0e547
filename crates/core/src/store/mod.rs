//! Durable storage and search for package collections.
//!
//! This module provides a `CollectionStore` trait for persisting collections
//! and querying them (by identifier, by package attributes, by target name),
//! plus the SQLite-backed implementation used in production.

mod backoff;
mod cache;
mod sqlite;
mod trie;
mod types;

pub use sqlite::SqliteCollectionStore;
pub use types::*;

use async_trait::async_trait;

use crate::model::{Collection, CollectionIdentifier, PackageIdentity};

/// Trait for collection storage and search.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Insert or replace a collection, keyed by its identifier.
    ///
    /// Replacing a collection atomically swaps its search-index rows for the
    /// new contents. Returns the stored collection.
    async fn put(&self, collection: Collection) -> Result<Collection, StoreError>;

    /// Remove a collection and every search-index entry derived from it.
    ///
    /// Removing an absent identifier is not an error.
    async fn remove(&self, identifier: &CollectionIdentifier) -> Result<(), StoreError>;

    /// Fetch a single collection by identifier.
    ///
    /// Reads do not populate the in-memory cache; only writes do. `list` is
    /// the intended cache warm-up path.
    async fn get(&self, identifier: &CollectionIdentifier) -> Result<Collection, StoreError>;

    /// Fetch several collections, or every stored collection when
    /// `identifiers` is `None`.
    ///
    /// Undecodable rows are skipped and reported once through the
    /// diagnostics sink. Order follows the request when identifiers are
    /// given, and is unspecified otherwise.
    async fn list(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
    ) -> Result<Vec<Collection>, StoreError>;

    /// Full-text search over package attributes within the candidate
    /// collections (all collections when `identifiers` is `None`).
    ///
    /// With search indices available this is a tokenized match; the
    /// fallback scan matches substrings inside attributes, so the two paths
    /// are intentionally not equivalent for infix queries.
    async fn search_packages(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
        query: &str,
    ) -> Result<PackageSearchResult, StoreError>;

    /// Look up a package by exact identity.
    ///
    /// When several candidate collections contain the identity, the package
    /// value comes from the most recently processed one; the returned
    /// collection list is ordered newest first.
    async fn find_package(
        &self,
        identity: &PackageIdentity,
        identifiers: Option<&[CollectionIdentifier]>,
    ) -> Result<PackageSearchItem, StoreError>;

    /// Search target names, exact or by prefix. Case-insensitive.
    async fn search_targets(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
        query: &str,
        mode: TargetSearchMode,
    ) -> Result<TargetSearchResult, StoreError>;

    /// Flush and close the underlying database.
    ///
    /// Safe to call more than once; a later operation reopens the database.
    async fn close(&self) -> Result<(), StoreError>;
}
