//! Public types for the collection store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CollectionIdentifier, Package, Target};

/// Where the store keeps its database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// A database file on disk. Parent directories are created on first use.
    Path(PathBuf),
    /// A private in-memory database; contents do not survive a close.
    Memory,
    /// A temporary on-disk database, deleted when the connection closes.
    Temporary,
}

impl DatabaseLocation {
    /// Default on-disk location: a cache directory under the user's home.
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("collectino")
            .join("collections.db")
    }

    pub fn is_path(&self) -> bool {
        matches!(self, Self::Path(_))
    }
}

impl Default for DatabaseLocation {
    fn default() -> Self {
        Self::Path(Self::default_path())
    }
}

/// How target-name search matches the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSearchMode {
    /// The target name equals the query (case-insensitive).
    Exact,
    /// The target name starts with the query (case-insensitive).
    Prefix,
}

/// Result of a package search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSearchResult {
    pub items: Vec<PackageSearchItem>,
}

/// One matched package and every candidate collection that contains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSearchItem {
    pub package: Package,
    pub collections: Vec<CollectionIdentifier>,
}

/// Result of a target search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSearchResult {
    pub items: Vec<TargetSearchItem>,
}

/// One matched target and the packages declaring it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSearchItem {
    pub target: Target,
    pub packages: Vec<TargetSearchPackage>,
}

/// A package as it appears in target-search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSearchPackage {
    pub repository_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Versions declaring the target, newest first.
    pub versions: Vec<String>,
    pub collections: Vec<CollectionIdentifier>,
}

/// Errors for collection store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stored collection is corrupt: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to close database: {0}")]
    CloseFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&TargetSearchMode::Exact).unwrap(),
            "\"exact\""
        );
        assert_eq!(
            serde_json::to_string(&TargetSearchMode::Prefix).unwrap(),
            "\"prefix\""
        );
    }

    #[test]
    fn test_default_location_is_under_home_cache() {
        let location = DatabaseLocation::default();
        let DatabaseLocation::Path(path) = &location else {
            panic!("default location should be a path");
        };
        assert!(path.ends_with("collectino/collections.db"));
        assert!(location.is_path());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("https://example.org/c1.json".to_string());
        assert_eq!(err.to_string(), "Not found: https://example.org/c1.json");
    }
}
