//! Testing utilities and mock implementations.
//!
//! `MockCollectionStore` is a fully in-memory `CollectionStore` for embedder
//! tests that don't want a database on disk; `fixtures` builds model values
//! with reasonable defaults.

mod mock_store;

pub use mock_store::MockCollectionStore;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::{DateTime, TimeZone, Utc};

    use crate::model::{
        Collection, CollectionIdentifier, CollectionSource, CollectionSourceType, Package,
        PackageVersion, Product, Target,
    };

    /// A fixed, deterministic timestamp (midnight UTC).
    pub fn timestamp(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    /// Create a test collection with one default package.
    pub fn collection(url: &str) -> Collection {
        collection_with_packages(url, vec![package("https://github.com/acme/lib")])
    }

    /// Create a test collection with the given packages.
    pub fn collection_with_packages(url: &str, packages: Vec<Package>) -> Collection {
        Collection {
            identifier: CollectionIdentifier::json(url),
            source: CollectionSource {
                kind: CollectionSourceType::Json,
                url: url.to_string(),
            },
            name: "Test Collection".to_string(),
            description: Some("A collection for tests".to_string()),
            keywords: None,
            packages,
            created_at: timestamp(2024, 1, 1),
            last_processed_at: timestamp(2024, 1, 1),
        }
    }

    /// Create a test package with a single 1.0.0 version and a `Lib` target.
    pub fn package(repository_url: &str) -> Package {
        package_with_targets(repository_url, "1.0.0", &["Lib"])
    }

    /// Create a test package with the given summary.
    pub fn package_with_summary(repository_url: &str, summary: &str) -> Package {
        let mut package = package(repository_url);
        package.summary = Some(summary.to_string());
        package
    }

    /// Create a test package with one version declaring the given targets.
    pub fn package_with_targets(repository_url: &str, version: &str, targets: &[&str]) -> Package {
        package_with_versions(repository_url, &[(version, targets)])
    }

    /// Create a test package with one entry per `(version, targets)` pair.
    pub fn package_with_versions(repository_url: &str, versions: &[(&str, &[&str])]) -> Package {
        Package {
            repository_url: repository_url.to_string(),
            summary: Some("A library for testing".to_string()),
            readme_url: None,
            keywords: None,
            versions: versions
                .iter()
                .map(|(version, targets)| version_with_targets(version, targets))
                .collect(),
        }
    }

    /// Create a test version declaring the given targets, with one library
    /// product spanning all of them.
    pub fn version_with_targets(version: &str, targets: &[&str]) -> PackageVersion {
        PackageVersion {
            version: version.to_string(),
            package_name: "Lib".to_string(),
            tools_version: "1.0".to_string(),
            verified_platforms: None,
            verified_tools_versions: None,
            license: None,
            targets: targets
                .iter()
                .map(|name| Target {
                    name: name.to_string(),
                    module_name: Some(name.to_string()),
                })
                .collect(),
            products: vec![Product {
                name: "Lib".to_string(),
                kind: "library".to_string(),
                targets: targets.iter().map(|name| name.to_string()).collect(),
            }],
        }
    }
}
