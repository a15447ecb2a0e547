//! Package collection data model.
//!
//! A `Collection` is a curated bundle of package metadata identified by the
//! URL it was fetched from. Collections are produced elsewhere (fetching and
//! schema validation are not this crate's concern) and handed to the store
//! already parsed.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a package collection.
///
/// The only variant today is a JSON collection addressed by URL; the
/// discriminator is kept on the wire so future variants stay decodable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "_case", rename_all = "lowercase")]
pub enum CollectionIdentifier {
    Json { url: String },
}

impl CollectionIdentifier {
    pub fn json(url: impl Into<String>) -> Self {
        Self::Json { url: url.into() }
    }

    /// The textual key this identifier maps to in the primary table.
    pub fn database_key(&self) -> &str {
        match self {
            Self::Json { url } => url,
        }
    }
}

impl fmt::Display for CollectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.database_key())
    }
}

/// Where a collection was obtained from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSource {
    #[serde(rename = "type")]
    pub kind: CollectionSourceType,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionSourceType {
    Json,
}

/// A package collection: the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub identifier: CollectionIdentifier,
    pub source: CollectionSource,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    pub packages: Vec<Package>,
    pub created_at: DateTime<Utc>,
    /// When the collection was last processed; the tie-break key for
    /// "latest metadata wins" ordering across collections.
    pub last_processed_at: DateTime<Utc>,
}

/// Metadata for one source repository inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Canonical locator of the package.
    pub repository_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    pub versions: Vec<PackageVersion>,
}

impl Package {
    /// Identity derived from the repository URL.
    pub fn identity(&self) -> PackageIdentity {
        PackageIdentity::from_url(&self.repository_url)
    }
}

/// One released state of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVersion {
    pub version: String,
    pub package_name: String,
    pub tools_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_platforms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_tools_versions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,
    pub targets: Vec<Target>,
    pub products: Vec<Product>,
}

impl PackageVersion {
    /// Parsed semantic version, if the version string is well-formed.
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(self.version.trim_start_matches('v')).ok()
    }
}

/// A named compilation unit inside a package version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
}

/// A product exposed by a package version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub targets: Vec<String>,
}

/// Package license reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub url: String,
}

/// Canonical identity of a package, derived from its repository URL.
///
/// Two URLs that point at the same repository (scheme, `git@` form, `.git`
/// suffix, trailing slash, letter case) canonicalize to the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageIdentity(String);

impl PackageIdentity {
    pub fn from_url(url: &str) -> Self {
        let mut s = url.trim().trim_end_matches('/').to_lowercase();

        for prefix in ["https://", "http://", "ssh://git@", "git://", "git@"] {
            if let Some(rest) = s.strip_prefix(prefix) {
                s = rest.to_string();
                break;
            }
        }

        // scp-like remotes: host:path -> host/path
        if let Some((host, path)) = s.split_once(':') {
            if !host.contains('/') && !path.is_empty() {
                s = format!("{}/{}", host, path);
            }
        }

        if let Some(stripped) = s.strip_suffix(".git") {
            s = stripped.to_string();
        }

        Self(s.trim_end_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
