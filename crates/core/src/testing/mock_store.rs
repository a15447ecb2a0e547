use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::model::{Collection, CollectionIdentifier, PackageIdentity, Target};
use crate::store::{
    CollectionStore, PackageSearchItem, PackageSearchResult, StoreError, TargetSearchItem,
    TargetSearchMode, TargetSearchPackage, TargetSearchResult,
};

/// In-memory mock implementation of [`CollectionStore`].
///
/// Search behaves like the store's fallback scans (substring package match,
/// case-insensitive target match), so embedder tests see the same shapes
/// without a database.
#[derive(Default)]
pub struct MockCollectionStore {
    collections: RwLock<HashMap<CollectionIdentifier, Collection>>,
}

impl MockCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored collections.
    pub fn len(&self) -> usize {
        self.collections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.read().unwrap().is_empty()
    }

    fn candidates(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
    ) -> HashMap<CollectionIdentifier, Collection> {
        let collections = self.collections.read().unwrap();
        match identifiers {
            Some(ids) => ids
                .iter()
                .filter_map(|id| collections.get(id).map(|c| (id.clone(), c.clone())))
                .collect(),
            None => collections.clone(),
        }
    }
}

fn sort_newest_first(
    ids: &mut [CollectionIdentifier],
    candidates: &HashMap<CollectionIdentifier, Collection>,
) {
    ids.sort_by(|a, b| {
        let a_processed = candidates.get(a).map(|c| c.last_processed_at);
        let b_processed = candidates.get(b).map(|c| c.last_processed_at);
        b_processed.cmp(&a_processed)
    });
}

#[async_trait]
impl CollectionStore for MockCollectionStore {
    async fn put(&self, collection: Collection) -> Result<Collection, StoreError> {
        self.collections
            .write()
            .unwrap()
            .insert(collection.identifier.clone(), collection.clone());
        Ok(collection)
    }

    async fn remove(&self, identifier: &CollectionIdentifier) -> Result<(), StoreError> {
        self.collections.write().unwrap().remove(identifier);
        Ok(())
    }

    async fn get(&self, identifier: &CollectionIdentifier) -> Result<Collection, StoreError> {
        self.collections
            .read()
            .unwrap()
            .get(identifier)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))
    }

    async fn list(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
    ) -> Result<Vec<Collection>, StoreError> {
        let collections = self.collections.read().unwrap();
        match identifiers {
            Some(ids) => Ok(ids
                .iter()
                .filter_map(|id| collections.get(id).cloned())
                .collect()),
            None => {
                let mut all: Vec<Collection> = collections.values().cloned().collect();
                all.sort_by(|a, b| {
                    a.identifier
                        .database_key()
                        .cmp(b.identifier.database_key())
                });
                Ok(all)
            }
        }
    }

    async fn search_packages(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
        query: &str,
    ) -> Result<PackageSearchResult, StoreError> {
        let candidates = self.candidates(identifiers);
        let needle = query.to_lowercase();
        let mut matched: HashMap<PackageIdentity, HashSet<CollectionIdentifier>> = HashMap::new();

        for (id, collection) in &candidates {
            for package in &collection.packages {
                // summary and keywords fall back to the parent collection's
                // description and keywords when the package has none
                let summary = package.summary.as_ref().or(collection.description.as_ref());
                let keywords = package.keywords.as_ref().or(collection.keywords.as_ref());
                let hit = package.repository_url.to_lowercase().contains(&needle)
                    || summary.is_some_and(|s| s.to_lowercase().contains(&needle))
                    || keywords
                        .is_some_and(|ks| ks.iter().any(|k| k.to_lowercase().contains(&needle)))
                    || package.versions.iter().any(|v| {
                        v.package_name.to_lowercase().contains(&needle)
                            || v.products
                                .iter()
                                .any(|p| p.name.to_lowercase().contains(&needle))
                            || v.targets
                                .iter()
                                .any(|t| t.name.to_lowercase().contains(&needle))
                    });
                if hit {
                    matched
                        .entry(package.identity())
                        .or_default()
                        .insert(id.clone());
                }
            }
        }

        let mut items = Vec::with_capacity(matched.len());
        for (identity, collection_ids) in matched {
            let mut ids: Vec<CollectionIdentifier> = collection_ids.into_iter().collect();
            sort_newest_first(&mut ids, &candidates);
            let package = ids.iter().find_map(|cid| {
                candidates
                    .get(cid)
                    .and_then(|c| c.packages.iter().find(|p| p.identity() == identity))
            });
            if let Some(package) = package {
                items.push(PackageSearchItem {
                    package: package.clone(),
                    collections: ids,
                });
            }
        }
        items.sort_by(|a, b| a.package.repository_url.cmp(&b.package.repository_url));

        Ok(PackageSearchResult { items })
    }

    async fn find_package(
        &self,
        identity: &PackageIdentity,
        identifiers: Option<&[CollectionIdentifier]>,
    ) -> Result<PackageSearchItem, StoreError> {
        let candidates = self.candidates(identifiers);
        let mut ids: Vec<CollectionIdentifier> = candidates
            .iter()
            .filter(|(_, c)| c.packages.iter().any(|p| p.identity() == *identity))
            .map(|(id, _)| id.clone())
            .collect();

        if ids.is_empty() {
            return Err(StoreError::NotFound(identity.to_string()));
        }
        sort_newest_first(&mut ids, &candidates);

        let package = ids
            .iter()
            .find_map(|cid| {
                candidates
                    .get(cid)
                    .and_then(|c| c.packages.iter().find(|p| p.identity() == *identity))
            })
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;

        Ok(PackageSearchItem {
            package: package.clone(),
            collections: ids,
        })
    }

    async fn search_targets(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
        query: &str,
        mode: TargetSearchMode,
    ) -> Result<TargetSearchResult, StoreError> {
        let candidates = self.candidates(identifiers);
        let needle = query.to_lowercase();

        let mut hits: HashMap<String, HashMap<PackageIdentity, HashSet<CollectionIdentifier>>> =
            HashMap::new();
        for (id, collection) in &candidates {
            for package in &collection.packages {
                for version in &package.versions {
                    for target in &version.targets {
                        let lowered = target.name.to_lowercase();
                        let is_match = match mode {
                            TargetSearchMode::Exact => lowered == needle,
                            TargetSearchMode::Prefix => lowered.starts_with(&needle),
                        };
                        if is_match {
                            hits.entry(lowered)
                                .or_default()
                                .entry(package.identity())
                                .or_default()
                                .insert(id.clone());
                        }
                    }
                }
            }
        }

        let mut items = Vec::with_capacity(hits.len());
        for (word, packages) in hits {
            let mut target_value: Option<Target> = None;
            let mut result_packages = Vec::with_capacity(packages.len());

            for (identity, collection_ids) in packages {
                let mut ids: Vec<CollectionIdentifier> = collection_ids.into_iter().collect();
                sort_newest_first(&mut ids, &candidates);

                let Some(package) = ids.iter().find_map(|cid| {
                    candidates
                        .get(cid)
                        .and_then(|c| c.packages.iter().find(|p| p.identity() == identity))
                }) else {
                    continue;
                };

                if target_value.is_none() {
                    target_value = package
                        .versions
                        .iter()
                        .flat_map(|v| &v.targets)
                        .find(|t| t.name.to_lowercase() == word)
                        .cloned();
                }

                let mut versions: Vec<(Option<semver::Version>, String)> = package
                    .versions
                    .iter()
                    .filter(|v| v.targets.iter().any(|t| t.name.to_lowercase() == word))
                    .map(|v| (v.semver(), v.version.clone()))
                    .collect();
                versions.sort_by(|a, b| b.0.cmp(&a.0));

                result_packages.push(TargetSearchPackage {
                    repository_url: package.repository_url.clone(),
                    summary: package.summary.clone(),
                    versions: versions.into_iter().map(|(_, raw)| raw).collect(),
                    collections: ids,
                });
            }

            let Some(target) = target_value else {
                continue;
            };
            result_packages.sort_by(|a, b| a.repository_url.cmp(&b.repository_url));
            items.push(TargetSearchItem {
                target,
                packages: result_packages,
            });
        }
        items.sort_by(|a, b| a.target.name.cmp(&b.target.name));

        Ok(TargetSearchResult { items })
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
