use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::{Collection, CollectionIdentifier};

/// Concurrent identifier -> collection map.
///
/// The cache holds a subset of the primary table: entries are added only
/// after a successful write and evicted only after a successful delete, so a
/// hit always matches what the database would return.
#[derive(Debug, Default)]
pub struct CollectionCache {
    entries: RwLock<HashMap<CollectionIdentifier, Collection>>,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &CollectionIdentifier) -> Option<Collection> {
        self.entries.read().unwrap().get(identifier).cloned()
    }

    pub fn put(&self, collection: Collection) {
        self.entries
            .write()
            .unwrap()
            .insert(collection.identifier.clone(), collection);
    }

    pub fn remove(&self, identifier: &CollectionIdentifier) {
        self.entries.write().unwrap().remove(identifier);
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// All cached entries for the given identifiers, in request order, or
    /// `None` if any of them is missing.
    pub fn get_all(&self, identifiers: &[CollectionIdentifier]) -> Option<Vec<Collection>> {
        let entries = self.entries.read().unwrap();
        identifiers
            .iter()
            .map(|id| entries.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_put_get_remove() {
        let cache = CollectionCache::new();
        let collection = fixtures::collection("https://example.org/c1.json");
        let id = collection.identifier.clone();

        assert!(cache.get(&id).is_none());

        cache.put(collection.clone());
        assert_eq!(cache.get(&id), Some(collection));
        assert_eq!(cache.len(), 1);

        cache.remove(&id);
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let cache = CollectionCache::new();
        let mut collection = fixtures::collection("https://example.org/c1.json");
        cache.put(collection.clone());

        collection.name = "renamed".to_string();
        cache.put(collection.clone());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&collection.identifier).unwrap().name, "renamed");
    }

    #[test]
    fn test_get_all_requires_every_key() {
        let cache = CollectionCache::new();
        let a = fixtures::collection("https://example.org/a.json");
        let b = fixtures::collection("https://example.org/b.json");
        cache.put(a.clone());

        assert!(cache
            .get_all(&[a.identifier.clone(), b.identifier.clone()])
            .is_none());

        cache.put(b.clone());
        let all = cache
            .get_all(&[b.identifier.clone(), a.identifier.clone()])
            .unwrap();
        assert_eq!(all, vec![b, a]);
    }

    #[test]
    fn test_clear() {
        let cache = CollectionCache::new();
        cache.put(fixtures::collection("https://example.org/a.json"));
        cache.put(fixtures::collection("https://example.org/b.json"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
