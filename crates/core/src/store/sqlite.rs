//! SQLite-backed collection store.
//!
//! Collections are persisted as JSON blobs in a key/value table; two FTS4
//! virtual tables index package attributes and target names for search. An
//! in-memory cache answers repeat reads and an in-memory trie accelerates
//! target-name lookups once it has been warmed up from the target index.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rayon::prelude::*;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, warn};

use super::backoff::ExponentialBackoff;
use super::cache::CollectionCache;
use super::trie::{CollectionPackage, Trie};
use super::{
    CollectionStore, DatabaseLocation, PackageSearchItem, PackageSearchResult, StoreError,
    TargetSearchItem, TargetSearchMode, TargetSearchPackage, TargetSearchResult,
};
use crate::model::{Collection, CollectionIdentifier, Package, PackageIdentity, Target};

/// Identifier lookups are chunked to keep `IN (...)` lists bounded.
const LIST_CHUNK_SIZE: usize = 100;
/// Result sets at or above this size are decoded on the rayon pool.
const PARALLEL_DECODE_THRESHOLD: usize = 100;

const PRIMARY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS package_collections(
    key   TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL);
"#;

// FTS4 with unicode61 is required; older FTS versions have different match
// semantics and are not an acceptable substitute.
const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS fts_packages USING fts4(
    collection_id_blob_base64, id, version, name, repository_url,
    summary, keywords, products, targets,
    notindexed=collection_id_blob_base64, tokenize=unicode61);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_targets USING fts4(
    collection_id_blob_base64, package_repository_url, name,
    notindexed=collection_id_blob_base64, tokenize=unicode61);
"#;

/// SQLite-backed implementation of [`CollectionStore`].
///
/// The database handle is opened lazily on first use and can be closed and
/// transparently reopened; all blocking SQL work runs on the tokio blocking
/// pool.
pub struct SqliteCollectionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    location: DatabaseLocation,
    state: Mutex<ConnectionState>,
    /// Serializes FTS update transactions; the connection admits only one
    /// transaction at a time.
    fts_lock: Mutex<()>,
    use_search_indices: AtomicBool,
    shutting_down: AtomicBool,
    target_trie: RwLock<Trie<CollectionPackage>>,
    trie_ready: AtomicBool,
    trie_warmup_started: AtomicBool,
    cache: CollectionCache,
}

enum ConnectionState {
    Idle,
    Connected(Arc<Mutex<Connection>>),
    Disconnected,
    Error(String),
}

impl SqliteCollectionStore {
    /// Create a store over the given location. The database is not opened
    /// until the first operation touches it.
    pub fn new(location: DatabaseLocation) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                location,
                state: Mutex::new(ConnectionState::Idle),
                fts_lock: Mutex::new(()),
                use_search_indices: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                target_trie: RwLock::new(Trie::new()),
                trie_ready: AtomicBool::new(false),
                trie_warmup_started: AtomicBool::new(false),
                cache: CollectionCache::new(),
            }),
        }
    }

    /// Create a store over a private in-memory database (useful for testing).
    pub fn in_memory() -> Self {
        Self::new(DatabaseLocation::Memory)
    }

    /// Drop every cached collection. Test seam; subsequent reads go back to
    /// the database.
    pub fn reset_cache(&self) {
        let dropped = self.inner.cache.len();
        self.inner.cache.clear();
        debug!("cache reset, dropped {} collections", dropped);
    }

    /// Whether the in-memory target trie has been fully populated.
    pub fn is_target_trie_ready(&self) -> bool {
        self.inner.trie_ready.load(Ordering::SeqCst)
    }

    /// Number of stored collections.
    pub async fn collection_count(&self) -> Result<u64, StoreError> {
        self.run_blocking(|inner| inner.count_blocking()).await
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<StoreInner>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(inner))
            .await
            .map_err(|e| StoreError::Database(format!("worker task failed: {}", e)))?
    }

    /// Kick off the one-shot background population of the target trie.
    ///
    /// Idempotent; the first caller wins. Until the trie is ready, target
    /// searches go through the FTS table instead.
    fn schedule_trie_warmup(&self) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.trie_warmup_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || inner.populate_target_trie()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("target trie warm-up failed: {}", e),
                Err(e) => warn!("target trie warm-up task failed: {}", e),
            }
        });
    }
}

#[async_trait]
impl CollectionStore for SqliteCollectionStore {
    async fn put(&self, collection: Collection) -> Result<Collection, StoreError> {
        let stored = self
            .run_blocking(move |inner| inner.put_blocking(collection))
            .await?;
        self.schedule_trie_warmup();
        Ok(stored)
    }

    async fn remove(&self, identifier: &CollectionIdentifier) -> Result<(), StoreError> {
        let identifier = identifier.clone();
        self.run_blocking(move |inner| inner.remove_blocking(&identifier))
            .await
    }

    async fn get(&self, identifier: &CollectionIdentifier) -> Result<Collection, StoreError> {
        let identifier = identifier.clone();
        self.run_blocking(move |inner| inner.get_blocking(&identifier))
            .await
    }

    async fn list(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
    ) -> Result<Vec<Collection>, StoreError> {
        let identifiers = identifiers.map(<[_]>::to_vec);
        self.run_blocking(move |inner| inner.list_blocking(identifiers))
            .await
    }

    async fn search_packages(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
        query: &str,
    ) -> Result<PackageSearchResult, StoreError> {
        let identifiers = identifiers.map(<[_]>::to_vec);
        let query = query.to_string();
        self.run_blocking(move |inner| inner.search_packages_blocking(identifiers, &query))
            .await
    }

    async fn find_package(
        &self,
        identity: &PackageIdentity,
        identifiers: Option<&[CollectionIdentifier]>,
    ) -> Result<PackageSearchItem, StoreError> {
        let identity = identity.clone();
        let identifiers = identifiers.map(<[_]>::to_vec);
        self.run_blocking(move |inner| inner.find_package_blocking(&identity, identifiers))
            .await
    }

    async fn search_targets(
        &self,
        identifiers: Option<&[CollectionIdentifier]>,
        query: &str,
        mode: TargetSearchMode,
    ) -> Result<TargetSearchResult, StoreError> {
        self.schedule_trie_warmup();
        let identifiers = identifiers.map(<[_]>::to_vec);
        let query = query.to_string();
        self.run_blocking(move |inner| inner.search_targets_blocking(identifiers, &query, mode))
            .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.run_blocking(|inner| inner.close_blocking()).await
    }
}

impl StoreInner {
    /// Hand out the shared connection, opening it first if the store is
    /// idle, disconnected, or its backing file vanished out-of-band.
    fn connection(&self) -> Result<Arc<Mutex<Connection>>, StoreError> {
        let mut state = self.state.lock().unwrap();

        if let ConnectionState::Connected(handle) = &*state {
            let stale =
                matches!(&self.location, DatabaseLocation::Path(path) if !path.exists());
            if !stale {
                return Ok(Arc::clone(handle));
            }
            warn!("database file disappeared, discarding stale handle");
        }
        if let ConnectionState::Error(e) = &*state {
            debug!("reopening database after failed open: {}", e);
        }

        match self.open_connection() {
            Ok(conn) => {
                let handle = Arc::new(Mutex::new(conn));
                *state = ConnectionState::Connected(Arc::clone(&handle));
                Ok(handle)
            }
            Err(e) => {
                *state = ConnectionState::Error(e.to_string());
                Err(e)
            }
        }
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let conn = match &self.location {
            DatabaseLocation::Path(path) => {
                if !path.exists() {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|e| {
                            StoreError::Database(format!(
                                "failed to create {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }
                Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?
            }
            DatabaseLocation::Memory => {
                Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?
            }
            DatabaseLocation::Temporary => {
                Connection::open("").map_err(|e| StoreError::Database(e.to_string()))?
            }
        };

        conn.execute_batch(PRIMARY_SCHEMA)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        match conn.execute_batch(FTS_SCHEMA) {
            Ok(()) => self.use_search_indices.store(true, Ordering::SeqCst),
            Err(e) => {
                warn!("full-text index unavailable, search falls back to scans: {}", e);
                self.use_search_indices.store(false, Ordering::SeqCst);
            }
        }

        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(conn)
    }

    fn put_blocking(&self, collection: Collection) -> Result<Collection, StoreError> {
        let value =
            serde_json::to_vec(&collection).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let handle = self.connection()?;

        {
            let conn = handle.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO package_collections (key, value) VALUES (?, ?)",
                params![collection.identifier.database_key(), value],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        if self.use_search_indices.load(Ordering::SeqCst) {
            let _fts = self.fts_lock.lock().unwrap();
            let id_b64 = encode_collection_id(&collection.identifier)?;

            let mut conn = handle.lock().unwrap();
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::Database(e.to_string()))?;

            tx.execute(
                "DELETE FROM fts_packages WHERE collection_id_blob_base64 = ?",
                params![id_b64],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
            tx.execute(
                "DELETE FROM fts_targets WHERE collection_id_blob_base64 = ?",
                params![id_b64],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
            {
                let identifier = collection.identifier.clone();
                let mut trie = self.target_trie.write().unwrap();
                trie.remove_where(|entry| entry.collection == identifier);
            }

            for package in &collection.packages {
                let identity = package.identity();
                // summary and keywords fall back to the parent collection's
                // description and keywords when the package has none
                let summary = package.summary.as_ref().or(collection.description.as_ref());
                let keywords = package.keywords.as_ref().or(collection.keywords.as_ref());

                for version in &package.versions {
                    let products: Vec<&str> =
                        version.products.iter().map(|p| p.name.as_str()).collect();
                    let targets: Vec<&str> =
                        version.targets.iter().map(|t| t.name.as_str()).collect();
                    tx.execute(
                        "INSERT INTO fts_packages (collection_id_blob_base64, id, version, name, \
                         repository_url, summary, keywords, products, targets) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        params![
                            id_b64,
                            identity.as_str(),
                            version.version,
                            version.package_name,
                            package.repository_url,
                            summary,
                            keywords.map(|k| k.join(" ")),
                            products.join(" "),
                            targets.join(" "),
                        ],
                    )
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                }

                let mut target_names: Vec<&str> = package
                    .versions
                    .iter()
                    .flat_map(|v| v.targets.iter().map(|t| t.name.as_str()))
                    .collect();
                target_names.sort_unstable();
                target_names.dedup();

                for name in target_names {
                    tx.execute(
                        "INSERT INTO fts_targets (collection_id_blob_base64, \
                         package_repository_url, name) VALUES (?, ?, ?)",
                        params![id_b64, package.repository_url, name],
                    )
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                    self.target_trie.write().unwrap().insert(
                        &name.to_lowercase(),
                        CollectionPackage {
                            collection: collection.identifier.clone(),
                            package: identity.clone(),
                        },
                    );
                }
            }

            tx.commit()
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        self.cache.put(collection.clone());
        Ok(collection)
    }

    fn remove_blocking(&self, identifier: &CollectionIdentifier) -> Result<(), StoreError> {
        let handle = self.connection()?;

        {
            let conn = handle.lock().unwrap();
            conn.execute(
                "DELETE FROM package_collections WHERE key = ?",
                params![identifier.database_key()],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        if self.use_search_indices.load(Ordering::SeqCst) {
            let _fts = self.fts_lock.lock().unwrap();
            let id_b64 = encode_collection_id(identifier)?;

            let mut conn = handle.lock().unwrap();
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::Database(e.to_string()))?;
            tx.execute(
                "DELETE FROM fts_packages WHERE collection_id_blob_base64 = ?",
                params![id_b64],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
            tx.execute(
                "DELETE FROM fts_targets WHERE collection_id_blob_base64 = ?",
                params![id_b64],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
            tx.commit()
                .map_err(|e| StoreError::Database(e.to_string()))?;

            let mut trie = self.target_trie.write().unwrap();
            trie.remove_where(|entry| entry.collection == *identifier);
        }

        self.cache.remove(identifier);
        Ok(())
    }

    fn get_blocking(&self, identifier: &CollectionIdentifier) -> Result<Collection, StoreError> {
        if let Some(hit) = self.cache.get(identifier) {
            return Ok(hit);
        }

        let handle = self.connection()?;
        let conn = handle.lock().unwrap();
        let blob: Vec<u8> = conn
            .query_row(
                "SELECT value FROM package_collections WHERE key = ? LIMIT 1",
                params![identifier.database_key()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(identifier.to_string())
                }
                _ => StoreError::Database(e.to_string()),
            })?;

        serde_json::from_slice(&blob).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn list_blocking(
        &self,
        identifiers: Option<Vec<CollectionIdentifier>>,
    ) -> Result<Vec<Collection>, StoreError> {
        if let Some(ids) = &identifiers {
            if let Some(cached) = self.cache.get_all(ids) {
                return Ok(cached);
            }
        }

        let handle = self.connection()?;
        let blobs: Vec<Vec<u8>> = {
            let conn = handle.lock().unwrap();
            match &identifiers {
                Some(ids) => {
                    let mut blobs = Vec::with_capacity(ids.len());
                    for chunk in ids.chunks(LIST_CHUNK_SIZE) {
                        let placeholders = vec!["?"; chunk.len()].join(", ");
                        let sql = format!(
                            "SELECT value FROM package_collections WHERE key IN ({})",
                            placeholders
                        );
                        let mut stmt = conn
                            .prepare(&sql)
                            .map_err(|e| StoreError::Database(e.to_string()))?;
                        let keys = chunk.iter().map(|id| id.database_key());
                        let rows = stmt
                            .query_map(params_from_iter(keys), |row| row.get::<_, Vec<u8>>(0))
                            .map_err(|e| StoreError::Database(e.to_string()))?;
                        for row in rows {
                            blobs.push(row.map_err(|e| StoreError::Database(e.to_string()))?);
                        }
                    }
                    blobs
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT value FROM package_collections")
                        .map_err(|e| StoreError::Database(e.to_string()))?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, Vec<u8>>(0))
                        .map_err(|e| StoreError::Database(e.to_string()))?;
                    let mut blobs = Vec::new();
                    for row in rows {
                        blobs.push(row.map_err(|e| StoreError::Database(e.to_string()))?);
                    }
                    blobs
                }
            }
        };

        let total = blobs.len();
        let mut collections: Vec<Collection> = if total >= PARALLEL_DECODE_THRESHOLD {
            blobs
                .par_iter()
                .filter_map(|blob| serde_json::from_slice(blob).ok())
                .collect()
        } else {
            blobs
                .iter()
                .filter_map(|blob| serde_json::from_slice(blob).ok())
                .collect()
        };

        if collections.len() < total {
            warn!("some stored collections could not be deserialized");
        }

        // Best-effort request order when identifiers were given.
        if let Some(ids) = &identifiers {
            let mut by_id: HashMap<CollectionIdentifier, Collection> = collections
                .drain(..)
                .map(|c| (c.identifier.clone(), c))
                .collect();
            collections = ids.iter().filter_map(|id| by_id.remove(id)).collect();
        }

        Ok(collections)
    }

    fn search_packages_blocking(
        &self,
        identifiers: Option<Vec<CollectionIdentifier>>,
        query: &str,
    ) -> Result<PackageSearchResult, StoreError> {
        let candidates = self.candidate_collections(identifiers)?;
        let mut matched: HashMap<PackageIdentity, HashSet<CollectionIdentifier>> = HashMap::new();

        if self.use_search_indices.load(Ordering::SeqCst) {
            let handle = self.connection()?;
            let conn = handle.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT collection_id_blob_base64, repository_url FROM fts_packages \
                     WHERE fts_packages MATCH ?",
                )
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![query], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| StoreError::Database(e.to_string()))?;
            for row in rows {
                let (id_b64, repository_url) =
                    row.map_err(|e| StoreError::Database(e.to_string()))?;
                let Some(collection_id) = decode_collection_id(&id_b64) else {
                    continue;
                };
                if !candidates.contains_key(&collection_id) {
                    continue;
                }
                matched
                    .entry(PackageIdentity::from_url(&repository_url))
                    .or_default()
                    .insert(collection_id);
            }
        } else {
            // Substring scan; unlike the tokenized FTS path this also finds
            // infix matches inside words.
            let needle = query.to_lowercase();
            for (id, collection) in &candidates {
                for package in &collection.packages {
                    if package_matches(collection, package, &needle) {
                        matched
                            .entry(package.identity())
                            .or_default()
                            .insert(id.clone());
                    }
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

    fn find_package_blocking(
        &self,
        identity: &PackageIdentity,
        identifiers: Option<Vec<CollectionIdentifier>>,
    ) -> Result<PackageSearchItem, StoreError> {
        let candidates = self.candidate_collections(identifiers)?;
        let mut containing: HashSet<CollectionIdentifier> = HashSet::new();

        if self.use_search_indices.load(Ordering::SeqCst) {
            let handle = self.connection()?;
            let conn = handle.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT collection_id_blob_base64, repository_url FROM fts_packages \
                     WHERE id = ?",
                )
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![identity.as_str()], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Database(e.to_string()))?;
            for row in rows {
                let id_b64 = row.map_err(|e| StoreError::Database(e.to_string()))?;
                let Some(collection_id) = decode_collection_id(&id_b64) else {
                    continue;
                };
                if candidates.contains_key(&collection_id) {
                    containing.insert(collection_id);
                }
            }
        } else {
            for (id, collection) in &candidates {
                if collection.packages.iter().any(|p| p.identity() == *identity) {
                    containing.insert(id.clone());
                }
            }
        }

        if containing.is_empty() {
            return Err(StoreError::NotFound(identity.to_string()));
        }

        // Latest processed collection wins the package value.
        let mut ids: Vec<CollectionIdentifier> = containing.into_iter().collect();
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

    fn search_targets_blocking(
        &self,
        identifiers: Option<Vec<CollectionIdentifier>>,
        query: &str,
        mode: TargetSearchMode,
    ) -> Result<TargetSearchResult, StoreError> {
        let needle = query.to_lowercase();
        let candidates = self.candidate_collections(identifiers)?;

        // word -> package identity -> collections declaring it
        let mut hits: HashMap<String, HashMap<PackageIdentity, HashSet<CollectionIdentifier>>> =
            HashMap::new();

        let fts_enabled = self.use_search_indices.load(Ordering::SeqCst);
        if fts_enabled && self.trie_ready.load(Ordering::SeqCst) {
            let words: HashMap<String, HashSet<CollectionPackage>> = {
                let trie = self.target_trie.read().unwrap();
                match mode {
                    TargetSearchMode::Exact => trie
                        .find(&needle)
                        .map(|values| HashMap::from([(needle.clone(), values)]))
                        .unwrap_or_default(),
                    TargetSearchMode::Prefix => {
                        trie.find_with_prefix(&needle).unwrap_or_default()
                    }
                }
            };
            for (word, entries) in words {
                for entry in entries {
                    if candidates.contains_key(&entry.collection) {
                        hits.entry(word.clone())
                            .or_default()
                            .entry(entry.package)
                            .or_default()
                            .insert(entry.collection);
                    }
                }
            }
        } else if fts_enabled {
            let handle = self.connection()?;
            let conn = handle.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT collection_id_blob_base64, package_repository_url, name \
                     FROM fts_targets WHERE name LIKE ?",
                )
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let pattern = match mode {
                TargetSearchMode::Exact => needle.clone(),
                TargetSearchMode::Prefix => format!("{}%", needle),
            };
            let rows = stmt
                .query_map(params![pattern], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| StoreError::Database(e.to_string()))?;
            for row in rows {
                let (id_b64, repository_url, name) =
                    row.map_err(|e| StoreError::Database(e.to_string()))?;
                let Some(collection_id) = decode_collection_id(&id_b64) else {
                    continue;
                };
                if !candidates.contains_key(&collection_id) {
                    continue;
                }
                hits.entry(name.to_lowercase())
                    .or_default()
                    .entry(PackageIdentity::from_url(&repository_url))
                    .or_default()
                    .insert(collection_id);
            }
        } else {
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

                // Versions declaring the target, newest first; versions that
                // fail to parse as semver sort last.
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

    /// Candidate set for a search: the requested collections, or everything.
    fn candidate_collections(
        &self,
        identifiers: Option<Vec<CollectionIdentifier>>,
    ) -> Result<HashMap<CollectionIdentifier, Collection>, StoreError> {
        let collections = self.list_blocking(identifiers)?;
        Ok(collections
            .into_iter()
            .map(|c| (c.identifier.clone(), c))
            .collect())
    }

    /// Read every row of the target index into the trie, then mark it ready.
    /// Aborts quietly if the store starts shutting down.
    fn populate_target_trie(&self) -> Result<(), StoreError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.connection()?;
        if !self.use_search_indices.load(Ordering::SeqCst) {
            return Ok(());
        }

        let conn = handle.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT collection_id_blob_base64, package_repository_url, name FROM fts_targets",
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for row in rows {
            if self.shutting_down.load(Ordering::SeqCst) {
                debug!("target trie warm-up aborted by shutdown");
                return Ok(());
            }

            let (id_b64, repository_url, name) =
                row.map_err(|e| StoreError::Database(e.to_string()))?;
            let Some(collection) = decode_collection_id(&id_b64) else {
                continue;
            };

            self.target_trie.write().unwrap().insert(
                &name.to_lowercase(),
                CollectionPackage {
                    collection,
                    package: PackageIdentity::from_url(&repository_url),
                },
            );
        }

        self.trie_ready.store(true, Ordering::SeqCst);
        debug!("target trie ready");
        Ok(())
    }

    fn count_blocking(&self) -> Result<u64, StoreError> {
        let handle = self.connection()?;
        let conn = handle.lock().unwrap();
        let count: u64 = conn
            .query_row("SELECT COUNT(*) FROM package_collections", [], |row| row.get(0))
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(count)
    }

    /// Close the connection, retrying with backoff while operations drain or
    /// the engine reports busy. The store ends up disconnected either way;
    /// a later operation reopens it.
    fn close_blocking(&self) -> Result<(), StoreError> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let previous = std::mem::replace(&mut *state, ConnectionState::Disconnected);
        let ConnectionState::Connected(handle) = previous else {
            return Ok(());
        };

        let mut handle = handle;
        let mut backoff = ExponentialBackoff::default();
        let mut last_error;
        loop {
            match Arc::try_unwrap(handle) {
                Ok(mutex) => {
                    let conn = mutex.into_inner().unwrap();
                    match conn.close() {
                        Ok(()) => {
                            debug!("database closed");
                            return Ok(());
                        }
                        Err((conn, e)) => {
                            last_error = e.to_string();
                            handle = Arc::new(Mutex::new(conn));
                        }
                    }
                }
                Err(shared) => {
                    last_error = "operations still in flight".to_string();
                    handle = shared;
                }
            }

            match backoff.next() {
                Some(delay) => {
                    warn!("database close failed, retrying in {:?}: {}", delay, last_error);
                    std::thread::sleep(delay);
                }
                None => {
                    return Err(StoreError::CloseFailed(format!(
                        "{} (after {} attempts)",
                        last_error,
                        backoff.attempts()
                    )));
                }
            }
        }
    }
}

fn encode_collection_id(identifier: &CollectionIdentifier) -> Result<String, StoreError> {
    let bytes =
        serde_json::to_vec(identifier).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

fn decode_collection_id(encoded: &str) -> Option<CollectionIdentifier> {
    let bytes = BASE64.decode(encoded).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn package_matches(collection: &Collection, package: &Package, needle: &str) -> bool {
    if package.repository_url.to_lowercase().contains(needle) {
        return true;
    }
    // summary and keywords fall back to the parent collection's description
    // and keywords when the package has none
    let summary = package.summary.as_ref().or(collection.description.as_ref());
    if summary.is_some_and(|s| s.to_lowercase().contains(needle)) {
        return true;
    }
    let keywords = package.keywords.as_ref().or(collection.keywords.as_ref());
    if keywords.is_some_and(|ks| ks.iter().any(|k| k.to_lowercase().contains(needle))) {
        return true;
    }
    package.versions.iter().any(|v| {
        v.package_name.to_lowercase().contains(needle)
            || v.products.iter().any(|p| p.name.to_lowercase().contains(needle))
            || v.targets.iter().any(|t| t.name.to_lowercase().contains(needle))
    })
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::testing::fixtures;

    fn create_test_store() -> SqliteCollectionStore {
        SqliteCollectionStore::in_memory()
    }

    async fn wait_for_trie(store: &SqliteCollectionStore) {
        for _ in 0..100 {
            if store.is_target_trie_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("target trie never became ready");
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let store = create_test_store();
        let collection = fixtures::collection("https://example.org/c1.json");

        let stored = store.put(collection.clone()).await.unwrap();
        assert_eq!(stored, collection);

        let fetched = store.get(&collection.identifier).await.unwrap();
        assert_eq!(fetched, collection);
    }

    #[tokio::test]
    async fn test_get_missing_returns_not_found() {
        let store = create_test_store();
        let id = CollectionIdentifier::json("https://example.org/absent.json");
        let result = store.get(&id).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_store_lists_nothing() {
        let store = create_test_store();
        let all = store.list(None).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_every_collection() {
        let store = create_test_store();
        let a = fixtures::collection("https://example.org/a.json");
        let b = fixtures::collection("https://example.org/b.json");
        let c = fixtures::collection("https://example.org/c.json");
        for collection in [&a, &b, &c] {
            store.put(collection.clone()).await.unwrap();
        }

        let mut listed = store.list(None).await.unwrap();
        listed.sort_by(|x, y| x.identifier.database_key().cmp(y.identifier.database_key()));
        assert_eq!(listed, vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_list_with_identifiers_preserves_request_order() {
        let store = create_test_store();
        let a = fixtures::collection("https://example.org/a.json");
        let b = fixtures::collection("https://example.org/b.json");
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();

        // exercise the database path, not the all-cached fast path
        store.reset_cache();

        let listed = store
            .list(Some(&[b.identifier.clone(), a.identifier.clone()]))
            .await
            .unwrap();
        assert_eq!(listed, vec![b, a]);
    }

    #[tokio::test]
    async fn test_list_fully_cached_short_circuits() {
        let store = create_test_store();
        let a = fixtures::collection("https://example.org/a.json");
        let b = fixtures::collection("https://example.org/b.json");
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();

        let listed = store
            .list(Some(&[a.identifier.clone(), b.identifier.clone()]))
            .await
            .unwrap();
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test]
    async fn test_get_does_not_populate_cache() {
        let store = create_test_store();
        let collection = fixtures::collection("https://example.org/c1.json");
        store.put(collection.clone()).await.unwrap();
        store.reset_cache();

        store.get(&collection.identifier).await.unwrap();
        assert!(store.inner.cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_after_cache_reset_reads_database() {
        let store = create_test_store();
        let collection = fixtures::collection("https://example.org/c1.json");
        store.put(collection.clone()).await.unwrap();
        store.reset_cache();

        let fetched = store.get(&collection.identifier).await.unwrap();
        assert_eq!(fetched, collection);
    }

    #[tokio::test]
    async fn test_replace_keeps_one_row_and_latest_contents() {
        let store = create_test_store();
        let mut collection = fixtures::collection("https://example.org/c1.json");
        store.put(collection.clone()).await.unwrap();

        collection.name = "updated".to_string();
        collection.packages =
            vec![fixtures::package_with_targets("https://github.com/acme/other", "2.0.0", &["Other"])];
        store.put(collection.clone()).await.unwrap();

        assert_eq!(store.collection_count().await.unwrap(), 1);
        let fetched = store.get(&collection.identifier).await.unwrap();
        assert_eq!(fetched.name, "updated");
    }

    #[tokio::test]
    async fn test_replace_cascades_to_target_index() {
        let store = create_test_store();
        let mut collection = fixtures::collection_with_packages(
            "https://example.org/c1.json",
            vec![fixtures::package_with_targets(
                "https://github.com/acme/lib",
                "1.0.0",
                &["Alpha", "Beta", "Gamma"],
            )],
        );
        store.put(collection.clone()).await.unwrap();

        collection.packages = vec![fixtures::package_with_targets(
            "https://github.com/acme/lib",
            "1.1.0",
            &["Delta"],
        )];
        store.put(collection.clone()).await.unwrap();

        let old = store
            .search_targets(None, "alpha", TargetSearchMode::Prefix)
            .await
            .unwrap();
        assert!(old.items.is_empty());

        let new = store
            .search_targets(None, "delta", TargetSearchMode::Exact)
            .await
            .unwrap();
        assert_eq!(new.items.len(), 1);
        assert_eq!(new.items[0].target.name, "Delta");
    }

    #[tokio::test]
    async fn test_remove_deletes_row_index_and_cache() {
        let store = create_test_store();
        let collection = fixtures::collection("https://example.org/c1.json");
        store.put(collection.clone()).await.unwrap();

        store.remove(&collection.identifier).await.unwrap();

        assert!(matches!(
            store.get(&collection.identifier).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.collection_count().await.unwrap(), 0);
        assert!(store.inner.cache.is_empty());

        let targets = store
            .search_targets(None, "lib", TargetSearchMode::Prefix)
            .await
            .unwrap();
        assert!(targets.items.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_an_error() {
        let store = create_test_store();
        let id = CollectionIdentifier::json("https://example.org/absent.json");
        store.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_search_packages_fts_match() {
        let store = create_test_store();
        let crypto = fixtures::collection_with_packages(
            "https://example.org/crypto.json",
            vec![fixtures::package_with_summary(
                "https://github.com/acme/crypto-kit",
                "cryptography primitives",
            )],
        );
        let other = fixtures::collection("https://example.org/other.json");
        store.put(crypto.clone()).await.unwrap();
        store.put(other).await.unwrap();

        let result = store.search_packages(None, "cryptography").await.unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(
            result.items[0].package.repository_url,
            "https://github.com/acme/crypto-kit"
        );
        assert_eq!(result.items[0].collections, vec![crypto.identifier]);
    }

    #[tokio::test]
    async fn test_search_packages_fts_does_not_match_infix() {
        let store = create_test_store();
        store
            .put(fixtures::collection_with_packages(
                "https://example.org/crypto.json",
                vec![fixtures::package_with_summary(
                    "https://github.com/acme/cipherlib",
                    "cryptography primitives",
                )],
            ))
            .await
            .unwrap();

        // tokenized match: "crypto" is not a token of "cryptography"
        let result = store.search_packages(None, "crypto").await.unwrap();
        assert!(result.items.is_empty());
    }

    #[tokio::test]
    async fn test_search_packages_fallback_matches_substring() {
        let store = create_test_store();
        store
            .put(fixtures::collection_with_packages(
                "https://example.org/crypto.json",
                vec![fixtures::package_with_summary(
                    "https://github.com/acme/crypto-kit",
                    "cryptography primitives",
                )],
            ))
            .await
            .unwrap();

        store.inner.use_search_indices.store(false, Ordering::SeqCst);

        let result = store.search_packages(None, "tography").await.unwrap();
        assert_eq!(result.items.len(), 1);
    }

    #[tokio::test]
    async fn test_search_packages_inherits_collection_description_and_keywords() {
        let store = create_test_store();
        let mut package = fixtures::package("https://github.com/acme/toolbelt");
        package.summary = None;
        let mut collection =
            fixtures::collection_with_packages("https://example.org/c1.json", vec![package]);
        collection.description = Some("handy developer utilities".to_string());
        collection.keywords = Some(vec!["devtools".to_string()]);
        store.put(collection.clone()).await.unwrap();

        // the index rows carry the inherited values
        let by_description = store.search_packages(None, "utilities").await.unwrap();
        assert_eq!(by_description.items.len(), 1);
        let by_keyword = store.search_packages(None, "devtools").await.unwrap();
        assert_eq!(by_keyword.items.len(), 1);

        // the fallback scan applies the same inheritance
        store.inner.use_search_indices.store(false, Ordering::SeqCst);
        let fallback = store.search_packages(None, "utilit").await.unwrap();
        assert_eq!(fallback.items.len(), 1);
        assert_eq!(
            fallback.items[0].package.repository_url,
            "https://github.com/acme/toolbelt"
        );
    }

    #[tokio::test]
    async fn test_search_packages_restricted_to_candidates() {
        let store = create_test_store();
        let a = fixtures::collection_with_packages(
            "https://example.org/a.json",
            vec![fixtures::package_with_summary(
                "https://github.com/acme/networking",
                "networking toolkit",
            )],
        );
        let b = fixtures::collection_with_packages(
            "https://example.org/b.json",
            vec![fixtures::package_with_summary(
                "https://github.com/acme/net-extras",
                "networking toolkit",
            )],
        );
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();

        let result = store
            .search_packages(Some(&[a.identifier.clone()]), "networking")
            .await
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(
            result.items[0].package.repository_url,
            "https://github.com/acme/networking"
        );
    }

    #[tokio::test]
    async fn test_search_packages_bad_match_expression_is_an_error() {
        let store = create_test_store();
        store
            .put(fixtures::collection("https://example.org/c1.json"))
            .await
            .unwrap();

        let result = store.search_packages(None, "\"").await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_find_package_latest_processed_wins() {
        let store = create_test_store();

        let mut old = fixtures::collection_with_packages(
            "https://example.org/old.json",
            vec![fixtures::package_with_summary(
                "https://github.com/acme/lib",
                "old summary",
            )],
        );
        old.last_processed_at = fixtures::timestamp(2024, 1, 1);

        let mut new = fixtures::collection_with_packages(
            "https://example.org/new.json",
            vec![fixtures::package_with_summary(
                "https://github.com/acme/lib",
                "new summary",
            )],
        );
        new.last_processed_at = fixtures::timestamp(2024, 6, 1);

        store.put(old.clone()).await.unwrap();
        store.put(new.clone()).await.unwrap();

        let identity = PackageIdentity::from_url("https://github.com/acme/lib");
        let item = store.find_package(&identity, None).await.unwrap();

        assert_eq!(item.package.summary.as_deref(), Some("new summary"));
        assert_eq!(
            item.collections,
            vec![new.identifier.clone(), old.identifier.clone()]
        );
    }

    #[tokio::test]
    async fn test_find_package_not_found() {
        let store = create_test_store();
        store
            .put(fixtures::collection("https://example.org/c1.json"))
            .await
            .unwrap();

        let identity = PackageIdentity::from_url("https://github.com/acme/absent");
        let result = store.find_package(&identity, None).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_search_targets_fts_path_exact_and_prefix() {
        let store = create_test_store();
        // pretend warm-up already ran so the query takes the FTS path
        store.inner.trie_warmup_started.store(true, Ordering::SeqCst);

        store
            .put(fixtures::collection_with_packages(
                "https://example.org/c1.json",
                vec![fixtures::package_with_targets(
                    "https://github.com/acme/netkit",
                    "1.0.0",
                    &["NetworkCore", "NetworkTests"],
                )],
            ))
            .await
            .unwrap();
        assert!(!store.is_target_trie_ready());

        let prefixed = store
            .search_targets(None, "network", TargetSearchMode::Prefix)
            .await
            .unwrap();
        assert_eq!(prefixed.items.len(), 2);

        let exact = store
            .search_targets(None, "network", TargetSearchMode::Exact)
            .await
            .unwrap();
        assert!(exact.items.is_empty());

        let exact_full = store
            .search_targets(None, "networkcore", TargetSearchMode::Exact)
            .await
            .unwrap();
        assert_eq!(exact_full.items.len(), 1);
        assert_eq!(exact_full.items[0].target.name, "NetworkCore");
    }

    #[tokio::test]
    async fn test_search_targets_via_trie_after_warmup() {
        let store = create_test_store();
        store
            .put(fixtures::collection_with_packages(
                "https://example.org/c1.json",
                vec![fixtures::package_with_targets(
                    "https://github.com/acme/netkit",
                    "1.0.0",
                    &["NetworkCore"],
                )],
            ))
            .await
            .unwrap();
        wait_for_trie(&store).await;

        let prefixed = store
            .search_targets(None, "network", TargetSearchMode::Prefix)
            .await
            .unwrap();
        assert_eq!(prefixed.items.len(), 1);
        assert_eq!(prefixed.items[0].target.name, "NetworkCore");
        assert_eq!(
            prefixed.items[0].packages[0].repository_url,
            "https://github.com/acme/netkit"
        );

        let exact = store
            .search_targets(None, "network", TargetSearchMode::Exact)
            .await
            .unwrap();
        assert!(exact.items.is_empty());
    }

    #[tokio::test]
    async fn test_target_search_is_case_insensitive() {
        let store = create_test_store();
        store
            .put(fixtures::collection_with_packages(
                "https://example.org/c1.json",
                vec![fixtures::package_with_targets(
                    "https://github.com/acme/netkit",
                    "1.0.0",
                    &["NetworkCore"],
                )],
            ))
            .await
            .unwrap();
        wait_for_trie(&store).await;

        let lower = store
            .search_targets(None, "networkcore", TargetSearchMode::Exact)
            .await
            .unwrap();
        let upper = store
            .search_targets(None, "NETWORKCORE", TargetSearchMode::Exact)
            .await
            .unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.items.len(), 1);
    }

    #[tokio::test]
    async fn test_prefix_results_superset_of_exact() {
        let store = create_test_store();
        store
            .put(fixtures::collection_with_packages(
                "https://example.org/c1.json",
                vec![fixtures::package_with_targets(
                    "https://github.com/acme/netkit",
                    "1.0.0",
                    &["Net", "NetworkCore"],
                )],
            ))
            .await
            .unwrap();
        wait_for_trie(&store).await;

        let exact = store
            .search_targets(None, "net", TargetSearchMode::Exact)
            .await
            .unwrap();
        let prefixed = store
            .search_targets(None, "net", TargetSearchMode::Prefix)
            .await
            .unwrap();

        assert_eq!(exact.items.len(), 1);
        assert_eq!(prefixed.items.len(), 2);
        for item in &exact.items {
            assert!(prefixed.items.iter().any(|p| p.target == item.target));
        }
    }

    #[tokio::test]
    async fn test_target_versions_sorted_newest_first() {
        let store = create_test_store();
        let package = fixtures::package_with_versions(
            "https://github.com/acme/netkit",
            &[("0.9.0", &["NetworkCore"]), ("1.10.0", &["NetworkCore"]), ("1.2.0", &["NetworkCore"])],
        );
        store
            .put(fixtures::collection_with_packages(
                "https://example.org/c1.json",
                vec![package],
            ))
            .await
            .unwrap();
        wait_for_trie(&store).await;

        let result = store
            .search_targets(None, "networkcore", TargetSearchMode::Exact)
            .await
            .unwrap();
        assert_eq!(
            result.items[0].packages[0].versions,
            vec!["1.10.0", "1.2.0", "0.9.0"]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = create_test_store();
        store
            .put(fixtures::collection("https://example.org/c1.json"))
            .await
            .unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_reopen_after_close() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SqliteCollectionStore::new(DatabaseLocation::Path(
            temp_dir.path().join("collections.db"),
        ));
        let collection = fixtures::collection("https://example.org/c1.json");
        store.put(collection.clone()).await.unwrap();

        store.close().await.unwrap();
        store.reset_cache();

        let fetched = store.get(&collection.identifier).await.unwrap();
        assert_eq!(fetched, collection);
    }

    #[tokio::test]
    async fn test_file_based_store_creates_parent_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("c.db");
        let store = SqliteCollectionStore::new(DatabaseLocation::Path(db_path.clone()));

        store
            .put(fixtures::collection("https://example.org/c1.json"))
            .await
            .unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_survives_database_file_deleted_out_of_band() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("collections.db");
        let store = SqliteCollectionStore::new(DatabaseLocation::Path(db_path.clone()));
        store
            .put(fixtures::collection("https://example.org/c1.json"))
            .await
            .unwrap();

        std::fs::remove_file(&db_path).unwrap();
        std::fs::remove_file(db_path.with_extension("db-wal")).ok();
        std::fs::remove_file(db_path.with_extension("db-shm")).ok();

        // the stale handle is discarded and a fresh (empty) database opened
        let listed = store.list(None).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_rows() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("collections.db");

        let store = SqliteCollectionStore::new(DatabaseLocation::Path(db_path.clone()));
        store
            .put(fixtures::collection("https://example.org/good.json"))
            .await
            .unwrap();
        store.close().await.unwrap();

        // plant a row that will not decode
        let conn = Connection::open(&db_path).unwrap();
        conn.execute(
            "INSERT INTO package_collections (key, value) VALUES (?, ?)",
            params!["https://example.org/bad.json", b"not json".to_vec()],
        )
        .unwrap();
        conn.close().unwrap();

        let store = SqliteCollectionStore::new(DatabaseLocation::Path(db_path));
        let listed = store.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].identifier,
            CollectionIdentifier::json("https://example.org/good.json")
        );
    }

    #[tokio::test]
    async fn test_get_corrupt_row_is_surfaced() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("collections.db");

        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(PRIMARY_SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO package_collections (key, value) VALUES (?, ?)",
            params!["https://example.org/bad.json", b"not json".to_vec()],
        )
        .unwrap();
        conn.close().unwrap();

        let store = SqliteCollectionStore::new(DatabaseLocation::Path(db_path));
        let result = store
            .get(&CollectionIdentifier::json("https://example.org/bad.json"))
            .await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_collection_id_encoding_round_trips() {
        let id = CollectionIdentifier::json("https://example.org/c1.json");
        let encoded = encode_collection_id(&id).unwrap();
        assert_eq!(decode_collection_id(&encoded), Some(id));
    }

    #[tokio::test]
    async fn test_concurrent_puts_same_identifier_last_writer_wins() {
        let store = Arc::new(create_test_store());
        let mut first = fixtures::collection("https://example.org/c1.json");
        first.name = "first".to_string();
        let mut second = first.clone();
        second.name = "second".to_string();

        let s1 = Arc::clone(&store);
        let s2 = Arc::clone(&store);
        let c1 = first.clone();
        let c2 = second.clone();
        let (r1, r2) = tokio::join!(s1.put(c1), s2.put(c2));
        r1.unwrap();
        r2.unwrap();

        assert_eq!(store.collection_count().await.unwrap(), 1);
        let stored = store.get(&first.identifier).await.unwrap();
        assert!(stored.name == "first" || stored.name == "second");
    }
}
