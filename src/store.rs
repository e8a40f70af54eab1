//! Single-shard document store
//!
//! A `DocumentStore` holds one document sequence plus its indices and the
//! query engine, persisted as a JSON array file with a sibling `.index`
//! file. Removal leaves a `null` tombstone at the document's position so
//! positions stay stable for index entries; every read through the sequence
//! tombstone-checks.
//!
//! All operations are asynchronous and deliberately defer by at least one
//! scheduler tick before doing any work, so callers can never observe
//! completion synchronously and the access guard has interleaving points to
//! catch misuse at. Exhaustive scans run in fixed-size pages with a yield
//! between pages so a large collection cannot monopolize the runtime.

use crate::config::StoreConfig;
use crate::document::{id_key, index_key, Document, ID_FIELD};
use crate::error::DocshardError;
use crate::guard::{AccessGuard, AccessKind, GuardMode};
use crate::index::{
    intersect_sorted, search_token_positions, sibling_path, union_sorted, FilterIndex, IndexFile,
    PositionList, SearchIndex, SideFile, FILTER_INDEX_SUFFIX, INDEX_SUFFIX, SEARCH_CATEGORY,
    SEARCH_INDEX_SUFFIX,
};
use crate::query::{Query, ValueSpec};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::yield_now;
use tracing::{debug, info, warn};

/// The operation surface shared by [`DocumentStore`] and
/// [`crate::ShardedStore`].
///
/// Every method completes only after at least one scheduling boundary.
/// `find` returns deep, independent copies; `find_no_deep_copy` returns
/// shared immutable views as a performance escape hatch.
#[async_trait]
pub trait DocumentOps {
    /// Append one document; returns the number inserted (0 when the
    /// document's `_id` was already present)
    async fn insert(&self, doc: Document) -> Result<usize>;

    /// Append a batch; documents whose `_id` is already present are
    /// skipped with a warning rather than failing the batch
    async fn insert_many(&self, docs: Vec<Document>) -> Result<usize>;

    /// Replace the document whose `_id` the query names; errors with
    /// `NotFound` when that id is not indexed
    async fn update(&self, query: &Query, record: Document) -> Result<()>;

    /// Like `update`, but inserts instead of failing on a missing `_id`
    async fn upsert(&self, query: &Query, record: Document) -> Result<()>;

    /// Remove matches; the empty query clears all documents and indices
    async fn remove(&self, query: &Query) -> Result<()>;

    /// All matching documents as deep copies, in insertion order
    async fn find(&self, query: &Query) -> Result<Vec<Document>>;

    /// The first matching document, or `None`
    async fn find_one(&self, query: &Query) -> Result<Option<Document>>;

    /// All matching documents as shared immutable views
    async fn find_no_deep_copy(&self, query: &Query) -> Result<Vec<Arc<Document>>>;

    /// Persist the document sequence and merged index tables
    async fn save(&self) -> Result<()>;

    /// (Re)merge separately-built filter/search index side-files
    async fn load_indices(&self) -> Result<()>;
}

#[derive(Default)]
struct StoreState {
    /// Document arena; a removed document leaves a `None` tombstone
    documents: Vec<Option<Arc<Document>>>,
    /// `_id` string form -> position; maintained incrementally
    id_index: BTreeMap<String, usize>,
    /// field -> value string form -> positions; loaded, dropped on mutation
    filter_index: FilterIndex,
    /// token -> positions; loaded, dropped on mutation
    search_index: SearchIndex,
    /// Last full find result, keyed by the normalized query string
    query_cache: Option<(String, PositionList)>,
}

/// One shard's documents, indices, and query engine
pub struct DocumentStore {
    name: String,
    file_path: PathBuf,
    scan_page_size: usize,
    guard: AccessGuard,
    state: Mutex<StoreState>,
}

impl DocumentStore {
    /// Open (or create empty) the store described by the configuration.
    ///
    /// A missing documents file means an empty store, not an error.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let mode = if config.strict_guard {
            GuardMode::Strict
        } else {
            GuardMode::Warn
        };
        let path = config.directory_path.join(&config.store_name);
        Self::open_at(path, config.store_name.clone(), config.scan_page_size, mode).await
    }

    /// Open a store at an explicit file path. Used by the sharded store,
    /// which passes `GuardMode::PassThrough` because access is already
    /// bracketed by its own outer guard.
    pub(crate) async fn open_at(
        file_path: PathBuf,
        name: String,
        scan_page_size: usize,
        guard_mode: GuardMode,
    ) -> Result<Self> {
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut state = StoreState::default();
        match tokio::fs::read(&file_path).await {
            Ok(bytes) => {
                let slots: Vec<Option<Document>> = serde_json::from_slice(&bytes)?;
                state.documents = slots.into_iter().map(|s| s.map(Arc::new)).collect();
                debug!(store = %name, documents = state.documents.len(), "loaded documents");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(store = %name, "no documents file, starting empty");
            }
            Err(e) => return Err(e.into()),
        }

        let index_path = sibling_path(&file_path, INDEX_SUFFIX);
        match tokio::fs::read(&index_path).await {
            Ok(bytes) => {
                let mut file: IndexFile = serde_json::from_slice(&bytes)?;
                state.id_index = file.id;
                state.search_index = file.categories.remove(SEARCH_CATEGORY).unwrap_or_default();
                state.filter_index = file.categories;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // No index file: the id index is required for operation, so
                // rebuild it from the sequence.
                for (pos, slot) in state.documents.iter().enumerate() {
                    if let Some(doc) = slot {
                        if let Some(key) = id_key(doc) {
                            state.id_index.insert(key, pos);
                        }
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        let (filter, search) = read_side_files(&file_path).await?;
        for (category, table) in filter {
            state.filter_index.insert(category, table);
        }
        if let Some(search) = search {
            state.search_index = search;
        }

        let guard = AccessGuard::new(name.clone(), guard_mode);
        Ok(Self {
            name,
            file_path,
            scan_page_size,
            guard,
            state: Mutex::new(state),
        })
    }

    /// The store's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the persisted document array
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Number of live (non-tombstoned) documents
    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .documents
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Evaluate a query to matching positions, in position order.
    ///
    /// Indexed candidates are computed under the lock; the residual pass
    /// runs over a snapshot so the lock is never held across a yield.
    async fn evaluate(&self, query: &Query, limit: Option<usize>) -> Result<PositionList> {
        let snapshot;
        let mut residual: Vec<usize> = Vec::new();
        let mut indexed: Option<PositionList> = None;
        let mut text_in_residual = !query.text.is_empty();
        {
            let state = self.state.lock();

            if limit.is_none() {
                if let Some((key, positions)) = &state.query_cache {
                    if *key == query.cache_key() {
                        return Ok(positions.clone());
                    }
                }
            }

            // 1. Empty query: every live document.
            if query.is_empty() {
                let mut all: PositionList = state
                    .documents
                    .iter()
                    .enumerate()
                    .filter_map(|(pos, slot)| slot.is_some().then_some(pos))
                    .collect();
                if let Some(limit) = limit {
                    all.truncate(limit);
                }
                return Ok(all);
            }

            // 2. The one strict shape: exactly {_id: scalar}.
            if let Some(id) = query.single_id() {
                let key = index_key(id)
                    .ok_or_else(|| DocshardError::invalid_query("_id must be a scalar"))?;
                return match state.id_index.get(&key) {
                    Some(&pos) if matches!(state.documents.get(pos), Some(Some(_))) => {
                        Ok(vec![pos])
                    }
                    _ => Err(DocshardError::IndexNotFound { id: key }),
                };
            }

            // 3. Resolve filters through the filter index where possible.
            // Null-valued specs cannot be represented in an index table and
            // always fall through to the exhaustive pass.
            for (i, filter) in query.filters.iter().enumerate() {
                let positions = state
                    .filter_index
                    .get(&filter.field)
                    .and_then(|table| indexed_lookup(table, &filter.spec));
                match positions {
                    Some(positions) => {
                        indexed = Some(match indexed.take() {
                            Some(acc) => intersect_sorted(&acc, &positions),
                            None => positions,
                        });
                    }
                    None => residual.push(i),
                }
            }

            // 4. $text through the search index: AND tokens within a
            // filter, OR across filters, substring expansion per token.
            if !query.text.is_empty() && !state.search_index.is_empty() {
                let mut text_result = PositionList::new();
                for tokens in &query.text {
                    let mut filter_result: Option<PositionList> = None;
                    for token in tokens {
                        let positions = search_token_positions(&state.search_index, token);
                        filter_result = Some(match filter_result.take() {
                            Some(acc) => intersect_sorted(&acc, &positions),
                            None => positions,
                        });
                    }
                    if let Some(result) = filter_result {
                        text_result = union_sorted(&text_result, &result);
                    }
                }
                // 5. Intersect with the filter-index candidates.
                indexed = Some(match indexed.take() {
                    Some(acc) => intersect_sorted(&acc, &text_result),
                    None => text_result,
                });
                text_in_residual = false;
            }

            snapshot = state.documents.clone();
        }

        // 6-7. Exhaustive pass over the candidate set (or the whole
        // sequence when no index applied), tombstone-checking every read,
        // paged with a yield so long scans do not starve other operations.
        let candidates: PositionList = match indexed {
            Some(candidates) => candidates,
            None => (0..snapshot.len()).collect(),
        };

        let mut matched = PositionList::new();
        for (i, &pos) in candidates.iter().enumerate() {
            if i > 0 && i % self.scan_page_size == 0 {
                yield_now().await;
            }
            if let Some(doc) = snapshot.get(pos).and_then(|slot| slot.as_deref()) {
                if query.matches_residual(doc, &residual, text_in_residual) {
                    matched.push(pos);
                    if let Some(limit) = limit {
                        if matched.len() >= limit {
                            return Ok(matched);
                        }
                    }
                }
            }
        }

        if limit.is_none() {
            self.state.lock().query_cache = Some((query.cache_key(), matched.clone()));
        }
        Ok(matched)
    }

    fn collect_positions(&self, positions: &[usize]) -> Vec<Arc<Document>> {
        let state = self.state.lock();
        positions
            .iter()
            .filter_map(|&pos| state.documents.get(pos).and_then(|slot| slot.clone()))
            .collect()
    }
}

/// Look one filter up in a field's index table. `None` means the filter
/// cannot be resolved through the index (pattern specs, null-valued specs).
fn indexed_lookup(
    table: &BTreeMap<String, PositionList>,
    spec: &ValueSpec,
) -> Option<PositionList> {
    match spec {
        ValueSpec::Eq(value) => {
            let key = index_key(value)?;
            Some(table.get(&key).cloned().unwrap_or_default())
        }
        ValueSpec::In(values) => {
            let mut result = PositionList::new();
            for value in values {
                let key = index_key(value)?;
                if let Some(positions) = table.get(&key) {
                    result = union_sorted(&result, positions);
                }
            }
            Some(result)
        }
        ValueSpec::Pattern(_) => None,
    }
}

/// Read the builder side-files next to a documents file. Missing files
/// yield empty tables.
async fn read_side_files(file_path: &Path) -> Result<(FilterIndex, Option<SearchIndex>)> {
    let mut filter = FilterIndex::new();
    match tokio::fs::read(sibling_path(file_path, FILTER_INDEX_SUFFIX)).await {
        Ok(bytes) => filter = serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut search = None;
    match tokio::fs::read(sibling_path(file_path, SEARCH_INDEX_SUFFIX)).await {
        Ok(bytes) => {
            let mut side: SideFile = serde_json::from_slice(&bytes)?;
            search = side.remove(SEARCH_CATEGORY);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    Ok((filter, search))
}

#[async_trait]
impl DocumentOps for DocumentStore {
    async fn insert(&self, doc: Document) -> Result<usize> {
        self.insert_many(vec![doc]).await
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<usize> {
        let _permit = self.guard.enter(AccessKind::Write, "insert")?;
        yield_now().await;

        let mut state = self.state.lock();
        let mut inserted = 0;
        for doc in docs {
            if let Some(key) = id_key(&doc) {
                if state.id_index.contains_key(&key) {
                    warn!(store = %self.name, id = %key, "skipping insert of duplicate _id");
                    continue;
                }
                let pos = state.documents.len();
                state.id_index.insert(key, pos);
            }
            state.documents.push(Some(Arc::new(doc)));
            inserted += 1;
        }
        // Loaded filter/search tables cannot describe the new documents;
        // drop them rather than patch them.
        state.filter_index.clear();
        state.search_index.clear();
        state.query_cache = None;
        Ok(inserted)
    }

    async fn update(&self, query: &Query, record: Document) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "update")?;
        yield_now().await;

        let id = query
            .single_id()
            .ok_or_else(|| DocshardError::missing_field("update", ID_FIELD))?
            .clone();
        let key =
            index_key(&id).ok_or_else(|| DocshardError::missing_field("update", ID_FIELD))?;

        let mut record = record;
        record.insert(ID_FIELD.to_string(), id);

        let mut state = self.state.lock();
        match state.id_index.get(&key) {
            Some(&pos) => {
                state.documents[pos] = Some(Arc::new(record));
                state.filter_index.clear();
                state.search_index.clear();
                state.query_cache = None;
                Ok(())
            }
            None => Err(DocshardError::NotFound { id: key }),
        }
    }

    async fn upsert(&self, query: &Query, record: Document) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "upsert")?;
        yield_now().await;

        let id = query
            .single_id()
            .ok_or_else(|| DocshardError::missing_field("upsert", ID_FIELD))?
            .clone();
        let key =
            index_key(&id).ok_or_else(|| DocshardError::missing_field("upsert", ID_FIELD))?;

        let mut record = record;
        record.insert(ID_FIELD.to_string(), id);

        let mut state = self.state.lock();
        match state.id_index.get(&key) {
            Some(&pos) => {
                state.documents[pos] = Some(Arc::new(record));
            }
            None => {
                let pos = state.documents.len();
                state.id_index.insert(key, pos);
                state.documents.push(Some(Arc::new(record)));
            }
        }
        state.filter_index.clear();
        state.search_index.clear();
        state.query_cache = None;
        Ok(())
    }

    async fn remove(&self, query: &Query) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "remove")?;
        yield_now().await;

        if query.is_empty() {
            let mut state = self.state.lock();
            state.documents.clear();
            state.id_index.clear();
            state.filter_index.clear();
            state.search_index.clear();
            state.query_cache = None;
            info!(store = %self.name, "cleared all documents and indices");
            return Ok(());
        }

        let positions = self.evaluate(query, None).await?;
        let mut state = self.state.lock();
        for pos in positions {
            // Tombstone the slot; positions of later documents stay valid.
            // Filter/search index entries are not repaired and become
            // misses through the tombstone check.
            if let Some(doc) = state.documents.get_mut(pos).and_then(|slot| slot.take()) {
                if let Some(key) = id_key(&doc) {
                    state.id_index.remove(&key);
                }
            }
        }
        state.query_cache = None;
        Ok(())
    }

    async fn find(&self, query: &Query) -> Result<Vec<Document>> {
        let _permit = self.guard.enter(AccessKind::Read, "find")?;
        yield_now().await;

        let positions = self.evaluate(query, None).await?;
        // Deep, independent copies: callers cannot reach store internals.
        Ok(self
            .collect_positions(&positions)
            .into_iter()
            .map(|doc| (*doc).clone())
            .collect())
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Document>> {
        let _permit = self.guard.enter(AccessKind::Read, "findOne")?;
        yield_now().await;

        let positions = self.evaluate(query, Some(1)).await?;
        Ok(self
            .collect_positions(&positions)
            .into_iter()
            .next()
            .map(|doc| (*doc).clone()))
    }

    async fn find_no_deep_copy(&self, query: &Query) -> Result<Vec<Arc<Document>>> {
        let _permit = self.guard.enter(AccessKind::Read, "findNoDeepCopy")?;
        yield_now().await;

        let positions = self.evaluate(query, None).await?;
        Ok(self.collect_positions(&positions))
    }

    async fn save(&self) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "save")?;
        yield_now().await;

        let (documents, index_file) = {
            let state = self.state.lock();
            let mut file = IndexFile {
                id: state.id_index.clone(),
                categories: state.filter_index.clone(),
            };
            if !state.search_index.is_empty() {
                file.categories
                    .insert(SEARCH_CATEGORY.to_string(), state.search_index.clone());
            }
            (state.documents.clone(), file)
        };

        // Each document is serialized and written individually; every
        // write_all drains the file before the next document is produced,
        // so a large set is never buffered wholesale. Tombstones persist
        // as `null` to keep positions stable across a reload.
        let mut out = tokio::fs::File::create(&self.file_path).await?;
        out.write_all(b"[").await?;
        for (i, slot) in documents.iter().enumerate() {
            if i > 0 {
                out.write_all(b",").await?;
            }
            out.write_all(b"\n").await?;
            let text = match slot {
                Some(doc) => serde_json::to_string_pretty(doc.as_ref())?,
                None => "null".to_string(),
            };
            out.write_all(b"  ").await?;
            out.write_all(text.replace('\n', "\n  ").as_bytes()).await?;
        }
        out.write_all(b"\n]\n").await?;
        out.flush().await?;

        let index_path = sibling_path(&self.file_path, INDEX_SUFFIX);
        tokio::fs::write(&index_path, serde_json::to_string_pretty(&index_file)?).await?;

        info!(store = %self.name, documents = documents.len(), "saved store");
        Ok(())
    }

    async fn load_indices(&self) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "loadIndices")?;
        yield_now().await;

        let (filter, search) = read_side_files(&self.file_path).await?;
        let mut state = self.state.lock();
        for (category, table) in filter {
            state.filter_index.insert(category, table);
        }
        if let Some(search) = search {
            state.search_index = search;
        }
        state.query_cache = None;
        debug!(store = %self.name, "merged index side-files");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    async fn store_in(dir: &TempDir) -> DocumentStore {
        let config = StoreConfig::new()
            .directory_path(dir.path())
            .store_name("test");
        DocumentStore::open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_find_all() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;

        let inserted = store
            .insert_many(vec![doc(json!({"a": 1})), doc(json!({"a": 2}))])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let all = store.find(&Query::empty()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], doc(json!({"a": 1})));
        assert_eq!(all[1], doc(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_filter_find_insertion_order() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store
            .insert_many(vec![
                doc(json!({"prop1": "A", "prop2": "B"})),
                doc(json!({"prop1": "C", "prop2": "A"})),
                doc(json!({"prop1": "A", "prop2": "Z"})),
            ])
            .await
            .unwrap();

        let found = store
            .find(&Query::empty().eq("prop1", json!("A")))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].get("prop2"), Some(&json!("B")));
        assert_eq!(found[1].get("prop2"), Some(&json!("Z")));
    }

    #[tokio::test]
    async fn test_null_filter_matches_absent_or_null() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store
            .insert_many(vec![
                doc(json!({"prop1": null, "prop2": "B"})),
                doc(json!({"prop1": "C", "prop2": "A"})),
                doc(json!({"prop2": "Z"})),
            ])
            .await
            .unwrap();

        let found = store
            .find(&Query::empty().eq("prop1", json!(null)))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].get("prop2"), Some(&json!("B")));
        assert_eq!(found[1].get("prop2"), Some(&json!("Z")));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let inserted = store
            .insert_many(vec![
                doc(json!({"_id": 1, "v": "first"})),
                doc(json!({"_id": 1, "v": "dup"})),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let found = store
            .find(&Query::empty().eq("_id", json!(1)))
            .await
            .unwrap();
        assert_eq!(found[0].get("v"), Some(&json!("first")));
    }

    #[tokio::test]
    async fn test_id_find_is_strict() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store.insert(doc(json!({"_id": "x"}))).await.unwrap();

        let miss = store.find(&Query::empty().eq("_id", json!("y"))).await;
        assert!(matches!(miss, Err(DocshardError::IndexNotFound { .. })));
        // a non-id miss is just an empty result
        let empty = store
            .find(&Query::empty().eq("other", json!("y")))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_upsert() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store.insert(doc(json!({"_id": 1, "v": "a"}))).await.unwrap();

        let id_query = Query::empty().eq("_id", json!(1));
        store
            .update(&id_query, doc(json!({"v": "b"})))
            .await
            .unwrap();
        let found = store.find_one(&id_query).await.unwrap().unwrap();
        assert_eq!(found.get("v"), Some(&json!("b")));
        assert_eq!(found.get("_id"), Some(&json!(1)));

        let missing = Query::empty().eq("_id", json!(2));
        let err = store.update(&missing, doc(json!({"v": "c"}))).await;
        assert!(matches!(err, Err(DocshardError::NotFound { .. })));

        store
            .upsert(&missing, doc(json!({"v": "c"})))
            .await
            .unwrap();
        assert_eq!(store.live_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_leaves_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store
            .insert_many(vec![
                doc(json!({"_id": 1, "k": "a"})),
                doc(json!({"_id": 2, "k": "b"})),
                doc(json!({"_id": 3, "k": "a"})),
            ])
            .await
            .unwrap();

        store
            .remove(&Query::empty().eq("_id", json!(2)))
            .await
            .unwrap();
        assert_eq!(store.live_count(), 2);

        // positions of the survivors are unaffected
        let found = store
            .find(&Query::empty().eq("k", json!("a")))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let gone = store.find(&Query::empty().eq("_id", json!(2))).await;
        assert!(matches!(gone, Err(DocshardError::IndexNotFound { .. })));
    }

    #[tokio::test]
    async fn test_remove_empty_query_clears_store() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store
            .insert_many(vec![doc(json!({"_id": 1})), doc(json!({"a": 2}))])
            .await
            .unwrap();

        store.remove(&Query::empty()).await.unwrap();
        assert!(store.find(&Query::empty()).await.unwrap().is_empty());
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test]
    async fn test_find_returns_independent_copies() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store.insert(doc(json!({"_id": 1, "v": "a"}))).await.unwrap();

        let mut found = store.find(&Query::empty()).await.unwrap();
        found[0].insert("v".to_string(), json!("mutated"));

        let again = store.find(&Query::empty()).await.unwrap();
        assert_eq!(again[0].get("v"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn test_paged_scan_finds_everything() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new()
            .directory_path(dir.path())
            .store_name("paged")
            .scan_page_size(7);
        let store = DocumentStore::open(&config).await.unwrap();

        let docs: Vec<Document> = (0..100)
            .map(|i| doc(json!({"n": i, "parity": i % 2})))
            .collect();
        store.insert_many(docs).await.unwrap();

        let even = store
            .find(&Query::empty().eq("parity", json!(0)))
            .await
            .unwrap();
        assert_eq!(even.len(), 50);

        let first = store
            .find_one(&Query::empty().eq("parity", json!(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_result_cache_invalidated_by_insert() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let query = Query::empty().eq("k", json!("a"));

        store.insert(doc(json!({"k": "a"}))).await.unwrap();
        assert_eq!(store.find(&query).await.unwrap().len(), 1);
        // served from cache
        assert_eq!(store.find(&query).await.unwrap().len(), 1);

        store.insert(doc(json!({"k": "a"}))).await.unwrap();
        assert_eq!(store.find(&query).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store
            .insert_many(vec![
                doc(json!({"_id": 1, "nested": {"k": [1, [2, 3]]}})),
                doc(json!({"_id": 2, "v": "b"})),
                doc(json!({"v": "no id"})),
            ])
            .await
            .unwrap();
        store
            .remove(&Query::empty().eq("_id", json!(2)))
            .await
            .unwrap();
        let before = store.find(&Query::empty()).await.unwrap();
        store.save().await.unwrap();

        let reloaded = store_in(&dir).await;
        let after = reloaded.find(&Query::empty()).await.unwrap();
        assert_eq!(before, after);

        // the tombstone survived as a hole: same positions, strict id miss
        let gone = reloaded.find(&Query::empty().eq("_id", json!(2))).await;
        assert!(matches!(gone, Err(DocshardError::IndexNotFound { .. })));
        let one = reloaded
            .find_one(&Query::empty().eq("_id", json!(1)))
            .await
            .unwrap();
        assert!(one.is_some());
    }

    #[tokio::test]
    async fn test_strict_guard_catches_overlapping_writes() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new()
            .directory_path(dir.path())
            .store_name("strict")
            .strict_guard(true);
        let store = DocumentStore::open(&config).await.unwrap();

        // Both futures are polled together: the first enters the guard and
        // parks at its deferred tick, the second then trips the monitor.
        let (first, second) = tokio::join!(
            store.insert(doc(json!({"a": 1}))),
            store.insert(doc(json!({"a": 2}))),
        );
        let violations = [first.is_err(), second.is_err()]
            .iter()
            .filter(|&&e| e)
            .count();
        assert_eq!(violations, 1);
    }

    #[tokio::test]
    async fn test_strict_guard_allows_concurrent_reads() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new()
            .directory_path(dir.path())
            .store_name("strict")
            .strict_guard(true);
        let store = DocumentStore::open(&config).await.unwrap();
        store.insert(doc(json!({"a": 1}))).await.unwrap();

        let query = Query::empty();
        let (first, second) = tokio::join!(store.find(&query), store.find(&query));
        assert!(first.is_ok());
        assert!(second.is_ok());
    }
}
