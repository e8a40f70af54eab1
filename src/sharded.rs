//! Sharded document store
//!
//! Routes operations to many [`DocumentStore`]s keyed by the `packageUId`
//! shard key and manages which shards are memory-resident. Shard files live
//! flat in one directory: `<uid>` holds the document array, `<uid>.index`
//! the merged index tables, and the offline builder's side-files sit next
//! to them (anything ending in `.index` is ignored during discovery).
//!
//! The working set is controlled through `use_shards`: shards outside the
//! requested set are evicted from memory (never from disk), except for
//! "hidden" shards, which are pinned resident regardless of the caller's
//! working set. Writes lazily load (or create) their target shard, which
//! can grow the resident set past the working set; `save` re-applies the
//! last working set afterwards to release those again.
//!
//! Inner stores run with pass-through guards; the sharded store brackets
//! its own operations with one coarser outer guard.

use crate::config::StoreConfig;
use crate::document::{shard_key, Document, SHARD_KEY_FIELD};
use crate::error::DocshardError;
use crate::guard::{AccessGuard, AccessKind, GuardMode};
use crate::index::discover_shard_files;
use crate::query::{Query, ValueSpec};
use crate::store::{DocumentOps, DocumentStore};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::yield_now;
use tracing::{debug, info};

/// Lifecycle slot of one shard in the `dbs` map. An `Unloaded` entry means
/// the shard is known (its file exists, or it existed this session) but is
/// not memory-resident.
enum ShardSlot {
    Unloaded,
    Loaded(Arc<DocumentStore>),
}

impl ShardSlot {
    fn loaded(&self) -> Option<&Arc<DocumentStore>> {
        match self {
            ShardSlot::Loaded(store) => Some(store),
            ShardSlot::Unloaded => None,
        }
    }
}

#[derive(Default)]
struct ShardedState {
    dbs: BTreeMap<String, ShardSlot>,
    hidden: BTreeSet<String>,
    last_use: Vec<String>,
    load_all: bool,
}

/// Many document stores behind one surface, keyed by shard id
pub struct ShardedStore {
    directory: PathBuf,
    config: StoreConfig,
    guard: AccessGuard,
    state: Mutex<ShardedState>,
}

impl ShardedStore {
    /// Open a sharded store over a directory, discovering existing shard
    /// files without loading any of them.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let directory = config.directory_path.clone();
        tokio::fs::create_dir_all(&directory).await?;

        let mut state = ShardedState::default();
        for uid in discover_shard_files(&directory).await? {
            state.dbs.insert(uid, ShardSlot::Unloaded);
        }
        debug!(directory = %directory.display(), shards = state.dbs.len(), "discovered shards");

        let mode = if config.strict_guard {
            GuardMode::Strict
        } else {
            GuardMode::Warn
        };
        Ok(Self {
            directory,
            config: config.clone(),
            guard: AccessGuard::new("sharded", mode),
            state: Mutex::new(state),
        })
    }

    /// Restrict the working set to `ids`: evict every loaded, non-hidden
    /// shard outside it, load every requested shard that exists but is not
    /// resident. Returns whether anything changed.
    pub async fn use_shards(&self, ids: &[String]) -> Result<bool> {
        let _permit = self.guard.enter(AccessKind::Write, "use")?;
        yield_now().await;

        let changed = self.apply_use(ids).await?;
        let mut state = self.state.lock();
        state.last_use = ids.to_vec();
        state.load_all = false;
        Ok(changed)
    }

    /// Compute what `use_shards` would change, without changing it
    pub async fn use_check_only(&self, ids: &[String]) -> Result<bool> {
        let _permit = self.guard.enter(AccessKind::Read, "useCheckOnly")?;
        yield_now().await;

        let state = self.state.lock();
        let requested: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        for (uid, slot) in &state.dbs {
            let resident = slot.loaded().is_some();
            let wanted = requested.contains(uid.as_str()) || state.hidden.contains(uid);
            if resident != wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Load every shard file found in the directory, superseding any prior
    /// working-set restriction.
    pub async fn use_all(&self) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "useAll")?;
        yield_now().await;

        let discovered = discover_shard_files(&self.directory).await?;
        {
            let mut state = self.state.lock();
            for uid in &discovered {
                state.dbs.entry(uid.clone()).or_insert(ShardSlot::Unloaded);
            }
        }

        let to_load: Vec<String> = {
            let state = self.state.lock();
            state
                .dbs
                .iter()
                .filter(|(_, slot)| slot.loaded().is_none())
                .map(|(uid, _)| uid.clone())
                .collect()
        };
        for uid in to_load {
            let store = self.open_shard(&uid).await?;
            self.state.lock().dbs.insert(uid, ShardSlot::Loaded(store));
        }

        let mut state = self.state.lock();
        state.load_all = true;
        info!(shards = state.dbs.len(), "loaded all shards");
        Ok(())
    }

    /// The last working set requested via `use_shards`
    pub fn using(&self) -> Vec<String> {
        self.state.lock().last_use.clone()
    }

    /// Pin shards resident regardless of the working set
    pub async fn use_hidden(&self, ids: &[String]) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "useHidden")?;
        yield_now().await;

        {
            let mut state = self.state.lock();
            state.hidden = ids.iter().cloned().collect();
        }
        for uid in ids {
            let known_unloaded = {
                let state = self.state.lock();
                matches!(state.dbs.get(uid), Some(ShardSlot::Unloaded))
            };
            if known_unloaded {
                let store = self.open_shard(uid).await?;
                self.state
                    .lock()
                    .dbs
                    .insert(uid.clone(), ShardSlot::Loaded(store));
            }
        }
        Ok(())
    }

    /// The currently pinned hidden shard ids
    pub fn using_hidden(&self) -> Vec<String> {
        self.state.lock().hidden.iter().cloned().collect()
    }

    async fn apply_use(&self, ids: &[String]) -> Result<bool> {
        let mut changed = false;
        let to_load: Vec<String> = {
            let mut state = self.state.lock();
            let requested: BTreeSet<&str> = ids.iter().map(String::as_str).collect();

            let hidden = state.hidden.clone();
            for (uid, slot) in state.dbs.iter_mut() {
                let wanted = requested.contains(uid.as_str()) || hidden.contains(uid);
                if !wanted && slot.loaded().is_some() {
                    *slot = ShardSlot::Unloaded;
                    changed = true;
                    debug!(shard = %uid, "unloaded shard");
                }
            }

            ids.iter()
                .filter(|uid| matches!(state.dbs.get(*uid), Some(ShardSlot::Unloaded)))
                .cloned()
                .collect()
        };

        for uid in to_load {
            let store = self.open_shard(&uid).await?;
            self.state
                .lock()
                .dbs
                .insert(uid.clone(), ShardSlot::Loaded(store));
            changed = true;
            debug!(shard = %uid, "loaded shard");
        }
        Ok(changed)
    }

    async fn open_shard(&self, uid: &str) -> Result<Arc<DocumentStore>> {
        let store = DocumentStore::open_at(
            self.directory.join(uid),
            uid.to_string(),
            self.config.scan_page_size,
            GuardMode::PassThrough,
        )
        .await?;
        Ok(Arc::new(store))
    }

    /// The shard holding documents with this key, loaded or created lazily
    async fn shard_for_write(&self, uid: &str) -> Result<Arc<DocumentStore>> {
        if let Some(store) = self
            .state
            .lock()
            .dbs
            .get(uid)
            .and_then(|slot| slot.loaded().cloned())
        {
            return Ok(store);
        }
        let store = self.open_shard(uid).await?;
        self.state
            .lock()
            .dbs
            .insert(uid.to_string(), ShardSlot::Loaded(store.clone()));
        Ok(store)
    }

    /// Resident shards the query fans out to, in shard-id order. A query
    /// naming shard ids (directly or via `$in`) restricts the fan-out.
    fn fan_out(&self, query: &Query) -> Vec<Arc<DocumentStore>> {
        let state = self.state.lock();
        let named: Option<Vec<String>> = query.literal_values_for(SHARD_KEY_FIELD).map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });

        match named {
            Some(uids) => uids
                .iter()
                .filter_map(|uid| state.dbs.get(uid).and_then(|s| s.loaded().cloned()))
                .collect(),
            None => state
                .dbs
                .values()
                .filter_map(|slot| slot.loaded().cloned())
                .collect(),
        }
    }

    fn loaded_shards(&self) -> Vec<(String, Arc<DocumentStore>)> {
        let state = self.state.lock();
        state
            .dbs
            .iter()
            .filter_map(|(uid, slot)| slot.loaded().map(|s| (uid.clone(), s.clone())))
            .collect()
    }

    fn shard_key_of(doc: &Document, operation: &str) -> Result<String> {
        shard_key(doc)
            .map(str::to_string)
            .ok_or_else(|| DocshardError::missing_field(operation, SHARD_KEY_FIELD))
    }

    async fn remove_shard_files(&self, uid: &str) -> Result<()> {
        for path in [
            self.directory.join(uid),
            self.directory.join(format!("{uid}.index")),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// The single shard a removal query names. Anything other than
/// `{packageUId}` or `{packageId, packageVersion}` is a usage error.
fn removal_uid(query: &Query) -> Result<String> {
    fn eq_string(spec: &ValueSpec) -> Option<&str> {
        match spec {
            ValueSpec::Eq(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    if !query.text.is_empty() {
        return Err(DocshardError::InvalidRemoveQuery {
            reason: "$text cannot name a shard".to_string(),
        });
    }

    let fields: BTreeMap<&str, &ValueSpec> = query
        .filters
        .iter()
        .map(|f| (f.field.as_str(), &f.spec))
        .collect();

    if fields.len() == 1 {
        if let Some(uid) = fields.get(SHARD_KEY_FIELD).copied().and_then(eq_string) {
            return Ok(uid.to_string());
        }
    }
    if fields.len() == 2 {
        let id = fields.get("packageId").copied().and_then(eq_string);
        let version = fields.get("packageVersion").copied().and_then(eq_string);
        if let (Some(id), Some(version)) = (id, version) {
            return Ok(format!("{id}.{version}"));
        }
    }
    Err(DocshardError::InvalidRemoveQuery {
        reason: format!(
            "expected {{}} or a query naming exactly one shard via {SHARD_KEY_FIELD} \
             or packageId+packageVersion"
        ),
    })
}

#[async_trait]
impl DocumentOps for ShardedStore {
    async fn insert(&self, doc: Document) -> Result<usize> {
        self.insert_many(vec![doc]).await
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<usize> {
        let _permit = self.guard.enter(AccessKind::Write, "insert")?;
        yield_now().await;

        let mut by_shard: BTreeMap<String, Vec<Document>> = BTreeMap::new();
        for doc in docs {
            let uid = Self::shard_key_of(&doc, "insert")?;
            by_shard.entry(uid).or_default().push(doc);
        }

        let mut inserted = 0;
        for (uid, docs) in by_shard {
            let shard = self.shard_for_write(&uid).await?;
            inserted += shard.insert_many(docs).await?;
        }
        Ok(inserted)
    }

    async fn update(&self, query: &Query, record: Document) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "update")?;
        yield_now().await;

        let uid = Self::shard_key_of(&record, "update")?;
        let shard = self.shard_for_write(&uid).await?;
        shard.update(query, record).await
    }

    async fn upsert(&self, query: &Query, record: Document) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "upsert")?;
        yield_now().await;

        let uid = Self::shard_key_of(&record, "upsert")?;
        let shard = self.shard_for_write(&uid).await?;
        shard.upsert(query, record).await
    }

    async fn remove(&self, query: &Query) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "remove")?;
        yield_now().await;

        if query.is_empty() {
            {
                let mut state = self.state.lock();
                state.dbs.clear();
                state.last_use.clear();
                state.load_all = false;
            }
            let mut entries = tokio::fs::read_dir(&self.directory).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    tokio::fs::remove_file(entry.path()).await?;
                }
            }
            info!("removed every shard and emptied the directory");
            return Ok(());
        }

        let uid = removal_uid(query)?;
        self.state.lock().dbs.remove(&uid);
        self.remove_shard_files(&uid).await?;
        info!(shard = %uid, "removed shard");
        Ok(())
    }

    async fn find(&self, query: &Query) -> Result<Vec<Document>> {
        let _permit = self.guard.enter(AccessKind::Read, "find")?;
        yield_now().await;

        let mut results = Vec::new();
        for shard in self.fan_out(query) {
            match shard.find(query).await {
                Ok(docs) => results.extend(docs),
                // a strict id miss in one shard is not a miss overall
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Document>> {
        let _permit = self.guard.enter(AccessKind::Read, "findOne")?;
        yield_now().await;

        for shard in self.fan_out(query) {
            match shard.find_one(query).await {
                Ok(Some(doc)) => return Ok(Some(doc)),
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn find_no_deep_copy(&self, query: &Query) -> Result<Vec<Arc<Document>>> {
        let _permit = self.guard.enter(AccessKind::Read, "findNoDeepCopy")?;
        yield_now().await;

        let mut results = Vec::new();
        for shard in self.fan_out(query) {
            match shard.find_no_deep_copy(query).await {
                Ok(docs) => results.extend(docs),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    async fn save(&self) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "save")?;
        yield_now().await;

        for (uid, shard) in self.loaded_shards() {
            shard.save().await?;
            debug!(shard = %uid, "saved shard");
        }

        // Writes auto-load shards past the working set; release them again,
        // unless the caller asked for everything resident.
        let (load_all, last_use) = {
            let state = self.state.lock();
            (state.load_all, state.last_use.clone())
        };
        if !load_all {
            self.apply_use(&last_use).await?;
        }
        Ok(())
    }

    async fn load_indices(&self) -> Result<()> {
        let _permit = self.guard.enter(AccessKind::Write, "loadIndices")?;
        yield_now().await;

        for (_, shard) in self.loaded_shards() {
            shard.load_indices().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(v: Value) -> Query {
        Query::parse(&v).unwrap()
    }

    #[test]
    fn test_removal_uid_shapes() {
        let q = query(json!({"packageUId": "pkgA.1.0.0"}));
        assert_eq!(removal_uid(&q).unwrap(), "pkgA.1.0.0");

        let q = query(json!({"packageId": "pkgA", "packageVersion": "1.0.0"}));
        assert_eq!(removal_uid(&q).unwrap(), "pkgA.1.0.0");

        let bad = [
            json!({"packageId": "pkgA"}),
            json!({"name": "x"}),
            json!({"packageUId": "a", "name": "x"}),
            json!({"packageUId": {"$in": ["a", "b"]}}),
        ];
        for shape in bad {
            assert!(matches!(
                removal_uid(&query(shape)),
                Err(DocshardError::InvalidRemoveQuery { .. })
            ));
        }
    }
}
