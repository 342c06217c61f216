use rocksdb::WriteBatch;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{debug, info, warn};

use super::{
    is_cancelled, scan_vertices, AbortableInfo, LabelPropertyIndex, LabelPropertyKey, ValueFilter,
};
use crate::error::{IndexDefinitionError, Result};
use crate::graph::transaction::Transaction;
use crate::graph::versioning::VersionStore;
use crate::storage::{RocksBackend, StoredEntry};
use crate::sync::Synchronized;
use crate::types::{Gid, LabelId, PropertyId, PropertyValue, Timestamp, VertexData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Populating,
    Ready,
}

/// Physical deletions one transaction owes the index store.
#[derive(Debug, Default)]
struct LedgerEntry {
    // Set once the owning transaction committed.
    commit_timestamp: Option<Timestamp>,
    // Vertex -> indices whose older entries became obsolete.
    removed: BTreeMap<Gid, BTreeSet<LabelPropertyKey>>,
    deleted: BTreeSet<Gid>,
}

impl LedgerEntry {
    fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Default)]
struct DiskState {
    catalog: BTreeMap<LabelPropertyKey, Status>,
    // Keyed by the owning transaction's start timestamp.
    ledger: BTreeMap<Timestamp, LedgerEntry>,
    // Distinct vertices with stored entries, per index.
    vertex_counts: BTreeMap<LabelPropertyKey, u64>,
}

impl DiskState {
    fn keys(&self) -> Vec<LabelPropertyKey> {
        self.catalog.keys().cloned().collect()
    }

    fn vertices_added(&mut self, keys: Vec<LabelPropertyKey>) {
        for key in keys {
            *self.vertex_counts.entry(key).or_insert(0) += 1;
        }
    }

    fn vertices_emptied(&mut self, keys: Vec<LabelPropertyKey>) {
        for key in keys {
            if let Some(count) = self.vertex_counts.get_mut(&key) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Label-property index stored in RocksDB.
///
/// Uncommitted changes never reach the store: a committing transaction
/// writes its vertices' entries in one batch stamped with its commit
/// timestamp, and the deletions it implies wait in the ledger until no
/// reader can need the older entries. Catalog and ledger share one lock,
/// and every store write that changes what the catalog promises happens
/// under it.
#[derive(Debug)]
pub struct DiskLabelPropertyIndex {
    backend: RocksBackend,
    state: Synchronized<DiskState>,
}

fn newest_per_vertex(entries: Vec<StoredEntry>) -> Vec<StoredEntry> {
    let mut newest: Vec<StoredEntry> = Vec::new();
    // Entries arrive sorted by gid, then commit timestamp.
    for entry in entries {
        match newest.last_mut() {
            Some(last) if last.gid == entry.gid => *last = entry,
            _ => newest.push(entry),
        }
    }
    newest
}

impl DiskLabelPropertyIndex {
    /// Opens the store under `path` and reloads its persisted catalog.
    pub fn open(path: &Path) -> Result<Self> {
        let backend = RocksBackend::new(path)?;
        let mut state = DiskState::default();
        for key in backend.load_catalog()? {
            state.vertex_counts.insert(key.clone(), backend.count_vertices(&key)?);
            state.catalog.insert(key, Status::Ready);
        }
        Ok(Self {
            backend,
            state: Synchronized::new(state),
        })
    }

    /// The index catalog as persisted in the store.
    pub fn load_index_info(&self) -> Result<Vec<LabelPropertyKey>> {
        self.backend.load_catalog()
    }

    /// Forgets every index and entry; used before rebuilding from a snapshot.
    pub fn reset(&self) -> Result<()> {
        self.state.with_lock(|state| -> Result<()> {
            self.backend.clear()?;
            *state = DiskState::default();
            Ok(())
        })?
    }

    /// Writes one vertex's current entries for every index, stamped with
    /// `commit_timestamp`. Returns false if the store rejected the write.
    pub fn sync_vertex_to_label_property_index_storage(
        &self,
        gid: Gid,
        vertex: &VertexData,
        commit_timestamp: Timestamp,
    ) -> bool {
        let result = self.state.with_lock(|state| -> Result<()> {
            let mut batch = WriteBatch::default();
            let added = self.put_vertex(&mut batch, &state.keys(), gid, vertex, commit_timestamp)?;
            self.backend.write(batch)?;
            state.vertices_added(added);
            Ok(())
        });
        match result.and_then(|r| r) {
            Ok(()) => true,
            Err(e) => {
                warn!(%gid, error = %e, "Failed to sync vertex to the label-property index store");
                false
            }
        }
    }

    /// Physically removes a deleted vertex's entries committed at or before
    /// `commit_timestamp`. Returns false if the store rejected the write.
    pub fn clear_deleted_vertex(&self, gid: Gid, commit_timestamp: Timestamp) -> bool {
        let result = self.state.with_lock(|state| self.clear_deleted_vertex_locked(state, gid, commit_timestamp));
        match result.and_then(|r| r) {
            Ok(()) => true,
            Err(e) => {
                warn!(%gid, error = %e, "Failed to clear deleted vertex from the label-property index store");
                false
            }
        }
    }

    fn clear_deleted_vertex_locked(&self, state: &mut DiskState, gid: Gid, commit_timestamp: Timestamp) -> Result<()> {
        let mut batch = WriteBatch::default();
        let mut emptied = Vec::new();
        for key in state.catalog.keys() {
            let pruned = self
                .backend
                .delete_vertex_entries(&mut batch, key, gid, |ts| ts <= commit_timestamp)?;
            if pruned.deleted > 0 && pruned.remaining == 0 {
                emptied.push(key.clone());
            }
        }
        self.backend.write(batch)?;
        state.vertices_emptied(emptied);
        Ok(())
    }

    /// Performs the removals the transaction that began at `start_timestamp`
    /// recorded: entries older than its `commit_timestamp` are deleted,
    /// then the ledger entry is dropped. Returns false if the store
    /// rejected the write; the ledger entry is kept for the next attempt.
    pub fn delete_vertices_with_removed_indexing_label(
        &self,
        start_timestamp: Timestamp,
        commit_timestamp: Timestamp,
    ) -> bool {
        let result = self.state.with_lock(|state| {
            self.delete_removed_locked(state, start_timestamp, commit_timestamp)
        });
        match result.and_then(|r| r) {
            Ok(()) => true,
            Err(e) => {
                warn!(start_timestamp, error = %e, "Failed to delete obsolete label-property index entries");
                false
            }
        }
    }

    fn delete_removed_locked(
        &self,
        state: &mut DiskState,
        start_timestamp: Timestamp,
        commit_timestamp: Timestamp,
    ) -> Result<()> {
        let Some(entry) = state.ledger.get(&start_timestamp) else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        let mut emptied = Vec::new();
        for (gid, keys) in &entry.removed {
            for key in keys.iter().filter(|k| state.catalog.contains_key(*k)) {
                let pruned = self
                    .backend
                    .delete_vertex_entries(&mut batch, key, *gid, |ts| ts < commit_timestamp)?;
                if pruned.deleted > 0 && pruned.remaining == 0 {
                    emptied.push(key.clone());
                }
            }
        }
        self.backend.write(batch)?;
        state.vertices_emptied(emptied);
        state.ledger.remove(&start_timestamp);
        Ok(())
    }

    /// Adds the vertex's entries to `batch`. Returns the indices that had
    /// no entry for the vertex yet.
    fn put_vertex(
        &self,
        batch: &mut WriteBatch,
        keys: &[LabelPropertyKey],
        gid: Gid,
        vertex: &VertexData,
        commit_timestamp: Timestamp,
    ) -> Result<Vec<LabelPropertyKey>> {
        let mut added = Vec::new();
        for key in keys {
            if let Some(values) = key.values_of(vertex) {
                if !self.backend.has_vertex_entries(key, gid)? {
                    added.push(key.clone());
                }
                self.backend.put_entry(batch, key, gid, commit_timestamp, &values)?;
            }
        }
        Ok(added)
    }

    fn record(&self, start_timestamp: Timestamp, f: impl FnOnce(&DiskState, &mut LedgerEntry)) -> Result<()> {
        self.state.with_lock(|state| {
            let mut entry = state.ledger.remove(&start_timestamp).unwrap_or_default();
            f(state, &mut entry);
            if !entry.is_empty() || entry.commit_timestamp.is_some() {
                state.ledger.insert(start_timestamp, entry);
            }
        })
    }

    fn discard_index(&self, state: &mut DiskState, key: &LabelPropertyKey) -> Result<()> {
        state.catalog.remove(key);
        state.vertex_counts.remove(key);
        for entry in state.ledger.values_mut() {
            for keys in entry.removed.values_mut() {
                keys.remove(key);
            }
            entry.removed.retain(|_, keys| !keys.is_empty());
        }
        let mut batch = WriteBatch::default();
        self.backend.delete_index_entries(&mut batch, key)?;
        self.backend.delete_catalog_entry(&mut batch, key)?;
        self.backend.write(batch)
    }

    fn ready_entries(&self, key: &LabelPropertyKey) -> Result<Option<Vec<StoredEntry>>> {
        let ready = self
            .state
            .with_lock(|state| state.catalog.get(key) == Some(&Status::Ready))?;
        if !ready {
            return Ok(None);
        }
        Ok(Some(newest_per_vertex(self.backend.scan_index(key)?)))
    }

    /// Ledger entries awaiting cleanup, for diagnostics.
    pub fn pending_deletions(&self) -> Result<usize> {
        self.state.with_lock(|state| state.ledger.len())
    }
}

impl LabelPropertyIndex for DiskLabelPropertyIndex {
    fn create_index(
        &self,
        key: &LabelPropertyKey,
        store: &VersionStore,
        transaction: &Transaction,
        _horizon: Timestamp,
        cancel: &dyn Fn() -> bool,
    ) -> Result<()> {
        key.validate()?;
        self.state.with_lock(|state| {
            if state.catalog.contains_key(key) {
                return Err(IndexDefinitionError::AlreadyExists);
            }
            state.catalog.insert(key.clone(), Status::Populating);
            Ok(())
        })??;

        // The whole build lands in one batch, written together with the catalog record.
        let view = transaction.visibility();
        let mut batch = WriteBatch::default();
        let built = scan_vertices(store, cancel, |gid, chain| {
            let Some(vertex) = chain.visible(&view) else {
                return Ok(());
            };
            match key.values_of(&vertex) {
                Some(values) => {
                    let commit_timestamp = chain.visible_commit_timestamp(&view);
                    self.backend
                        .put_entry(&mut batch, key, gid, commit_timestamp, &values)
                }
                None => Ok(()),
            }
        });

        let published = built.and_then(|()| {
            self.state.with_lock(|state| -> Result<()> {
                if cancel() {
                    return Err(IndexDefinitionError::Cancelled.into());
                }
                self.backend.put_catalog_entry(&mut batch, key)?;
                self.backend.write(batch)?;
                // Commits during the build overlap the scanned vertices; count once.
                state.vertex_counts.insert(key.clone(), self.backend.count_vertices(key)?);
                state.catalog.insert(key.clone(), Status::Ready);
                Ok(())
            })?
        });

        match published {
            Ok(()) => {
                info!(index = %key, "Created disk label-property index");
                Ok(())
            }
            Err(e) => {
                self.state.with_lock(|state| self.discard_index(state, key))??;
                if is_cancelled(&e) {
                    info!(index = %key, "Index creation cancelled");
                }
                Err(e)
            }
        }
    }

    fn drop_index(&self, key: &LabelPropertyKey) -> Result<()> {
        self.state.with_lock(|state| -> Result<()> {
            if state.catalog.get(key) != Some(&Status::Ready) {
                return Err(IndexDefinitionError::Definition.into());
            }
            self.discard_index(state, key)
        })??;
        info!(index = %key, "Dropped disk label-property index");
        Ok(())
    }

    fn index_exists(&self, key: &LabelPropertyKey) -> Result<bool> {
        self.state
            .with_lock(|state| state.catalog.get(key) == Some(&Status::Ready))
    }

    fn list_indices(&self) -> Result<Vec<LabelPropertyKey>> {
        self.state.with_lock(|state| {
            state
                .catalog
                .iter()
                .filter(|(_, status)| **status == Status::Ready)
                .map(|(key, _)| key.clone())
                .collect()
        })
    }

    fn registered_indices(&self) -> Result<Vec<LabelPropertyKey>> {
        self.state.with_lock(|state| state.keys())
    }

    // Entries are materialized at commit.
    fn update_on_add_label(&self, _: LabelId, _: Gid, _: &VertexData, _: &Transaction) -> Result<()> {
        Ok(())
    }

    fn update_on_remove_label(&self, label: LabelId, gid: Gid, _: &VertexData, transaction: &Transaction) -> Result<()> {
        self.record(transaction.start_timestamp, |state, entry| {
            for key in state.catalog.keys().filter(|k| k.label == label) {
                entry.removed.entry(gid).or_default().insert(key.clone());
            }
        })
    }

    fn update_on_set_property(
        &self,
        property: PropertyId,
        _old_value: &PropertyValue,
        gid: Gid,
        vertex: &VertexData,
        transaction: &Transaction,
    ) -> Result<()> {
        self.record(transaction.start_timestamp, |state, entry| {
            for key in state
                .catalog
                .keys()
                .filter(|k| k.contains_property(property) && vertex.has_label(k.label))
            {
                entry.removed.entry(gid).or_default().insert(key.clone());
            }
        })
    }

    fn update_on_delete_vertex(&self, gid: Gid, _: &VertexData, transaction: &Transaction) -> Result<()> {
        self.record(transaction.start_timestamp, |_, entry| {
            entry.deleted.insert(gid);
        })
    }

    fn commit_entries(
        &self,
        start_timestamp: Timestamp,
        commit_timestamp: Timestamp,
        vertices: &[(Gid, VertexData)],
    ) -> Result<()> {
        self.state.with_lock(|state| -> Result<()> {
            let keys = state.keys();
            let mut batch = WriteBatch::default();
            let mut added = Vec::new();
            for (gid, vertex) in vertices {
                added.extend(self.put_vertex(&mut batch, &keys, *gid, vertex, commit_timestamp)?);
            }
            self.backend.write(batch)?;
            state.vertices_added(added);

            if keys.is_empty() && !state.ledger.contains_key(&start_timestamp) {
                return Ok(());
            }
            // Entries committed before this one are superseded once no reader needs them.
            let entry = state.ledger.entry(start_timestamp).or_default();
            for (gid, _) in vertices {
                entry.removed.entry(*gid).or_default().extend(keys.iter().cloned());
            }
            entry.commit_timestamp = Some(commit_timestamp);
            Ok(())
        })?
    }

    fn abort_entries(&self, _: &AbortableInfo, start_timestamp: Timestamp) -> Result<()> {
        let dropped = self
            .state
            .with_lock(|state| state.ledger.remove(&start_timestamp).is_some())?;
        debug!(start_timestamp, dropped, "Discarded tentative index deletions");
        Ok(())
    }

    fn approximate_vertex_count(&self, key: &LabelPropertyKey, filter: &ValueFilter) -> Result<Option<u64>> {
        if let ValueFilter::Any = filter {
            return self.state.with_lock(|state| {
                (state.catalog.get(key) == Some(&Status::Ready))
                    .then(|| state.vertex_counts.get(key).copied().unwrap_or(0))
            });
        }
        // Values are stored in the entry, not the key, so narrowed counts read this index's range.
        Ok(self.ready_entries(key)?.map(|entries| {
            entries
                .iter()
                .filter(|e| filter.matches(&e.values))
                .count() as u64
        }))
    }

    fn entries(&self, key: &LabelPropertyKey) -> Result<Vec<(Vec<PropertyValue>, Gid)>> {
        let distinct: BTreeSet<(Vec<PropertyValue>, Gid)> = self
            .ready_entries(key)?
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.values, e.gid))
            .collect();
        Ok(distinct.into_iter().collect())
    }

    fn remove_obsolete_entries(&self, horizon: Timestamp, _: &VersionStore) -> Result<usize> {
        let due: Vec<(Timestamp, Timestamp, Vec<Gid>)> = self.state.with_lock(|state| {
            state
                .ledger
                .iter()
                .filter_map(|(start, entry)| {
                    let commit = entry.commit_timestamp.filter(|c| *c < horizon)?;
                    Some((*start, commit, entry.deleted.iter().copied().collect()))
                })
                .collect()
        })?;

        let mut cleaned = 0;
        for (start_timestamp, commit_timestamp, deleted) in due {
            let cleared = deleted
                .into_iter()
                .all(|gid| self.clear_deleted_vertex(gid, commit_timestamp));
            if cleared && self.delete_vertices_with_removed_indexing_label(start_timestamp, commit_timestamp) {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::transaction::{IsolationLevel, TransactionManager};
    use tempfile::tempdir;

    fn person(age: i64) -> VertexData {
        let mut vertex = VertexData::new();
        vertex.labels.insert(LabelId(1));
        vertex.properties.insert(PropertyId(2), PropertyValue::Int(age));
        vertex
    }

    fn person_age() -> LabelPropertyKey {
        LabelPropertyKey::new(LabelId(1), vec![PropertyId(2)])
    }

    #[test]
    fn test_catalog_survives_reopen() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new();
        let manager = TransactionManager::new();
        {
            let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
            let builder = manager.begin(IsolationLevel::default()).unwrap();
            index.create_index(&person_age(), &store, &builder, 0, &|| false).unwrap();
        }
        let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
        assert_eq!(index.load_index_info().unwrap(), vec![person_age()]);
        assert!(index.index_exists(&person_age()).unwrap());
    }

    #[test]
    fn test_ledger_entry_outlives_commit_until_cleanup() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new();
        let manager = TransactionManager::new();
        let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
        let builder = manager.begin(IsolationLevel::default()).unwrap();
        index.create_index(&person_age(), &store, &builder, 0, &|| false).unwrap();

        assert!(index.sync_vertex_to_label_property_index_storage(Gid(1), &person(30), 3));
        assert_eq!(
            index.approximate_vertex_count(&person_age(), &ValueFilter::Any).unwrap(),
            Some(1)
        );

        let deleter = manager.begin(IsolationLevel::default()).unwrap();
        index.update_on_delete_vertex(Gid(1), &person(30), &deleter).unwrap();
        let mut gone = person(30);
        gone.deleted = true;
        index
            .commit_entries(deleter.start_timestamp, 10, &[(Gid(1), gone)])
            .unwrap();
        assert_eq!(index.pending_deletions().unwrap(), 1);

        // Horizon not past the commit: nothing is touched.
        assert_eq!(index.remove_obsolete_entries(10, &store).unwrap(), 0);
        assert_eq!(index.pending_deletions().unwrap(), 1);

        assert_eq!(index.remove_obsolete_entries(11, &store).unwrap(), 1);
        assert_eq!(index.pending_deletions().unwrap(), 0);
        assert_eq!(
            index.approximate_vertex_count(&person_age(), &ValueFilter::Any).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn test_abort_drops_ledger_entry() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new();
        let manager = TransactionManager::new();
        let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
        let builder = manager.begin(IsolationLevel::default()).unwrap();
        index.create_index(&person_age(), &store, &builder, 0, &|| false).unwrap();

        let writer = manager.begin(IsolationLevel::default()).unwrap();
        index
            .update_on_remove_label(LabelId(1), Gid(4), &VertexData::new(), &writer)
            .unwrap();
        assert_eq!(index.pending_deletions().unwrap(), 1);
        index
            .abort_entries(&AbortableInfo::default(), writer.start_timestamp)
            .unwrap();
        assert_eq!(index.pending_deletions().unwrap(), 0);
    }

    #[test]
    fn test_repeated_commits_leave_one_entry_after_gc() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new();
        let manager = TransactionManager::new();
        let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
        let builder = manager.begin(IsolationLevel::default()).unwrap();
        index.create_index(&person_age(), &store, &builder, 0, &|| false).unwrap();
        manager.unregister(builder.start_timestamp).unwrap();

        // Each commit rewrites the vertex's entry, e.g. after an unrelated property changed.
        for _ in 0..100 {
            let writer = manager.begin(IsolationLevel::default()).unwrap();
            let commit_timestamp = {
                let mut guard = manager.lock_engine().unwrap();
                TransactionManager::next_commit_timestamp(&mut guard)
            };
            index
                .commit_entries(writer.start_timestamp, commit_timestamp, &[(Gid(1), person(30))])
                .unwrap();
            manager.finish_commit(&writer, commit_timestamp).unwrap();
        }
        assert_eq!(index.backend.scan_index(&person_age()).unwrap().len(), 100);
        assert_eq!(index.pending_deletions().unwrap(), 100);

        let horizon = manager.horizon().unwrap();
        assert_eq!(index.remove_obsolete_entries(horizon, &store).unwrap(), 100);
        assert_eq!(index.backend.scan_index(&person_age()).unwrap().len(), 1);
        assert_eq!(index.pending_deletions().unwrap(), 0);
        assert_eq!(
            index.approximate_vertex_count(&person_age(), &ValueFilter::Any).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_vertex_count_follows_deletes_and_reopen() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new();
        let manager = TransactionManager::new();
        {
            let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
            let builder = manager.begin(IsolationLevel::default()).unwrap();
            index.create_index(&person_age(), &store, &builder, 0, &|| false).unwrap();
            manager.unregister(builder.start_timestamp).unwrap();

            assert!(index.sync_vertex_to_label_property_index_storage(Gid(1), &person(30), 3));
            assert!(index.sync_vertex_to_label_property_index_storage(Gid(2), &person(40), 3));
            assert!(index.sync_vertex_to_label_property_index_storage(Gid(2), &person(41), 4));
            assert_eq!(
                index.approximate_vertex_count(&person_age(), &ValueFilter::Any).unwrap(),
                Some(2)
            );

            let deleter = manager.begin(IsolationLevel::default()).unwrap();
            index.update_on_delete_vertex(Gid(2), &person(41), &deleter).unwrap();
            let mut gone = person(41);
            gone.deleted = true;
            index
                .commit_entries(deleter.start_timestamp, 10, &[(Gid(2), gone)])
                .unwrap();
            manager.unregister(deleter.start_timestamp).unwrap();
            index.remove_obsolete_entries(11, &store).unwrap();

            assert_eq!(
                index.approximate_vertex_count(&person_age(), &ValueFilter::Any).unwrap(),
                Some(1)
            );
            let exact = ValueFilter::Exact(vec![PropertyValue::Int(41)]);
            assert_eq!(index.approximate_vertex_count(&person_age(), &exact).unwrap(), Some(0));
        }
        let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
        assert_eq!(
            index.approximate_vertex_count(&person_age(), &ValueFilter::Any).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_populating_index_is_registered_but_not_listed() {
        let dir = tempdir().unwrap();
        let index = DiskLabelPropertyIndex::open(dir.path()).unwrap();
        index
            .state
            .with_lock(|state| state.catalog.insert(person_age(), Status::Populating))
            .unwrap();
        assert!(index.list_indices().unwrap().is_empty());
        assert_eq!(index.registered_indices().unwrap(), vec![person_age()]);
        assert_eq!(
            index.approximate_vertex_count(&person_age(), &ValueFilter::Any).unwrap(),
            None
        );
    }
}
