use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use tracing::{debug, info};

use super::{
    is_cancelled, scan_vertices, AbortableInfo, LabelPropertyIndex, LabelPropertyKey, ValueFilter,
};
use crate::error::{IndexDefinitionError, Result};
use crate::graph::transaction::Transaction;
use crate::graph::versioning::VersionStore;
use crate::sync::{read, Synchronized};
use crate::types::{Gid, LabelId, PropertyId, PropertyValue, Timestamp, VertexData};

/// One candidate entry. `timestamp` is the start timestamp of the
/// transaction that inserted it; readers validate candidates against the
/// vertex itself, so stale entries are harmless until GC drops them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    values: Vec<PropertyValue>,
    gid: Gid,
    timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Populating,
    Ready,
}

#[derive(Debug)]
struct IndexContents {
    status: Status,
    entries: BTreeSet<Entry>,
    // Entries per vertex; its length is the distinct vertex count.
    refcounts: BTreeMap<Gid, usize>,
}

impl IndexContents {
    fn new() -> Self {
        Self {
            status: Status::Populating,
            entries: BTreeSet::new(),
            refcounts: BTreeMap::new(),
        }
    }

    fn insert(&mut self, entry: Entry) {
        let gid = entry.gid;
        if self.entries.insert(entry) {
            *self.refcounts.entry(gid).or_insert(0) += 1;
        }
    }

    fn remove(&mut self, entry: &Entry) -> bool {
        if !self.entries.remove(entry) {
            return false;
        }
        if let Some(count) = self.refcounts.get_mut(&entry.gid) {
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&entry.gid);
            }
        }
        true
    }

    fn count(&self, filter: &ValueFilter) -> u64 {
        let mut gids = BTreeSet::new();
        match filter {
            ValueFilter::Any => return self.refcounts.len() as u64,
            ValueFilter::Exact(prefix) => {
                let start = Entry {
                    values: prefix.clone(),
                    gid: Gid::MIN,
                    timestamp: 0,
                };
                for entry in self.entries.range(start..) {
                    if !entry.values.starts_with(prefix) {
                        break;
                    }
                    gids.insert(entry.gid);
                }
            }
            ValueFilter::Range(ranges) => {
                let start = match ranges.first().map(|r| &r.lower) {
                    Some(Bound::Included(low)) | Some(Bound::Excluded(low)) => Bound::Included(Entry {
                        values: vec![low.clone()],
                        gid: Gid::MIN,
                        timestamp: 0,
                    }),
                    _ => Bound::Unbounded,
                };
                for entry in self.entries.range((start, Bound::Unbounded)) {
                    if let (Some(first_range), Some(first)) = (ranges.first(), entry.values.first()) {
                        if first_range.is_past_upper(first) {
                            break;
                        }
                    }
                    if filter.matches(&entry.values) {
                        gids.insert(entry.gid);
                    }
                }
            }
        }
        gids.len() as u64
    }
}

/// Label-property index kept entirely in memory.
///
/// The catalog and every index's contents sit behind one lock.
#[derive(Debug, Default)]
pub struct InMemoryLabelPropertyIndex {
    indices: Synchronized<BTreeMap<LabelPropertyKey, IndexContents>>,
}

impl InMemoryLabelPropertyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the vertex's entries into every index `applies` selects.
    fn insert_for(
        &self,
        gid: Gid,
        vertex: &VertexData,
        timestamp: Timestamp,
        applies: impl Fn(&LabelPropertyKey) -> bool,
    ) -> Result<()> {
        self.indices.with_lock(|indices| {
            for (key, contents) in indices.iter_mut() {
                if !applies(key) {
                    continue;
                }
                if let Some(values) = key.values_of(vertex) {
                    contents.insert(Entry { values, gid, timestamp });
                }
            }
        })
    }
}

impl LabelPropertyIndex for InMemoryLabelPropertyIndex {
    fn create_index(
        &self,
        key: &LabelPropertyKey,
        store: &VersionStore,
        transaction: &Transaction,
        horizon: Timestamp,
        cancel: &dyn Fn() -> bool,
    ) -> Result<()> {
        key.validate()?;
        // Registered while populating so concurrent writers already feed it.
        self.indices.with_lock(|indices| {
            if indices.contains_key(key) {
                return Err(IndexDefinitionError::AlreadyExists);
            }
            indices.insert(key.clone(), IndexContents::new());
            Ok(())
        })??;

        let timestamp = transaction.start_timestamp;
        let built = scan_vertices(store, cancel, |gid, chain| {
            // Every state a current or future reader might look up.
            let entries: Vec<Entry> = chain
                .states_since(horizon)
                .iter()
                .filter_map(|state| key.values_of(state))
                .map(|values| Entry { values, gid, timestamp })
                .collect();
            if entries.is_empty() {
                return Ok(());
            }
            self.indices.with_lock(|indices| {
                if let Some(contents) = indices.get_mut(key) {
                    entries.into_iter().for_each(|entry| contents.insert(entry));
                }
            })
        });

        let published = built.and_then(|()| {
            self.indices.with_lock(|indices| {
                if cancel() {
                    return Err(IndexDefinitionError::Cancelled);
                }
                if let Some(contents) = indices.get_mut(key) {
                    contents.status = Status::Ready;
                }
                Ok(())
            })?
            .map_err(Into::into)
        });

        match published {
            Ok(()) => {
                info!(index = %key, "Created in-memory label-property index");
                Ok(())
            }
            Err(e) => {
                self.indices.with_lock(|indices| indices.remove(key))?;
                if is_cancelled(&e) {
                    info!(index = %key, "Index creation cancelled");
                }
                Err(e)
            }
        }
    }

    fn drop_index(&self, key: &LabelPropertyKey) -> Result<()> {
        let removed = self.indices.with_lock(|indices| {
            match indices.get(key).map(|c| c.status) {
                Some(Status::Ready) => indices.remove(key).is_some(),
                _ => false,
            }
        })?;
        if !removed {
            return Err(IndexDefinitionError::Definition.into());
        }
        info!(index = %key, "Dropped in-memory label-property index");
        Ok(())
    }

    fn index_exists(&self, key: &LabelPropertyKey) -> Result<bool> {
        self.indices
            .with_lock(|indices| indices.get(key).is_some_and(|c| c.status == Status::Ready))
    }

    fn list_indices(&self) -> Result<Vec<LabelPropertyKey>> {
        self.indices.with_lock(|indices| {
            indices
                .iter()
                .filter(|(_, c)| c.status == Status::Ready)
                .map(|(key, _)| key.clone())
                .collect()
        })
    }

    fn registered_indices(&self) -> Result<Vec<LabelPropertyKey>> {
        self.indices.with_lock(|indices| indices.keys().cloned().collect())
    }

    fn update_on_add_label(&self, label: LabelId, gid: Gid, vertex: &VertexData, transaction: &Transaction) -> Result<()> {
        self.insert_for(gid, vertex, transaction.start_timestamp, |key| key.label == label)
    }

    // Stale entries are left for GC.
    fn update_on_remove_label(&self, _: LabelId, _: Gid, _: &VertexData, _: &Transaction) -> Result<()> {
        Ok(())
    }

    fn update_on_set_property(
        &self,
        property: PropertyId,
        _old_value: &PropertyValue,
        gid: Gid,
        vertex: &VertexData,
        transaction: &Transaction,
    ) -> Result<()> {
        self.insert_for(gid, vertex, transaction.start_timestamp, |key| {
            key.contains_property(property)
        })
    }

    fn update_on_delete_vertex(&self, _: Gid, _: &VertexData, _: &Transaction) -> Result<()> {
        Ok(())
    }

    // Entries are in place since the write hooks ran.
    fn commit_entries(&self, _: Timestamp, _: Timestamp, _: &[(Gid, VertexData)]) -> Result<()> {
        Ok(())
    }

    fn abort_entries(&self, info: &AbortableInfo, start_timestamp: Timestamp) -> Result<()> {
        let removed = self.indices.with_lock(|indices| {
            let mut removed = 0usize;
            for (key, entries) in &info.entries {
                let Some(contents) = indices.get_mut(key) else {
                    continue;
                };
                for (values, gid) in entries {
                    let entry = Entry {
                        values: values.clone(),
                        gid: *gid,
                        timestamp: start_timestamp,
                    };
                    if contents.remove(&entry) {
                        removed += 1;
                    }
                }
            }
            removed
        })?;
        debug!(start_timestamp, removed, "Rolled back tentative index entries");
        Ok(())
    }

    fn approximate_vertex_count(&self, key: &LabelPropertyKey, filter: &ValueFilter) -> Result<Option<u64>> {
        self.indices.with_lock(|indices| {
            indices
                .get(key)
                .filter(|c| c.status == Status::Ready)
                .map(|c| c.count(filter))
        })
    }

    fn entries(&self, key: &LabelPropertyKey) -> Result<Vec<(Vec<PropertyValue>, Gid)>> {
        self.indices.with_lock(|indices| {
            let distinct: BTreeSet<(Vec<PropertyValue>, Gid)> = indices
                .get(key)
                .map(|c| c.entries.iter().map(|e| (e.values.clone(), e.gid)).collect())
                .unwrap_or_default();
            distinct.into_iter().collect()
        })
    }

    fn remove_obsolete_entries(&self, horizon: Timestamp, store: &VersionStore) -> Result<usize> {
        // Candidates first, so vertex locks are never taken under the index lock.
        let candidates: Vec<(LabelPropertyKey, Entry)> = self.indices.with_lock(|indices| {
            indices
                .iter()
                .flat_map(|(key, contents)| {
                    contents
                        .entries
                        .iter()
                        .filter(|e| e.timestamp < horizon)
                        .map(move |e| (key.clone(), e.clone()))
                })
                .collect()
        })?;

        let mut obsolete = Vec::new();
        for (key, entry) in candidates {
            let still_needed = match store.vertex_record(entry.gid)? {
                Some(record) => read(&record)?
                    .states_since(horizon)
                    .iter()
                    .any(|state| key.values_of(state).as_ref() == Some(&entry.values)),
                None => false,
            };
            if !still_needed {
                obsolete.push((key, entry));
            }
        }

        self.indices.with_lock(|indices| {
            let mut removed = 0;
            for (key, entry) in &obsolete {
                if let Some(contents) = indices.get_mut(key) {
                    if contents.remove(entry) {
                        removed += 1;
                    }
                }
            }
            removed
        })
    }
}
