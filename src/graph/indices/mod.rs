//! Label-property indices.
//!
//! [`LabelPropertyIndex`] is the contract both backends implement; the
//! storage only ever talks to it through `Arc<dyn LabelPropertyIndex>`.

pub mod disk;
pub mod in_memory;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::transaction::Transaction;
use super::versioning::{VersionChain, VersionStore};
use crate::error::{IndexDefinitionError, Result, StorageError};
use crate::sync::read;
use crate::types::{Gid, LabelId, PropertyId, PropertyValue, PropertyValueRange, Timestamp, VertexData};

pub use disk::DiskLabelPropertyIndex;
pub use in_memory::InMemoryLabelPropertyIndex;

/// How many vertices an index build visits between two cancellation checks.
pub const CANCEL_CHECK_INTERVAL: usize = 128;

/// Most properties one index may cover; the stored key records the count in one byte.
pub const MAX_INDEX_PROPERTIES: usize = u8::MAX as usize;

/// Identity of one index: a label plus an ordered list of properties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelPropertyKey {
    pub label: LabelId,
    pub properties: Vec<PropertyId>,
}

impl LabelPropertyKey {
    pub fn new(label: LabelId, properties: Vec<PropertyId>) -> Self {
        Self { label, properties }
    }

    /// Rejects empty, repeated or overlong property lists.
    pub fn validate(&self) -> std::result::Result<(), IndexDefinitionError> {
        let distinct: BTreeSet<_> = self.properties.iter().collect();
        if self.properties.is_empty()
            || self.properties.len() > MAX_INDEX_PROPERTIES
            || distinct.len() != self.properties.len()
        {
            return Err(IndexDefinitionError::Config);
        }
        Ok(())
    }

    pub fn contains_property(&self, property: PropertyId) -> bool {
        self.properties.contains(&property)
    }

    /// The values `vertex` contributes to this index, if any.
    pub fn values_of(&self, vertex: &VertexData) -> Option<Vec<PropertyValue>> {
        vertex.index_values(self.label, &self.properties)
    }
}

impl fmt::Display for LabelPropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}(", self.label)?;
        for (i, property) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", property)?;
        }
        write!(f, ")")
    }
}

/// Narrows an approximate count. Values apply to the leading properties
/// of the index; trailing properties are unconstrained.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueFilter {
    Any,
    Exact(Vec<PropertyValue>),
    Range(Vec<PropertyValueRange>),
}

impl ValueFilter {
    pub fn matches(&self, values: &[PropertyValue]) -> bool {
        match self {
            ValueFilter::Any => true,
            ValueFilter::Exact(prefix) => values.starts_with(prefix),
            ValueFilter::Range(ranges) => {
                ranges.len() <= values.len()
                    && ranges.iter().zip(values).all(|(range, value)| range.contains(value))
            }
        }
    }
}

/// Which maintained index could serve a lookup over the given labels and
/// properties, with positions into the caller's slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub key: LabelPropertyKey,
    pub label_position: usize,
    /// For each index property, its position in the caller's properties.
    pub property_positions: Vec<Option<usize>>,
}

/// Tentative entries an aborting transaction produced, per index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbortableInfo {
    pub entries: BTreeMap<LabelPropertyKey, Vec<(Vec<PropertyValue>, Gid)>>,
}

impl AbortableInfo {
    /// Projects every state an aborting transaction left on each vertex onto every index.
    pub fn collect<'a>(
        indices: &[LabelPropertyKey],
        vertices: impl IntoIterator<Item = (Gid, &'a [VertexData])>,
    ) -> Self {
        let mut entries: BTreeMap<LabelPropertyKey, Vec<(Vec<PropertyValue>, Gid)>> = BTreeMap::new();
        for (gid, states) in vertices {
            for key in indices {
                for state in states {
                    if let Some(values) = key.values_of(state) {
                        entries.entry(key.clone()).or_default().push((values, gid));
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The contract shared by the in-memory and the disk-backed index.
///
/// Maintenance hooks run inside the writing transaction and only record
/// tentative changes; `commit_entries` and `abort_entries` settle them.
pub trait LabelPropertyIndex: Send + Sync + fmt::Debug {
    /// Builds an index over every vertex the building transaction can see.
    /// `cancel` is polled before the scan, every [`CANCEL_CHECK_INTERVAL`]
    /// vertices and before the index is published; a cancelled build leaves
    /// nothing behind.
    fn create_index(
        &self,
        key: &LabelPropertyKey,
        store: &VersionStore,
        transaction: &Transaction,
        horizon: Timestamp,
        cancel: &dyn Fn() -> bool,
    ) -> Result<()>;

    fn drop_index(&self, key: &LabelPropertyKey) -> Result<()>;

    fn index_exists(&self, key: &LabelPropertyKey) -> Result<bool>;

    /// Every published index, in key order.
    fn list_indices(&self) -> Result<Vec<LabelPropertyKey>>;

    /// Every index writers currently feed: published ones and those still populating.
    fn registered_indices(&self) -> Result<Vec<LabelPropertyKey>>;

    fn update_on_add_label(&self, label: LabelId, gid: Gid, vertex: &VertexData, transaction: &Transaction) -> Result<()>;

    fn update_on_remove_label(&self, label: LabelId, gid: Gid, vertex: &VertexData, transaction: &Transaction) -> Result<()>;

    fn update_on_set_property(
        &self,
        property: PropertyId,
        old_value: &PropertyValue,
        gid: Gid,
        vertex: &VertexData,
        transaction: &Transaction,
    ) -> Result<()>;

    fn update_on_delete_vertex(&self, gid: Gid, vertex_before: &VertexData, transaction: &Transaction) -> Result<()>;

    /// Makes a committing transaction's entries permanent. `vertices` holds
    /// the final state of every vertex it touched.
    fn commit_entries(
        &self,
        start_timestamp: Timestamp,
        commit_timestamp: Timestamp,
        vertices: &[(Gid, VertexData)],
    ) -> Result<()>;

    /// Undoes exactly the tentative entries recorded by the transaction that began at `start_timestamp`.
    fn abort_entries(&self, info: &AbortableInfo, start_timestamp: Timestamp) -> Result<()>;

    /// Distinct vertices an index holds under `filter`; `None` when the index does not exist.
    fn approximate_vertex_count(&self, key: &LabelPropertyKey, filter: &ValueFilter) -> Result<Option<u64>>;

    /// Observable index contents as sorted, distinct `(values, gid)` pairs.
    fn entries(&self, key: &LabelPropertyKey) -> Result<Vec<(Vec<PropertyValue>, Gid)>>;

    /// GC hook: drops entries no reader at or after `horizon` can need.
    /// Returns how many entries were removed.
    fn remove_obsolete_entries(&self, horizon: Timestamp, store: &VersionStore) -> Result<usize>;

    /// Indices whose label is among `labels` and whose leading property is among `properties`.
    fn relevant_label_properties_indices_info(
        &self,
        labels: &[LabelId],
        properties: &[PropertyId],
    ) -> Result<Vec<IndexInfo>> {
        let mut infos = Vec::new();
        for key in self.list_indices()? {
            let Some(label_position) = labels.iter().position(|l| *l == key.label) else {
                continue;
            };
            let property_positions: Vec<Option<usize>> = key
                .properties
                .iter()
                .map(|p| properties.iter().position(|q| q == p))
                .collect();
            if property_positions.first().copied().flatten().is_none() {
                continue;
            }
            infos.push(IndexInfo {
                key,
                label_position,
                property_positions,
            });
        }
        Ok(infos)
    }
}

/// Visits every vertex record in gid order, polling `cancel` before the
/// first vertex and every [`CANCEL_CHECK_INTERVAL`] vertices.
pub(crate) fn scan_vertices(
    store: &VersionStore,
    cancel: &dyn Fn() -> bool,
    mut visit: impl FnMut(Gid, &VersionChain<VertexData>) -> Result<()>,
) -> Result<()> {
    for (i, (gid, record)) in store.vertex_records()?.into_iter().enumerate() {
        if i % CANCEL_CHECK_INTERVAL == 0 && cancel() {
            return Err(IndexDefinitionError::Cancelled.into());
        }
        let chain = read(&record)?;
        visit(gid, &chain)?;
    }
    if cancel() {
        return Err(IndexDefinitionError::Cancelled.into());
    }
    Ok(())
}

pub(crate) fn is_cancelled(error: &StorageError) -> bool {
    matches!(error, StorageError::IndexDefinition(IndexDefinitionError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Bound;

    fn key(properties: &[u64]) -> LabelPropertyKey {
        LabelPropertyKey::new(LabelId(1), properties.iter().map(|p| PropertyId(*p)).collect())
    }

    #[test]
    fn test_property_list_validation() {
        assert_eq!(key(&[]).validate(), Err(IndexDefinitionError::Config));
        assert_eq!(key(&[2, 2]).validate(), Err(IndexDefinitionError::Config));
        assert!(key(&[2, 3]).validate().is_ok());

        let widest: Vec<u64> = (0..MAX_INDEX_PROPERTIES as u64).collect();
        assert!(key(&widest).validate().is_ok());
        let too_wide: Vec<u64> = (0..=MAX_INDEX_PROPERTIES as u64).collect();
        assert_eq!(key(&too_wide).validate(), Err(IndexDefinitionError::Config));
    }

    #[test]
    fn test_value_filters_only_narrow() {
        let values = vec![PropertyValue::Int(30), PropertyValue::from("x")];
        assert!(ValueFilter::Any.matches(&values));
        assert!(ValueFilter::Exact(vec![PropertyValue::Int(30)]).matches(&values));
        assert!(!ValueFilter::Exact(vec![PropertyValue::Int(31)]).matches(&values));
        let range = PropertyValueRange::new(Bound::Excluded(PropertyValue::Int(20)), Bound::Unbounded);
        assert!(ValueFilter::Range(vec![range.clone()]).matches(&values));
        assert!(!ValueFilter::Range(vec![range.clone(), range.clone(), range]).matches(&values));
    }

    #[test]
    fn test_abortable_info_projects_every_state() {
        let mut before = VertexData::new();
        before.labels.insert(LabelId(1));
        let mut after = before.clone();
        after.properties.insert(PropertyId(2), PropertyValue::Int(5));
        let states = vec![after, before];

        let info = AbortableInfo::collect(&[key(&[2])], [(Gid(9), states.as_slice())]);
        assert_eq!(
            info.entries.get(&key(&[2])),
            Some(&vec![(vec![PropertyValue::Int(5)], Gid(9))])
        );
    }
}
