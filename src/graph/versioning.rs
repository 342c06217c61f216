use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock}; // Read-Write Lock: Allows many readers or one writer at a time.

use crate::error::{RecoveryError, Result, StorageError, StorageManipulationError};
use crate::sync::{read, write};
use crate::types::{
    EdgeData, Gid, LabelId, PropertyId, PropertyValue, Timestamp, TransactionId, VertexData,
};

/// Shared between a transaction and every delta it created.
///
/// Holds the transaction id while the transaction is in flight and the
/// commit timestamp once it committed; flipping it publishes all of the
/// transaction's deltas at once.
#[derive(Debug)]
pub struct CommitInfo {
    timestamp: AtomicU64,
}

impl CommitInfo {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            timestamp: AtomicU64::new(transaction_id),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, commit_timestamp: Timestamp) {
        self.timestamp.store(commit_timestamp, Ordering::Release);
    }
}

/// What a reader is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub start_timestamp: Timestamp,
    pub transaction_id: TransactionId,
}

impl Visibility {
    /// The view shared by every transaction starting at or after `horizon`.
    pub fn at_horizon(horizon: Timestamp) -> Self {
        Self {
            start_timestamp: horizon,
            transaction_id: 0,
        }
    }

    pub fn sees(&self, timestamp: u64) -> bool {
        timestamp == self.transaction_id || timestamp < self.start_timestamp
    }
}

/// The undo action recorded by a write; applying it restores the previous state.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaAction {
    /// Undo of a creation.
    DeleteObject,
    /// Undo of a deletion.
    RecreateObject,
    AddLabel(LabelId),
    RemoveLabel(LabelId),
    SetProperty(PropertyId, PropertyValue),
    // Recorded on both endpoints of a created/deleted edge. Adjacency lives
    // outside the vertex state, so undoing them is a no-op.
    AddEdge(Gid),
    RemoveEdge(Gid),
}

#[derive(Debug, Clone)]
pub struct Delta {
    pub commit_info: Arc<CommitInfo>,
    pub action: DeltaAction,
}

impl Delta {
    pub fn timestamp(&self) -> u64 {
        self.commit_info.timestamp()
    }
}

/// Element state that knows how to roll one delta back.
pub trait Versioned: Clone {
    fn undo(&mut self, action: &DeltaAction);
    fn is_deleted(&self) -> bool;
}

fn undo_property(
    properties: &mut BTreeMap<PropertyId, PropertyValue>,
    property: PropertyId,
    old: &PropertyValue,
) {
    if old.is_null() {
        properties.remove(&property);
    } else {
        properties.insert(property, old.clone());
    }
}

impl Versioned for VertexData {
    fn undo(&mut self, action: &DeltaAction) {
        match action {
            DeltaAction::DeleteObject => self.deleted = true,
            DeltaAction::RecreateObject => self.deleted = false,
            DeltaAction::AddLabel(label) => {
                self.labels.insert(*label);
            }
            DeltaAction::RemoveLabel(label) => {
                self.labels.remove(label);
            }
            DeltaAction::SetProperty(property, old) => undo_property(&mut self.properties, *property, old),
            DeltaAction::AddEdge(_) | DeltaAction::RemoveEdge(_) => {}
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl Versioned for EdgeData {
    fn undo(&mut self, action: &DeltaAction) {
        match action {
            DeltaAction::DeleteObject => self.deleted = true,
            DeltaAction::RecreateObject => self.deleted = false,
            DeltaAction::SetProperty(property, old) => undo_property(&mut self.properties, *property, old),
            DeltaAction::AddLabel(_)
            | DeltaAction::RemoveLabel(_)
            | DeltaAction::AddEdge(_)
            | DeltaAction::RemoveEdge(_) => {}
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// One element: its newest state plus the undo deltas that lead back
/// through its history, ordered oldest to newest.
#[derive(Debug, Clone)]
pub struct VersionChain<T: Versioned> {
    pub current: T,
    pub deltas: Vec<Delta>,
}

impl<T: Versioned> VersionChain<T> {
    /// A freshly created element; invisible to everyone but its creator until commit.
    pub fn created(data: T, commit_info: Arc<CommitInfo>) -> Self {
        Self {
            current: data,
            deltas: vec![Delta {
                commit_info,
                action: DeltaAction::DeleteObject,
            }],
        }
    }

    /// An element restored from durable storage, visible to everyone.
    pub fn recovered(data: T) -> Self {
        Self {
            current: data,
            deltas: Vec::new(),
        }
    }

    /// The state `view` sees, deleted or not.
    pub fn state_for(&self, view: &Visibility) -> T {
        let mut state = self.current.clone();
        for delta in self.deltas.iter().rev() {
            if view.sees(delta.timestamp()) {
                break;
            }
            state.undo(&delta.action);
        }
        state
    }

    /// The live state `view` sees.
    pub fn visible(&self, view: &Visibility) -> Option<T> {
        let state = self.state_for(view);
        (!state.is_deleted()).then_some(state)
    }

    /// Commit timestamp of the newest delta `view` sees; 0 for recovered or
    /// fully collected history.
    pub fn visible_commit_timestamp(&self, view: &Visibility) -> Timestamp {
        self.deltas
            .iter()
            .rev()
            .map(Delta::timestamp)
            .find(|ts| view.sees(*ts))
            .filter(|ts| *ts < crate::types::TRANSACTION_INITIAL_ID)
            .unwrap_or(0)
    }

    /// Every state some transaction starting at or after `horizon` (or still
    /// in flight) can observe: the newest state first, the horizon's view last.
    pub fn states_since(&self, horizon: Timestamp) -> Vec<T> {
        let view = Visibility::at_horizon(horizon);
        let mut state = self.current.clone();
        let mut states = vec![state.clone()];
        for delta in self.deltas.iter().rev() {
            if view.sees(delta.timestamp()) {
                break;
            }
            state.undo(&delta.action);
            states.push(state.clone());
        }
        states
    }

    /// Every state `transaction_id` produced, plus the state before it started.
    pub fn states_touched_by(&self, transaction_id: TransactionId) -> Vec<T> {
        let mut state = self.current.clone();
        let mut states = vec![state.clone()];
        for delta in self.deltas.iter().rev() {
            if delta.timestamp() != transaction_id {
                break;
            }
            state.undo(&delta.action);
            states.push(state.clone());
        }
        states
    }

    /// First-updater-wins: a writer may only build on a chain whose newest
    /// delta is its own or was committed before it started.
    pub fn prepare_for_write(&self, view: &Visibility) -> std::result::Result<(), StorageManipulationError> {
        match self.deltas.last() {
            Some(delta) if !view.sees(delta.timestamp()) => Err(StorageManipulationError::Serialization),
            _ => Ok(()),
        }
    }

    /// Pops and undoes the deltas of an aborted transaction. Returns how many were rolled back.
    pub fn rollback(&mut self, transaction_id: TransactionId) -> usize {
        let mut undone = 0;
        while let Some(delta) = self.deltas.last() {
            if delta.timestamp() != transaction_id {
                break;
            }
            let action = delta.action.clone();
            self.current.undo(&action);
            self.deltas.pop();
            undone += 1;
        }
        undone
    }

    /// Drops deltas every current and future reader already sees. Returns how many were dropped.
    pub fn trim(&mut self, horizon: Timestamp) -> usize {
        let view = Visibility::at_horizon(horizon);
        match self.deltas.iter().rposition(|d| view.sees(d.timestamp())) {
            Some(newest_visible) => {
                self.deltas.drain(..=newest_visible);
                newest_visible + 1
            }
            None => 0,
        }
    }
}

pub type VertexRecord = Arc<RwLock<VersionChain<VertexData>>>;
pub type EdgeRecord = Arc<RwLock<VersionChain<EdgeData>>>;

/// VersionStore holds every vertex and edge together with its history.
///
/// There is no global lock over the graph: the maps are locked only to
/// find, insert or remove an element; all other work happens under the
/// element's own lock.
#[derive(Debug)]
pub struct VersionStore {
    vertices: RwLock<BTreeMap<Gid, VertexRecord>>,
    edges: RwLock<BTreeMap<Gid, EdgeRecord>>,
    // Vertex -> incident edges, including deleted edges not yet collected.
    adjacency: RwLock<BTreeMap<Gid, BTreeSet<Gid>>>,
    next_vertex_gid: AtomicU64,
    next_edge_gid: AtomicU64,
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            vertices: RwLock::new(BTreeMap::new()),
            edges: RwLock::new(BTreeMap::new()),
            adjacency: RwLock::new(BTreeMap::new()),
            next_vertex_gid: AtomicU64::new(0),
            next_edge_gid: AtomicU64::new(0),
        }
    }

    pub fn vertex_record(&self, gid: Gid) -> Result<Option<VertexRecord>> {
        Ok(read(&self.vertices)?.get(&gid).cloned())
    }

    pub fn edge_record(&self, gid: Gid) -> Result<Option<EdgeRecord>> {
        Ok(read(&self.edges)?.get(&gid).cloned())
    }

    /// Handles to every vertex, in gid order. The map lock is released before returning.
    pub fn vertex_records(&self) -> Result<Vec<(Gid, VertexRecord)>> {
        Ok(read(&self.vertices)?
            .iter()
            .map(|(gid, record)| (*gid, Arc::clone(record)))
            .collect())
    }

    pub fn edge_records(&self) -> Result<Vec<(Gid, EdgeRecord)>> {
        Ok(read(&self.edges)?
            .iter()
            .map(|(gid, record)| (*gid, Arc::clone(record)))
            .collect())
    }

    pub fn vertex_count(&self) -> Result<usize> {
        Ok(read(&self.vertices)?.len())
    }

    pub fn edge_count(&self) -> Result<usize> {
        Ok(read(&self.edges)?.len())
    }

    pub fn insert_vertex(&self, commit_info: Arc<CommitInfo>) -> Result<Gid> {
        let gid = Gid(self.next_vertex_gid.fetch_add(1, Ordering::AcqRel));
        let record = Arc::new(RwLock::new(VersionChain::created(VertexData::new(), commit_info)));
        write(&self.vertices)?.insert(gid, record);
        Ok(gid)
    }

    /// Reserves a gid for an edge that [`VersionStore::insert_edge`] will add.
    pub fn allocate_edge_gid(&self) -> Gid {
        Gid(self.next_edge_gid.fetch_add(1, Ordering::AcqRel))
    }

    pub fn insert_edge(&self, gid: Gid, data: EdgeData, commit_info: Arc<CommitInfo>) -> Result<()> {
        let (from, to) = (data.from, data.to);
        let record = Arc::new(RwLock::new(VersionChain::created(data, commit_info)));
        write(&self.edges)?.insert(gid, record);
        let mut adjacency = write(&self.adjacency)?;
        adjacency.entry(from).or_default().insert(gid);
        adjacency.entry(to).or_default().insert(gid);
        Ok(())
    }

    /// Every edge ever attached to `vertex` that has not been collected yet.
    pub fn incident_edges(&self, vertex: Gid) -> Result<Vec<Gid>> {
        Ok(read(&self.adjacency)?
            .get(&vertex)
            .map(|edges| edges.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Applies `f` to the newest state of a vertex and records the undo
    /// delta it returns. Returns `f`'s result and the state after the update.
    pub fn update_vertex<R>(
        &self,
        gid: Gid,
        view: &Visibility,
        commit_info: &Arc<CommitInfo>,
        f: impl FnOnce(&mut VertexData) -> Option<(R, DeltaAction)>,
    ) -> Result<Option<(R, VertexData)>> {
        let record = self.vertex_record(gid)?.ok_or(StorageError::VertexNotFound(gid))?;
        let mut chain = write(&record)?;
        update_chain(gid, &mut chain, view, commit_info, f)
    }

    pub fn update_edge<R>(
        &self,
        gid: Gid,
        view: &Visibility,
        commit_info: &Arc<CommitInfo>,
        f: impl FnOnce(&mut EdgeData) -> Option<(R, DeltaAction)>,
    ) -> Result<Option<(R, EdgeData)>> {
        let record = self.edge_record(gid)?.ok_or(StorageError::EdgeNotFound(gid))?;
        let mut chain = write(&record)?;
        update_chain(gid, &mut chain, view, commit_info, f)
    }

    pub fn vertex(&self, gid: Gid, view: &Visibility) -> Result<Option<VertexData>> {
        match self.vertex_record(gid)? {
            Some(record) => Ok(read(&record)?.visible(view)),
            None => Ok(None),
        }
    }

    pub fn edge(&self, gid: Gid, view: &Visibility) -> Result<Option<EdgeData>> {
        match self.edge_record(gid)? {
            Some(record) => Ok(read(&record)?.visible(view)),
            None => Ok(None),
        }
    }

    /// Newest state of a vertex as its writer sees it (uncommitted changes included).
    pub fn vertex_current(&self, gid: Gid) -> Result<Option<VertexData>> {
        match self.vertex_record(gid)? {
            Some(record) => Ok(Some(read(&record)?.current.clone())),
            None => Ok(None),
        }
    }

    /// Rolls back `transaction_id` on a vertex, dropping it if the transaction created it.
    pub fn rollback_vertex(&self, gid: Gid, transaction_id: TransactionId) -> Result<()> {
        let Some(record) = self.vertex_record(gid)? else {
            return Ok(());
        };
        let orphaned = {
            let mut chain = write(&record)?;
            chain.rollback(transaction_id);
            chain.deltas.is_empty() && chain.current.deleted
        };
        if orphaned {
            write(&self.vertices)?.remove(&gid);
            write(&self.adjacency)?.remove(&gid);
        }
        Ok(())
    }

    pub fn rollback_edge(&self, gid: Gid, transaction_id: TransactionId) -> Result<()> {
        let Some(record) = self.edge_record(gid)? else {
            return Ok(());
        };
        let orphaned = {
            let mut chain = write(&record)?;
            chain.rollback(transaction_id);
            chain.deltas.is_empty() && chain.current.deleted
        };
        if orphaned {
            self.remove_edge(gid)?;
        }
        Ok(())
    }

    /// Trims a vertex's history below `horizon`; a vertex whose deletion
    /// everyone sees is removed. Returns (deltas dropped, removed).
    pub fn collect_vertex(&self, gid: Gid, horizon: Timestamp) -> Result<(usize, bool)> {
        let Some(record) = self.vertex_record(gid)? else {
            return Ok((0, false));
        };
        let (trimmed, dead) = {
            let mut chain = write(&record)?;
            let trimmed = chain.trim(horizon);
            (trimmed, chain.deltas.is_empty() && chain.current.deleted)
        };
        if dead {
            write(&self.vertices)?.remove(&gid);
            write(&self.adjacency)?.remove(&gid);
        }
        Ok((trimmed, dead))
    }

    pub fn collect_edge(&self, gid: Gid, horizon: Timestamp) -> Result<(usize, bool)> {
        let Some(record) = self.edge_record(gid)? else {
            return Ok((0, false));
        };
        let (trimmed, dead) = {
            let mut chain = write(&record)?;
            let trimmed = chain.trim(horizon);
            (trimmed, chain.deltas.is_empty() && chain.current.deleted)
        };
        if dead {
            self.remove_edge(gid)?;
        }
        Ok((trimmed, dead))
    }

    fn remove_edge(&self, gid: Gid) -> Result<()> {
        let Some(record) = write(&self.edges)?.remove(&gid) else {
            return Ok(());
        };
        let (from, to) = {
            let chain = read(&record)?;
            (chain.current.from, chain.current.to)
        };
        let mut adjacency = write(&self.adjacency)?;
        for endpoint in [from, to] {
            if let Some(edges) = adjacency.get_mut(&endpoint) {
                edges.remove(&gid);
            }
        }
        Ok(())
    }

    /// Inserts a vertex restored from a snapshot.
    pub fn insert_recovered_vertex(&self, gid: Gid, data: VertexData) -> std::result::Result<(), RecoveryError> {
        let mut vertices = self.vertices.write().map_err(|e| RecoveryError::InvalidData {
            offset: 0,
            reason: format!("vertex map lock poisoned: {}", e),
        })?;
        if vertices.contains_key(&gid) {
            return Err(RecoveryError::DuplicateGid { kind: "vertex", gid });
        }
        vertices.insert(gid, Arc::new(RwLock::new(VersionChain::recovered(data))));
        self.next_vertex_gid.fetch_max(gid.0 + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Inserts an edge restored from a snapshot; both endpoints must already exist.
    pub fn insert_recovered_edge(&self, gid: Gid, data: EdgeData) -> std::result::Result<(), RecoveryError> {
        let poisoned = |e: String| RecoveryError::InvalidData {
            offset: 0,
            reason: format!("edge map lock poisoned: {}", e),
        };
        {
            let vertices = self.vertices.read().map_err(|e| poisoned(e.to_string()))?;
            for endpoint in [data.from, data.to] {
                if !vertices.contains_key(&endpoint) {
                    return Err(RecoveryError::DanglingReference(format!(
                        "edge {} references missing vertex {}",
                        gid, endpoint
                    )));
                }
            }
        }
        let (from, to) = (data.from, data.to);
        {
            let mut edges = self.edges.write().map_err(|e| poisoned(e.to_string()))?;
            if edges.contains_key(&gid) {
                return Err(RecoveryError::DuplicateGid { kind: "edge", gid });
            }
            edges.insert(gid, Arc::new(RwLock::new(VersionChain::recovered(data))));
        }
        let mut adjacency = self.adjacency.write().map_err(|e| poisoned(e.to_string()))?;
        adjacency.entry(from).or_default().insert(gid);
        adjacency.entry(to).or_default().insert(gid);
        self.next_edge_gid.fetch_max(gid.0 + 1, Ordering::AcqRel);
        Ok(())
    }

    pub fn next_vertex_gid(&self) -> u64 {
        self.next_vertex_gid.load(Ordering::Acquire)
    }

    pub fn next_edge_gid(&self) -> u64 {
        self.next_edge_gid.load(Ordering::Acquire)
    }
}

fn update_chain<T: Versioned, R>(
    gid: Gid,
    chain: &mut VersionChain<T>,
    view: &Visibility,
    commit_info: &Arc<CommitInfo>,
    f: impl FnOnce(&mut T) -> Option<(R, DeltaAction)>,
) -> Result<Option<(R, T)>> {
    chain.prepare_for_write(view)?;
    if chain.current.is_deleted() {
        return Err(StorageError::DeletedObject(gid));
    }
    let Some((result, undo)) = f(&mut chain.current) else {
        return Ok(None);
    };
    chain.deltas.push(Delta {
        commit_info: Arc::clone(commit_info),
        action: undo,
    });
    Ok(Some((result, chain.current.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TRANSACTION_INITIAL_ID;

    fn view(start: Timestamp, id: TransactionId) -> Visibility {
        Visibility {
            start_timestamp: start,
            transaction_id: id,
        }
    }

    #[test]
    fn test_uncommitted_vertex_is_only_visible_to_its_writer() {
        let store = VersionStore::new();
        let writer = TRANSACTION_INITIAL_ID;
        let info = Arc::new(CommitInfo::new(writer));
        let gid = store.insert_vertex(Arc::clone(&info)).unwrap();

        assert!(store.vertex(gid, &view(1, writer)).unwrap().is_some());
        assert!(store.vertex(gid, &view(1, writer + 1)).unwrap().is_none());

        info.publish(5);
        assert!(store.vertex(gid, &view(5, writer + 1)).unwrap().is_none());
        assert!(store.vertex(gid, &view(6, writer + 1)).unwrap().is_some());
    }

    #[test]
    fn test_version_time_travel() {
        let store = VersionStore::new();
        let label = LabelId(1);
        let t1 = TRANSACTION_INITIAL_ID;
        let info1 = Arc::new(CommitInfo::new(t1));
        let gid = store.insert_vertex(Arc::clone(&info1)).unwrap();
        store
            .update_vertex(gid, &view(1, t1), &info1, |v| {
                v.labels.insert(label);
                Some(((), DeltaAction::RemoveLabel(label)))
            })
            .unwrap();
        info1.publish(2);

        let t2 = t1 + 1;
        let info2 = Arc::new(CommitInfo::new(t2));
        store
            .update_vertex(gid, &view(3, t2), &info2, |v| {
                v.properties.insert(PropertyId(7), PropertyValue::Int(30));
                Some(((), DeltaAction::SetProperty(PropertyId(7), PropertyValue::Null)))
            })
            .unwrap();
        info2.publish(4);

        // Reader that started between the two commits sees the label but not the property.
        let between = store.vertex(gid, &view(3, 0)).unwrap().unwrap();
        assert!(between.has_label(label));
        assert!(between.property(PropertyId(7)).is_null());

        let after = store.vertex(gid, &view(5, 0)).unwrap().unwrap();
        assert_eq!(after.property(PropertyId(7)), PropertyValue::Int(30));

        // Before the creation committed nothing is there.
        assert!(store.vertex(gid, &view(2, 0)).unwrap().is_none());
    }

    #[test]
    fn test_second_writer_is_rejected() {
        let store = VersionStore::new();
        let info = Arc::new(CommitInfo::new(TRANSACTION_INITIAL_ID));
        let gid = store.insert_vertex(Arc::clone(&info)).unwrap();
        info.publish(1);

        let first = Arc::new(CommitInfo::new(TRANSACTION_INITIAL_ID + 1));
        store
            .update_vertex(gid, &view(2, TRANSACTION_INITIAL_ID + 1), &first, |v| {
                v.labels.insert(LabelId(1));
                Some(((), DeltaAction::RemoveLabel(LabelId(1))))
            })
            .unwrap();

        let second = Arc::new(CommitInfo::new(TRANSACTION_INITIAL_ID + 2));
        let result = store.update_vertex(gid, &view(3, TRANSACTION_INITIAL_ID + 2), &second, |v| {
            v.labels.insert(LabelId(2));
            Some(((), DeltaAction::RemoveLabel(LabelId(2))))
        });
        assert!(matches!(
            result,
            Err(StorageError::Manipulation(StorageManipulationError::Serialization))
        ));
    }

    #[test]
    fn test_rollback_drops_created_vertex() {
        let store = VersionStore::new();
        let id = TRANSACTION_INITIAL_ID;
        let gid = store.insert_vertex(Arc::new(CommitInfo::new(id))).unwrap();
        store.rollback_vertex(gid, id).unwrap();
        assert!(store.vertex_record(gid).unwrap().is_none());
        assert_eq!(store.vertex_count().unwrap(), 0);
    }

    #[test]
    fn test_trim_keeps_history_active_readers_need() {
        let info_old = Arc::new(CommitInfo::new(TRANSACTION_INITIAL_ID));
        let mut chain = VersionChain::created(VertexData::new(), Arc::clone(&info_old));
        info_old.publish(1);
        let info_new = Arc::new(CommitInfo::new(TRANSACTION_INITIAL_ID + 1));
        chain.current.labels.insert(LabelId(3));
        chain.deltas.push(Delta {
            commit_info: Arc::clone(&info_new),
            action: DeltaAction::RemoveLabel(LabelId(3)),
        });
        info_new.publish(5);

        // A reader started at 3 still needs the label-less version.
        assert_eq!(chain.trim(3), 1);
        assert_eq!(chain.deltas.len(), 1);
        assert_eq!(chain.states_since(3).len(), 2);

        assert_eq!(chain.trim(6), 1);
        assert!(chain.deltas.is_empty());
        assert_eq!(chain.states_since(6), vec![chain.current.clone()]);
    }
}
