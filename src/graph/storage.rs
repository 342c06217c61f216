use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::catalog::{EnumStore, NameIdMapper};
use super::constraints::{Constraints, ConstraintsInfo};
use super::epoch::ReplicationEpoch;
use super::indices::{
    AbortableInfo, DiskLabelPropertyIndex, InMemoryLabelPropertyIndex, IndexInfo, LabelPropertyIndex,
    LabelPropertyKey, ValueFilter,
};
use super::schema::SchemaInfo;
use super::transaction::{IsolationLevel, Transaction, TransactionManager};
use super::versioning::{DeltaAction, VersionStore, Visibility};
use crate::config::{Config, StorageMode};
use crate::durability::snapshot::{self, RecoveredSnapshot, SnapshotSource};
use crate::error::{Result, StorageError, StorageManipulationError};
use crate::sync::{read, write, Synchronized};
use crate::types::{
    EdgeData, EdgeTypeId, EnumTypeId, Gid, LabelId, PropertyId, PropertyType, PropertyValue, Timestamp,
    VertexData,
};

/// What one garbage collection run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub horizon: Timestamp,
    pub deltas_removed: usize,
    pub vertices_removed: usize,
    pub edges_removed: usize,
    pub index_entries_removed: usize,
}

/// Storage ties the versioned graph store, the transaction engine, the
/// label-property index and the catalogs together.
///
/// Every write goes through a [`Transaction`]; `commit` and `abort`
/// consume it. The index backend is picked from [`Config::storage_mode`]
/// and only ever reached through the [`LabelPropertyIndex`] contract.
#[derive(Debug)]
pub struct Storage {
    config: Config,
    store: VersionStore,
    transactions: TransactionManager,
    indices: Arc<dyn LabelPropertyIndex>,
    constraints: Constraints,
    name_mapper: NameIdMapper,
    enums: EnumStore,
    epoch: ReplicationEpoch,
    schema: Synchronized<SchemaInfo>,
    uuid: RwLock<String>,
    gc_lock: Mutex<()>,
    snapshot_lock: Mutex<()>,
}

/// Both endpoints, once for a self-loop.
fn endpoints(from: Gid, to: Gid) -> Vec<Gid> {
    if from == to { vec![from] } else { vec![from, to] }
}

/// `Int(1)` and `Double(1.0)` compare equal but are different values to store.
fn same_value(old: &PropertyValue, new: &PropertyValue) -> bool {
    old == new && old.property_type() == new.property_type()
}

fn visible_vertices(store: &VersionStore, view: &Visibility) -> Result<Vec<(Gid, VertexData)>> {
    let mut vertices = Vec::new();
    for (gid, record) in store.vertex_records()? {
        if let Some(vertex) = read(&record)?.visible(view) {
            vertices.push((gid, vertex));
        }
    }
    Ok(vertices)
}

fn visible_edges(store: &VersionStore, view: &Visibility) -> Result<Vec<(Gid, EdgeData)>> {
    let mut edges = Vec::new();
    for (gid, record) in store.edge_records()? {
        if let Some(edge) = read(&record)?.visible(view) {
            edges.push((gid, edge));
        }
    }
    Ok(edges)
}

/// The state before `transaction_id` touched the element and the state it left.
fn net_change<T>(states: &[T]) -> Option<(&T, &T)> {
    Some((states.last()?, states.first()?))
}

/// Loads the newest snapshot that reads cleanly. Older snapshots are tried
/// when a newer one is corrupt; if none loads, the newest failure is returned.
fn recover_latest(config: &Config) -> Result<Option<(VersionStore, RecoveredSnapshot)>> {
    let directory = config.snapshot_directory();
    let mut newest_failure = None;
    for path in snapshot::snapshot_files(&directory)?.into_iter().rev() {
        let store = VersionStore::new();
        match snapshot::load_snapshot(&path, &store, config.durability.recovery_thread_count) {
            Ok(recovered) => {
                info!(path = %path.display(), "Recovered from snapshot");
                return Ok(Some((store, recovered)));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot");
                newest_failure.get_or_insert(e);
            }
        }
    }
    match newest_failure {
        Some(e) => Err(e.into()),
        None => Ok(None),
    }
}

impl Storage {
    /// Opens the storage rooted at `config.data_directory`, recovering the
    /// newest snapshot when `recover_on_startup` is set and rebuilding every
    /// index it or the on-disk catalog lists.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_directory)?;

        let recovered = if config.durability.recover_on_startup {
            recover_latest(&config)?
        } else {
            None
        };

        let transactions = TransactionManager::new();
        let constraints = Constraints::new();
        let name_mapper = NameIdMapper::new();
        let enums = EnumStore::new();
        let epoch = ReplicationEpoch::new();
        let mut uuid = Uuid::new_v4().to_string();
        let mut index_keys = Vec::new();
        let mut schema = SchemaInfo::default();

        let store = match recovered {
            Some((store, recovered)) => {
                for (id, name) in recovered.mapper {
                    name_mapper.insert_recovered(id, name)?;
                }
                enums.restore(recovered.enums)?;
                epoch.restore(recovered.info.epoch_id.clone(), recovered.epoch_history)?;
                constraints.restore(recovered.constraints)?;
                transactions.advance_past(recovered.stats.highest_timestamp)?;
                uuid = recovered.info.uuid.clone();
                index_keys = recovered.indices;
                schema = recovered.schema;
                store
            }
            None => VersionStore::new(),
        };

        let indices: Arc<dyn LabelPropertyIndex> = match config.storage_mode {
            StorageMode::InMemory => Arc::new(InMemoryLabelPropertyIndex::new()),
            StorageMode::OnDisk => {
                let disk = DiskLabelPropertyIndex::open(&config.index_directory())?;
                // Stored entries may predate the recovered graph; rebuild from scratch.
                index_keys.extend(disk.load_index_info()?);
                disk.reset()?;
                Arc::new(disk)
            }
        };
        index_keys.sort();
        index_keys.dedup();

        let storage = Self {
            config,
            store,
            transactions,
            indices,
            constraints,
            name_mapper,
            enums,
            epoch,
            schema: Synchronized::new(schema),
            uuid: RwLock::new(uuid),
            gc_lock: Mutex::new(()),
            snapshot_lock: Mutex::new(()),
        };
        for key in &index_keys {
            storage.create_index(key, &|| false)?;
        }
        info!(
            vertices = storage.store.vertex_count()?,
            edges = storage.store.edge_count()?,
            indices = index_keys.len(),
            mode = ?storage.config.storage_mode,
            "Storage opened"
        );
        Ok(storage)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn begin(&self) -> Result<Transaction> {
        self.begin_with(IsolationLevel::default())
    }

    pub fn begin_with(&self, isolation_level: IsolationLevel) -> Result<Transaction> {
        self.transactions.begin(isolation_level)
    }

    // --- Writes ---

    pub fn create_vertex(&self, transaction: &mut Transaction) -> Result<Gid> {
        let gid = self.store.insert_vertex(Arc::clone(&transaction.commit_info))?;
        transaction.modified_vertices.insert(gid);
        Ok(gid)
    }

    /// Returns false if the vertex already had the label.
    pub fn add_label(&self, transaction: &mut Transaction, gid: Gid, label: LabelId) -> Result<bool> {
        let view = transaction.visibility();
        let updated = self
            .store
            .update_vertex(gid, &view, &transaction.commit_info, |vertex| {
                vertex
                    .labels
                    .insert(label)
                    .then_some(((), DeltaAction::RemoveLabel(label)))
            })?;
        let Some(((), vertex)) = updated else {
            return Ok(false);
        };
        transaction.modified_vertices.insert(gid);
        self.indices
            .update_on_add_label(label, gid, &vertex, transaction)?;
        Ok(true)
    }

    /// Returns false if the vertex did not have the label.
    pub fn remove_label(&self, transaction: &mut Transaction, gid: Gid, label: LabelId) -> Result<bool> {
        let view = transaction.visibility();
        let updated = self
            .store
            .update_vertex(gid, &view, &transaction.commit_info, |vertex| {
                vertex
                    .labels
                    .remove(&label)
                    .then_some(((), DeltaAction::AddLabel(label)))
            })?;
        let Some(((), vertex)) = updated else {
            return Ok(false);
        };
        transaction.modified_vertices.insert(gid);
        self.indices
            .update_on_remove_label(label, gid, &vertex, transaction)?;
        Ok(true)
    }

    /// Sets (or, with `Null`, removes) a vertex property and returns the old value.
    pub fn set_property(
        &self,
        transaction: &mut Transaction,
        gid: Gid,
        property: PropertyId,
        value: PropertyValue,
    ) -> Result<PropertyValue> {
        let view = transaction.visibility();
        let updated = self
            .store
            .update_vertex(gid, &view, &transaction.commit_info, |vertex| {
                let old = vertex.property(property);
                if same_value(&old, &value) {
                    return None;
                }
                if value.is_null() {
                    vertex.properties.remove(&property);
                } else {
                    vertex.properties.insert(property, value.clone());
                }
                Some((old.clone(), DeltaAction::SetProperty(property, old)))
            })?;
        let Some((old, vertex)) = updated else {
            return Ok(value);
        };
        transaction.modified_vertices.insert(gid);
        self.indices
            .update_on_set_property(property, &old, gid, &vertex, transaction)?;
        Ok(old)
    }

    /// Deletes a vertex that has no visible edges.
    pub fn delete_vertex(&self, transaction: &mut Transaction, gid: Gid) -> Result<()> {
        let view = transaction.visibility();
        for edge in self.store.incident_edges(gid)? {
            if self.store.edge(edge, &view)?.is_some() {
                return Err(StorageError::VertexHasEdges(gid));
            }
        }
        let updated = self
            .store
            .update_vertex(gid, &view, &transaction.commit_info, |vertex| {
                let before = vertex.clone();
                vertex.deleted = true;
                Some((before, DeltaAction::RecreateObject))
            })?;
        if let Some((before, _)) = updated {
            transaction.modified_vertices.insert(gid);
            self.indices
                .update_on_delete_vertex(gid, &before, transaction)?;
        }
        Ok(())
    }

    /// Deletes a vertex together with its visible edges. Returns how many edges were deleted.
    pub fn detach_delete_vertex(&self, transaction: &mut Transaction, gid: Gid) -> Result<usize> {
        let view = transaction.visibility();
        let mut deleted_edges = 0;
        for edge in self.store.incident_edges(gid)? {
            if self.store.edge(edge, &view)?.is_some() {
                self.delete_edge(transaction, edge)?;
                deleted_edges += 1;
            }
        }
        self.delete_vertex(transaction, gid)?;
        Ok(deleted_edges)
    }

    pub fn create_edge(
        &self,
        transaction: &mut Transaction,
        from: Gid,
        to: Gid,
        edge_type: EdgeTypeId,
    ) -> Result<Gid> {
        let view = transaction.visibility();
        let gid = self.store.allocate_edge_gid();
        // Touching the endpoints makes a concurrent delete of either one conflict.
        for endpoint in endpoints(from, to) {
            self.store
                .update_vertex(endpoint, &view, &transaction.commit_info, |_| {
                    Some(((), DeltaAction::RemoveEdge(gid)))
                })?;
            transaction.modified_vertices.insert(endpoint);
        }
        self.store.insert_edge(
            gid,
            EdgeData::new(edge_type, from, to),
            Arc::clone(&transaction.commit_info),
        )?;
        transaction.modified_edges.insert(gid);
        Ok(gid)
    }

    pub fn delete_edge(&self, transaction: &mut Transaction, gid: Gid) -> Result<()> {
        let view = transaction.visibility();
        let updated = self
            .store
            .update_edge(gid, &view, &transaction.commit_info, |edge| {
                edge.deleted = true;
                Some(((edge.from, edge.to), DeltaAction::RecreateObject))
            })?;
        let Some(((from, to), _)) = updated else {
            return Ok(());
        };
        transaction.modified_edges.insert(gid);
        for endpoint in endpoints(from, to) {
            self.store
                .update_vertex(endpoint, &view, &transaction.commit_info, |_| {
                    Some(((), DeltaAction::AddEdge(gid)))
                })?;
            transaction.modified_vertices.insert(endpoint);
        }
        Ok(())
    }

    /// Sets an edge property and returns the old value. Fails unless
    /// `properties_on_edges` is enabled.
    pub fn set_edge_property(
        &self,
        transaction: &mut Transaction,
        gid: Gid,
        property: PropertyId,
        value: PropertyValue,
    ) -> Result<PropertyValue> {
        if !self.config.items.properties_on_edges {
            return Err(StorageError::PropertiesDisabled);
        }
        let view = transaction.visibility();
        let updated = self
            .store
            .update_edge(gid, &view, &transaction.commit_info, |edge| {
                let old = edge.property(property);
                if same_value(&old, &value) {
                    return None;
                }
                if value.is_null() {
                    edge.properties.remove(&property);
                } else {
                    edge.properties.insert(property, value.clone());
                }
                Some((old.clone(), DeltaAction::SetProperty(property, old)))
            })?;
        match updated {
            Some((old, _)) => {
                transaction.modified_edges.insert(gid);
                Ok(old)
            }
            None => Ok(value),
        }
    }

    // --- Reads ---

    pub fn vertex(&self, transaction: &Transaction, gid: Gid) -> Result<Option<VertexData>> {
        self.store.vertex(gid, &transaction.visibility())
    }

    /// Every vertex the transaction sees, in gid order.
    pub fn vertices(&self, transaction: &Transaction) -> Result<Vec<(Gid, VertexData)>> {
        visible_vertices(&self.store, &transaction.visibility())
    }

    pub fn edge(&self, transaction: &Transaction, gid: Gid) -> Result<Option<EdgeData>> {
        self.store.edge(gid, &transaction.visibility())
    }

    pub fn edges(&self, transaction: &Transaction) -> Result<Vec<(Gid, EdgeData)>> {
        visible_edges(&self.store, &transaction.visibility())
    }

    /// Visible edges attached to a vertex, in either direction.
    pub fn vertex_edges(&self, transaction: &Transaction, gid: Gid) -> Result<Vec<(Gid, EdgeData)>> {
        let view = transaction.visibility();
        let mut edges = Vec::new();
        for edge_gid in self.store.incident_edges(gid)? {
            if let Some(edge) = self.store.edge(edge_gid, &view)? {
                edges.push((edge_gid, edge));
            }
        }
        Ok(edges)
    }

    // --- Commit / abort ---

    /// Commits the transaction and returns its commit timestamp, or `None`
    /// for a read-only transaction. A constraint violation or a failure to
    /// persist index entries aborts the transaction and is returned as a
    /// [`StorageManipulationError`].
    pub fn commit(&self, transaction: Transaction) -> Result<Option<Timestamp>> {
        if transaction.is_read_only() {
            self.transactions.unregister(transaction.start_timestamp)?;
            return Ok(None);
        }

        let mut final_vertices = Vec::with_capacity(transaction.modified_vertices.len());
        for gid in &transaction.modified_vertices {
            if let Some(vertex) = self.store.vertex_current(*gid)? {
                final_vertices.push((*gid, vertex));
            }
        }

        let mut engine = self.transactions.lock_engine()?;
        if let Err(e) = self.validate_commit(&transaction, &final_vertices, *engine) {
            drop(engine);
            debug!(transaction = transaction.id, error = %e, "Commit rejected");
            self.abort(transaction)?;
            return Err(e);
        }

        let commit_timestamp = TransactionManager::next_commit_timestamp(&mut engine);
        if let Err(e) = self
            .indices
            .commit_entries(transaction.start_timestamp, commit_timestamp, &final_vertices)
        {
            drop(engine);
            error!(transaction = transaction.id, error = %e, "Failed to persist index entries");
            self.abort(transaction)?;
            return Err(StorageManipulationError::Persistence.into());
        }

        self.record_schema_changes(&transaction)?;
        transaction.commit_info.publish(commit_timestamp);
        self.transactions
            .finish_commit(&transaction, commit_timestamp)?;
        drop(engine);
        debug!(transaction = transaction.id, commit_timestamp, "Transaction committed");
        Ok(Some(commit_timestamp))
    }

    /// Checks constraints against the committed graph plus this
    /// transaction's writes. Runs under the engine lock.
    fn validate_commit(
        &self,
        transaction: &Transaction,
        final_vertices: &[(Gid, VertexData)],
        next_timestamp: Timestamp,
    ) -> Result<()> {
        for (_, vertex) in final_vertices {
            if let Some(violation) = self.constraints.validate_vertex(vertex)? {
                return Err(violation.into());
            }
        }
        if !self.constraints.has_unique()? {
            return Ok(());
        }
        let view = Visibility {
            start_timestamp: next_timestamp,
            transaction_id: transaction.id,
        };
        let others = visible_vertices(&self.store, &view)?;
        for (gid, vertex) in final_vertices {
            if let Some(violation) = self.constraints.validate_unique(*gid, vertex, &others)? {
                return Err(violation.into());
            }
        }
        Ok(())
    }

    /// Folds the transaction's net effect into the schema statistics.
    /// Runs under the engine lock, before the commit is published.
    fn record_schema_changes(&self, transaction: &Transaction) -> Result<()> {
        let mut vertices = Vec::with_capacity(transaction.modified_vertices.len());
        for gid in &transaction.modified_vertices {
            if let Some(record) = self.store.vertex_record(*gid)? {
                vertices.push(read(&record)?.states_touched_by(transaction.id));
            }
        }
        let mut edges = Vec::with_capacity(transaction.modified_edges.len());
        for gid in &transaction.modified_edges {
            if let Some(record) = self.store.edge_record(*gid)? {
                edges.push(read(&record)?.states_touched_by(transaction.id));
            }
        }
        self.schema.with_lock(|schema| {
            for (before, after) in vertices.iter().filter_map(|states| net_change(states)) {
                schema.update_vertex(before, after);
            }
            for (before, after) in edges.iter().filter_map(|states| net_change(states)) {
                schema.update_edge(before, after);
            }
        })
    }

    /// Discards every change the transaction made, index entries included.
    pub fn abort(&self, transaction: Transaction) -> Result<()> {
        // Populating indices already receive this transaction's entries.
        let keys = self.indices.registered_indices()?;
        let mut touched = Vec::with_capacity(transaction.modified_vertices.len());
        for gid in &transaction.modified_vertices {
            if let Some(record) = self.store.vertex_record(*gid)? {
                touched.push((*gid, read(&record)?.states_touched_by(transaction.id)));
            }
        }
        let info = AbortableInfo::collect(
            &keys,
            touched.iter().map(|(gid, states)| (*gid, states.as_slice())),
        );
        self.indices
            .abort_entries(&info, transaction.start_timestamp)?;

        for gid in &transaction.modified_edges {
            self.store.rollback_edge(*gid, transaction.id)?;
        }
        for gid in &transaction.modified_vertices {
            self.store.rollback_vertex(*gid, transaction.id)?;
        }
        self.transactions.unregister(transaction.start_timestamp)?;
        debug!(transaction = transaction.id, "Transaction aborted");
        Ok(())
    }

    // --- Indices ---

    /// Builds a label-property index over the committed graph. `cancel` is
    /// polled throughout the build; a cancelled build leaves no index.
    pub fn create_index(&self, key: &LabelPropertyKey, cancel: &dyn Fn() -> bool) -> Result<()> {
        let builder = self.begin()?;
        let built = self
            .transactions
            .horizon()
            .and_then(|horizon| self.indices.create_index(key, &self.store, &builder, horizon, cancel));
        self.transactions.unregister(builder.start_timestamp)?;
        built?;
        self.config.invalidate_plan_cache();
        Ok(())
    }

    pub fn drop_index(&self, key: &LabelPropertyKey) -> Result<()> {
        self.indices.drop_index(key)?;
        self.config.invalidate_plan_cache();
        Ok(())
    }

    pub fn index_exists(&self, key: &LabelPropertyKey) -> Result<bool> {
        self.indices.index_exists(key)
    }

    pub fn list_indices(&self) -> Result<Vec<LabelPropertyKey>> {
        self.indices.list_indices()
    }

    /// Observable contents of an index as sorted `(values, gid)` pairs.
    pub fn index_entries(&self, key: &LabelPropertyKey) -> Result<Vec<(Vec<PropertyValue>, Gid)>> {
        self.indices.entries(key)
    }

    /// Number of vertex records, deleted ones awaiting GC included.
    pub fn approximate_vertex_count(&self) -> Result<u64> {
        Ok(self.store.vertex_count()? as u64)
    }

    /// Estimate for vertices with `label`: the committed label count, raised
    /// to the largest index on that label, never above the vertex total.
    pub fn approximate_vertex_count_for_label(&self, label: LabelId) -> Result<u64> {
        let total = self.approximate_vertex_count()?;
        let mut largest = self.schema.with_lock(|schema| schema.label_count(label))?;
        for key in self.indices.list_indices()?.iter().filter(|k| k.label == label) {
            if let Some(count) = self.indices.approximate_vertex_count(key, &ValueFilter::Any)? {
                largest = largest.max(count);
            }
        }
        Ok(largest.min(total))
    }

    /// Committed label, property-type and edge-type counts.
    pub fn schema_info(&self) -> Result<SchemaInfo> {
        self.schema.with_lock(|schema| schema.clone())
    }

    /// Estimate for vertices an index holds under `filter`; `None` when the index does not exist.
    pub fn approximate_vertex_count_for(
        &self,
        key: &LabelPropertyKey,
        filter: &ValueFilter,
    ) -> Result<Option<u64>> {
        let total = self.approximate_vertex_count()?;
        Ok(self
            .indices
            .approximate_vertex_count(key, filter)?
            .map(|count| count.min(total)))
    }

    pub fn relevant_label_properties_indices_info(
        &self,
        labels: &[LabelId],
        properties: &[PropertyId],
    ) -> Result<Vec<IndexInfo>> {
        self.indices
            .relevant_label_properties_indices_info(labels, properties)
    }

    // --- Constraints ---

    /// Runs `f` over the committed graph with commits held off.
    fn with_committed_vertices<R>(&self, f: impl FnOnce(&[(Gid, VertexData)]) -> Result<R>) -> Result<R> {
        let engine = self.transactions.lock_engine()?;
        let vertices = visible_vertices(&self.store, &Visibility::at_horizon(*engine))?;
        let result = f(&vertices);
        drop(engine);
        if result.is_ok() {
            self.config.invalidate_plan_cache();
        }
        result
    }

    pub fn create_existence_constraint(&self, label: LabelId, property: PropertyId) -> Result<()> {
        self.with_committed_vertices(|vertices| self.constraints.create_existence(label, property, vertices))
    }

    pub fn drop_existence_constraint(&self, label: LabelId, property: PropertyId) -> Result<()> {
        self.constraints.drop_existence(label, property)?;
        self.config.invalidate_plan_cache();
        Ok(())
    }

    pub fn create_unique_constraint(&self, label: LabelId, properties: Vec<PropertyId>) -> Result<()> {
        self.with_committed_vertices(|vertices| self.constraints.create_unique(label, properties, vertices))
    }

    pub fn drop_unique_constraint(&self, label: LabelId, properties: Vec<PropertyId>) -> Result<()> {
        self.constraints.drop_unique(label, properties)?;
        self.config.invalidate_plan_cache();
        Ok(())
    }

    pub fn create_type_constraint(
        &self,
        label: LabelId,
        property: PropertyId,
        property_type: PropertyType,
    ) -> Result<()> {
        self.with_committed_vertices(|vertices| {
            self.constraints
                .create_type(label, property, property_type, vertices)
        })
    }

    pub fn drop_type_constraint(&self, label: LabelId, property: PropertyId) -> Result<()> {
        self.constraints.drop_type(label, property)?;
        self.config.invalidate_plan_cache();
        Ok(())
    }

    pub fn constraints_info(&self) -> Result<ConstraintsInfo> {
        self.constraints.info()
    }

    // --- Garbage collection ---

    pub fn gc_horizon(&self) -> Result<Timestamp> {
        self.transactions.horizon()
    }

    /// Removes history no current or future transaction can read. Only one
    /// run happens at a time; a call made while another runs returns `None`.
    pub fn collect_garbage(&self) -> Result<Option<GcStats>> {
        let _running = match self.gc_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(e)) => return Err(StorageError::lock(e)),
        };
        let horizon = self.transactions.horizon()?;
        let mut stats = GcStats {
            horizon,
            index_entries_removed: self.indices.remove_obsolete_entries(horizon, &self.store)?,
            ..GcStats::default()
        };

        for committed in self.transactions.drain_committed_before(horizon)? {
            for gid in committed.edges {
                let (trimmed, removed) = self.store.collect_edge(gid, horizon)?;
                stats.deltas_removed += trimmed;
                stats.edges_removed += usize::from(removed);
            }
            for gid in committed.vertices {
                let (trimmed, removed) = self.store.collect_vertex(gid, horizon)?;
                stats.deltas_removed += trimmed;
                stats.vertices_removed += usize::from(removed);
            }
        }
        debug!(?stats, "Garbage collection finished");
        Ok(Some(stats))
    }

    // --- Durability ---

    /// Writes a snapshot of the committed graph. `abort` is polled between
    /// batches; an aborted snapshot returns `None` and leaves no file.
    pub fn create_snapshot(&self, abort: &AtomicBool) -> Result<Option<PathBuf>> {
        let _writing = self.snapshot_lock.lock().map_err(StorageError::lock)?;
        let transaction = self.begin()?;
        let directory = self.config.snapshot_directory();

        let created = self.snapshot_source(&transaction).and_then(|source| {
            snapshot::create_snapshot(&directory, &source, abort)
        });
        self.transactions.unregister(transaction.start_timestamp)?;

        let path = created?;
        if path.is_some() {
            let removed = snapshot::apply_retention(&directory, self.config.durability.snapshot_retention_count)?;
            if removed > 0 {
                debug!(removed, "Applied snapshot retention");
            }
        }
        Ok(path)
    }

    fn snapshot_source<'a>(&'a self, transaction: &Transaction) -> Result<SnapshotSource<'a>> {
        Ok(SnapshotSource {
            store: &self.store,
            view: transaction.visibility(),
            uuid: self.uuid()?,
            epoch_id: self.epoch.id()?,
            epoch_history: self.epoch.history()?,
            durable_timestamp: transaction.last_commit_timestamp(),
            indices: self.indices.list_indices()?,
            constraints: self.constraints.info()?,
            mapper: self.name_mapper.entries()?,
            enums: self.enums.entries()?,
            items_per_batch: self.config.durability.items_per_batch,
        })
    }

    /// Identity of this storage instance, written into every snapshot.
    pub fn uuid(&self) -> Result<String> {
        Ok(read(&self.uuid)?.clone())
    }

    pub fn set_uuid(&self, uuid: String) -> Result<()> {
        *write(&self.uuid)? = uuid;
        Ok(())
    }

    pub fn epoch_id(&self) -> Result<String> {
        self.epoch.id()
    }

    pub fn epoch_history(&self) -> Result<Vec<(String, Timestamp)>> {
        self.epoch.history()
    }

    /// Closes the current replication epoch at the last commit and opens a new one.
    pub fn start_new_epoch(&self) -> Result<String> {
        let last_commit = self.transactions.last_commit_timestamp();
        let id = self.epoch.start_new_epoch(last_commit)?;
        info!(epoch = %id, last_commit, "Started new replication epoch");
        Ok(id)
    }

    pub fn last_commit_timestamp(&self) -> Timestamp {
        self.transactions.last_commit_timestamp()
    }

    pub fn active_transactions(&self) -> Result<usize> {
        self.transactions.active_count()
    }

    // --- Catalogs ---

    pub fn label(&self, name: &str) -> Result<LabelId> {
        Ok(LabelId(self.name_mapper.name_to_id(name)?))
    }

    pub fn property(&self, name: &str) -> Result<PropertyId> {
        Ok(PropertyId(self.name_mapper.name_to_id(name)?))
    }

    pub fn edge_type(&self, name: &str) -> Result<EdgeTypeId> {
        Ok(EdgeTypeId(self.name_mapper.name_to_id(name)?))
    }

    /// Name behind a label, property or edge-type id.
    pub fn name_of(&self, id: u64) -> Result<Option<String>> {
        self.name_mapper.id_to_name(id)
    }

    pub fn register_enum(&self, name: &str, values: Vec<String>) -> Result<EnumTypeId> {
        self.enums.register(name, values)
    }

    pub fn to_enum(&self, type_name: &str, value_name: &str) -> Result<Option<PropertyValue>> {
        self.enums.to_enum(type_name, value_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConstraintKind, IndexDefinitionError};
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Storage {
        Storage::open(Config::with_data_directory(dir)).unwrap()
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let age = storage.property("age").unwrap();

        let mut writer = storage.begin().unwrap();
        let gid = storage.create_vertex(&mut writer).unwrap();
        storage.set_property(&mut writer, gid, age, PropertyValue::Int(30)).unwrap();
        let reader = storage.begin().unwrap();
        storage.commit(writer).unwrap();

        assert!(storage.vertex(&reader, gid).unwrap().is_none());
        let later = storage.begin().unwrap();
        assert_eq!(storage.vertex(&later, gid).unwrap().unwrap().property(age), PropertyValue::Int(30));
    }

    #[test]
    fn test_write_write_conflict() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let mut setup = storage.begin().unwrap();
        let gid = storage.create_vertex(&mut setup).unwrap();
        storage.commit(setup).unwrap();

        let label = storage.label("Person").unwrap();
        let mut first = storage.begin().unwrap();
        let mut second = storage.begin().unwrap();
        assert!(storage.add_label(&mut first, gid, label).unwrap());
        let err = storage.add_label(&mut second, gid, label).unwrap_err();
        assert_eq!(err.manipulation_kind(), Some(&StorageManipulationError::Serialization));
        storage.abort(second).unwrap();
        storage.commit(first).unwrap();
    }

    #[test]
    fn test_vertex_with_edges_cannot_be_deleted() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let knows = storage.edge_type("KNOWS").unwrap();
        let mut txn = storage.begin().unwrap();
        let a = storage.create_vertex(&mut txn).unwrap();
        let b = storage.create_vertex(&mut txn).unwrap();
        storage.create_edge(&mut txn, a, b, knows).unwrap();

        assert!(matches!(storage.delete_vertex(&mut txn, a), Err(StorageError::VertexHasEdges(_))));
        assert_eq!(storage.detach_delete_vertex(&mut txn, a).unwrap(), 1);
        assert!(storage.vertex_edges(&txn, b).unwrap().is_empty());
        storage.commit(txn).unwrap();
    }

    #[test]
    fn test_existence_constraint_aborts_commit() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let person = storage.label("Person").unwrap();
        let name = storage.property("name").unwrap();
        storage.create_existence_constraint(person, name).unwrap();

        let mut txn = storage.begin().unwrap();
        let gid = storage.create_vertex(&mut txn).unwrap();
        storage.add_label(&mut txn, gid, person).unwrap();
        let err = storage.commit(txn).unwrap_err();
        match err.manipulation_kind() {
            Some(StorageManipulationError::ConstraintViolation(v)) => assert_eq!(v.kind, ConstraintKind::Existence),
            other => panic!("unexpected error {:?}", other),
        }
        let reader = storage.begin().unwrap();
        assert!(storage.vertices(&reader).unwrap().is_empty());
    }

    #[test]
    fn test_index_ddl_errors() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let key = LabelPropertyKey::new(storage.label("Person").unwrap(), vec![storage.property("age").unwrap()]);
        assert!(matches!(
            storage.drop_index(&key),
            Err(StorageError::IndexDefinition(IndexDefinitionError::Definition))
        ));
        storage.create_index(&key, &|| false).unwrap();
        assert!(matches!(
            storage.create_index(&key, &|| false),
            Err(StorageError::IndexDefinition(IndexDefinitionError::AlreadyExists))
        ));
        assert_eq!(storage.list_indices().unwrap(), vec![key]);
        assert_eq!(storage.active_transactions().unwrap(), 0);
    }

    #[test]
    fn test_gc_removes_deleted_vertices() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let mut txn = storage.begin().unwrap();
        let gid = storage.create_vertex(&mut txn).unwrap();
        storage.commit(txn).unwrap();
        let mut txn = storage.begin().unwrap();
        storage.delete_vertex(&mut txn, gid).unwrap();
        storage.commit(txn).unwrap();

        let stats = storage.collect_garbage().unwrap().unwrap();
        assert_eq!(stats.vertices_removed, 1);
        assert_eq!(storage.approximate_vertex_count().unwrap(), 0);
    }

    #[test]
    fn test_schema_info_tracks_committed_changes() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let person = storage.label("Person").unwrap();
        let age = storage.property("age").unwrap();
        let knows = storage.edge_type("KNOWS").unwrap();

        let mut txn = storage.begin().unwrap();
        let a = storage.create_vertex(&mut txn).unwrap();
        let b = storage.create_vertex(&mut txn).unwrap();
        for gid in [a, b] {
            storage.add_label(&mut txn, gid, person).unwrap();
            storage.set_property(&mut txn, gid, age, PropertyValue::Int(7)).unwrap();
        }
        storage.create_edge(&mut txn, a, b, knows).unwrap();
        storage.commit(txn).unwrap();

        let schema = storage.schema_info().unwrap();
        assert_eq!(schema.label_count(person), 2);
        assert_eq!(schema.property_types.get(&(person, age, PropertyType::Int)), Some(&2));
        assert_eq!(schema.edge_type_count(knows), 1);
        assert_eq!(storage.approximate_vertex_count_for_label(person).unwrap(), 2);

        let mut aborted = storage.begin().unwrap();
        storage.remove_label(&mut aborted, b, person).unwrap();
        storage.abort(aborted).unwrap();
        assert_eq!(storage.schema_info().unwrap(), schema);

        let mut txn = storage.begin().unwrap();
        storage.detach_delete_vertex(&mut txn, a).unwrap();
        storage.commit(txn).unwrap();
        let schema = storage.schema_info().unwrap();
        assert_eq!(schema.label_count(person), 1);
        assert_eq!(schema.property_types.get(&(person, age, PropertyType::Int)), Some(&1));
        assert_eq!(schema.edge_type_count(knows), 0);
    }

    #[test]
    fn test_gc_skips_while_another_run_holds_the_lock() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());
        let running = storage.gc_lock.lock().unwrap();
        assert!(storage.collect_garbage().unwrap().is_none());
        drop(running);
        assert!(storage.collect_garbage().unwrap().is_some());
    }
}
