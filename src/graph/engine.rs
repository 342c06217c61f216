use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

use super::indices::{LabelPropertyKey, ValueFilter};
use super::storage::{GcStats, Storage};
use super::transaction::Transaction;
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::types::{Gid, PropertyValue, VertexData};

/// Async front door to a [`Storage`].
///
/// Storage calls block (element locks, RocksDB, file I/O), so every
/// operation here runs on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct GraphEngine {
    // Shared so blocking tasks can outlive the call that spawned them.
    storage: Arc<Storage>,
}

impl GraphEngine {
    /// Opens (and recovers) the storage described by `config`.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            storage: Arc::new(Storage::open(config)?),
        })
    }

    pub fn from_storage(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Storage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Runs `f` in a fresh transaction, committing on success and aborting
    /// when `f` fails so no transaction outlives the call.
    async fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Storage, &mut Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_blocking(move |storage| {
            let mut transaction = storage.begin()?;
            match f(storage, &mut transaction) {
                Ok(value) => {
                    storage.commit(transaction)?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(abort_error) = storage.abort(transaction) {
                        warn!(error = %abort_error, "Failed to abort transaction");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    /// Creates a vertex with the named labels and properties in its own transaction.
    pub async fn store_vertex(&self, labels: Vec<String>, properties: Vec<(String, PropertyValue)>) -> Result<Gid> {
        self.run_in_transaction(move |storage, transaction| {
            let gid = storage.create_vertex(transaction)?;
            for name in &labels {
                let label = storage.label(name)?;
                storage.add_label(transaction, gid, label)?;
            }
            for (name, value) in properties {
                let property = storage.property(&name)?;
                storage.set_property(transaction, gid, property, value)?;
            }
            Ok(gid)
        })
        .await
    }

    /// Connects two existing vertices with an edge of the named type.
    pub async fn relate(&self, from: Gid, edge_type: String, to: Gid) -> Result<Gid> {
        self.run_in_transaction(move |storage, transaction| {
            let edge_type = storage.edge_type(&edge_type)?;
            storage.create_edge(transaction, from, to, edge_type)
        })
        .await
    }

    /// Removes a vertex and its edges in its own transaction.
    pub async fn forget(&self, gid: Gid) -> Result<usize> {
        self.run_in_transaction(move |storage, transaction| storage.detach_delete_vertex(transaction, gid))
            .await
    }

    /// The vertex as of the latest commit.
    pub async fn vertex(&self, gid: Gid) -> Result<Option<VertexData>> {
        self.run_in_transaction(move |storage, transaction| storage.vertex(transaction, gid))
            .await
    }

    /// Builds the index for the named label and properties. Setting `cancel`
    /// from another task stops the build.
    pub async fn create_index(&self, label: &str, properties: &[&str], cancel: Arc<AtomicBool>) -> Result<LabelPropertyKey> {
        let key = self.index_key(label, properties)?;
        let build = key.clone();
        self.run_blocking(move |storage| storage.create_index(&build, &|| cancel.load(Ordering::Acquire)))
            .await?;
        Ok(key)
    }

    pub async fn drop_index(&self, key: LabelPropertyKey) -> Result<()> {
        self.run_blocking(move |storage| storage.drop_index(&key)).await
    }

    pub async fn approximate_vertex_count(&self, key: LabelPropertyKey, filter: ValueFilter) -> Result<Option<u64>> {
        self.run_blocking(move |storage| storage.approximate_vertex_count_for(&key, &filter))
            .await
    }

    pub async fn create_snapshot(&self, abort: Arc<AtomicBool>) -> Result<Option<PathBuf>> {
        self.run_blocking(move |storage| storage.create_snapshot(&abort)).await
    }

    pub async fn collect_garbage(&self) -> Result<Option<GcStats>> {
        self.run_blocking(Storage::collect_garbage).await
    }

    fn index_key(&self, label: &str, properties: &[&str]) -> Result<LabelPropertyKey> {
        let label = self.storage.label(label)?;
        let properties = properties
            .iter()
            .map(|name| self.storage.property(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(LabelPropertyKey::new(label, properties))
    }

    /// Runs garbage collection every `gc.interval_ms` until the storage is dropped.
    pub fn spawn_configured_gc_task(&self) -> JoinHandle<()> {
        self.spawn_gc_task(Duration::from_millis(self.storage.config().gc.interval_ms))
    }

    /// Runs garbage collection every `period` until the storage is dropped.
    ///
    /// The task holds only a weak reference, so it never keeps the storage alive.
    pub fn spawn_gc_task(&self, period: Duration) -> JoinHandle<()> {
        let storage: Weak<Storage> = Arc::downgrade(&self.storage);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(strong) = storage.upgrade() else {
                    debug!("Storage dropped, stopping garbage collector");
                    break;
                };
                match task::spawn_blocking(move || strong.collect_garbage()).await {
                    Ok(Ok(Some(stats))) => debug!(?stats, "Periodic garbage collection"),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Periodic garbage collection failed"),
                    Err(e) => warn!(error = %e, "Garbage collection task panicked"),
                }
            }
        })
    }
}
