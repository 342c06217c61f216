use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::versioning::{CommitInfo, Visibility};
use crate::error::{Result, StorageError};
use crate::types::{Gid, Timestamp, TransactionId, TRANSACTION_INITIAL_ID};

/// Defines how much a transaction is isolated from other concurrent transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    SnapshotIsolation, // The only level we implement.
}

/// A Transaction is a "workspace" for a set of atomic changes to the graph.
///
/// Not `Clone`: commit and abort consume it, so it is finalized exactly once.
#[derive(Debug)]
pub struct Transaction {
    /// The unique ID for this transaction, `>= TRANSACTION_INITIAL_ID`.
    pub id: TransactionId,

    /// Every delta committed before this timestamp is visible to the transaction.
    pub start_timestamp: Timestamp,

    pub isolation_level: IsolationLevel,

    pub(crate) commit_info: Arc<CommitInfo>,
    pub(crate) modified_vertices: BTreeSet<Gid>,
    pub(crate) modified_edges: BTreeSet<Gid>,
    cancelled: Arc<AtomicBool>,
    // Newest commit timestamp when the transaction began.
    last_commit_timestamp: Timestamp,
}

impl Transaction {
    pub fn visibility(&self) -> Visibility {
        Visibility {
            start_timestamp: self.start_timestamp,
            transaction_id: self.id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Asks every long-running operation driven by this transaction to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// The flag behind [`Transaction::is_cancelled`], for cancelling from another thread.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn last_commit_timestamp(&self) -> Timestamp {
        self.last_commit_timestamp
    }

    pub fn is_read_only(&self) -> bool {
        self.modified_vertices.is_empty() && self.modified_edges.is_empty()
    }
}

/// A committed transaction whose deltas still have to be trimmed by GC.
#[derive(Debug, Clone)]
pub(crate) struct CommittedTransaction {
    pub commit_timestamp: Timestamp,
    pub vertices: Vec<Gid>,
    pub edges: Vec<Gid>,
}

/// TransactionManager hands out timestamps and tracks in-flight transactions.
///
/// The engine lock guards the timestamp counter: starting a transaction and
/// assigning a commit timestamp both go through it, which gives commits
/// their total order.
#[derive(Debug)]
pub struct TransactionManager {
    // Next timestamp to hand out, start or commit.
    engine_lock: Mutex<Timestamp>,
    next_transaction_id: AtomicU64,
    active: Mutex<BTreeSet<Timestamp>>,
    committed: Mutex<VecDeque<CommittedTransaction>>,
    last_commit_timestamp: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            engine_lock: Mutex::new(1),
            next_transaction_id: AtomicU64::new(TRANSACTION_INITIAL_ID),
            active: Mutex::new(BTreeSet::new()),
            committed: Mutex::new(VecDeque::new()),
            last_commit_timestamp: AtomicU64::new(0),
        }
    }

    /// Begins a new transaction and registers it as active.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Result<Transaction> {
        let mut next = self.lock_engine()?;
        let start_timestamp = *next;
        *next += 1;
        self.active
            .lock()
            .map_err(StorageError::lock)?
            .insert(start_timestamp);
        drop(next);

        let id = self.next_transaction_id.fetch_add(1, Ordering::AcqRel);
        Ok(Transaction {
            id,
            start_timestamp,
            isolation_level,
            commit_info: Arc::new(CommitInfo::new(id)),
            modified_vertices: BTreeSet::new(),
            modified_edges: BTreeSet::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            last_commit_timestamp: self.last_commit_timestamp.load(Ordering::Acquire),
        })
    }

    pub(crate) fn lock_engine(&self) -> Result<MutexGuard<'_, Timestamp>> {
        self.engine_lock.lock().map_err(StorageError::lock)
    }

    /// Takes the next timestamp as a commit timestamp. The caller holds the engine lock.
    pub(crate) fn next_commit_timestamp(guard: &mut MutexGuard<'_, Timestamp>) -> Timestamp {
        let commit_timestamp = **guard;
        **guard += 1;
        commit_timestamp
    }

    /// Records a published commit for GC and retires the transaction.
    pub(crate) fn finish_commit(&self, transaction: &Transaction, commit_timestamp: Timestamp) -> Result<()> {
        self.last_commit_timestamp
            .fetch_max(commit_timestamp, Ordering::AcqRel);
        if !transaction.is_read_only() {
            self.committed
                .lock()
                .map_err(StorageError::lock)?
                .push_back(CommittedTransaction {
                    commit_timestamp,
                    vertices: transaction.modified_vertices.iter().copied().collect(),
                    edges: transaction.modified_edges.iter().copied().collect(),
                });
        }
        self.unregister(transaction.start_timestamp)
    }

    pub(crate) fn unregister(&self, start_timestamp: Timestamp) -> Result<()> {
        self.active
            .lock()
            .map_err(StorageError::lock)?
            .remove(&start_timestamp);
        Ok(())
    }

    /// Oldest start timestamp among active transactions, or the next
    /// timestamp when nothing is running. Nothing below it can still be read.
    pub fn horizon(&self) -> Result<Timestamp> {
        let next = self.lock_engine()?;
        let active = self.active.lock().map_err(StorageError::lock)?;
        Ok(active.first().copied().unwrap_or(*next))
    }

    /// Removes and returns the committed transactions every reader already sees.
    pub(crate) fn drain_committed_before(&self, horizon: Timestamp) -> Result<Vec<CommittedTransaction>> {
        let mut committed = self.committed.lock().map_err(StorageError::lock)?;
        let mut drained = Vec::new();
        // Commits are pushed in commit order.
        while committed
            .front()
            .is_some_and(|c| c.commit_timestamp < horizon)
        {
            if let Some(entry) = committed.pop_front() {
                drained.push(entry);
            }
        }
        Ok(drained)
    }

    pub fn last_commit_timestamp(&self) -> Timestamp {
        self.last_commit_timestamp.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.active.lock().map_err(StorageError::lock)?.len())
    }

    /// Moves the timestamp counter past everything a recovered snapshot saw.
    pub(crate) fn advance_past(&self, timestamp: Timestamp) -> Result<()> {
        let mut next = self.lock_engine()?;
        if *next <= timestamp {
            *next = timestamp + 1;
        }
        self.last_commit_timestamp
            .fetch_max(timestamp, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_strictly_increasing() {
        let manager = TransactionManager::new();
        let t1 = manager.begin(IsolationLevel::default()).unwrap();
        let commit = {
            let mut guard = manager.lock_engine().unwrap();
            TransactionManager::next_commit_timestamp(&mut guard)
        };
        let t2 = manager.begin(IsolationLevel::default()).unwrap();

        assert!(t1.start_timestamp < commit);
        assert!(commit < t2.start_timestamp);
        assert_ne!(t1.id, t2.id);
        assert!(t1.id >= TRANSACTION_INITIAL_ID);
    }

    #[test]
    fn test_horizon_tracks_oldest_active_transaction() {
        let manager = TransactionManager::new();
        let t1 = manager.begin(IsolationLevel::default()).unwrap();
        let t2 = manager.begin(IsolationLevel::default()).unwrap();
        assert_eq!(manager.horizon().unwrap(), t1.start_timestamp);

        manager.unregister(t1.start_timestamp).unwrap();
        assert_eq!(manager.horizon().unwrap(), t2.start_timestamp);

        manager.unregister(t2.start_timestamp).unwrap();
        assert!(manager.horizon().unwrap() > t2.start_timestamp);
        assert_eq!(manager.active_count().unwrap(), 0);
    }

    #[test]
    fn test_cancellation_is_shared() {
        let manager = TransactionManager::new();
        let transaction = manager.begin(IsolationLevel::default()).unwrap();
        let flag = transaction.cancellation();
        assert!(!transaction.is_cancelled());
        flag.store(true, Ordering::Release);
        assert!(transaction.is_cancelled());
    }
}
