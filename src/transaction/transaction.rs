use std::collections::HashSet;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states under two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Lock acquisition after the transaction started releasing
    LockOnShrinking,
    /// Shared locks are meaningless under READ_UNCOMMITTED
    LockSharedOnReadUncommitted,
    /// Another upgrade was already in flight on the same record
    UpgradeConflict,
    /// Chosen as the victim of a waits-for cycle
    Deadlock,
}

/// Kind of write an executor is locking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WType {
    Insert,
    Update,
    Delete,
}

/// One entry of the index write set, kept for undo by the
/// transaction manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexWriteRecord {
    pub rid: Rid,
    pub wtype: WType,
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} aborted: {1:?}")]
    Abort(TxnId, AbortReason),

    #[error("Transaction {0} not found")]
    NotFound(TxnId),

    #[error("Transaction {0} is already finished")]
    InvalidState(TxnId),
}

/// An active database transaction. The state and lock sets are
/// mutated from the owning thread and from the deadlock detector, so
/// they live behind mutexes.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub fn remove_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
    }

    pub fn remove_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().remove(&rid);
    }

    /// Every record the transaction currently holds a lock on
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub fn append_index_write_record(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    /// Drain the write set, newest first, for undo
    pub fn take_index_write_set(&self) -> Vec<IndexWriteRecord> {
        let mut records = std::mem::take(&mut *self.index_write_set.lock());
        records.reverse();
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(2, IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 7);

        assert!(!txn.is_shared_locked(rid));
        txn.add_shared_lock(rid);
        assert!(txn.is_shared_locked(rid));

        txn.add_exclusive_lock(rid);
        txn.remove_shared_lock(rid);
        assert!(!txn.is_shared_locked(rid));
        assert!(txn.is_exclusive_locked(rid));

        assert_eq!(txn.locked_rids(), vec![rid]);
    }

    #[test]
    fn test_write_set_drains_newest_first() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        txn.append_index_write_record(IndexWriteRecord {
            rid: Rid::new(1, 0),
            wtype: WType::Insert,
        });
        txn.append_index_write_record(IndexWriteRecord {
            rid: Rid::new(1, 1),
            wtype: WType::Delete,
        });

        let records = txn.take_index_write_set();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rid, Rid::new(1, 1));
        assert!(txn.take_index_write_set().is_empty());
    }
}
