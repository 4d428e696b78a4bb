use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::transaction::{
    IndexWriteRecord, IsolationLevel, Transaction, TransactionError, TransactionState,
};
use crate::transaction::lock_manager::LockManager;

/// Registry of active transactions. Injected into the lock manager's
/// deadlock detector so victims can be looked up and aborted without
/// any process-wide state.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a transaction at the given isolation level
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Commit: release every lock still held and retire the
    /// transaction.
    pub fn commit(
        &self,
        txn: &Transaction,
        lock_manager: &LockManager,
    ) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(TransactionError::InvalidState(txn.id()));
            }
            _ => {}
        }

        for rid in txn.locked_rids() {
            lock_manager.unlock(txn, rid);
        }
        txn.set_state(TransactionState::Committed);
        self.active_transactions.lock().remove(&txn.id());
        Ok(())
    }

    /// Abort: release every lock still held and retire the
    /// transaction. Undo of the index write set is the caller's job;
    /// the drained records are returned newest first.
    pub fn abort(
        &self,
        txn: &Transaction,
        lock_manager: &LockManager,
    ) -> Vec<IndexWriteRecord> {
        txn.set_state(TransactionState::Aborted);
        for rid in txn.locked_rids() {
            lock_manager.unlock(txn, rid);
        }
        self.active_transactions.lock().remove(&txn.id());
        txn.take_index_write_set()
    }
}
