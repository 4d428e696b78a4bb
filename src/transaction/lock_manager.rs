use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use parking_lot::{Condvar, Mutex};
use log::warn;

use crate::common::types::{Rid, TxnId};
use crate::transaction::transaction::{
    AbortReason, IndexWriteRecord, IsolationLevel, Transaction, TransactionError,
    TransactionState, WType,
};
use crate::transaction::transaction_manager::TransactionManager;

/// How often the background detector scans for waits-for cycles
pub const DEFAULT_CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    lock_mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, lock_mode: LockMode) -> Self {
        Self {
            txn_id,
            lock_mode,
            granted: false,
        }
    }
}

#[derive(Default)]
struct QueueState {
    request_queue: VecDeque<LockRequest>,
    upgrading: bool,
}

/// Per-record request queue. Blocked requesters sleep on the condvar
/// and re-check their grant predicate on every wakeup.
#[derive(Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// Record-level two-phase lock manager with shared/exclusive modes,
/// in-place upgrades, and a background waits-for cycle detector that
/// aborts the youngest transaction of any cycle it finds.
pub struct LockManager {
    /// Guards the lock table itself; per-queue traffic runs under the
    /// queue's own mutex. The detector holds this latch for a whole
    /// pass, stopping new queue installation while it scans.
    latch: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    /// Waits-for graph, rebuilt from the lock table each detector
    /// pass. Ordered containers make the DFS deterministic: sources
    /// and out-edges are visited in ascending txn id order.
    waits_for: Mutex<BTreeMap<TxnId, BTreeSet<TxnId>>>,
    txn_manager: Arc<TransactionManager>,
    enable_cycle_detection: Arc<AtomicBool>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Lock manager with the detector running at the default interval
    pub fn new(txn_manager: Arc<TransactionManager>) -> Arc<Self> {
        Self::with_interval(txn_manager, DEFAULT_CYCLE_DETECTION_INTERVAL)
    }

    /// Lock manager with the detector running at a custom interval
    pub fn with_interval(txn_manager: Arc<TransactionManager>, interval: Duration) -> Arc<Self> {
        let manager = Arc::new(Self::build(txn_manager, true));

        let weak = Arc::downgrade(&manager);
        let enabled = manager.enable_cycle_detection.clone();
        let handle = thread::spawn(move || {
            while enabled.load(Ordering::SeqCst) {
                thread::sleep(interval);
                match weak.upgrade() {
                    Some(manager) => manager.run_cycle_detection_pass(),
                    None => break,
                }
            }
        });
        *manager.detector.lock() = Some(handle);

        manager
    }

    /// Lock manager with no background detector (graph-API tests)
    pub fn without_cycle_detection(txn_manager: Arc<TransactionManager>) -> Arc<Self> {
        Arc::new(Self::build(txn_manager, false))
    }

    fn build(txn_manager: Arc<TransactionManager>, detection: bool) -> Self {
        Self {
            latch: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            txn_manager,
            enable_cycle_detection: Arc::new(AtomicBool::new(detection)),
            detector: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Lock acquisition / release
    // ------------------------------------------------------------------

    /// Acquire a shared lock on `rid`. Idempotent for a transaction
    /// already holding shared or exclusive on the record.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionError> {
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                // Reads never lock at RU
                return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {}
        }

        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();
        state
            .request_queue
            .push_back(LockRequest::new(txn.id(), LockMode::Shared));

        while !(Self::can_grant(&state, LockMode::Shared, txn.id())
            || txn.state() == TransactionState::Aborted)
        {
            queue.cv.wait(&mut state);
        }

        if txn.state() == TransactionState::Aborted {
            return Err(Self::bail_out(&queue, &mut state, txn));
        }

        if let Some(request) = state.request_queue.iter_mut().find(|r| r.txn_id == txn.id()) {
            request.granted = true;
        }
        drop(state);

        if !txn.is_exclusive_locked(rid) {
            txn.add_shared_lock(rid);
        }
        Ok(true)
    }

    /// Acquire an exclusive lock on `rid`. Idempotent for a
    /// transaction already holding exclusive on the record.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionError> {
        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }

        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();
        state
            .request_queue
            .push_back(LockRequest::new(txn.id(), LockMode::Exclusive));

        while !(Self::can_grant(&state, LockMode::Exclusive, txn.id())
            || txn.state() == TransactionState::Aborted)
        {
            queue.cv.wait(&mut state);
        }

        if txn.state() == TransactionState::Aborted {
            return Err(Self::bail_out(&queue, &mut state, txn));
        }

        if let Some(request) = state
            .request_queue
            .iter_mut()
            .find(|r| r.txn_id == txn.id() && r.lock_mode == LockMode::Exclusive)
        {
            request.granted = true;
        }
        drop(state);

        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Upgrade a held shared lock to exclusive. The request keeps its
    /// queue position; only one upgrade may be in flight per record.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionError> {
        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }

        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();

        if state.upgrading {
            drop(state);
            return Err(self.abort(txn, AbortReason::UpgradeConflict));
        }
        state.upgrading = true;

        // Flip the existing shared request in place; FIFO order is
        // preserved because the position does not change.
        match state.request_queue.iter_mut().find(|r| r.txn_id == txn.id()) {
            Some(request) => {
                request.lock_mode = LockMode::Exclusive;
                request.granted = false;
            }
            None => {
                state
                    .request_queue
                    .push_back(LockRequest::new(txn.id(), LockMode::Exclusive));
            }
        }

        while !(Self::can_grant(&state, LockMode::Exclusive, txn.id())
            || txn.state() == TransactionState::Aborted)
        {
            queue.cv.wait(&mut state);
        }

        if txn.state() == TransactionState::Aborted {
            state.upgrading = false;
            return Err(Self::bail_out(&queue, &mut state, txn));
        }

        if let Some(request) = state.request_queue.iter_mut().find(|r| r.txn_id == txn.id()) {
            request.granted = true;
        }
        state.upgrading = false;
        drop(state);

        txn.remove_shared_lock(rid);
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Release the transaction's lock on `rid`. The first unlock of a
    /// REPEATABLE_READ transaction moves it into its shrinking phase.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Growing
        {
            txn.set_state(TransactionState::Shrinking);
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock();
        state.request_queue.retain(|r| r.txn_id != txn.id());

        // Wake the queue if the oldest waiting request just became
        // grantable.
        let next_waiting = state
            .request_queue
            .iter()
            .find(|r| !r.granted)
            .map(|r| (r.lock_mode, r.txn_id));
        if let Some((mode, waiter)) = next_waiting {
            if Self::can_grant(&state, mode, waiter) {
                queue.cv.notify_all();
            }
        }
        drop(state);

        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);
        true
    }

    // ------------------------------------------------------------------
    // Executor-facing helpers
    // ------------------------------------------------------------------

    /// Take the lock a read at the transaction's isolation level
    /// needs: nothing at RU, a transient shared lock at RC, a held
    /// shared lock at RR.
    pub fn lock_read(&self, txn: &Transaction, rid: Rid) -> Result<(), TransactionError> {
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => Ok(()),
            IsolationLevel::ReadCommitted => {
                self.lock_shared(txn, rid)?;
                self.unlock(txn, rid);
                Ok(())
            }
            IsolationLevel::RepeatableRead => {
                self.lock_shared(txn, rid)?;
                Ok(())
            }
        }
    }

    /// Take the exclusive lock a write needs, upgrading a held shared
    /// lock, and record the write in the transaction's index write
    /// set for undo.
    pub fn lock_write(
        &self,
        txn: &Transaction,
        rid: Rid,
        wtype: WType,
    ) -> Result<(), TransactionError> {
        if txn.is_shared_locked(rid) {
            self.lock_upgrade(txn, rid)?;
        } else if !txn.is_exclusive_locked(rid) {
            self.lock_exclusive(txn, rid)?;
        }
        txn.append_index_write_record(IndexWriteRecord { rid, wtype });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Grant logic
    // ------------------------------------------------------------------

    /// Whether the transaction's request in this queue can be granted.
    ///
    /// A shared request grants at the head of the queue, or whenever
    /// no exclusive request sits anywhere in the queue (waiting
    /// exclusives block younger shared requests, keeping FIFO). An
    /// exclusive request grants only as the oldest waiting request
    /// with no lock granted to anyone else; an upgrading request
    /// therefore waits in place until the remaining shared holders
    /// drain.
    fn can_grant(state: &QueueState, lock_mode: LockMode, txn_id: TxnId) -> bool {
        match lock_mode {
            LockMode::Shared => {
                if state
                    .request_queue
                    .front()
                    .map(|r| r.txn_id == txn_id)
                    .unwrap_or(false)
                {
                    return true;
                }
                !state
                    .request_queue
                    .iter()
                    .any(|r| r.lock_mode == LockMode::Exclusive)
            }
            LockMode::Exclusive => {
                let others_granted = state
                    .request_queue
                    .iter()
                    .any(|r| r.granted && r.txn_id != txn_id);
                let oldest_waiting = state
                    .request_queue
                    .iter()
                    .find(|r| !r.granted)
                    .map(|r| r.txn_id == txn_id)
                    .unwrap_or(false);
                !others_granted && oldest_waiting
            }
        }
    }

    /// Find or install the queue for a record
    fn queue_for(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut lock_table = self.latch.lock();
        lock_table.entry(rid).or_default().clone()
    }

    /// Mark the transaction aborted and build the abort error
    fn abort(&self, txn: &Transaction, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        TransactionError::Abort(txn.id(), reason)
    }

    /// A sleeping requester woke up aborted: withdraw its request,
    /// wake the queue, and surface the deadlock abort. The detector
    /// never edits queues itself.
    fn bail_out(
        queue: &LockRequestQueue,
        state: &mut QueueState,
        txn: &Transaction,
    ) -> TransactionError {
        state.request_queue.retain(|r| r.txn_id != txn.id() || r.granted);
        queue.cv.notify_all();
        TransactionError::Abort(txn.id(), AbortReason::Deadlock)
    }

    // ------------------------------------------------------------------
    // Deadlock detection
    // ------------------------------------------------------------------

    /// One stop-the-world detector pass: rebuild the waits-for graph
    /// from the lock table, abort the youngest member of each cycle,
    /// and wake its queues, until the graph is acyclic.
    fn run_cycle_detection_pass(&self) {
        let lock_table = self.latch.lock();
        loop {
            self.rebuild_waits_for_graph(&lock_table);

            let mut victim: TxnId = 0;
            if !self.has_cycle(&mut victim) {
                break;
            }

            warn!("aborting txn {} to break a waits-for cycle", victim);
            if let Some(txn) = self.txn_manager.get_transaction(victim) {
                txn.set_state(TransactionState::Aborted);
            }

            // Wake every queue the victim appears in so sleeping
            // requests observe the aborted state.
            for queue in lock_table.values() {
                let state = queue.state.lock();
                let involved = state.request_queue.iter().any(|r| r.txn_id == victim);
                drop(state);
                if involved {
                    queue.cv.notify_all();
                }
            }
        }
    }

    /// Project the waits-for graph out of the request queues: one
    /// edge per (waiting, granted) pair of live transactions on the
    /// same record.
    fn rebuild_waits_for_graph(&self, lock_table: &HashMap<Rid, Arc<LockRequestQueue>>) {
        let mut graph = self.waits_for.lock();
        graph.clear();

        for queue in lock_table.values() {
            let state = queue.state.lock();
            let mut granted = Vec::new();
            let mut waiting = Vec::new();
            for request in state.request_queue.iter() {
                let alive = self
                    .txn_manager
                    .get_transaction(request.txn_id)
                    .map(|t| t.state() != TransactionState::Aborted)
                    .unwrap_or(false);
                if !alive {
                    continue;
                }
                if request.granted {
                    granted.push(request.txn_id);
                } else {
                    waiting.push(request.txn_id);
                }
            }
            for &waiter in &waiting {
                for &holder in &granted {
                    if waiter != holder {
                        graph.entry(waiter).or_default().insert(holder);
                    }
                }
            }
        }
    }

    /// Add edge t1 -> t2 (t1 waits for t2)
    pub fn add_edge(&self, t1: TxnId, t2: TxnId) {
        self.waits_for.lock().entry(t1).or_default().insert(t2);
    }

    /// Remove edge t1 -> t2
    pub fn remove_edge(&self, t1: TxnId, t2: TxnId) {
        if let Some(edges) = self.waits_for.lock().get_mut(&t1) {
            edges.remove(&t2);
        }
    }

    /// DFS the graph in ascending txn id order. On a cycle, stores
    /// the youngest transaction on the back-edge path (the largest
    /// id) into `txn_id` and returns true.
    pub fn has_cycle(&self, txn_id: &mut TxnId) -> bool {
        let graph = self.waits_for.lock();
        let mut visited = BTreeSet::new();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            if Self::dfs_cycle(&graph, start, &mut visited, &mut path, txn_id) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle(
        graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        current: TxnId,
        visited: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
        out: &mut TxnId,
    ) -> bool {
        visited.insert(current);
        path.push(current);

        if let Some(edges) = graph.get(&current) {
            for &next in edges {
                if let Some(pos) = path.iter().position(|&t| t == next) {
                    // Back edge: the cycle is path[pos..]
                    *out = path[pos..].iter().copied().max().unwrap_or(next);
                    return true;
                }
                if !visited.contains(&next)
                    && Self::dfs_cycle(graph, next, visited, path, out)
                {
                    return true;
                }
            }
        }

        path.pop();
        false
    }

    /// Current edge set, for tests
    pub fn get_edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.waits_for
            .lock()
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
            .collect()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.enable_cycle_detection.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            // The detector may itself hold the last Arc; never join
            // from our own thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
