use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use vesperdb::common::types::Rid;
use vesperdb::transaction::{
    AbortReason, IsolationLevel, LockManager, TransactionError, TransactionManager,
    TransactionState, WType,
};

const SHORT_INTERVAL: Duration = Duration::from_millis(10);
const SETTLE: Duration = Duration::from_millis(100);
const WAIT: Duration = Duration::from_secs(5);

fn setup() -> (Arc<TransactionManager>, Arc<LockManager>) {
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = LockManager::with_interval(txn_manager.clone(), SHORT_INTERVAL);
    (txn_manager, lock_manager)
}

#[test]
fn test_shared_lock_basic() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert!(lock_manager.lock_shared(&txn, rid)?);
    assert!(txn.is_shared_locked(rid));

    assert!(lock_manager.unlock(&txn, rid));
    assert!(!txn.is_shared_locked(rid));
    // First unlock of an RR transaction starts its shrinking phase
    assert_eq!(txn.state(), TransactionState::Shrinking);
    Ok(())
}

#[test]
fn test_shared_locks_are_concurrent() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert!(lock_manager.lock_shared(&txn1, rid)?);
    assert!(lock_manager.lock_shared(&txn2, rid)?);
    assert!(txn1.is_shared_locked(rid));
    assert!(txn2.is_shared_locked(rid));
    Ok(())
}

#[test]
fn test_lock_idempotence() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert!(lock_manager.lock_shared(&txn, rid)?);
    assert!(lock_manager.lock_shared(&txn, rid)?);

    let txn2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid2 = Rid::new(1, 1);
    assert!(lock_manager.lock_exclusive(&txn2, rid2)?);
    assert!(lock_manager.lock_exclusive(&txn2, rid2)?);

    // A shared request on a record already held exclusive is a no-op
    assert!(lock_manager.lock_shared(&txn2, rid2)?);
    assert!(!txn2.is_shared_locked(rid2));
    assert!(txn2.is_exclusive_locked(rid2));
    Ok(())
}

#[test]
fn test_read_uncommitted_rejects_shared() {
    let (txn_manager, lock_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
    let rid = Rid::new(1, 0);

    match lock_manager.lock_shared(&txn, rid) {
        Err(TransactionError::Abort(id, AbortReason::LockSharedOnReadUncommitted)) => {
            assert_eq!(id, txn.id());
        }
        other => panic!("expected LockSharedOnReadUncommitted abort, got {:?}", other),
    }
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_lock_on_shrinking_aborts() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid1 = Rid::new(1, 0);
    let rid2 = Rid::new(1, 1);

    lock_manager.lock_shared(&txn, rid1)?;
    lock_manager.unlock(&txn, rid1);
    assert_eq!(txn.state(), TransactionState::Shrinking);

    match lock_manager.lock_shared(&txn, rid2) {
        Err(TransactionError::Abort(_, AbortReason::LockOnShrinking)) => {}
        other => panic!("expected LockOnShrinking abort, got {:?}", other),
    }
    assert_eq!(txn.state(), TransactionState::Aborted);
    Ok(())
}

#[test]
fn test_read_committed_relocks_freely() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::ReadCommitted);
    let rid = Rid::new(1, 0);

    // RC unlocks don't start a shrinking phase; re-locking is fine
    lock_manager.lock_shared(&txn, rid)?;
    lock_manager.unlock(&txn, rid);
    assert_eq!(txn.state(), TransactionState::Growing);
    lock_manager.lock_shared(&txn, rid)?;
    Ok(())
}

#[test]
fn test_exclusive_blocks_until_shared_released() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let reader = txn_manager.begin(IsolationLevel::RepeatableRead);
    let writer = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lock_manager.lock_shared(&reader, rid)?;

    let (tx, rx) = mpsc::channel();
    let handle = {
        let lock_manager = lock_manager.clone();
        let writer = writer.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_exclusive(&writer, rid);
            tx.send(()).unwrap();
            result
        })
    };

    // The writer stays blocked while the reader holds its lock
    assert!(rx.recv_timeout(SETTLE).is_err());

    lock_manager.unlock(&reader, rid);
    rx.recv_timeout(WAIT).expect("writer was not granted");
    assert!(handle.join().unwrap()?);
    assert!(writer.is_exclusive_locked(rid));
    Ok(())
}

#[test]
fn test_upgrade_waits_for_other_readers() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lock_manager.lock_shared(&txn1, rid)?;
    lock_manager.lock_shared(&txn2, rid)?;

    let (tx, rx) = mpsc::channel();
    let handle = {
        let lock_manager = lock_manager.clone();
        let txn1 = txn1.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_upgrade(&txn1, rid);
            tx.send(()).unwrap();
            result
        })
    };

    // txn2 still holds shared: the upgrade must wait
    assert!(rx.recv_timeout(SETTLE).is_err());

    lock_manager.unlock(&txn2, rid);
    rx.recv_timeout(WAIT).expect("upgrade was not granted");
    assert!(handle.join().unwrap()?);
    assert!(txn1.is_exclusive_locked(rid));
    assert!(!txn1.is_shared_locked(rid));
    Ok(())
}

#[test]
fn test_concurrent_upgrades_conflict() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lock_manager.lock_shared(&txn1, rid)?;
    lock_manager.lock_shared(&txn2, rid)?;

    let (tx, rx) = mpsc::channel();
    let handle = {
        let lock_manager = lock_manager.clone();
        let txn1 = txn1.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_upgrade(&txn1, rid);
            tx.send(()).unwrap();
            result
        })
    };
    assert!(rx.recv_timeout(SETTLE).is_err());

    // A second in-flight upgrade on the same record is refused
    match lock_manager.lock_upgrade(&txn2, rid) {
        Err(TransactionError::Abort(_, AbortReason::UpgradeConflict)) => {}
        other => panic!("expected UpgradeConflict abort, got {:?}", other),
    }
    assert_eq!(txn2.state(), TransactionState::Aborted);

    // Releasing the aborted reader lets the first upgrade through
    txn_manager.abort(&txn2, &lock_manager);
    rx.recv_timeout(WAIT).expect("upgrade was not granted");
    assert!(handle.join().unwrap()?);
    Ok(())
}

#[test]
fn test_fifo_fairness() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn_a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_b = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_c = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lock_manager.lock_shared(&txn_a, rid)?;

    let (tx_b, rx_b) = mpsc::channel();
    let handle_b = {
        let lock_manager = lock_manager.clone();
        let txn_b = txn_b.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_exclusive(&txn_b, rid);
            tx_b.send(()).unwrap();
            result
        })
    };
    // Make sure B's request is queued before C's
    thread::sleep(SETTLE);

    let (tx_c, rx_c) = mpsc::channel();
    let handle_c = {
        let lock_manager = lock_manager.clone();
        let txn_c = txn_c.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_shared(&txn_c, rid);
            tx_c.send(()).unwrap();
            result
        })
    };

    // C must not overtake the older exclusive request
    assert!(rx_b.recv_timeout(SETTLE).is_err());
    assert!(rx_c.recv_timeout(SETTLE).is_err());

    lock_manager.unlock(&txn_a, rid);
    rx_b.recv_timeout(WAIT).expect("writer was not granted");
    assert!(handle_b.join().unwrap()?);
    assert!(rx_c.recv_timeout(SETTLE).is_err());

    lock_manager.unlock(&txn_b, rid);
    rx_c.recv_timeout(WAIT).expect("reader was not granted");
    assert!(handle_c.join().unwrap()?);
    Ok(())
}

#[test]
fn test_deadlock_detector_aborts_youngest() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid1 = Rid::new(1, 0);
    let rid2 = Rid::new(1, 1);

    lock_manager.lock_exclusive(&txn1, rid1)?;
    lock_manager.lock_exclusive(&txn2, rid2)?;

    let handle1 = {
        let lock_manager = lock_manager.clone();
        let txn1 = txn1.clone();
        thread::spawn(move || lock_manager.lock_exclusive(&txn1, rid2))
    };
    thread::sleep(SETTLE);

    let handle2 = {
        let (txn_manager, lock_manager) = (txn_manager.clone(), lock_manager.clone());
        let txn2 = txn2.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_exclusive(&txn2, rid1);
            if result.is_err() {
                // The victim unwinds through the transaction manager,
                // releasing what it still holds
                txn_manager.abort(&txn2, &lock_manager);
            }
            result
        })
    };

    // The youngest member of the cycle is chosen as the victim
    match handle2.join().unwrap() {
        Err(TransactionError::Abort(id, AbortReason::Deadlock)) => assert_eq!(id, txn2.id()),
        other => panic!("expected deadlock abort for txn2, got {:?}", other),
    }
    assert_eq!(txn2.state(), TransactionState::Aborted);

    // The survivor gets its lock once the victim's are released
    assert!(handle1.join().unwrap()?);
    assert!(txn1.is_exclusive_locked(rid2));
    Ok(())
}

#[test]
fn test_lock_read_by_isolation_level() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let rid = Rid::new(1, 0);

    // RU: reads take no lock at all
    let ru = txn_manager.begin(IsolationLevel::ReadUncommitted);
    lock_manager.lock_read(&ru, rid)?;
    assert!(!ru.is_shared_locked(rid));

    // RC: the shared lock is released right after the read
    let rc = txn_manager.begin(IsolationLevel::ReadCommitted);
    lock_manager.lock_read(&rc, rid)?;
    assert!(!rc.is_shared_locked(rid));
    assert_eq!(rc.state(), TransactionState::Growing);

    // RR: the shared lock is kept until commit
    let rr = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_read(&rr, rid)?;
    assert!(rr.is_shared_locked(rid));
    Ok(())
}

#[test]
fn test_lock_write_upgrades_and_records() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lock_manager.lock_shared(&txn, rid)?;
    lock_manager.lock_write(&txn, rid, WType::Update)?;
    assert!(txn.is_exclusive_locked(rid));
    assert!(!txn.is_shared_locked(rid));

    // Already exclusive: a second write lock is a no-op
    lock_manager.lock_write(&txn, rid, WType::Delete)?;

    let records = txn.take_index_write_set();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].wtype, WType::Delete);
    assert_eq!(records[1].wtype, WType::Update);
    Ok(())
}

#[test]
fn test_commit_releases_locks() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let holder = txn_manager.begin(IsolationLevel::RepeatableRead);
    let waiter = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lock_manager.lock_exclusive(&holder, rid)?;

    let handle = {
        let lock_manager = lock_manager.clone();
        let waiter = waiter.clone();
        thread::spawn(move || lock_manager.lock_exclusive(&waiter, rid))
    };
    thread::sleep(SETTLE);

    txn_manager.commit(&holder, &lock_manager)?;
    assert_eq!(holder.state(), TransactionState::Committed);
    assert!(handle.join().unwrap()?);
    Ok(())
}

#[test]
fn test_waits_for_graph_api() {
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = LockManager::without_cycle_detection(txn_manager);

    lock_manager.add_edge(1, 2);
    lock_manager.add_edge(2, 3);

    let mut victim = 0;
    assert!(!lock_manager.has_cycle(&mut victim));

    lock_manager.add_edge(3, 1);
    assert!(lock_manager.has_cycle(&mut victim));
    // The youngest transaction on the cycle is the victim
    assert_eq!(victim, 3);

    let edges = lock_manager.get_edge_list();
    assert_eq!(edges.len(), 3);
    assert!(edges.contains(&(1, 2)));
    assert!(edges.contains(&(2, 3)));
    assert!(edges.contains(&(3, 1)));

    lock_manager.remove_edge(3, 1);
    assert!(!lock_manager.has_cycle(&mut victim));
}

#[test]
fn test_has_cycle_is_deterministic() {
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = LockManager::without_cycle_detection(txn_manager);

    // Two disjoint cycles; DFS starts from the smallest txn id, so
    // the first cycle found is {1, 2} and its youngest member is 2
    lock_manager.add_edge(1, 2);
    lock_manager.add_edge(2, 1);
    lock_manager.add_edge(5, 6);
    lock_manager.add_edge(6, 5);

    let mut victim = 0;
    assert!(lock_manager.has_cycle(&mut victim));
    assert_eq!(victim, 2);
}
