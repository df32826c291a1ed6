use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::concurrency::{LockManager, LockMode};
use crate::error::{Result, StoneError};
use crate::stats::Statistics;
use crate::storage::store::{self, KvStore};
use crate::wal::record::{LogRecord, TxnId};
use crate::wal::writer::Wal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

struct Transaction {
    state: TxnState,
    read_set: HashSet<Vec<u8>>,
    write_set: HashSet<Vec<u8>>,
}

impl Transaction {
    fn new() -> Self {
        Transaction {
            state: TxnState::Active,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
        }
    }
}

struct TxnTable {
    next_id: TxnId,
    active: HashMap<TxnId, Transaction>,
}

/// Issues transaction ids and drives each operation through the strict
/// ordering: lock acquisition, WAL append, storage mutation; at commit, WAL
/// flush (the durability barrier), storage flush, then lock release.
///
/// The table mutex is held only to mutate the transaction table, never
/// across a lock wait or I/O.
pub struct TransactionManager {
    store: Arc<Mutex<KvStore>>,
    wal: Arc<Mutex<Wal>>,
    locks: Arc<LockManager>,
    stats: Arc<Statistics>,
    page_size: usize,
    table: Mutex<TxnTable>,
}

impl TransactionManager {
    pub fn new(
        store: Arc<Mutex<KvStore>>,
        wal: Arc<Mutex<Wal>>,
        locks: Arc<LockManager>,
        stats: Arc<Statistics>,
    ) -> Self {
        let page_size = store.lock().page_size();
        TransactionManager {
            store,
            wal,
            locks,
            stats,
            page_size,
            table: Mutex::new(TxnTable {
                next_id: 1,
                active: HashMap::new(),
            }),
        }
    }

    /// Start a transaction. The id allocation is rolled back when the BEGIN
    /// record cannot be logged.
    pub fn begin(&self) -> Result<TxnId> {
        let txn_id = {
            let mut table = self.table.lock();
            let txn_id = table.next_id;
            table.next_id = table.next_id.wrapping_add(1);
            if table.next_id == 0 {
                table.next_id = 1;
            }
            table.active.insert(txn_id, Transaction::new());
            txn_id
        };

        if let Err(e) = self.wal.lock().append(&LogRecord::Begin { txn_id }) {
            error!("failed to log begin for txn {}: {}", txn_id, e);
            self.table.lock().active.remove(&txn_id);
            return Err(e);
        }

        self.stats.record_transaction();
        debug!("txn {} started", txn_id);
        Ok(txn_id)
    }

    fn ensure_active(&self, txn_id: TxnId) -> Result<()> {
        let table = self.table.lock();
        match table.active.get(&txn_id) {
            None => Err(StoneError::TransactionNotFound(txn_id)),
            Some(txn) if txn.state != TxnState::Active => {
                Err(StoneError::TransactionNotActive(txn_id))
            }
            Some(_) => Ok(()),
        }
    }

    pub fn put(&self, txn_id: TxnId, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active(txn_id)?;
        store::validate_record(key, value, self.page_size)?;

        self.locks.acquire(txn_id, key, LockMode::Exclusive)?;
        self.wal.lock().append(&LogRecord::Put {
            txn_id,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.store.lock().put(key, value)?;

        if let Some(txn) = self.table.lock().active.get_mut(&txn_id) {
            txn.write_set.insert(key.to_vec());
        }
        self.stats.record_put();
        Ok(())
    }

    /// Read under a shared lock. A miss is not an error.
    pub fn get(&self, txn_id: TxnId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active(txn_id)?;
        store::validate_key(key)?;

        self.locks.acquire(txn_id, key, LockMode::Shared)?;
        let value = self.store.lock().get(key)?;

        if value.is_some() {
            if let Some(txn) = self.table.lock().active.get_mut(&txn_id) {
                txn.read_set.insert(key.to_vec());
            }
        }
        self.stats.record_get();
        Ok(value)
    }

    /// Delete under an exclusive lock. Returns whether the key existed; a
    /// missing key does not abort the transaction.
    pub fn delete(&self, txn_id: TxnId, key: &[u8]) -> Result<bool> {
        self.ensure_active(txn_id)?;
        store::validate_key(key)?;

        self.locks.acquire(txn_id, key, LockMode::Exclusive)?;
        self.wal.lock().append(&LogRecord::Delete {
            txn_id,
            key: key.to_vec(),
        })?;
        let found = self.store.lock().delete(key)?;

        if let Some(txn) = self.table.lock().active.get_mut(&txn_id) {
            txn.write_set.insert(key.to_vec());
        }
        self.stats.record_delete();
        Ok(found)
    }

    /// Commit: the WAL flush of the COMMIT record is the durability barrier;
    /// the storage flush after it is recoverable from the log.
    ///
    /// A WAL failure leaves the transaction active so the caller may retry
    /// or abort. A storage-flush failure aborts the transaction to keep the
    /// durability contract honest.
    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_active(txn_id)?;

        let seq = self.wal.lock().append(&LogRecord::Commit { txn_id })?;
        self.wal.lock().flush_up_to(seq)?;

        if let Err(e) = self.store.lock().flush_all() {
            error!("storage flush failed during commit of txn {}: {}", txn_id, e);
            self.locks.release_all(txn_id);
            self.finish(txn_id, TxnState::Aborted);
            return Err(e);
        }

        self.locks.release_all(txn_id);
        self.finish(txn_id, TxnState::Committed);
        Ok(())
    }

    /// Abort: logs the ABORT record (unflushed), releases all locks, and
    /// retires the transaction. Storage is not rolled back; replay discards
    /// uncommitted work after a crash.
    pub fn abort(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_active(txn_id)?;

        let logged = self.wal.lock().append(&LogRecord::Abort { txn_id });
        self.locks.release_all(txn_id);
        self.finish(txn_id, TxnState::Aborted);
        logged?;
        Ok(())
    }

    fn finish(&self, txn_id: TxnId, state: TxnState) {
        let mut table = self.table.lock();
        if let Some(mut txn) = table.active.remove(&txn_id) {
            txn.state = state;
            info!(
                "txn {} {:?} ({} writes, {} reads)",
                txn_id,
                state,
                txn.write_set.len(),
                txn.read_set.len()
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> TransactionManager {
        let stats = Arc::new(Statistics::new());
        let store = KvStore::open(&dir.path().join("test.sdb"), true, 4096, stats.clone()).unwrap();
        let wal = Wal::open(&dir.path().join("test.wal")).unwrap();
        TransactionManager::new(
            Arc::new(Mutex::new(store)),
            Arc::new(Mutex::new(wal)),
            Arc::new(LockManager::new(stats.clone())),
            stats,
        )
    }

    #[test]
    fn test_read_your_own_writes() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let txn = mgr.begin().unwrap();
        mgr.put(txn, b"user1", b"alice").unwrap();
        assert_eq!(mgr.get(txn, b"user1").unwrap(), Some(b"alice".to_vec()));
        mgr.commit(txn).unwrap();
    }

    #[test]
    fn test_committed_writes_visible_to_later_txn() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let t1 = mgr.begin().unwrap();
        mgr.put(t1, b"user1", b"alice").unwrap();
        mgr.put(t1, b"user2", b"bob").unwrap();
        mgr.commit(t1).unwrap();

        let t2 = mgr.begin().unwrap();
        assert_eq!(mgr.get(t2, b"user1").unwrap(), Some(b"alice".to_vec()));
        assert_eq!(mgr.get(t2, b"user2").unwrap(), Some(b"bob".to_vec()));
        mgr.commit(t2).unwrap();
    }

    #[test]
    fn test_txn_ids_are_sequential() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let t1 = mgr.begin().unwrap();
        let t2 = mgr.begin().unwrap();
        assert_eq!(t2, t1 + 1);
        mgr.commit(t1).unwrap();
        mgr.commit(t2).unwrap();
    }

    #[test]
    fn test_operations_on_retired_txn_fail() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let txn = mgr.begin().unwrap();
        mgr.commit(txn).unwrap();
        assert!(matches!(
            mgr.put(txn, b"k", b"v"),
            Err(StoneError::TransactionNotFound(_))
        ));
        assert!(matches!(
            mgr.commit(txn),
            Err(StoneError::TransactionNotFound(_))
        ));

        assert!(matches!(
            mgr.get(999, b"k"),
            Err(StoneError::TransactionNotFound(999))
        ));
    }

    #[test]
    fn test_delete_missing_key_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let txn = mgr.begin().unwrap();
        assert!(!mgr.delete(txn, b"ghost").unwrap());
        // The transaction stays usable.
        mgr.put(txn, b"real", b"value").unwrap();
        mgr.commit(txn).unwrap();
    }

    #[test]
    fn test_delete_then_get_not_found() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let t1 = mgr.begin().unwrap();
        mgr.put(t1, b"k", b"v").unwrap();
        mgr.commit(t1).unwrap();

        let t2 = mgr.begin().unwrap();
        assert!(mgr.delete(t2, b"k").unwrap());
        mgr.commit(t2).unwrap();

        let t3 = mgr.begin().unwrap();
        assert_eq!(mgr.get(t3, b"k").unwrap(), None);
        mgr.commit(t3).unwrap();
    }

    #[test]
    fn test_abort_releases_locks() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let t1 = mgr.begin().unwrap();
        mgr.put(t1, b"k", b"v").unwrap();
        mgr.abort(t1).unwrap();

        // A second transaction can lock the key immediately.
        let t2 = mgr.begin().unwrap();
        mgr.put(t2, b"k", b"w").unwrap();
        mgr.commit(t2).unwrap();

        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_oversized_records_rejected_before_logging() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        let txn = mgr.begin().unwrap();
        assert!(matches!(
            mgr.put(txn, b"", b"v"),
            Err(StoneError::InvalidKey)
        ));
        let long_key = vec![b'x'; 256];
        assert!(matches!(
            mgr.put(txn, &long_key, b"v"),
            Err(StoneError::KeyTooLarge(256))
        ));
        let wide_value = vec![0u8; 4096];
        assert!(matches!(
            mgr.put(txn, b"k", &wide_value),
            Err(StoneError::ValueTooLarge(_))
        ));
        // Nothing was stored.
        assert_eq!(mgr.get(txn, b"k").unwrap(), None);
        mgr.commit(txn).unwrap();
    }

    #[test]
    fn test_deadlock_victim_can_abort_and_other_commits() {
        use std::thread;
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let mgr = Arc::new(setup(&dir));

        let t1 = mgr.begin().unwrap();
        let t2 = mgr.begin().unwrap();
        mgr.put(t1, b"a", b"1").unwrap();
        mgr.put(t2, b"b", b"2").unwrap();

        let mgr_bg = mgr.clone();
        let blocked = thread::spawn(move || {
            // Blocks on "b" held by t2 until the deadlock is broken.
            let result = mgr_bg.put(t1, b"b", b"from-t1");
            match result {
                Ok(()) => {
                    mgr_bg.commit(t1).unwrap();
                    true
                }
                Err(_) => {
                    mgr_bg.abort(t1).unwrap();
                    false
                }
            }
        });
        thread::sleep(Duration::from_millis(50));

        // Closing the cycle: exactly one side is refused and aborts, the
        // other goes on to commit.
        let t2_committed = match mgr.put(t2, b"a", b"from-t2") {
            Ok(()) => {
                mgr.commit(t2).unwrap();
                true
            }
            Err(StoneError::Deadlock(_)) => {
                mgr.abort(t2).unwrap();
                false
            }
            Err(other) => panic!("unexpected error: {}", other),
        };
        let t1_committed = blocked.join().unwrap();
        assert_ne!(t1_committed, t2_committed);
        assert_eq!(mgr.active_count(), 0);
    }
}
