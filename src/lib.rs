//! StoneDB: embedded transactional key-value store.
//!
//! A single-file database with:
//! - Paged storage with an on-disk free-list and a bounded LRU page cache
//! - Slotted record pages with tombstone-based deletes
//! - Write-ahead logging with group flush and crash recovery
//! - Strict two-phase per-key locking with deadlock detection

pub mod backup;
pub mod concurrency;
pub mod error;
pub mod stats;
pub mod storage;
pub mod tx;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::concurrency::LockManager;
use crate::error::Result;
use crate::stats::Statistics;
use crate::storage::pager::DEFAULT_PAGE_SIZE;
use crate::storage::store::KvStore;
use crate::tx::TransactionManager;
use crate::wal::record::TxnId;
use crate::wal::recovery;
use crate::wal::writer::Wal;

pub use crate::error::StoneError;

fn wal_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("wal")
}

/// Main database handle. Owns the shared collaborators — storage, WAL, lock
/// manager, statistics — and threads every client operation through the
/// transaction manager.
pub struct Database {
    txns: TransactionManager,
    store: Arc<Mutex<KvStore>>,
    wal: Arc<Mutex<Wal>>,
    stats: Arc<Statistics>,
    db_path: PathBuf,
    closed: bool,
}

impl Database {
    /// Open the database at `path`, creating it when missing. WAL recovery
    /// runs before any client operation; after a successful replay the log
    /// is checkpointed down to its header.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_page_size(path, DEFAULT_PAGE_SIZE)
    }

    pub fn open_with_page_size(path: &Path, page_size: u32) -> Result<Self> {
        let stats = Arc::new(Statistics::new());
        let mut store = KvStore::open(path, true, page_size, stats.clone())?;

        let wp = wal_path(path);
        let report = recovery::recover(&mut store, &wp)?;
        if report.applied() > 0 {
            info!(
                "recovered {} operations from {}",
                report.applied(),
                wp.display()
            );
        }

        let mut wal = Wal::open(&wp)?;
        wal.checkpoint(&mut store)?;

        let store = Arc::new(Mutex::new(store));
        let wal = Arc::new(Mutex::new(wal));
        let locks = Arc::new(LockManager::new(stats.clone()));
        let txns = TransactionManager::new(store.clone(), wal.clone(), locks, stats.clone());

        Ok(Database {
            txns,
            store,
            wal,
            stats,
            db_path: path.to_path_buf(),
            closed: false,
        })
    }

    pub fn begin(&self) -> Result<TxnId> {
        self.txns.begin()
    }

    pub fn put(&self, txn_id: TxnId, key: &[u8], value: &[u8]) -> Result<()> {
        self.txns.put(txn_id, key, value)
    }

    pub fn get(&self, txn_id: TxnId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.txns.get(txn_id, key)
    }

    pub fn delete(&self, txn_id: TxnId, key: &[u8]) -> Result<bool> {
        self.txns.delete(txn_id, key)
    }

    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        self.txns.commit(txn_id)
    }

    pub fn abort(&self, txn_id: TxnId) -> Result<()> {
        self.txns.abort(txn_id)
    }

    /// All live records in page order. Not transactional; intended for the
    /// shell's `scan` and for backups.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.store.lock().scan()
    }

    /// Flush storage, flush the WAL, and truncate the log to its header.
    pub fn checkpoint(&self) -> Result<()> {
        let mut store = self.store.lock();
        self.wal.lock().checkpoint(&mut store)
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Checkpoint and close. Idempotent; also invoked on drop.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.checkpoint()?;
        self.store.lock().close()?;
        self.closed = true;
        info!("closed database {}", self.db_path.display());
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
