use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};

use crate::error::Result;
use crate::storage::store::KvStore;
use crate::wal::record::{LogRecord, TxnId};
use crate::wal::WAL_HEADER_SIZE;

/// Append-only write-ahead log.
///
/// `append` only buffers into the OS; durability comes from `flush`, which
/// fsyncs. Commits flush through `flush_up_to`, so a commit whose record was
/// already covered by another thread's fsync skips its own (group flush).
pub struct Wal {
    file: File,
    path: PathBuf,
    append_seq: u64,
    flushed_seq: u64,
    active_txns: HashSet<TxnId>,
    committed_txns: HashSet<TxnId>,
}

impl Wal {
    /// Open the log, writing the reserved 32-byte header when the file is
    /// new or shorter than it.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE as u64 {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&[0u8; WAL_HEADER_SIZE])?;
            file.set_len(WAL_HEADER_SIZE as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        info!("opened wal {}", path.display());
        Ok(Wal {
            file,
            path: path.to_path_buf(),
            append_seq: 0,
            flushed_seq: 0,
            active_txns: HashSet::new(),
            committed_txns: HashSet::new(),
        })
    }

    /// Serialize and append one record. Returns the record's sequence number
    /// for use with [`Wal::flush_up_to`]. Does not flush.
    pub fn append(&mut self, record: &LogRecord) -> Result<u64> {
        let bytes = record.serialize(now_millis());
        self.file.write_all(&bytes)?;
        self.append_seq += 1;

        match record {
            LogRecord::Begin { txn_id } => {
                self.active_txns.insert(*txn_id);
            }
            LogRecord::Commit { txn_id } => {
                self.active_txns.remove(txn_id);
                self.committed_txns.insert(*txn_id);
            }
            LogRecord::Abort { txn_id } => {
                self.active_txns.remove(txn_id);
            }
            _ => {}
        }
        Ok(self.append_seq)
    }

    /// Fsync everything appended so far.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.flushed_seq = self.append_seq;
        Ok(())
    }

    /// Fsync if `seq` has not been covered by an earlier flush.
    pub fn flush_up_to(&mut self, seq: u64) -> Result<()> {
        if self.flushed_seq >= seq {
            debug!("group flush: seq {} already durable", seq);
            return Ok(());
        }
        self.flush()
    }

    /// Drop the log back to its reserved header.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.file.sync_all()?;
        self.file.seek(SeekFrom::End(0))?;
        self.active_txns.clear();
        self.committed_txns.clear();
        info!("wal truncated: {}", self.path.display());
        Ok(())
    }

    /// Make the pager state on disk cover every committed entry, then drop
    /// the log to just its header.
    pub fn checkpoint(&mut self, store: &mut KvStore) -> Result<()> {
        store.sync()?;
        self.flush()?;
        self.truncate()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn active_txns(&self) -> &HashSet<TxnId> {
        &self.active_txns
    }

    pub fn committed_txns(&self) -> &HashSet<TxnId> {
        &self.committed_txns
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
