use std::path::Path;

use log::info;

use crate::error::Result;
use crate::storage::store::KvStore;
use crate::wal::reader::WalReader;
use crate::wal::record::LogRecord;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub applied_puts: usize,
    pub applied_deletes: usize,
}

impl RecoveryReport {
    pub fn applied(&self) -> usize {
        self.applied_puts + self.applied_deletes
    }
}

/// Re-apply committed WAL work to storage. Runs before the engine accepts
/// any client operation.
///
/// Replay is idempotent: puts and deletes are deterministic functions of the
/// key and value bytes, so re-running recovery over the same log converges
/// to the same storage state. Uncommitted transactions are discarded; their
/// absent COMMIT record leaves nothing to re-apply.
pub fn recover(store: &mut KvStore, wal_path: &Path) -> Result<RecoveryReport> {
    if !wal_path.exists() {
        return Ok(RecoveryReport::default());
    }

    let mut reader = WalReader::open(wal_path)?;
    let entries = reader.replay()?;

    let mut report = RecoveryReport::default();
    for entry in entries {
        match entry.record {
            LogRecord::Put { key, value, .. } => {
                store.put(&key, &value)?;
                report.applied_puts += 1;
            }
            LogRecord::Delete { key, .. } => {
                store.delete(&key)?;
                report.applied_deletes += 1;
            }
            _ => {}
        }
    }

    if report.applied() > 0 {
        store.sync()?;
    }
    info!(
        "recovery replayed {} puts and {} deletes from {}",
        report.applied_puts,
        report.applied_deletes,
        wal_path.display()
    );
    Ok(report)
}
