use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use log::warn;

use crate::error::Result;
use crate::wal::record::{LogRecord, TxnId, TAG_BEGIN, TAG_DELETE};
use crate::wal::{MAX_WAL_KEY, MAX_WAL_VALUE, WAL_HEADER_SIZE};

/// One parsed log entry.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub record: LogRecord,
    pub timestamp: u64,
}

/// Sequential WAL scanner for recovery.
///
/// Parsing is bounds-first: lengths are validated against the per-entry caps
/// before any payload byte is allocated or read. The first malformed or
/// truncated entry ends the scan as a corrupt tail; everything before it is
/// returned.
pub struct WalReader {
    reader: BufReader<File>,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len >= WAL_HEADER_SIZE as u64 {
            file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        } else {
            // Shorter than the reserved header: nothing to scan.
            file.seek(SeekFrom::Start(len))?;
        }
        Ok(WalReader {
            reader: BufReader::new(file),
        })
    }

    /// Parse the next entry. `Ok(None)` at EOF or at the first parse failure.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        // type + txn_id + timestamp + key_len
        let mut prefix = [0u8; 19];
        match self.reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let tag = prefix[0];
        let txn_id = TxnId::from_le_bytes(prefix[1..9].try_into().unwrap());
        let timestamp = u64::from_le_bytes(prefix[9..17].try_into().unwrap());
        let key_len = u16::from_le_bytes(prefix[17..19].try_into().unwrap()) as usize;

        if !(TAG_BEGIN..=TAG_DELETE).contains(&tag) {
            warn!("wal: unknown record type {}, treating as corrupt tail", tag);
            return Ok(None);
        }
        if key_len > MAX_WAL_KEY {
            warn!("wal: key length {} over cap, treating as corrupt tail", key_len);
            return Ok(None);
        }

        let mut key = vec![0u8; key_len];
        if !self.read_payload(&mut key)? {
            return Ok(None);
        }

        let mut len_buf = [0u8; 2];
        if !self.read_payload(&mut len_buf)? {
            return Ok(None);
        }
        let val_len = u16::from_le_bytes(len_buf) as usize;
        if val_len > MAX_WAL_VALUE {
            warn!("wal: value length {} over cap, treating as corrupt tail", val_len);
            return Ok(None);
        }

        let mut value = vec![0u8; val_len];
        if !self.read_payload(&mut value)? {
            return Ok(None);
        }

        let Some(record) = LogRecord::from_parts(tag, txn_id, key, value) else {
            return Ok(None);
        };
        Ok(Some(WalEntry { record, timestamp }))
    }

    /// Fill `buf`, reporting a truncated tail as `false`.
    fn read_payload(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!("wal: entry truncated at tail");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every parseable entry, in file order.
    pub fn read_all(&mut self) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Replayable work: PUT and DELETE entries of committed transactions, in
    /// file order. Uncommitted transactions are discarded silently.
    pub fn replay(&mut self) -> Result<Vec<WalEntry>> {
        let entries = self.read_all()?;

        let committed: HashSet<TxnId> = entries
            .iter()
            .filter(|e| matches!(e.record, LogRecord::Commit { .. }))
            .map(|e| e.record.txn_id())
            .collect();

        Ok(entries
            .into_iter()
            .filter(|e| {
                committed.contains(&e.record.txn_id())
                    && matches!(
                        e.record,
                        LogRecord::Put { .. } | LogRecord::Delete { .. }
                    )
            })
            .collect())
    }
}
