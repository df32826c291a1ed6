//! Typed WAL records.
//!
//! On-disk framing, all integers little-endian:
//!   `type:u8 | txn_id:u64 | timestamp:u64 | key_len:u16 | key | val_len:u16 | value`
//!
//! BEGIN/COMMIT/ABORT carry empty key and value. The timestamp is wall-clock
//! milliseconds, informational only.

pub type TxnId = u64;

pub const TAG_BEGIN: u8 = 1;
pub const TAG_COMMIT: u8 = 2;
pub const TAG_ABORT: u8 = 3;
pub const TAG_PUT: u8 = 4;
pub const TAG_DELETE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Begin { txn_id: TxnId },
    Commit { txn_id: TxnId },
    Abort { txn_id: TxnId },
    Put { txn_id: TxnId, key: Vec<u8>, value: Vec<u8> },
    Delete { txn_id: TxnId, key: Vec<u8> },
}

impl LogRecord {
    pub fn txn_id(&self) -> TxnId {
        match self {
            LogRecord::Begin { txn_id }
            | LogRecord::Commit { txn_id }
            | LogRecord::Abort { txn_id }
            | LogRecord::Put { txn_id, .. }
            | LogRecord::Delete { txn_id, .. } => *txn_id,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            LogRecord::Begin { .. } => TAG_BEGIN,
            LogRecord::Commit { .. } => TAG_COMMIT,
            LogRecord::Abort { .. } => TAG_ABORT,
            LogRecord::Put { .. } => TAG_PUT,
            LogRecord::Delete { .. } => TAG_DELETE,
        }
    }

    fn payload(&self) -> (&[u8], &[u8]) {
        match self {
            LogRecord::Put { key, value, .. } => (key.as_slice(), value.as_slice()),
            LogRecord::Delete { key, .. } => (key.as_slice(), &[]),
            _ => (&[], &[]),
        }
    }

    /// Serialize with the given timestamp stamped into the frame.
    pub fn serialize(&self, timestamp: u64) -> Vec<u8> {
        let (key, value) = self.payload();
        let mut buf = Vec::with_capacity(1 + 8 + 8 + 2 + key.len() + 2 + value.len());
        buf.push(self.tag());
        buf.extend_from_slice(&self.txn_id().to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
        buf.extend_from_slice(value);
        buf
    }

    /// Rebuild a record from its parsed fields. `None` for an unknown tag.
    pub fn from_parts(tag: u8, txn_id: TxnId, key: Vec<u8>, value: Vec<u8>) -> Option<LogRecord> {
        match tag {
            TAG_BEGIN => Some(LogRecord::Begin { txn_id }),
            TAG_COMMIT => Some(LogRecord::Commit { txn_id }),
            TAG_ABORT => Some(LogRecord::Abort { txn_id }),
            TAG_PUT => Some(LogRecord::Put { txn_id, key, value }),
            TAG_DELETE => Some(LogRecord::Delete { txn_id, key }),
            _ => None,
        }
    }
}
