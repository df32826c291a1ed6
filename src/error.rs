use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoneError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("bad page id: {0}")]
    BadPageId(u64),

    #[error("invalid key: keys must be 1..=255 bytes")]
    InvalidKey,

    #[error("key too large: {0} bytes")]
    KeyTooLarge(usize),

    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    #[error("page full")]
    PageFull,

    #[error("page cache full")]
    CacheFull,

    #[error("transaction not found: {0}")]
    TransactionNotFound(u64),

    #[error("transaction not active: {0}")]
    TransactionNotActive(u64),

    #[error("lock wait timed out")]
    LockTimeout,

    #[error("deadlock detected for transaction {0}")]
    Deadlock(u64),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, StoneError>;
