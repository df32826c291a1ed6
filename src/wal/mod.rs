pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

/// Reserved bytes at the start of the WAL file.
pub const WAL_HEADER_SIZE: usize = 32;

/// Replay refuses key lengths above this bound and treats the entry as a
/// corrupt tail.
pub const MAX_WAL_KEY: usize = 1024 * 1024;

/// Replay refuses value lengths above this bound and treats the entry as a
/// corrupt tail.
pub const MAX_WAL_VALUE: usize = 10 * 1024 * 1024;
