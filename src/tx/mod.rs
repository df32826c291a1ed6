pub mod manager;

pub use manager::{TransactionManager, TxnState};
