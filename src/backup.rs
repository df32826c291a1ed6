//! JSON backup and restore.
//!
//! A backup file is an array of `{"key": ..., "value": ...}` objects. Keys
//! and values are UTF-8 at this surface; binary records fail the backup.

use std::fs;
use std::path::Path;

use log::info;
use serde_json::{json, Value};

use crate::error::{Result, StoneError};
use crate::Database;

/// Serialize every live record to `path`. Returns the record count.
pub fn backup(db: &Database, path: &Path) -> Result<usize> {
    let records = db.scan()?;
    let mut entries = Vec::with_capacity(records.len());
    for (key, value) in &records {
        let key = std::str::from_utf8(key)
            .map_err(|_| StoneError::Storage("backup requires UTF-8 keys".into()))?;
        let value = std::str::from_utf8(value)
            .map_err(|_| StoneError::Storage("backup requires UTF-8 values".into()))?;
        entries.push(json!({ "key": key, "value": value }));
    }

    let doc = serde_json::to_vec_pretty(&Value::Array(entries))
        .map_err(|e| StoneError::Storage(format!("backup serialization failed: {}", e)))?;
    fs::write(path, doc)?;
    info!("backed up {} records to {}", records.len(), path.display());
    Ok(records.len())
}

/// Load records from a backup file through one transaction. Existing keys
/// are overwritten; keys absent from the backup are left alone.
pub fn restore(db: &Database, path: &Path) -> Result<usize> {
    let bytes = fs::read(path)?;
    let doc: Value = serde_json::from_slice(&bytes)
        .map_err(|e| StoneError::Storage(format!("invalid backup file: {}", e)))?;
    let Value::Array(items) = doc else {
        return Err(StoneError::Storage(
            "invalid backup file: expected a JSON array".into(),
        ));
    };

    let txn = db.begin()?;
    let mut applied = 0usize;
    for item in &items {
        let (Some(key), Some(value)) = (
            item.get("key").and_then(Value::as_str),
            item.get("value").and_then(Value::as_str),
        ) else {
            db.abort(txn)?;
            return Err(StoneError::Storage(
                "invalid backup entry: expected string key and value".into(),
            ));
        };
        if let Err(e) = db.put(txn, key.as_bytes(), value.as_bytes()) {
            db.abort(txn)?;
            return Err(e);
        }
        applied += 1;
    }
    db.commit(txn)?;
    info!("restored {} records from {}", applied, path.display());
    Ok(applied)
}
