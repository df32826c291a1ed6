use stonedb::{Database, StoneError};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Database {
    Database::open(&dir.path().join("test.sdb")).unwrap()
}

#[test]
fn test_read_your_own_writes() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let txn = db.begin().unwrap();
    db.put(txn, b"k", b"v").unwrap();
    assert_eq!(db.get(txn, b"k").unwrap(), Some(b"v".to_vec()));
    db.commit(txn).unwrap();
}

#[test]
fn test_sequential_commits_last_writer_wins() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let t1 = db.begin().unwrap();
    db.put(t1, b"k", b"v1").unwrap();
    db.commit(t1).unwrap();

    let t2 = db.begin().unwrap();
    db.put(t2, b"k", b"v2").unwrap();
    db.commit(t2).unwrap();

    let t3 = db.begin().unwrap();
    assert_eq!(db.get(t3, b"k").unwrap(), Some(b"v2".to_vec()));
    db.commit(t3).unwrap();
}

#[test]
fn test_committed_delete_stays_deleted() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let t1 = db.begin().unwrap();
    db.put(t1, b"k", b"v").unwrap();
    db.commit(t1).unwrap();

    let t2 = db.begin().unwrap();
    assert!(db.delete(t2, b"k").unwrap());
    db.commit(t2).unwrap();

    let t3 = db.begin().unwrap();
    assert_eq!(db.get(t3, b"k").unwrap(), None);
    db.commit(t3).unwrap();

    // Until a new put commits.
    let t4 = db.begin().unwrap();
    db.put(t4, b"k", b"again").unwrap();
    db.commit(t4).unwrap();

    let t5 = db.begin().unwrap();
    assert_eq!(db.get(t5, b"k").unwrap(), Some(b"again".to_vec()));
    db.commit(t5).unwrap();
}

#[test]
fn test_terminated_transactions_reject_operations() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let committed = db.begin().unwrap();
    db.commit(committed).unwrap();
    assert!(matches!(
        db.put(committed, b"k", b"v"),
        Err(StoneError::TransactionNotFound(_))
    ));

    let aborted = db.begin().unwrap();
    db.abort(aborted).unwrap();
    assert!(matches!(
        db.get(aborted, b"k"),
        Err(StoneError::TransactionNotFound(_))
    ));
    assert!(matches!(
        db.abort(aborted),
        Err(StoneError::TransactionNotFound(_))
    ));
}

#[test]
fn test_unknown_transaction_id() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    assert!(matches!(
        db.commit(424242),
        Err(StoneError::TransactionNotFound(424242))
    ));
}

#[test]
fn test_delete_missing_key_keeps_transaction_alive() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let txn = db.begin().unwrap();
    assert!(!db.delete(txn, b"ghost").unwrap());
    db.put(txn, b"real", b"thing").unwrap();
    db.commit(txn).unwrap();

    let check = db.begin().unwrap();
    assert_eq!(db.get(check, b"real").unwrap(), Some(b"thing".to_vec()));
    db.commit(check).unwrap();
}

#[test]
fn test_invalid_keys_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let txn = db.begin().unwrap();
    assert!(matches!(
        db.put(txn, b"", b"v"),
        Err(StoneError::InvalidKey)
    ));
    assert!(matches!(db.get(txn, b""), Err(StoneError::InvalidKey)));

    let long_key = vec![b'k'; 256];
    assert!(matches!(
        db.put(txn, &long_key, b"v"),
        Err(StoneError::KeyTooLarge(256))
    ));
    db.commit(txn).unwrap();
}

#[test]
fn test_oversized_value_causes_no_mutation() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let txn = db.begin().unwrap();
    let wide = vec![0u8; 8192];
    assert!(matches!(
        db.put(txn, b"k", &wide),
        Err(StoneError::ValueTooLarge(_))
    ));
    db.commit(txn).unwrap();

    assert!(db.scan().unwrap().is_empty());
}
