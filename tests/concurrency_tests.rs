use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stonedb::{Database, StoneError};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Arc<Database> {
    Arc::new(Database::open(&dir.path().join("test.sdb")).unwrap())
}

#[test]
fn test_reader_blocks_writer_until_commit() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let reader_committed = Arc::new(AtomicBool::new(false));

    let db_a = db.clone();
    let flag_a = reader_committed.clone();
    let reader = thread::spawn(move || {
        let txn = db_a.begin().unwrap();
        assert_eq!(db_a.get(txn, b"k").unwrap(), None);
        thread::sleep(Duration::from_millis(100));
        flag_a.store(true, Ordering::SeqCst);
        db_a.commit(txn).unwrap();
    });

    thread::sleep(Duration::from_millis(30));

    let db_b = db.clone();
    let flag_b = reader_committed.clone();
    let writer = thread::spawn(move || {
        let txn = db_b.begin().unwrap();
        db_b.put(txn, b"k", b"x").unwrap();
        // The shared lock is held until the reader commits.
        assert!(flag_b.load(Ordering::SeqCst));
        db_b.commit(txn).unwrap();
    });

    reader.join().unwrap();
    writer.join().unwrap();

    let txn = db.begin().unwrap();
    assert_eq!(db.get(txn, b"k").unwrap(), Some(b"x".to_vec()));
    db.commit(txn).unwrap();
}

#[test]
fn test_deadlock_exactly_one_victim() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let t1 = db.begin().unwrap();
    let t2 = db.begin().unwrap();
    db.put(t1, b"a", b"1").unwrap();
    db.put(t2, b"b", b"2").unwrap();

    let db_bg = db.clone();
    let crossing = thread::spawn(move || match db_bg.put(t1, b"b", b"t1") {
        Ok(()) => {
            db_bg.commit(t1).unwrap();
            true
        }
        Err(StoneError::Deadlock(_)) => {
            db_bg.abort(t1).unwrap();
            false
        }
        Err(other) => panic!("unexpected error: {}", other),
    });
    thread::sleep(Duration::from_millis(50));

    let t2_committed = match db.put(t2, b"a", b"t2") {
        Ok(()) => {
            db.commit(t2).unwrap();
            true
        }
        Err(StoneError::Deadlock(_)) => {
            db.abort(t2).unwrap();
            false
        }
        Err(other) => panic!("unexpected error: {}", other),
    };
    let t1_committed = crossing.join().unwrap();

    assert_ne!(t1_committed, t2_committed);
    assert!(db.stats().deadlocks() >= 1);
}

#[test]
fn test_disjoint_keys_do_not_block() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let db = db.clone();
            thread::spawn(move || {
                for round in 0..10 {
                    let key = format!("worker{}-{}", i, round);
                    let txn = db.begin().unwrap();
                    db.put(txn, key.as_bytes(), b"payload").unwrap();
                    db.commit(txn).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(db.scan().unwrap().len(), 40);
}

#[test]
fn test_no_lost_updates_under_lock_upgrades() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    {
        let txn = db.begin().unwrap();
        db.put(txn, b"counter", b"0").unwrap();
        db.commit(txn).unwrap();
    }

    // Read under a shared lock, then upgrade by writing. Competing upgraders
    // produce deadlock victims that retry with a fresh transaction, so no
    // increment is ever lost.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    loop {
                        let txn = db.begin().unwrap();
                        let current = match db.get(txn, b"counter") {
                            Ok(v) => v.unwrap(),
                            Err(StoneError::Deadlock(_)) => {
                                db.abort(txn).unwrap();
                                continue;
                            }
                            Err(other) => panic!("unexpected error: {}", other),
                        };
                        let n: u64 = String::from_utf8(current).unwrap().parse().unwrap();
                        match db.put(txn, b"counter", (n + 1).to_string().as_bytes()) {
                            Ok(()) => {
                                db.commit(txn).unwrap();
                                break;
                            }
                            Err(StoneError::Deadlock(_)) => {
                                db.abort(txn).unwrap();
                            }
                            Err(other) => panic!("unexpected error: {}", other),
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let txn = db.begin().unwrap();
    assert_eq!(db.get(txn, b"counter").unwrap(), Some(b"40".to_vec()));
    db.commit(txn).unwrap();
}

#[test]
fn test_many_concurrent_readers() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    {
        let txn = db.begin().unwrap();
        db.put(txn, b"shared", b"value").unwrap();
        db.commit(txn).unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let txn = db.begin().unwrap();
                    assert_eq!(db.get(txn, b"shared").unwrap(), Some(b"value".to_vec()));
                    db.commit(txn).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
