use keybridge::{Bridge, DbFlags, EnvFlags, EnvHandle, Error, UsageError, ValueMode, WriteFlags};
use tempfile::TempDir;

fn setup() -> (TempDir, Bridge, EnvHandle) {
    let dir = TempDir::new().unwrap();
    let bridge = Bridge::new();
    let env = bridge.env_create();
    bridge.env_open(env, dir.path(), EnvFlags::empty(), 0o644).unwrap();
    (dir, bridge, env)
}

fn get_copy(bridge: &Bridge, txn: keybridge::TxnHandle, db: keybridge::DbHandle, key: &[u8]) -> Option<Vec<u8>> {
    bridge
        .get(txn, db, key, ValueMode::Copy)
        .unwrap()
        .map(|v| v.detach().unwrap())
}

#[test]
fn put_get_roundtrip() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
    bridge.put(txn, db, b"key", b"value", WriteFlags::empty()).unwrap();
    assert_eq!(get_copy(&bridge, txn, db, b"key").unwrap(), b"value");
    assert!(get_copy(&bridge, txn, db, b"missing").is_none());
    bridge.txn_commit(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn delete_reports_presence() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
    bridge.put(txn, db, b"key", b"value", WriteFlags::empty()).unwrap();
    assert!(bridge.del(txn, db, b"key", None).unwrap());
    assert!(!bridge.del(txn, db, b"key", None).unwrap());
    assert!(get_copy(&bridge, txn, db, b"key").is_none());
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn exclusive_insert_carries_the_existing_value() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
    bridge.put(txn, db, b"key", b"first", WriteFlags::empty()).unwrap();

    let err = bridge
        .put(txn, db, b"key", b"second", WriteFlags::NOOVERWRITE)
        .unwrap_err();
    match err {
        Error::KeyExists { current } => assert_eq!(current, b"first"),
        other => panic!("expected KeyExists, got {other:?}"),
    }
    // The refused insert changed nothing.
    assert_eq!(get_copy(&bridge, txn, db, b"key").unwrap(), b"first");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn invalid_keys_never_reach_the_engine() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();

    assert!(matches!(
        bridge.put(txn, db, b"", b"v", WriteFlags::empty()),
        Err(Error::Usage(UsageError::KeyRejected { len: 0, max: 511 }))
    ));
    let oversized = vec![0u8; 512];
    assert!(matches!(
        bridge.get(txn, db, &oversized, ValueMode::Copy),
        Err(Error::Usage(UsageError::KeyRejected { len: 512, max: 511 }))
    ));
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn append_requires_sorted_keys() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
    bridge.put(txn, db, b"b", b"1", WriteFlags::APPEND).unwrap();
    bridge.put(txn, db, b"c", b"2", WriteFlags::APPEND).unwrap();
    assert!(matches!(
        bridge.put(txn, db, b"a", b"3", WriteFlags::APPEND),
        Err(Error::Usage(UsageError::AppendOutOfOrder))
    ));
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn data_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let bridge = Bridge::new();
        let env = bridge.env_create();
        bridge.env_open(env, dir.path(), EnvFlags::empty(), 0o644).unwrap();
        let txn = bridge.txn_begin(env, None, false).unwrap();
        let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
        bridge.put(txn, db, b"durable", b"yes", WriteFlags::empty()).unwrap();
        bridge.txn_commit(txn).unwrap();
        bridge.env_close(env).unwrap();
    }
    let bridge = Bridge::new();
    let env = bridge.env_create();
    bridge.env_open(env, dir.path(), EnvFlags::empty(), 0o644).unwrap();
    let txn = bridge.txn_begin(env, None, true).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
    assert_eq!(get_copy(&bridge, txn, db, b"durable").unwrap(), b"yes");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn named_databases_are_isolated() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let left = bridge.db_open(txn, Some("left"), DbFlags::CREATE).unwrap();
    let right = bridge.db_open(txn, Some("right"), DbFlags::CREATE).unwrap();
    bridge.put(txn, left, b"k", b"L", WriteFlags::empty()).unwrap();
    bridge.put(txn, right, b"k", b"R", WriteFlags::empty()).unwrap();
    assert_eq!(get_copy(&bridge, txn, left, b"k").unwrap(), b"L");
    assert_eq!(get_copy(&bridge, txn, right, b"k").unwrap(), b"R");

    // Repeat opens come back from the cache as the same handle.
    let again = bridge.db_open(txn, Some("left"), DbFlags::empty()).unwrap();
    assert_eq!(again, left);
    bridge.txn_commit(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn dupsort_keeps_duplicates_sorted() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    bridge.put(txn, db, b"k", b"3", WriteFlags::empty()).unwrap();
    bridge.put(txn, db, b"k", b"1", WriteFlags::empty()).unwrap();
    bridge.put(txn, db, b"k", b"2", WriteFlags::empty()).unwrap();

    // A plain get returns the smallest duplicate.
    assert_eq!(get_copy(&bridge, txn, db, b"k").unwrap(), b"1");

    assert!(matches!(
        bridge.put(txn, db, b"k", b"2", WriteFlags::NODUPDATA),
        Err(Error::KeyExists { .. })
    ));

    // Deleting one duplicate leaves the others.
    assert!(bridge.del(txn, db, b"k", Some(b"1")).unwrap());
    assert_eq!(get_copy(&bridge, txn, db, b"k").unwrap(), b"2");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn drop_empties_and_delete_removes() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, Some("scratch"), DbFlags::CREATE).unwrap();
    bridge.put(txn, db, b"k", b"v", WriteFlags::empty()).unwrap();
    bridge.db_clear(txn, db).unwrap();
    assert!(get_copy(&bridge, txn, db, b"k").is_none());
    assert_eq!(bridge.db_stat(txn, db).unwrap().entry_count, 0);

    bridge.db_drop(txn, db, true).unwrap();
    bridge.txn_commit(txn).unwrap();

    // The deleted database is gone and its cached handle was retired.
    let txn = bridge.txn_begin(env, None, true).unwrap();
    assert!(matches!(
        bridge.db_open(txn, Some("scratch"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn aborted_delete_keeps_the_database() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, Some("kept"), DbFlags::CREATE).unwrap();
    bridge.put(txn, db, b"k", b"v", WriteFlags::empty()).unwrap();
    bridge.txn_commit(txn).unwrap();

    let txn = bridge.txn_begin(env, None, false).unwrap();
    bridge.db_drop(txn, db, true).unwrap();
    bridge.txn_abort(txn).unwrap();

    let txn = bridge.txn_begin(env, None, true).unwrap();
    assert_eq!(get_copy(&bridge, txn, db, b"k").unwrap(), b"v");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn comparisons_follow_database_ordering() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let plain = bridge.db_open(txn, Some("plain"), DbFlags::CREATE).unwrap();
    let rev = bridge
        .db_open(txn, Some("rev"), DbFlags::CREATE | DbFlags::REVERSEKEY)
        .unwrap();

    assert_eq!(bridge.compare_keys(txn, plain, b"ab", b"b").unwrap(), -1);
    // Reverse ordering compares from the last byte: "ab" ends in 'b',
    // "b" is its strict prefix from the end.
    assert_eq!(bridge.compare_keys(txn, rev, b"ab", b"b").unwrap(), 1);
    assert_eq!(bridge.compare_keys(txn, rev, b"x", b"x").unwrap(), 0);

    let revdup = bridge
        .db_open(txn, Some("revdup"), DbFlags::CREATE | DbFlags::DUPSORT | DbFlags::REVERSEDUP)
        .unwrap();
    assert_eq!(bridge.compare_values(txn, plain, b"1", b"2").unwrap(), -1);
    assert_eq!(bridge.compare_values(txn, revdup, b"ab", b"b").unwrap(), 1);
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn stat_reflects_entry_volume() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
    for i in 0..100u32 {
        let key = format!("key-{i:04}");
        bridge.put(txn, db, key.as_bytes(), b"payload", WriteFlags::empty()).unwrap();
    }
    let stat = bridge.db_stat(txn, db).unwrap();
    assert_eq!(stat.entry_count, 100);
    assert_eq!(stat.page_size, 4096);
    assert!(stat.tree_depth >= 1);
    assert!(stat.leaf_pages >= 1);
    bridge.txn_commit(txn).unwrap();
    bridge.env_close(env).unwrap();
}
