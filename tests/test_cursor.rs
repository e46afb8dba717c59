use keybridge::{
    Bridge, CursorOp, DbFlags, DbHandle, EnvFlags, EnvHandle, Error, TxnHandle, UsageError,
    ValueMode, WriteFlags,
};
use tempfile::TempDir;

fn setup() -> (TempDir, Bridge, EnvHandle) {
    let dir = TempDir::new().unwrap();
    let bridge = Bridge::new();
    let env = bridge.env_create();
    bridge.env_open(env, dir.path(), EnvFlags::empty(), 0o644).unwrap();
    (dir, bridge, env)
}

fn seeded(bridge: &Bridge, env: EnvHandle, pairs: &[(&[u8], &[u8])]) -> (TxnHandle, DbHandle) {
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, None, DbFlags::empty()).unwrap();
    for (k, v) in pairs {
        bridge.put(txn, db, k, v, WriteFlags::empty()).unwrap();
    }
    (txn, db)
}

fn step(
    bridge: &Bridge,
    cursor: keybridge::CursorHandle,
    op: CursorOp,
) -> Option<(Vec<u8>, Vec<u8>)> {
    bridge
        .cursor_get(cursor, op, None, None, ValueMode::Copy)
        .unwrap()
        .map(|(k, v)| (k, v.detach().unwrap()))
}

#[test]
fn full_scan_visits_keys_in_order() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"c", b"3"), (b"a", b"1"), (b"b", b"2")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();

    assert_eq!(step(&bridge, cursor, CursorOp::First).unwrap().0, b"a");
    assert_eq!(step(&bridge, cursor, CursorOp::Next).unwrap().0, b"b");
    assert_eq!(step(&bridge, cursor, CursorOp::Next).unwrap().0, b"c");
    // Past the end is an ordinary miss.
    assert!(step(&bridge, cursor, CursorOp::Next).is_none());
    // A miss does not move the cursor.
    assert_eq!(step(&bridge, cursor, CursorOp::GetCurrent).unwrap().0, b"c");

    assert_eq!(step(&bridge, cursor, CursorOp::Prev).unwrap().0, b"b");
    assert_eq!(step(&bridge, cursor, CursorOp::Last).unwrap().0, b"c");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn set_and_range_positioning() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1"), (b"c", b"3")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();

    let hit = bridge
        .cursor_get(cursor, CursorOp::Set, Some(b"c"), None, ValueMode::Copy)
        .unwrap();
    assert_eq!(hit.unwrap().1.detach().unwrap(), b"3");

    let miss = bridge
        .cursor_get(cursor, CursorOp::Set, Some(b"b"), None, ValueMode::Copy)
        .unwrap();
    assert!(miss.is_none());

    let ranged = bridge
        .cursor_get(cursor, CursorOp::SetRange, Some(b"b"), None, ValueMode::Copy)
        .unwrap();
    assert_eq!(ranged.unwrap().0, b"c");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn seek_keys_are_validated() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();

    let oversized = vec![0u8; 512];
    assert!(matches!(
        bridge.cursor_get(cursor, CursorOp::SetRange, Some(&oversized), None, ValueMode::Copy),
        Err(Error::Usage(UsageError::KeyRejected { len: 512, max: 511 }))
    ));
    assert!(matches!(
        bridge.cursor_get(cursor, CursorOp::Set, Some(b""), None, ValueMode::Copy),
        Err(Error::Usage(UsageError::KeyRejected { len: 0, .. }))
    ));
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn get_current_requires_a_position() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();
    assert!(matches!(
        bridge.cursor_get(cursor, CursorOp::GetCurrent, None, None, ValueMode::Copy),
        Err(Error::Usage(UsageError::CursorUnpositioned))
    ));
    assert!(matches!(
        bridge.cursor_del(cursor, WriteFlags::empty()),
        Err(Error::Usage(UsageError::CursorUnpositioned))
    ));
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn cursor_put_and_replace_in_place() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[]);
    let cursor = bridge.cursor_open(txn, db).unwrap();

    bridge.cursor_put(cursor, b"k", b"v1", WriteFlags::empty()).unwrap();
    let (key, value) = step(&bridge, cursor, CursorOp::GetCurrent).unwrap();
    assert_eq!((key.as_slice(), value.as_slice()), (&b"k"[..], &b"v1"[..]));

    bridge.cursor_put(cursor, b"k", b"v2", WriteFlags::CURRENT).unwrap();
    assert_eq!(step(&bridge, cursor, CursorOp::GetCurrent).unwrap().1, b"v2");

    assert!(matches!(
        bridge.cursor_put(cursor, b"other", b"v3", WriteFlags::CURRENT),
        Err(Error::Usage(UsageError::KeyMismatch))
    ));
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn delete_leaves_the_cursor_usable() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();

    bridge
        .cursor_get(cursor, CursorOp::Set, Some(b"b"), None, ValueMode::Copy)
        .unwrap();
    bridge.cursor_del(cursor, WriteFlags::empty()).unwrap();

    // The deleted pair is gone but navigation continues from the hole.
    assert!(step(&bridge, cursor, CursorOp::GetCurrent).is_none());
    assert_eq!(step(&bridge, cursor, CursorOp::Next).unwrap().0, b"c");
    assert_eq!(step(&bridge, cursor, CursorOp::Prev).unwrap().0, b"a");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn duplicate_navigation_and_count() {
    let (_dir, bridge, env) = setup();
    let txn = bridge.txn_begin(env, None, false).unwrap();
    let db = bridge.db_open(txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    for v in [&b"v2"[..], b"v1", b"v3"] {
        bridge.put(txn, db, b"k", v, WriteFlags::empty()).unwrap();
    }
    bridge.put(txn, db, b"z", b"last", WriteFlags::empty()).unwrap();
    let cursor = bridge.cursor_open(txn, db).unwrap();

    assert_eq!(step(&bridge, cursor, CursorOp::First).unwrap().1, b"v1");
    assert_eq!(bridge.cursor_count(cursor).unwrap(), 3);
    assert_eq!(step(&bridge, cursor, CursorOp::NextDup).unwrap().1, b"v2");
    assert_eq!(step(&bridge, cursor, CursorOp::LastDup).unwrap().1, b"v3");
    assert!(step(&bridge, cursor, CursorOp::NextDup).is_none());
    assert_eq!(step(&bridge, cursor, CursorOp::NextNoDup).unwrap().0, b"z");
    assert_eq!(step(&bridge, cursor, CursorOp::PrevNoDup).unwrap().1, b"v3");
    assert_eq!(step(&bridge, cursor, CursorOp::FirstDup).unwrap().1, b"v1");

    let exact = bridge
        .cursor_get(cursor, CursorOp::GetBoth, Some(b"k"), Some(b"v2"), ValueMode::Copy)
        .unwrap();
    assert_eq!(exact.unwrap().1.detach().unwrap(), b"v2");
    let nearest = bridge
        .cursor_get(cursor, CursorOp::GetBothRange, Some(b"k"), Some(b"v15"), ValueMode::Copy)
        .unwrap();
    assert_eq!(nearest.unwrap().1.detach().unwrap(), b"v2");

    // NODUPDATA removes every duplicate of the key at once.
    bridge.cursor_del(cursor, WriteFlags::NODUPDATA).unwrap();
    assert_eq!(step(&bridge, cursor, CursorOp::First).unwrap().0, b"z");
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn count_needs_a_dupsort_database() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();
    bridge
        .cursor_get(cursor, CursorOp::First, None, None, ValueMode::Copy)
        .unwrap();
    assert_eq!(bridge.cursor_count(cursor).unwrap_err().code(), 22);
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn ending_the_txn_retires_its_cursors() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();
    bridge.txn_commit(txn).unwrap();
    assert!(matches!(
        bridge.cursor_get(cursor, CursorOp::First, None, None, ValueMode::Copy),
        Err(Error::Usage(UsageError::StaleHandle))
    ));
    bridge.env_close(env).unwrap();
}

#[test]
fn closed_cursors_are_stale() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1")]);
    let cursor = bridge.cursor_open(txn, db).unwrap();
    bridge.cursor_close(cursor).unwrap();
    assert!(matches!(
        bridge.cursor_close(cursor),
        Err(Error::Usage(UsageError::StaleHandle))
    ));
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn renew_rebinds_to_a_new_reader() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[(b"a", b"1")]);
    bridge.txn_commit(txn).unwrap();

    let r1 = bridge.txn_begin(env, None, true).unwrap();
    let cursor = bridge.cursor_open(r1, db).unwrap();
    assert_eq!(step(&bridge, cursor, CursorOp::First).unwrap().0, b"a");

    let r2 = bridge.txn_begin(env, None, true).unwrap();
    bridge.cursor_renew(r2, cursor).unwrap();
    bridge.txn_abort(r1).unwrap();

    // Rebinding cleared the position and the cursor follows the new txn.
    assert!(matches!(
        bridge.cursor_get(cursor, CursorOp::GetCurrent, None, None, ValueMode::Copy),
        Err(Error::Usage(UsageError::CursorUnpositioned))
    ));
    assert_eq!(step(&bridge, cursor, CursorOp::First).unwrap().0, b"a");

    let w = bridge.txn_begin(env, None, false).unwrap();
    assert!(matches!(
        bridge.cursor_renew(w, cursor),
        Err(Error::Usage(UsageError::CursorRenew))
    ));
    bridge.txn_abort(w).unwrap();
    bridge.txn_abort(r2).unwrap();
    bridge.env_close(env).unwrap();
}

#[test]
fn cursor_resolves_its_owners() {
    let (_dir, bridge, env) = setup();
    let (txn, db) = seeded(&bridge, env, &[]);
    let cursor = bridge.cursor_open(txn, db).unwrap();
    assert_eq!(bridge.cursor_txn(cursor).unwrap(), txn);
    assert_eq!(bridge.cursor_db(cursor).unwrap(), db);
    bridge.txn_abort(txn).unwrap();
    bridge.env_close(env).unwrap();
}
