//! Database handles and the key/value data plane. Handle resolution is
//! memoized per environment: reopening a name returns the cached handle
//! without an engine call. Absent keys are ordinary results, never errors.

use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use crate::constants::{DbFlags, WriteFlags, MAX_KEY_SIZE};
use crate::engine::{dup_ordering, key_encode, PutOutcome, Stat};
use crate::error::{Error, Result, UsageError};
use crate::handle::{DbHandle, EnvHandle, TxnHandle};
use crate::transaction::TxnState;
use crate::value::{Value, ValueMode, ValueRef};
use crate::Bridge;

pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::Usage(UsageError::KeyRejected { len: key.len(), max: MAX_KEY_SIZE }));
    }
    Ok(())
}

pub(crate) fn resolve_db(state: &Arc<TxnState>, db: DbHandle) -> Result<u32> {
    let registry = state.env.dbs.lock();
    Ok(registry.table.get(db.0)?.dbi)
}

fn ordering_to_i32(ord: Ordering) -> i32 {
    match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

impl Bridge {
    /// Resolve a database by name within the transaction, creating it when
    /// `CREATE` is set. A name already resolved for this environment comes
    /// back from the handle cache.
    pub fn db_open(&self, txn: TxnHandle, name: Option<&str>, flags: DbFlags) -> Result<DbHandle> {
        let state = self.inner.txn(txn)?;
        let key = name.map(str::to_string);
        if let Some(&handle) = state.env.dbs.lock().by_name.get(&key) {
            return Ok(handle);
        }
        let open_name = key.clone();
        let dbi = state.exec(false, move |e| e.dbi_open(open_name.as_deref(), flags))?;
        let mut registry = state.env.dbs.lock();
        // Another caller may have raced us here.
        if let Some(&handle) = registry.by_name.get(&key) {
            return Ok(handle);
        }
        let handle =
            DbHandle(registry.table.insert(crate::env::DbSlot { dbi, name: key.clone() }));
        registry.by_name.insert(key, handle);
        Ok(handle)
    }

    pub fn db_stat(&self, txn: TxnHandle, db: DbHandle) -> Result<Stat> {
        let state = self.inner.txn(txn)?;
        let dbi = resolve_db(&state, db)?;
        state.exec(false, move |e| e.db_stat(dbi))
    }

    pub fn db_flags(&self, txn: TxnHandle, db: DbHandle) -> Result<DbFlags> {
        let state = self.inner.txn(txn)?;
        let dbi = resolve_db(&state, db)?;
        state.exec(false, move |e| e.db_flags(dbi))
    }

    /// Drop a cached database handle. Refused while the environment has
    /// live transactions, since any of them may still address the handle.
    pub fn db_close(&self, env: EnvHandle, db: DbHandle) -> Result<()> {
        let environment = self.inner.env(env)?;
        let live = environment.live_txns.load(AtomicOrdering::Acquire);
        if live > 0 {
            return Err(Error::Usage(UsageError::EnvBusy { live_txns: live }));
        }
        let mut registry = environment.dbs.lock();
        let slot = registry.table.remove(db.0)?;
        registry.by_name.remove(&slot.name);
        Ok(())
    }

    /// Empty a database, or with `delete` remove it from the environment.
    /// The handle cache entry of a deleted database is retired when the
    /// root transaction commits; an abort leaves it untouched.
    pub fn db_drop(&self, txn: TxnHandle, db: DbHandle, delete: bool) -> Result<()> {
        let state = self.inner.txn(txn)?;
        let dbi = resolve_db(&state, db)?;
        state.exec(true, move |e| e.drop_db(dbi, delete))?;
        state.clock.bump();
        if delete {
            state.inner.lock().pending_db_deletes.push(db);
        }
        Ok(())
    }

    /// Remove every entry of the database, keeping the handle usable.
    pub fn db_clear(&self, txn: TxnHandle, db: DbHandle) -> Result<()> {
        self.db_drop(txn, db, false)
    }

    /// Fetch the value under `key`, or the first duplicate for DUPSORT
    /// databases. `ValueMode` picks between an owned copy and a zero-copy
    /// view pinned to this transaction.
    pub fn get(
        &self,
        txn: TxnHandle,
        db: DbHandle,
        key: &[u8],
        mode: ValueMode,
    ) -> Result<Option<Value>> {
        check_key(key)?;
        let state = self.inner.txn(txn)?;
        let dbi = resolve_db(&state, db)?;
        let key = key.to_vec();
        let found = state.exec(false, move |e| e.get(dbi, &key))?;
        Ok(found.map(|bytes| match mode {
            ValueMode::Copy => Value::Owned(bytes.to_vec()),
            ValueMode::ZeroCopy => Value::View(ValueRef::new(bytes, state.clock.clone())),
        }))
    }

    /// Store a key/value pair. `NOOVERWRITE` and `NODUPDATA` refuse an
    /// existing pair with `KeyExists`, carrying the value already stored.
    pub fn put(
        &self,
        txn: TxnHandle,
        db: DbHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        check_key(key)?;
        let state = self.inner.txn(txn)?;
        let dbi = resolve_db(&state, db)?;
        let key = key.to_vec();
        let value = value.to_vec();
        let outcome = state.exec(true, move |e| e.put(dbi, &key, &value, flags))?;
        state.clock.bump();
        match outcome {
            PutOutcome::Stored => Ok(()),
            PutOutcome::Exists(current) => {
                Err(Error::KeyExists { current: current.to_vec() })
            }
        }
    }

    /// Delete a key, or a single duplicate when `value` is given. Returns
    /// whether anything was removed; an absent pair is not an error.
    pub fn del(
        &self,
        txn: TxnHandle,
        db: DbHandle,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        check_key(key)?;
        let state = self.inner.txn(txn)?;
        let dbi = resolve_db(&state, db)?;
        let key = key.to_vec();
        let value = value.map(<[u8]>::to_vec);
        let removed = state.exec(true, move |e| e.del(dbi, &key, value.as_deref()))?;
        state.clock.bump();
        Ok(removed)
    }

    /// Compare two keys the way the database orders them.
    pub fn compare_keys(&self, txn: TxnHandle, db: DbHandle, a: &[u8], b: &[u8]) -> Result<i32> {
        let flags = self.db_flags(txn, db)?;
        let ea = key_encode(flags, a);
        let eb = key_encode(flags, b);
        Ok(ordering_to_i32(ea.cmp(&eb)))
    }

    /// Compare two values the way the database orders duplicates.
    pub fn compare_values(&self, txn: TxnHandle, db: DbHandle, a: &[u8], b: &[u8]) -> Result<i32> {
        let flags = self.db_flags(txn, db)?;
        Ok(ordering_to_i32(dup_ordering(flags, a, b)))
    }
}
