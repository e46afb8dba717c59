//! Cursors. A cursor owns no data; it remembers a position (stored key and
//! duplicate index) and re-derives each movement from the transaction's
//! current view, so it stays correct across writes made through the same
//! transaction. Running past either end is an ordinary `None`, not an error.

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::{codes, DbFlags, WriteFlags};
use crate::database::{check_key, resolve_db};
use crate::engine::{dup_ordering, key_decode, key_encode, Bytes, DbState, EngineStatus};
use crate::error::{Error, Result, UsageError};
use crate::handle::{CursorHandle, DbHandle, TxnHandle};
use crate::transaction::TxnState;
use crate::value::{Value, ValueMode, ValueRef};
use crate::Bridge;

/// Cursor positioning requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    Last,
    LastDup,
    Next,
    NextDup,
    NextNoDup,
    Prev,
    PrevDup,
    PrevNoDup,
    Set,
    SetKey,
    SetRange,
}

impl CursorOp {
    fn needs_position(self) -> bool {
        matches!(
            self,
            CursorOp::FirstDup
                | CursorOp::LastDup
                | CursorOp::GetCurrent
                | CursorOp::NextDup
                | CursorOp::PrevDup
        )
    }

    fn needs_key(self) -> bool {
        matches!(
            self,
            CursorOp::GetBoth | CursorOp::GetBothRange | CursorOp::Set | CursorOp::SetKey
                | CursorOp::SetRange
        )
    }
}

/// Saved position: the key in stored encoding plus a duplicate index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pos {
    key: Vec<u8>,
    dup: usize,
}

pub(crate) struct CursorInner {
    pub txn: TxnHandle,
    pub db: DbHandle,
    pub dbi: u32,
    pub pos: Option<Pos>,
}

pub(crate) struct CursorState {
    pub inner: Mutex<CursorInner>,
}

type Hit = (Pos, (Vec<u8>, Bytes));

fn hit(db: &DbState, stored: &[u8], dup: usize) -> Option<Hit> {
    let value = db.map.get(stored)?.get(dup)?;
    Some((
        Pos { key: stored.to_vec(), dup },
        (key_decode(db.flags, stored), value.clone()),
    ))
}

fn next_key(db: &DbState, after: &[u8], last_dup: bool) -> Option<Hit> {
    let (key, dups) = db
        .map
        .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
        .next()?;
    let dup = if last_dup { dups.len() - 1 } else { 0 };
    hit(db, key, dup)
}

fn prev_key(db: &DbState, before: &[u8], last_dup: bool) -> Option<Hit> {
    let (key, dups) = db
        .map
        .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(before)))
        .next_back()?;
    let dup = if last_dup { dups.len() - 1 } else { 0 };
    hit(db, key, dup)
}

/// Resolve one positioning request against the transaction's view.
/// Returns the new position and the pair found; a miss leaves the old
/// position in place.
fn seek(
    db: &DbState,
    pos: Option<Pos>,
    op: CursorOp,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
) -> (Option<Pos>, Option<(Vec<u8>, Bytes)>) {
    let flags = db.flags;
    let outcome: Option<Hit> = match op {
        CursorOp::First => db.map.iter().next().and_then(|(k, _)| hit(db, k, 0)),
        CursorOp::Last => db
            .map
            .iter()
            .next_back()
            .and_then(|(k, dups)| hit(db, k, dups.len() - 1)),
        CursorOp::FirstDup => pos.as_ref().and_then(|p| hit(db, &p.key, 0)),
        CursorOp::LastDup => pos.as_ref().and_then(|p| {
            let dups = db.map.get(&p.key)?;
            hit(db, &p.key, dups.len() - 1)
        }),
        CursorOp::GetCurrent => pos.as_ref().and_then(|p| hit(db, &p.key, p.dup)),
        CursorOp::Next => match &pos {
            None => db.map.iter().next().and_then(|(k, _)| hit(db, k, 0)),
            Some(p) => hit(db, &p.key, p.dup + 1).or_else(|| next_key(db, &p.key, false)),
        },
        CursorOp::NextDup => pos.as_ref().and_then(|p| hit(db, &p.key, p.dup + 1)),
        CursorOp::NextNoDup => match &pos {
            None => db.map.iter().next().and_then(|(k, _)| hit(db, k, 0)),
            Some(p) => next_key(db, &p.key, false),
        },
        CursorOp::Prev => match &pos {
            None => db
                .map
                .iter()
                .next_back()
                .and_then(|(k, dups)| hit(db, k, dups.len() - 1)),
            Some(p) if p.dup > 0 => hit(db, &p.key, p.dup - 1),
            Some(p) => prev_key(db, &p.key, true),
        },
        CursorOp::PrevDup => pos
            .as_ref()
            .and_then(|p| if p.dup > 0 { hit(db, &p.key, p.dup - 1) } else { None }),
        CursorOp::PrevNoDup => match &pos {
            None => db
                .map
                .iter()
                .next_back()
                .and_then(|(k, dups)| hit(db, k, dups.len() - 1)),
            Some(p) => prev_key(db, &p.key, true),
        },
        CursorOp::Set | CursorOp::SetKey => key
            .as_deref()
            .map(|k| key_encode(flags, k))
            .and_then(|stored| hit(db, &stored, 0)),
        CursorOp::SetRange => key.as_deref().map(|k| key_encode(flags, k)).and_then(|stored| {
            let (k, _) = db
                .map
                .range::<[u8], _>((Bound::Included(stored.as_slice()), Bound::Unbounded))
                .next()?;
            hit(db, k, 0)
        }),
        CursorOp::GetBoth => match (key.as_deref(), value.as_deref()) {
            (Some(k), Some(v)) => {
                let stored = key_encode(flags, k);
                let dups = db.map.get(&stored);
                dups.and_then(|dups| {
                    dups.binary_search_by(|d| dup_ordering(flags, d, v))
                        .ok()
                        .and_then(|dup| hit(db, &stored, dup))
                })
            }
            _ => None,
        },
        CursorOp::GetBothRange => match (key.as_deref(), value.as_deref()) {
            (Some(k), Some(v)) => {
                let stored = key_encode(flags, k);
                db.map.get(&stored).and_then(|dups| {
                    let dup = dups
                        .iter()
                        .position(|d| dup_ordering(flags, d, v) != std::cmp::Ordering::Less)?;
                    hit(db, &stored, dup)
                })
            }
            _ => None,
        },
    };
    match outcome {
        Some((new_pos, pair)) => (Some(new_pos), Some(pair)),
        None => (pos, None),
    }
}

impl Bridge {
    pub fn cursor_open(&self, txn: TxnHandle, db: DbHandle) -> Result<CursorHandle> {
        let state = self.inner.txn(txn)?;
        let dbi = resolve_db(&state, db)?;
        let cursor = Arc::new(CursorState {
            inner: Mutex::new(CursorInner { txn, db, dbi, pos: None }),
        });
        let handle = CursorHandle(self.inner.cursors.lock().insert(cursor));
        state.inner.lock().cursors.push(handle);
        Ok(handle)
    }

    pub fn cursor_close(&self, cursor: CursorHandle) -> Result<()> {
        let state = self.inner.cursors.lock().remove(cursor.0)?;
        let txn = state.inner.lock().txn;
        if let Ok(txn_state) = self.inner.txn(txn) {
            txn_state.inner.lock().cursors.retain(|&c| c != cursor);
        }
        Ok(())
    }

    /// Rebind a cursor to a fresh read-only transaction of the same
    /// environment, clearing its position.
    pub fn cursor_renew(&self, txn: TxnHandle, cursor: CursorHandle) -> Result<()> {
        let cursor_state = self.inner.cursor(cursor)?;
        let new_state = self.inner.txn(txn)?;
        if !new_state.read_only || new_state.parent.is_some() {
            return Err(Error::Usage(UsageError::CursorRenew));
        }
        let mut inner = cursor_state.inner.lock();
        let old_txn = inner.txn;
        if let Ok(old_state) = self.inner.txn(old_txn) {
            if !Arc::ptr_eq(&old_state.env, &new_state.env) {
                return Err(Error::Usage(UsageError::CursorRenew));
            }
            old_state.inner.lock().cursors.retain(|&c| c != cursor);
        }
        inner.txn = txn;
        inner.pos = None;
        new_state.inner.lock().cursors.push(cursor);
        Ok(())
    }

    /// Move the cursor and return the pair it lands on, or `None` when the
    /// request has nowhere to go.
    pub fn cursor_get(
        &self,
        cursor: CursorHandle,
        op: CursorOp,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        mode: ValueMode,
    ) -> Result<Option<(Vec<u8>, Value)>> {
        let cursor_state = self.inner.cursor(cursor)?;
        let (txn, dbi, pos) = {
            let inner = cursor_state.inner.lock();
            (inner.txn, inner.dbi, inner.pos.clone())
        };
        if op.needs_position() && pos.is_none() {
            return Err(Error::Usage(UsageError::CursorUnpositioned));
        }
        if op.needs_key() {
            match key {
                None => return Err(Error::from_code(codes::EINVAL)),
                Some(key) => check_key(key)?,
            }
        }
        let state = self.txn_of_cursor(txn)?;
        let key = key.map(<[u8]>::to_vec);
        let value = value.map(<[u8]>::to_vec);
        let (new_pos, pair) = state.exec(false, move |e| {
            let db = e.db_view(dbi)?;
            Ok(seek(db, pos, op, key, value))
        })?;
        cursor_state.inner.lock().pos = new_pos;
        Ok(pair.map(|(k, v)| {
            let value = match mode {
                ValueMode::Copy => Value::Owned(v.to_vec()),
                ValueMode::ZeroCopy => Value::View(ValueRef::new(v, state.clock.clone())),
            };
            (k, value)
        }))
    }

    /// Store through the cursor. With `CURRENT` the value at the cursor's
    /// position is replaced; the key, when given, must match the position.
    pub fn cursor_put(
        &self,
        cursor: CursorHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        check_key(key)?;
        let cursor_state = self.inner.cursor(cursor)?;
        let (txn, dbi, pos) = {
            let inner = cursor_state.inner.lock();
            (inner.txn, inner.dbi, inner.pos.clone())
        };
        let state = self.txn_of_cursor(txn)?;
        let value = value.to_vec();

        let new_pos = if flags.contains(WriteFlags::CURRENT) {
            let pos = match pos {
                Some(pos) => pos,
                None => return Err(Error::Usage(UsageError::CursorUnpositioned)),
            };
            let key = key.to_vec();
            let replaced = state.exec(true, move |e| {
                let db = e.db_view(dbi)?;
                let flags_db = db.flags;
                let user_key = key_decode(flags_db, &pos.key);
                if user_key != key {
                    return Err(EngineStatus(codes::EINVAL));
                }
                let dupsort = flags_db.contains(DbFlags::DUPSORT);
                let current = db
                    .map
                    .get(&pos.key)
                    .and_then(|dups| dups.get(pos.dup).cloned());
                let old = match current {
                    Some(old) => old,
                    None => return Err(EngineStatus(codes::NOTFOUND)),
                };
                if dupsort {
                    e.del(dbi, &user_key, Some(&old))?;
                }
                e.put(dbi, &user_key, &value, WriteFlags::empty())?;
                let db = e.db_view(dbi)?;
                let dup = db
                    .map
                    .get(&pos.key)
                    .map(|dups| {
                        dups.binary_search_by(|d| dup_ordering(flags_db, d, &value))
                            .unwrap_or(0)
                    })
                    .unwrap_or(0);
                Ok(Pos { key: pos.key, dup })
            });
            match replaced {
                Ok(new_pos) => Some(new_pos),
                Err(Error::Status { code, .. }) if code == codes::EINVAL => {
                    return Err(Error::Usage(UsageError::KeyMismatch));
                }
                Err(Error::NotFound) => {
                    return Err(Error::Usage(UsageError::CursorUnpositioned));
                }
                Err(err) => return Err(err),
            }
        } else {
            let key = key.to_vec();
            let outcome = state.exec(true, move |e| {
                let put = e.put(dbi, &key, &value, flags)?;
                let db = e.db_view(dbi)?;
                let flags_db = db.flags;
                let stored = key_encode(flags_db, &key);
                let dup = db
                    .map
                    .get(&stored)
                    .map(|dups| {
                        dups.binary_search_by(|d| dup_ordering(flags_db, d, &value))
                            .unwrap_or(0)
                    })
                    .unwrap_or(0);
                Ok((put, Pos { key: stored, dup }))
            })?;
            match outcome {
                (crate::engine::PutOutcome::Stored, new_pos) => Some(new_pos),
                (crate::engine::PutOutcome::Exists(current), _) => {
                    return Err(Error::KeyExists { current: current.to_vec() });
                }
            }
        };
        state.clock.bump();
        cursor_state.inner.lock().pos = new_pos;
        Ok(())
    }

    /// Delete the pair at the cursor's position. With `NODUPDATA` all
    /// duplicates of the key go at once.
    pub fn cursor_del(&self, cursor: CursorHandle, flags: WriteFlags) -> Result<()> {
        let cursor_state = self.inner.cursor(cursor)?;
        let (txn, dbi, pos) = {
            let inner = cursor_state.inner.lock();
            (inner.txn, inner.dbi, inner.pos.clone())
        };
        let pos = match pos {
            Some(pos) => pos,
            None => return Err(Error::Usage(UsageError::CursorUnpositioned)),
        };
        let state = self.txn_of_cursor(txn)?;
        state.exec(true, move |e| {
            let db = e.db_view(dbi)?;
            let flags_db = db.flags;
            let user_key = key_decode(flags_db, &pos.key);
            let all = flags.contains(WriteFlags::NODUPDATA)
                || !flags_db.contains(DbFlags::DUPSORT);
            let target = if all {
                None
            } else {
                db.map.get(&pos.key).and_then(|dups| dups.get(pos.dup).cloned())
            };
            // A vanished current pair makes this a no-op.
            e.del(dbi, &user_key, target.as_deref()).map(|_| ())
        })?;
        state.clock.bump();
        Ok(())
    }

    /// Number of duplicates at the cursor's key. DUPSORT databases only.
    pub fn cursor_count(&self, cursor: CursorHandle) -> Result<u64> {
        let cursor_state = self.inner.cursor(cursor)?;
        let (txn, dbi, pos) = {
            let inner = cursor_state.inner.lock();
            (inner.txn, inner.dbi, inner.pos.clone())
        };
        let pos = match pos {
            Some(pos) => pos,
            None => return Err(Error::Usage(UsageError::CursorUnpositioned)),
        };
        let state = self.txn_of_cursor(txn)?;
        state.exec(false, move |e| {
            let db = e.db_view(dbi)?;
            if !db.flags.contains(DbFlags::DUPSORT) {
                return Err(EngineStatus(codes::EINVAL));
            }
            Ok(db.map.get(&pos.key).map(|dups| dups.len() as u64).unwrap_or(0))
        })
    }

    pub fn cursor_txn(&self, cursor: CursorHandle) -> Result<TxnHandle> {
        Ok(self.inner.cursor(cursor)?.inner.lock().txn)
    }

    pub fn cursor_db(&self, cursor: CursorHandle) -> Result<DbHandle> {
        Ok(self.inner.cursor(cursor)?.inner.lock().db)
    }

    /// A cursor whose transaction has ended resolves to a closed cursor,
    /// not a stale transaction.
    fn txn_of_cursor(&self, txn: TxnHandle) -> Result<Arc<TxnState>> {
        self.inner
            .txn(txn)
            .map_err(|_| Error::Usage(UsageError::CursorClosed))
    }
}
