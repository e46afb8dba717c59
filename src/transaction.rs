//! Transaction lifecycle. Read transactions run on the caller's thread
//! against a private snapshot. Write transactions are serialized by the
//! environment's gate, which is acquired on the caller's thread so a second
//! writer blocks there, and every operation of a write transaction is
//! executed on the environment's writer thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::constants::codes;
use crate::engine::{EngineResult, EngineTxn};
use crate::env::Environment;
use crate::error::{Error, Result, UsageError};
use crate::handle::{CursorHandle, DbHandle, EnvHandle, TxnHandle};
use crate::value::MutationClock;
use crate::Bridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnStage {
    Active,
    Reset,
}

pub(crate) struct TxnInner {
    pub stage: TxnStage,
    /// The engine transaction. For a nested transaction the root's engine
    /// transaction migrates here while this level is the innermost one;
    /// `None` on a level whose child currently holds it.
    pub engine: Option<EngineTxn>,
    pub id: u64,
    pub child: Option<TxnHandle>,
    pub cursors: Vec<CursorHandle>,
    /// Database handles whose cache entries are dropped once the root
    /// transaction commits. Discarded on abort.
    pub pending_db_deletes: Vec<DbHandle>,
}

pub(crate) struct TxnState {
    pub env_handle: EnvHandle,
    pub env: Arc<Environment>,
    pub read_only: bool,
    pub parent: Option<TxnHandle>,
    pub clock: Arc<MutationClock>,
    pub inner: Mutex<TxnInner>,
}

impl TxnState {
    /// Run one engine operation under this transaction's rules: reset and
    /// suspended levels are refused, mutation requires a write transaction,
    /// and write-transaction work is routed to the writer thread.
    pub(crate) fn exec<R, F>(self: &Arc<Self>, mutating: bool, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineTxn) -> EngineResult<R> + Send + 'static,
    {
        if mutating && self.read_only {
            return Err(Error::Usage(UsageError::ReadOnlyTxn));
        }
        {
            let inner = self.inner.lock();
            if inner.stage == TxnStage::Reset {
                return Err(Error::Usage(UsageError::TxnReset));
            }
            if inner.child.is_some() || inner.engine.is_none() {
                return Err(Error::Usage(UsageError::TxnHasChild));
            }
        }
        if self.read_only {
            let mut inner = self.inner.lock();
            match inner.engine.as_mut() {
                Some(engine) => f(engine).map_err(|s| Error::from_code(s.0)),
                None => Err(Error::Usage(UsageError::TxnReset)),
            }
        } else {
            let state = self.clone();
            self.env.run_write(move || {
                let mut inner = state.inner.lock();
                match inner.engine.as_mut() {
                    Some(engine) => f(engine).map_err(|s| Error::from_code(s.0)),
                    None => Err(Error::Usage(UsageError::TxnHasChild)),
                }
            })?
        }
    }
}

#[derive(Clone, Copy)]
enum EndMode {
    Commit,
    Abort,
}

impl Bridge {
    /// Begin a transaction. A write transaction with no parent blocks here
    /// until it is the environment's only writer.
    pub fn txn_begin(
        &self,
        env: EnvHandle,
        parent: Option<TxnHandle>,
        read_only: bool,
    ) -> Result<TxnHandle> {
        match parent {
            None => self.begin_root(env, read_only),
            Some(parent) => self.begin_nested(env, parent, read_only),
        }
    }

    fn begin_root(&self, env: EnvHandle, read_only: bool) -> Result<TxnHandle> {
        let environment = self.inner.env(env)?;
        let engine = environment.engine()?;
        let engine_txn = if read_only {
            engine.begin_read().map_err(|s| Error::from_code(s.0))?
        } else {
            environment.gate.acquire();
            let outcome = environment.run_write(move || engine.begin_write());
            match outcome {
                Ok(Ok(txn)) => txn,
                Ok(Err(status)) => {
                    environment.gate.release();
                    return Err(Error::from_code(status.0));
                }
                Err(err) => {
                    environment.gate.release();
                    return Err(err);
                }
            }
        };
        let id = engine_txn.id;
        let state = Arc::new(TxnState {
            env_handle: env,
            env: environment.clone(),
            read_only,
            parent: None,
            clock: Arc::new(MutationClock::new()),
            inner: Mutex::new(TxnInner {
                stage: TxnStage::Active,
                engine: Some(engine_txn),
                id,
                child: None,
                cursors: Vec::new(),
                pending_db_deletes: Vec::new(),
            }),
        });
        environment.live_txns.fetch_add(1, Ordering::AcqRel);
        let handle = TxnHandle(self.inner.txns.lock().insert(state));
        trace!("began {} txn {id}", if read_only { "read" } else { "write" });
        Ok(handle)
    }

    fn begin_nested(&self, env: EnvHandle, parent: TxnHandle, read_only: bool) -> Result<TxnHandle> {
        let parent_state = self.inner.txn(parent)?;
        if parent_state.read_only {
            return Err(Error::Usage(UsageError::NestedUnderReadOnly));
        }
        if read_only || parent_state.env_handle != env {
            return Err(Error::from_code(codes::EINVAL));
        }
        // Taking the engine txn suspends the parent; the lock is dropped
        // before dispatching so a concurrent parent operation queued on the
        // writer thread cannot deadlock against it.
        let engine_txn = {
            let mut parent_inner = parent_state.inner.lock();
            if parent_inner.stage == TxnStage::Reset {
                return Err(Error::Usage(UsageError::TxnReset));
            }
            if parent_inner.child.is_some() {
                return Err(Error::Usage(UsageError::TxnHasChild));
            }
            match parent_inner.engine.take() {
                Some(txn) => txn,
                None => return Err(Error::Usage(UsageError::TxnHasChild)),
            }
        };
        // Open the nesting level on the writer thread; the engine txn moves
        // there and back.
        let pushed = parent_state.env.run_write(move || {
            let mut txn = engine_txn;
            let outcome = txn.push_frame();
            (outcome, txn)
        });
        let engine_txn = match pushed {
            Ok((Ok(()), txn)) => txn,
            Ok((Err(status), txn)) => {
                parent_state.inner.lock().engine = Some(txn);
                return Err(Error::from_code(status.0));
            }
            Err(err) => return Err(err),
        };
        let id = engine_txn.id;
        let environment = parent_state.env.clone();
        let state = Arc::new(TxnState {
            env_handle: env,
            env: environment.clone(),
            read_only: false,
            parent: Some(parent),
            clock: Arc::new(MutationClock::new()),
            inner: Mutex::new(TxnInner {
                stage: TxnStage::Active,
                engine: Some(engine_txn),
                id,
                child: None,
                cursors: Vec::new(),
                pending_db_deletes: Vec::new(),
            }),
        });
        environment.live_txns.fetch_add(1, Ordering::AcqRel);
        let handle = TxnHandle(self.inner.txns.lock().insert(state));
        parent_state.inner.lock().child = Some(handle);
        trace!("began nested txn under {id}");
        Ok(handle)
    }

    /// Commit the transaction and retire its handle. A failed commit still
    /// retires the handle; the transaction's effects are discarded.
    pub fn txn_commit(&self, txn: TxnHandle) -> Result<()> {
        self.end_txn(txn, EndMode::Commit)
    }

    /// Abort the transaction and retire its handle.
    pub fn txn_abort(&self, txn: TxnHandle) -> Result<()> {
        self.end_txn(txn, EndMode::Abort)
    }

    fn end_txn(&self, txn: TxnHandle, mode: EndMode) -> Result<()> {
        let state = {
            let mut txns = self.inner.txns.lock();
            if txns.get(txn.0)?.inner.lock().child.is_some() {
                return Err(Error::Usage(UsageError::TxnHasChild));
            }
            txns.remove(txn.0)?
        };
        let (engine_txn, cursors, pending) = {
            let mut inner = state.inner.lock();
            (
                inner.engine.take(),
                std::mem::take(&mut inner.cursors),
                std::mem::take(&mut inner.pending_db_deletes),
            )
        };
        {
            let mut table = self.inner.cursors.lock();
            for cursor in cursors {
                let _ = table.remove(cursor.0);
            }
        }
        state.clock.bump();
        state.env.live_txns.fetch_sub(1, Ordering::AcqRel);

        let outcome = match (&state.parent, state.read_only) {
            // Root read: dropping the engine txn frees the reader slot.
            (None, true) => {
                drop(engine_txn);
                Ok(())
            }
            (None, false) => self.end_root_write(&state, engine_txn, mode, pending),
            (Some(parent), _) => self.end_nested(&state, *parent, engine_txn, mode, pending),
        };
        trace!("txn ended: {outcome:?}");
        outcome
    }

    fn end_root_write(
        &self,
        state: &Arc<TxnState>,
        engine_txn: Option<EngineTxn>,
        mode: EndMode,
        pending: Vec<DbHandle>,
    ) -> Result<()> {
        let outcome = match (engine_txn, mode) {
            (Some(engine_txn), EndMode::Commit) => match state.env.engine() {
                Ok(engine) => {
                    let committed = state.env.run_write(move || {
                        engine.commit(engine_txn).map_err(|s| Error::from_code(s.0))
                    });
                    match committed {
                        Ok(result) => result,
                        Err(err) => Err(err),
                    }
                }
                Err(err) => Err(err),
            },
            (engine_txn, EndMode::Abort) => {
                drop(engine_txn);
                Ok(())
            }
            (None, EndMode::Commit) => Ok(()),
        };
        state.env.gate.release();
        if outcome.is_ok() {
            if let EndMode::Commit = mode {
                let mut registry = state.env.dbs.lock();
                for handle in pending {
                    if let Ok(slot) = registry.table.remove(handle.0) {
                        registry.by_name.remove(&slot.name);
                    }
                }
            }
        }
        outcome
    }

    fn end_nested(
        &self,
        state: &Arc<TxnState>,
        parent: TxnHandle,
        engine_txn: Option<EngineTxn>,
        mode: EndMode,
        pending: Vec<DbHandle>,
    ) -> Result<()> {
        let parent_state = self.inner.txn(parent)?;
        let (outcome, engine_txn) = match (engine_txn, mode) {
            (Some(engine_txn), EndMode::Commit) => {
                let merged = state.env.run_write(move || {
                    let mut txn = engine_txn;
                    let outcome = txn.commit_frame();
                    (outcome, txn)
                })?;
                (merged.0.map_err(|s| Error::from_code(s.0)), Some(merged.1))
            }
            (Some(engine_txn), EndMode::Abort) => {
                let popped = state.env.run_write(move || {
                    let mut txn = engine_txn;
                    let outcome = txn.abort_frame();
                    (outcome, txn)
                })?;
                (popped.0.map_err(|s| Error::from_code(s.0)), Some(popped.1))
            }
            (None, _) => (Ok(()), None),
        };
        let mut parent_inner = parent_state.inner.lock();
        parent_inner.child = None;
        parent_inner.engine = engine_txn;
        if outcome.is_ok() {
            if let EndMode::Commit = mode {
                parent_inner.pending_db_deletes.extend(pending);
                // The parent's view of the data changed under it.
                parent_state.clock.bump();
            }
        }
        outcome
    }

    /// Release a root read-only transaction's snapshot while keeping the
    /// handle for a later renew.
    pub fn txn_reset(&self, txn: TxnHandle) -> Result<()> {
        let state = self.inner.txn(txn)?;
        if !state.read_only || state.parent.is_some() {
            return Err(Error::Usage(UsageError::ResetNotAllowed));
        }
        let mut inner = state.inner.lock();
        if inner.stage == TxnStage::Reset {
            return Err(Error::Usage(UsageError::TxnReset));
        }
        inner.stage = TxnStage::Reset;
        // The reader slot is free for others until the renew.
        if let Some(engine) = inner.engine.as_mut() {
            engine.release_reader();
        }
        state.clock.bump();
        Ok(())
    }

    /// Bind a reset transaction to the latest committed snapshot.
    pub fn txn_renew(&self, txn: TxnHandle) -> Result<()> {
        let state = self.inner.txn(txn)?;
        if !state.read_only || state.parent.is_some() {
            return Err(Error::Usage(UsageError::ResetNotAllowed));
        }
        let mut inner = state.inner.lock();
        if inner.stage != TxnStage::Reset {
            return Err(Error::Usage(UsageError::RenewWithoutReset));
        }
        let engine = state.env.engine()?;
        match inner.engine.as_mut() {
            Some(engine_txn) => {
                engine.renew_read(engine_txn).map_err(|s| Error::from_code(s.0))?;
                inner.id = engine_txn.id;
            }
            None => return Err(Error::Usage(UsageError::TxnReset)),
        }
        inner.stage = TxnStage::Active;
        Ok(())
    }

    /// Snapshot identifier: the committed generation a read transaction
    /// observes, or the generation a write transaction will produce.
    pub fn txn_id(&self, txn: TxnHandle) -> Result<u64> {
        Ok(self.inner.txn(txn)?.inner.lock().id)
    }

    pub fn txn_env(&self, txn: TxnHandle) -> Result<EnvHandle> {
        Ok(self.inner.txn(txn)?.env_handle)
    }
}
