//! Handle-based boundary layer over an embedded, memory-mapped,
//! transactional key-value store.
//!
//! A [`Bridge`] owns every environment, transaction and cursor behind
//! opaque generational handles, so a managed host can drive the store
//! without holding raw pointers. Handles that outlive their object fail
//! with a usage error instead of touching freed state.
//!
//! ```no_run
//! use keybridge::{Bridge, DbFlags, EnvFlags, ValueMode, WriteFlags};
//!
//! # fn main() -> keybridge::Result<()> {
//! let bridge = Bridge::new();
//! let env = bridge.env_create();
//! bridge.env_open(env, std::path::Path::new("/tmp/store"), EnvFlags::empty(), 0o644)?;
//!
//! let txn = bridge.txn_begin(env, None, false)?;
//! let db = bridge.db_open(txn, None, DbFlags::empty())?;
//! bridge.put(txn, db, b"greeting", b"hello", WriteFlags::empty())?;
//! bridge.txn_commit(txn)?;
//!
//! let txn = bridge.txn_begin(env, None, true)?;
//! let found = bridge.get(txn, db, b"greeting", ValueMode::Copy)?;
//! assert!(found.is_some());
//! bridge.txn_abort(txn)?;
//! bridge.env_close(env)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

pub mod constants;
mod cursor;
mod database;
mod dispatch;
mod engine;
mod env;
mod error;
mod handle;
mod transaction;
mod value;

pub use constants::{CopyFlags, DbFlags, EnvFlags, WriteFlags};
pub use cursor::CursorOp;
pub use engine::{EnvInfo, Stat};
pub use error::{strerror, Error, Result, UsageError};
pub use handle::{CursorHandle, DbHandle, EnvHandle, TxnHandle};
pub use value::{Value, ValueMode, ValueRef};

use cursor::CursorState;
use env::Environment;
use handle::HandleTable;
use transaction::TxnState;

pub(crate) struct BridgeInner {
    pub envs: Mutex<HandleTable<Arc<Environment>>>,
    pub txns: Mutex<HandleTable<Arc<TxnState>>>,
    pub cursors: Mutex<HandleTable<Arc<CursorState>>>,
}

impl BridgeInner {
    pub fn env(&self, handle: EnvHandle) -> Result<Arc<Environment>> {
        Ok(self.envs.lock().get(handle.0)?.clone())
    }

    pub fn txn(&self, handle: TxnHandle) -> Result<Arc<TxnState>> {
        Ok(self.txns.lock().get(handle.0)?.clone())
    }

    pub fn cursor(&self, handle: CursorHandle) -> Result<Arc<CursorState>> {
        Ok(self.cursors.lock().get(handle.0)?.clone())
    }
}

/// The boundary itself: one instance serves any number of environments.
/// Cloning shares the underlying handle tables.
#[derive(Clone)]
pub struct Bridge {
    pub(crate) inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new() -> Bridge {
        Bridge {
            inner: Arc::new(BridgeInner {
                envs: Mutex::new(HandleTable::new()),
                txns: Mutex::new(HandleTable::new()),
                cursors: Mutex::new(HandleTable::new()),
            }),
        }
    }
}

impl Default for Bridge {
    fn default() -> Bridge {
        Bridge::new()
    }
}

/// Library version, numeric parts plus the rendered form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub string: String,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.string)
    }
}

pub fn version() -> Version {
    let (major, minor, patch) =
        (constants::VERSION_MAJOR, constants::VERSION_MINOR, constants::VERSION_PATCH);
    Version { major, minor, patch, string: format!("{major}.{minor}.{patch}") }
}
