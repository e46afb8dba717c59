use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result, UsageError};

/// How a read should hand the stored bytes back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMode {
    /// Copy the bytes out. The result is owned and lives independently of
    /// the transaction.
    Copy,
    /// Borrow the engine's bytes. The view is only valid until the next
    /// mutation through the same transaction, or until the transaction ends.
    ZeroCopy,
}

/// Per-transaction mutation counter. Every put, delete, drop, commit and
/// abort through the transaction bumps it, invalidating outstanding views.
#[derive(Debug, Default)]
pub struct MutationClock(AtomicU64);

impl MutationClock {
    pub fn new() -> MutationClock {
        MutationClock(AtomicU64::new(0))
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// A value returned by a read operation.
#[derive(Debug, Clone)]
pub enum Value {
    Owned(Vec<u8>),
    View(ValueRef),
}

impl Value {
    /// The stored bytes. Fails with `ViewExpired` if this is a view whose
    /// window has closed.
    pub fn bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Owned(v) => Ok(v),
            Value::View(r) => r.bytes(),
        }
    }

    /// Take the bytes out as an owned vector, copying if this is a view.
    /// A view must still be inside its validity window to be detached.
    pub fn detach(self) -> Result<Vec<u8>> {
        match self {
            Value::Owned(v) => Ok(v),
            Value::View(r) => r.bytes().map(<[u8]>::to_vec),
        }
    }

    pub fn len(&self) -> Result<usize> {
        self.bytes().map(<[u8]>::len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.bytes().map(<[u8]>::is_empty)
    }
}

/// Zero-copy view of a stored value, pinned to the mutation clock of the
/// transaction that produced it.
#[derive(Debug, Clone)]
pub struct ValueRef {
    data: Arc<[u8]>,
    clock: Arc<MutationClock>,
    epoch: u64,
}

impl ValueRef {
    pub(crate) fn new(data: Arc<[u8]>, clock: Arc<MutationClock>) -> ValueRef {
        let epoch = clock.now();
        ValueRef { data, clock, epoch }
    }

    /// Whether the view is still inside its validity window.
    pub fn is_valid(&self) -> bool {
        self.clock.now() == self.epoch
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        if self.is_valid() {
            Ok(&self.data)
        } else {
            Err(Error::Usage(UsageError::ViewExpired))
        }
    }
}
