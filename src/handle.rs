use std::num::NonZeroU64;

use crate::error::{Error, Result, UsageError};

/// Opaque handle crossing the boundary: slot index in the low 32 bits,
/// generation counter in the high 32. Generations start at 1, so the packed
/// value is never zero and a zeroed handle from the host is always rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    fn pack(slot: u32, gen: u32) -> RawHandle {
        debug_assert!(gen != 0);
        let bits = (gen as u64) << 32 | slot as u64;
        // gen != 0 keeps the high half nonzero.
        RawHandle(NonZeroU64::new(bits).unwrap_or(NonZeroU64::MIN))
    }

    fn slot(self) -> u32 {
        self.0.get() as u32
    }

    fn gen(self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    /// Raw transport representation for the host.
    pub fn to_bits(self) -> u64 {
        self.0.get()
    }

    /// Decode a host-supplied value. Zero is never a valid handle.
    pub fn from_bits(bits: u64) -> Result<RawHandle> {
        match NonZeroU64::new(bits) {
            Some(n) => Ok(RawHandle(n)),
            None => Err(Error::Usage(UsageError::StaleHandle)),
        }
    }
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) RawHandle);

        impl $name {
            pub fn to_bits(self) -> u64 {
                self.0.to_bits()
            }

            pub fn from_bits(bits: u64) -> Result<$name> {
                RawHandle::from_bits(bits).map($name)
            }
        }
    };
}

typed_handle!(
    /// Handle to an environment.
    EnvHandle
);
typed_handle!(
    /// Handle to a transaction.
    TxnHandle
);
typed_handle!(
    /// Handle to a named database within an environment.
    DbHandle
);
typed_handle!(
    /// Handle to a cursor.
    CursorHandle
);

struct Slot<T> {
    gen: u32,
    value: Option<T>,
}

/// Generational slab backing one handle namespace. Freed slots are reused
/// with a bumped generation, so a retired handle can never alias a newer
/// object in the same slot.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    pub fn new() -> HandleTable<T> {
        HandleTable { slots: Vec::new(), free: Vec::new() }
    }

    pub fn insert(&mut self, value: T) -> RawHandle {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.value = Some(value);
                RawHandle::pack(slot, entry.gen)
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot { gen: 1, value: Some(value) });
                RawHandle::pack(slot, 1)
            }
        }
    }

    fn slot_of(&self, handle: RawHandle) -> Option<usize> {
        let idx = handle.slot() as usize;
        match self.slots.get(idx) {
            Some(entry) if entry.gen == handle.gen() && entry.value.is_some() => Some(idx),
            _ => None,
        }
    }

    pub fn get(&self, handle: RawHandle) -> Result<&T> {
        match self.slot_of(handle) {
            Some(idx) => match &self.slots[idx].value {
                Some(v) => Ok(v),
                None => Err(Error::Usage(UsageError::StaleHandle)),
            },
            None => Err(Error::Usage(UsageError::StaleHandle)),
        }
    }

    /// Retire the handle and return its object. The generation is bumped so
    /// the handle (and any copy of it) is stale from here on.
    pub fn remove(&mut self, handle: RawHandle) -> Result<T> {
        let idx = match self.slot_of(handle) {
            Some(idx) => idx,
            None => return Err(Error::Usage(UsageError::StaleHandle)),
        };
        let entry = &mut self.slots[idx];
        entry.gen = entry.gen.wrapping_add(1).max(1);
        self.free.push(idx as u32);
        match entry.value.take() {
            Some(v) => Ok(v),
            None => Err(Error::Usage(UsageError::StaleHandle)),
        }
    }
}
