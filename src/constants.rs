use bitflags::bitflags;

bitflags! {
    /// Environment open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Environment path names the data file itself, not a directory.
        const NOSUBDIR = 0x4000;
        /// Don't flush the data file after commit.
        const NOSYNC = 0x10000;
        /// Open the environment read-only.
        const RDONLY = 0x20000;
        /// Don't flush the meta region after commit.
        const NOMETASYNC = 0x40000;
        /// Don't take the environment lock file.
        const NOLOCK = 0x400000;
    }
}

bitflags! {
    /// Database (keyspace) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Compare keys from the final byte first.
        const REVERSEKEY = 0x02;
        /// Keep sorted duplicate values per key.
        const DUPSORT = 0x04;
        /// Keys are native integers of uniform width.
        const INTEGERKEY = 0x08;
        /// With DUPSORT, duplicates have a fixed size.
        const DUPFIXED = 0x10;
        /// With DUPSORT, duplicates are integers.
        const INTEGERDUP = 0x20;
        /// With DUPSORT, compare duplicates from the final byte first.
        const REVERSEDUP = 0x40;
        /// Create the database if it does not exist.
        const CREATE = 0x40000;
    }
}

bitflags! {
    /// Write operation flags for put/cursor_put/cursor_del.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Don't overwrite an existing key; report the current value instead.
        const NOOVERWRITE = 0x10;
        /// With DUPSORT, don't store an already-present key/value pair.
        /// For cursor_del, remove every duplicate at the current key.
        const NODUPDATA = 0x20;
        /// For cursor_put, overwrite the entry at the cursor position.
        const CURRENT = 0x40;
        /// Key is appended past the current last key; out-of-order keys are
        /// rejected as a usage error.
        const APPEND = 0x20000;
        /// Like APPEND, for duplicate values of the current key.
        const APPENDDUP = 0x40000;
    }
}

bitflags! {
    /// Environment copy flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u32 {
        /// Compacting copy: omit free space, renumber pages.
        const COMPACT = 0x01;
    }
}

/// Engine status codes, preserved numerically for diagnostics.
pub mod codes {
    /// Successful result.
    pub const SUCCESS: i32 = 0;
    /// Key/data pair already exists.
    pub const KEYEXIST: i32 = -30799;
    /// Key/data pair not found.
    pub const NOTFOUND: i32 = -30798;
    /// Requested page not found; usually indicates corruption.
    pub const PAGE_NOTFOUND: i32 = -30797;
    /// Located page was of the wrong type.
    pub const CORRUPTED: i32 = -30796;
    /// Meta update failed or the environment had a fatal error.
    pub const PANIC: i32 = -30795;
    /// Environment version mismatch.
    pub const VERSION_MISMATCH: i32 = -30794;
    /// File is not a valid engine file.
    pub const INVALID: i32 = -30793;
    /// Environment map size limit reached.
    pub const MAP_FULL: i32 = -30792;
    /// Environment max databases limit reached.
    pub const DBS_FULL: i32 = -30791;
    /// Environment max readers limit reached.
    pub const READERS_FULL: i32 = -30790;
    /// Transaction has too many dirty pages.
    pub const TXN_FULL: i32 = -30788;
    /// Database contents grew beyond the environment map size.
    pub const MAP_RESIZED: i32 = -30785;
    /// Operation and database are incompatible.
    pub const INCOMPATIBLE: i32 = -30784;
    /// Invalid reuse of a reader slot.
    pub const BAD_RSLOT: i32 = -30783;
    /// Transaction must abort, has a child, or is invalid.
    pub const BAD_TXN: i32 = -30782;
    /// Unsupported size of key, database name, or data.
    pub const BAD_VALSIZE: i32 = -30781;
    /// The database handle was changed unexpectedly.
    pub const BAD_DBI: i32 = -30780;
    /// Unexpected problem; the transaction should abort.
    pub const PROBLEM: i32 = -30779;
    /// Key appended out of order. Layer-specific code, outside the classic
    /// range, surfaced as a usage error rather than KEYEXIST.
    pub const BAD_APPEND: i32 = -30740;
    /// Environment path does not exist.
    pub const ENOENT: i32 = 2;
    /// Permission denied (e.g. write in a read-only environment).
    pub const EACCES: i32 = 13;
    /// Environment is locked by another process.
    pub const EAGAIN: i32 = 11;
    /// Invalid argument reached the engine.
    pub const EINVAL: i32 = 22;
}

/// Layer version.
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Magic number of the persisted engine image.
pub const IMAGE_MAGIC: u32 = 0x4B42_4447;
/// Image format version.
pub const IMAGE_VERSION: u32 = 1;

/// Nominal page size used for stat accounting.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Default memory-map size limit in bytes.
pub const DEFAULT_MAP_SIZE: usize = 16 * 1024 * 1024;
/// Default number of reader slots.
pub const DEFAULT_MAX_READERS: u32 = 126;
/// Default number of named databases.
pub const DEFAULT_MAX_DBS: u32 = 16;
/// Largest key accepted by the layer, in bytes.
pub const MAX_KEY_SIZE: usize = 511;

/// Name of the data file inside an environment directory.
pub const DATA_FILE: &str = "data.kbg";
/// Name of the lock file inside an environment directory.
pub const LOCK_FILE: &str = "lock.kbg";
