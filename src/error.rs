use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::constants::codes;

/// Result type used across the layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed error taxonomy of the boundary layer.
///
/// `NotFound` is a normal outcome and is not surfaced by the data-plane
/// operations at all (they return `Option`/`bool` instead); it exists so the
/// mapper is total over engine codes. `Usage` errors are raised by the layer
/// itself, before the engine is involved wherever that is feasible. `Status`
/// and `Fatal` preserve the original engine code for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No matching key/data pair. A normal result, not a failure.
    #[error("key/data pair not found")]
    NotFound,
    /// Exclusive insert found the key already present; carries the value
    /// currently stored so the caller can decide how to proceed.
    #[error("key/data pair already exists")]
    KeyExists { current: Vec<u8> },
    /// The caller violated a documented precondition of this layer.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    /// The engine reported a recoverable failure.
    #[error("engine status {code}: {message}")]
    Status { code: i32, message: String },
    /// The engine reported an unrecoverable condition; the caller should
    /// consider the environment unusable.
    #[error("fatal engine condition {code}: {message}")]
    Fatal { code: i32, message: String },
}

/// Preconditions enforced by the layer before an engine call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// The handle does not name a live object; it was closed, its owner
    /// ended, or it never belonged to this table.
    #[error("stale or unknown handle")]
    StaleHandle,
    /// Map size, reader count and database count are immutable once the
    /// environment is open.
    #[error("environment configuration cannot change after open")]
    ConfigAfterOpen,
    /// The environment has been created but not opened yet.
    #[error("environment is not open")]
    EnvNotOpen,
    /// The environment still has live transactions.
    #[error("environment has {live_txns} live transaction(s)")]
    EnvBusy { live_txns: usize },
    /// Mutation attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnlyTxn,
    /// The transaction has an active child; it is suspended until the child
    /// commits or aborts.
    #[error("transaction has an active child")]
    TxnHasChild,
    /// The transaction was reset and must be renewed before use.
    #[error("transaction is reset; renew it first")]
    TxnReset,
    /// Reset/renew applies only to root read-only transactions.
    #[error("only root read-only transactions can be reset or renewed")]
    ResetNotAllowed,
    /// Renew called on a transaction that was never reset.
    #[error("transaction is active; reset it before renewing")]
    RenewWithoutReset,
    /// Nested transactions require a read-write parent.
    #[error("cannot nest a transaction under a read-only parent")]
    NestedUnderReadOnly,
    /// The key is empty or longer than the environment's maximum.
    #[error("key of {len} bytes rejected (valid range 1..={max})")]
    KeyRejected { len: usize, max: usize },
    /// A zero-copy view was used outside its validity window.
    #[error("zero-copy view used outside its validity window")]
    ViewExpired,
    /// The cursor was closed or its transaction ended.
    #[error("cursor is closed")]
    CursorClosed,
    /// The cursor has no current position.
    #[error("cursor is not positioned")]
    CursorUnpositioned,
    /// Cursors are renewed only against a read-only transaction of the same
    /// environment.
    #[error("cursor can only be renewed against a read-only transaction of its environment")]
    CursorRenew,
    /// APPEND/APPENDDUP was given a key that does not sort past the end.
    #[error("appended key is not greater than the last key")]
    AppendOutOfOrder,
    /// cursor_put with CURRENT must keep the key at the cursor position.
    #[error("key does not match the cursor position")]
    KeyMismatch,
}

/// Human-readable message for an engine status code.
pub fn strerror(code: i32) -> String {
    static MESSAGES: Lazy<HashMap<i32, &'static str>> = Lazy::new(|| {
        let mut m = HashMap::new();
        m.insert(codes::SUCCESS, "successful result");
        m.insert(codes::KEYEXIST, "key/data pair already exists");
        m.insert(codes::NOTFOUND, "key/data pair not found");
        m.insert(codes::PAGE_NOTFOUND, "requested page not found");
        m.insert(codes::CORRUPTED, "located page was of the wrong type");
        m.insert(codes::PANIC, "engine had a fatal error");
        m.insert(codes::VERSION_MISMATCH, "environment version mismatch");
        m.insert(codes::INVALID, "file is not a valid engine file");
        m.insert(codes::MAP_FULL, "environment map size limit reached");
        m.insert(codes::DBS_FULL, "environment max databases limit reached");
        m.insert(codes::READERS_FULL, "environment max readers limit reached");
        m.insert(codes::TXN_FULL, "transaction has too many dirty pages");
        m.insert(codes::MAP_RESIZED, "database contents grew beyond map size");
        m.insert(codes::INCOMPATIBLE, "operation and database are incompatible");
        m.insert(codes::BAD_RSLOT, "invalid reuse of a reader slot");
        m.insert(codes::BAD_TXN, "transaction must abort, has a child, or is invalid");
        m.insert(codes::BAD_VALSIZE, "unsupported size of key, database name, or data");
        m.insert(codes::BAD_DBI, "database handle changed unexpectedly");
        m.insert(codes::PROBLEM, "unexpected problem, transaction should abort");
        m.insert(codes::BAD_APPEND, "key appended out of order");
        m.insert(codes::ENOENT, "no such file or directory");
        m.insert(codes::EACCES, "permission denied");
        m.insert(codes::EAGAIN, "environment is locked by another process");
        m.insert(codes::EINVAL, "invalid argument");
        m
    });
    match MESSAGES.get(&code) {
        Some(msg) => (*msg).to_string(),
        None => format!("unknown error code ({code})"),
    }
}

impl Error {
    /// Translate an engine status code into the taxonomy.
    ///
    /// Reader-table exhaustion, map exhaustion, corruption, version skew and
    /// engine panic are unrecoverable and surface as `Fatal`; everything else
    /// the engine reports is a recoverable `Status`.
    pub(crate) fn from_code(code: i32) -> Error {
        match code {
            codes::NOTFOUND => Error::NotFound,
            codes::KEYEXIST => Error::KeyExists { current: Vec::new() },
            codes::BAD_APPEND => Error::Usage(UsageError::AppendOutOfOrder),
            codes::MAP_FULL
            | codes::READERS_FULL
            | codes::PANIC
            | codes::CORRUPTED
            | codes::PAGE_NOTFOUND
            | codes::VERSION_MISMATCH
            | codes::INVALID => Error::Fatal { code, message: strerror(code) },
            _ => Error::Status { code, message: strerror(code) },
        }
    }

    /// The engine code closest to this error, for hosts that key on codes.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound => codes::NOTFOUND,
            Error::KeyExists { .. } => codes::KEYEXIST,
            Error::Usage(_) => codes::EINVAL,
            Error::Status { code, .. } | Error::Fatal { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_found_and_keyexist() {
        assert_eq!(Error::from_code(codes::NOTFOUND), Error::NotFound);
        assert!(matches!(Error::from_code(codes::KEYEXIST), Error::KeyExists { .. }));
    }

    #[test]
    fn fatal_codes_are_fatal() {
        for code in [
            codes::MAP_FULL,
            codes::READERS_FULL,
            codes::PANIC,
            codes::CORRUPTED,
            codes::VERSION_MISMATCH,
            codes::INVALID,
        ] {
            let err = Error::from_code(code);
            assert!(matches!(err, Error::Fatal { .. }), "{code} should be fatal: {err:?}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn recoverable_codes_keep_their_code() {
        let err = Error::from_code(codes::BAD_TXN);
        assert_eq!(err, Error::Status { code: codes::BAD_TXN, message: strerror(codes::BAD_TXN) });
    }

    #[test]
    fn append_violation_is_usage_not_keyexist() {
        assert_eq!(
            Error::from_code(codes::BAD_APPEND),
            Error::Usage(UsageError::AppendOutOfOrder)
        );
    }

    #[test]
    fn strerror_unknown_code() {
        assert!(strerror(-1).contains("unknown error code"));
        assert_eq!(strerror(codes::MAP_FULL), "environment map size limit reached");
    }
}
