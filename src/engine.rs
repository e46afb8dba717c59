//! In-process storage engine: copy-on-write snapshots over memory-resident
//! B-tree maps, persisted as a single checksummed image that is written
//! atomically on every root commit and memory-mapped back in at open.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use log::{debug, trace};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::constants::{
    codes, DbFlags, EnvFlags, WriteFlags, DATA_FILE, DEFAULT_PAGE_SIZE, IMAGE_MAGIC,
    IMAGE_VERSION, LOCK_FILE, MAX_KEY_SIZE,
};

/// Stored value bytes, shared between snapshots without copying.
pub(crate) type Bytes = Arc<[u8]>;

/// Raw engine status code, translated at the boundary by the error mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EngineStatus(pub i32);

pub(crate) type EngineResult<T> = std::result::Result<T, EngineStatus>;

pub(crate) fn io_status(err: &std::io::Error) -> EngineStatus {
    use std::io::ErrorKind;
    EngineStatus(match err.kind() {
        ErrorKind::NotFound => codes::ENOENT,
        ErrorKind::PermissionDenied => codes::EACCES,
        _ => codes::PROBLEM,
    })
}

/// Encode a key for storage. Reverse-ordered databases store the bytes
/// reversed so the map's natural ordering compares from the end of the key.
pub(crate) fn key_encode(flags: DbFlags, key: &[u8]) -> Vec<u8> {
    if flags.contains(DbFlags::REVERSEKEY) {
        key.iter().rev().copied().collect()
    } else {
        key.to_vec()
    }
}

pub(crate) fn key_decode(flags: DbFlags, stored: &[u8]) -> Vec<u8> {
    // Reversal is its own inverse.
    key_encode(flags, stored)
}

/// Ordering of duplicate values within one key.
pub(crate) fn dup_ordering(flags: DbFlags, a: &[u8], b: &[u8]) -> Ordering {
    if flags.contains(DbFlags::REVERSEDUP) {
        a.iter().rev().cmp(b.iter().rev())
    } else {
        a.cmp(b)
    }
}

/// One named (or the unnamed main) database. The entry map is shared by
/// reference between snapshots; a write frame clones it on first mutation.
/// Duplicate values live in a vector kept sorted by `dup_ordering`; plain
/// databases always hold exactly one element.
#[derive(Debug, Clone)]
pub(crate) struct DbState {
    pub name: Option<String>,
    pub flags: DbFlags,
    pub map: Arc<BTreeMap<Vec<u8>, Vec<Bytes>>>,
}

impl DbState {
    fn new(name: Option<String>, flags: DbFlags) -> DbState {
        DbState { name, flags, map: Arc::new(BTreeMap::new()) }
    }

    pub fn entry_count(&self) -> u64 {
        self.map.values().map(|dups| dups.len() as u64).sum()
    }

    fn byte_volume(&self) -> u64 {
        self.map
            .iter()
            .map(|(k, dups)| {
                k.len() as u64 + dups.iter().map(|v| v.len() as u64).sum::<u64>()
            })
            .sum()
    }
}

/// Per-database statistics. Page accounting is derived from entry volume;
/// the engine keeps whole trees in memory and has no literal pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub page_size: u32,
    pub tree_depth: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entry_count: u64,
}

/// Environment-wide information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvInfo {
    pub map_address: usize,
    pub map_size: usize,
    pub last_page_number: u64,
    pub last_transaction_id: u64,
    pub max_readers: u32,
    pub num_readers: u32,
}

pub(crate) fn derive_stat(db: &DbState) -> Stat {
    let page_size = DEFAULT_PAGE_SIZE as u32;
    let entries = db.entry_count();
    let volume = db.byte_volume();
    let leaf_pages = if entries == 0 { 0 } else { (volume / page_size as u64).max(1) };
    let branch_pages = if leaf_pages > 1 { (leaf_pages + 15) / 16 } else { 0 };
    let overflow_pages = db
        .map
        .values()
        .flatten()
        .filter(|v| v.len() > page_size as usize)
        .map(|v| (v.len() as u64 + page_size as u64 - 1) / page_size as u64)
        .sum();
    let tree_depth = match (entries, branch_pages) {
        (0, _) => 0,
        (_, 0) => 1,
        _ => 2,
    };
    Stat { page_size, tree_depth, branch_pages, leaf_pages, overflow_pages, entry_count: entries }
}

/// Immutable view of the store at one point in time. Dropped databases leave
/// a `None` tombstone so database indices stay stable for the environment's
/// lifetime.
#[derive(Debug, Clone, Default)]
struct StoreView {
    dbs: Vec<Option<DbState>>,
    names: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct CommittedState {
    view: StoreView,
    last_txn_id: u64,
}

pub(crate) struct EngineConfig {
    pub map_size: usize,
    pub max_readers: u32,
    pub max_dbs: u32,
}

struct ReaderSlot {
    token: Weak<()>,
    txn_id: u64,
}

pub(crate) struct Engine {
    flags: EnvFlags,
    /// Runtime-changeable NOSYNC/NOMETASYNC bits.
    sync_bits: AtomicU32,
    map_size: usize,
    max_readers: u32,
    max_dbs: u32,
    data_path: PathBuf,
    data_file: File,
    committed: RwLock<CommittedState>,
    readers: Mutex<Vec<ReaderSlot>>,
}

/// Outcome of a put: either stored, or refused by an exclusivity flag with
/// the value currently in place.
pub(crate) enum PutOutcome {
    Stored,
    Exists(Bytes),
}

/// An open engine transaction. Write transactions carry a stack of frames,
/// one per nesting level; each frame is a full copy-on-write view, so
/// aborting a level is just popping it.
#[derive(Debug)]
pub(crate) struct EngineTxn {
    pub id: u64,
    pub read_only: bool,
    max_dbs: u32,
    base: StoreView,
    frames: Vec<StoreView>,
    reader_token: Option<Arc<()>>,
}

impl EngineTxn {
    fn top(&self) -> &StoreView {
        match self.frames.last() {
            Some(frame) => frame,
            None => &self.base,
        }
    }

    fn top_mut(&mut self) -> EngineResult<&mut StoreView> {
        match self.frames.last_mut() {
            Some(frame) => Ok(frame),
            None => Err(EngineStatus(codes::EACCES)),
        }
    }

    pub fn db_view(&self, dbi: u32) -> EngineResult<&DbState> {
        match self.top().dbs.get(dbi as usize) {
            Some(Some(db)) => Ok(db),
            _ => Err(EngineStatus(codes::BAD_DBI)),
        }
    }

    fn db_mut(&mut self, dbi: u32) -> EngineResult<&mut DbState> {
        match self.top_mut()?.dbs.get_mut(dbi as usize) {
            Some(Some(db)) => Ok(db),
            _ => Err(EngineStatus(codes::BAD_DBI)),
        }
    }

    /// Open one more nesting level.
    pub fn push_frame(&mut self) -> EngineResult<()> {
        let top = match self.frames.last() {
            Some(frame) => frame.clone(),
            None => return Err(EngineStatus(codes::EACCES)),
        };
        self.frames.push(top);
        Ok(())
    }

    /// Merge the innermost level into its parent.
    pub fn commit_frame(&mut self) -> EngineResult<()> {
        if self.frames.len() < 2 {
            return Err(EngineStatus(codes::BAD_TXN));
        }
        let merged = match self.frames.pop() {
            Some(frame) => frame,
            None => return Err(EngineStatus(codes::BAD_TXN)),
        };
        if let Some(parent) = self.frames.last_mut() {
            *parent = merged;
        }
        Ok(())
    }

    /// Discard the innermost level.
    pub fn abort_frame(&mut self) -> EngineResult<()> {
        if self.frames.len() < 2 {
            return Err(EngineStatus(codes::BAD_TXN));
        }
        self.frames.pop();
        Ok(())
    }

    /// Resolve a database by name, creating it when asked.
    pub fn dbi_open(&mut self, name: Option<&str>, flags: DbFlags) -> EngineResult<u32> {
        let name = match name {
            None => return Ok(0),
            Some(n) => n,
        };
        let want = flags.difference(DbFlags::CREATE);
        if let Some(&dbi) = self.top().names.get(name) {
            let db = self.db_view(dbi)?;
            if !want.is_empty() && want != db.flags {
                return Err(EngineStatus(codes::INCOMPATIBLE));
            }
            return Ok(dbi);
        }
        if !flags.contains(DbFlags::CREATE) {
            return Err(EngineStatus(codes::NOTFOUND));
        }
        if self.read_only {
            return Err(EngineStatus(codes::EACCES));
        }
        let max_dbs = self.max_dbs;
        let view = self.top_mut()?;
        let named = view.dbs.iter().skip(1).filter(|d| d.is_some()).count() as u32;
        if named >= max_dbs {
            return Err(EngineStatus(codes::DBS_FULL));
        }
        let dbi = view.dbs.len() as u32;
        view.dbs.push(Some(DbState::new(Some(name.to_string()), want)));
        view.names.insert(name.to_string(), dbi);
        trace!("created database {name:?} as dbi {dbi}");
        Ok(dbi)
    }

    /// Give the reader slot back while keeping the transaction around for a
    /// later renew.
    pub fn release_reader(&mut self) {
        self.reader_token = None;
    }

    pub fn db_flags(&self, dbi: u32) -> EngineResult<DbFlags> {
        Ok(self.db_view(dbi)?.flags)
    }

    pub fn db_stat(&self, dbi: u32) -> EngineResult<Stat> {
        Ok(derive_stat(self.db_view(dbi)?))
    }

    /// First duplicate under the key, or the sole value for plain databases.
    pub fn get(&self, dbi: u32, key: &[u8]) -> EngineResult<Option<Bytes>> {
        let db = self.db_view(dbi)?;
        let stored = key_encode(db.flags, key);
        Ok(db.map.get(&stored).and_then(|dups| dups.first().cloned()))
    }

    pub fn put(
        &mut self,
        dbi: u32,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<PutOutcome> {
        if self.read_only {
            return Err(EngineStatus(codes::EACCES));
        }
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(EngineStatus(codes::BAD_VALSIZE));
        }
        let db = self.db_mut(dbi)?;
        let db_flags = db.flags;
        let dupsort = db_flags.contains(DbFlags::DUPSORT);
        let stored = key_encode(db_flags, key);

        if flags.intersects(WriteFlags::APPEND | WriteFlags::APPENDDUP) {
            if let Some((last, _)) = db.map.iter().next_back() {
                match stored.cmp(last) {
                    Ordering::Less => return Err(EngineStatus(codes::BAD_APPEND)),
                    Ordering::Equal if !dupsort => {
                        return Err(EngineStatus(codes::BAD_APPEND))
                    }
                    _ => {}
                }
            }
        }

        let map = Arc::make_mut(&mut db.map);
        let value: Bytes = Arc::from(value);
        match map.entry(stored) {
            Entry::Vacant(slot) => {
                slot.insert(vec![value]);
                Ok(PutOutcome::Stored)
            }
            Entry::Occupied(mut slot) => {
                let dups = slot.get_mut();
                if flags.contains(WriteFlags::NOOVERWRITE) {
                    return Ok(PutOutcome::Exists(dups[0].clone()));
                }
                if !dupsort {
                    dups[0] = value;
                    return Ok(PutOutcome::Stored);
                }
                match dups.binary_search_by(|d| dup_ordering(db_flags, d, &value)) {
                    Ok(_) if flags.contains(WriteFlags::NODUPDATA) => {
                        Ok(PutOutcome::Exists(value))
                    }
                    Ok(_) => Ok(PutOutcome::Stored),
                    Err(pos) => {
                        if flags.contains(WriteFlags::APPENDDUP) && pos != dups.len() {
                            return Err(EngineStatus(codes::BAD_APPEND));
                        }
                        dups.insert(pos, value);
                        Ok(PutOutcome::Stored)
                    }
                }
            }
        }
    }

    /// Remove a key, or one duplicate under it. Returns whether anything
    /// was removed.
    pub fn del(&mut self, dbi: u32, key: &[u8], value: Option<&[u8]>) -> EngineResult<bool> {
        if self.read_only {
            return Err(EngineStatus(codes::EACCES));
        }
        let db = self.db_mut(dbi)?;
        let db_flags = db.flags;
        let stored = key_encode(db_flags, key);
        if !db.map.contains_key(&stored) {
            return Ok(false);
        }
        let map = Arc::make_mut(&mut db.map);
        match value {
            None => {
                map.remove(&stored);
                Ok(true)
            }
            Some(value) => {
                let dups = match map.get_mut(&stored) {
                    Some(dups) => dups,
                    None => return Ok(false),
                };
                match dups.binary_search_by(|d| dup_ordering(db_flags, d, value)) {
                    Ok(pos) => {
                        dups.remove(pos);
                        if dups.is_empty() {
                            map.remove(&stored);
                        }
                        Ok(true)
                    }
                    Err(_) => Ok(false),
                }
            }
        }
    }

    /// Empty a database, or remove it entirely leaving a tombstone so its
    /// index is never reused.
    pub fn drop_db(&mut self, dbi: u32, delete: bool) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineStatus(codes::EACCES));
        }
        if dbi == 0 && delete {
            return Err(EngineStatus(codes::EINVAL));
        }
        let view = self.top_mut()?;
        let slot = match view.dbs.get_mut(dbi as usize) {
            Some(slot @ Some(_)) => slot,
            _ => return Err(EngineStatus(codes::BAD_DBI)),
        };
        if delete {
            if let Some(db) = slot.take() {
                if let Some(name) = db.name {
                    view.names.remove(&name);
                }
            }
        } else if let Some(db) = slot.as_mut() {
            db.map = Arc::new(BTreeMap::new());
        }
        Ok(())
    }
}

impl Engine {
    /// Open or create the store under `path`. Without `NOSUBDIR` the path
    /// names an existing directory holding the data and lock files;
    /// otherwise it names the data file itself.
    pub fn open(path: &Path, flags: EnvFlags, cfg: &EngineConfig, mode: u32) -> EngineResult<Engine> {
        let (data_path, lock_path) = if flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock = path.as_os_str().to_owned();
            lock.push("-lock");
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            if !path.is_dir() {
                return Err(EngineStatus(codes::ENOENT));
            }
            (path.join(DATA_FILE), path.join(LOCK_FILE))
        };

        let read_only = flags.contains(EnvFlags::RDONLY);
        let committed = if data_path.exists() {
            let file = File::open(&data_path).map_err(|e| io_status(&e))?;
            // Safety: the image is only remapped here, never written in
            // place; commits replace the whole file via rename.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| io_status(&e))?;
            parse_image(&mmap, cfg.map_size)?
        } else if read_only {
            return Err(EngineStatus(codes::ENOENT));
        } else {
            let mut view = StoreView::default();
            view.dbs.push(Some(DbState::new(None, DbFlags::empty())));
            CommittedState { view, last_txn_id: 0 }
        };

        if !read_only && !flags.contains(EnvFlags::NOLOCK) {
            let lock = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| io_status(&e))?;
            apply_mode(&lock, mode);
        }

        if !data_path.exists() {
            let image = build_image(&committed.view, committed.last_txn_id);
            write_image(&data_path, &image, flags).map_err(|e| io_status(&e))?;
        }
        let data_file = File::open(&data_path).map_err(|e| io_status(&e))?;
        if !read_only {
            apply_mode(&data_file, mode);
        }

        debug!(
            "opened store at {} (last txn {})",
            data_path.display(),
            committed.last_txn_id
        );
        let sync_bits = flags.intersection(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC).bits();
        Ok(Engine {
            flags,
            sync_bits: AtomicU32::new(sync_bits),
            map_size: cfg.map_size,
            max_readers: cfg.max_readers,
            max_dbs: cfg.max_dbs,
            data_path,
            data_file,
            committed: RwLock::new(committed),
            readers: Mutex::new(Vec::new()),
        })
    }

    fn sync_flags(&self) -> EnvFlags {
        EnvFlags::from_bits_retain(self.sync_bits.load(AtomicOrdering::Acquire))
    }

    /// Toggle the runtime-changeable durability flags. Anything outside
    /// NOSYNC/NOMETASYNC is refused.
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> EngineResult<()> {
        let allowed = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC;
        if !allowed.contains(flags) {
            return Err(EngineStatus(codes::EINVAL));
        }
        if on {
            self.sync_bits.fetch_or(flags.bits(), AtomicOrdering::AcqRel);
        } else {
            self.sync_bits.fetch_and(!flags.bits(), AtomicOrdering::AcqRel);
        }
        Ok(())
    }

    /// Effective environment flags, including runtime toggles.
    pub fn effective_flags(&self) -> EnvFlags {
        self.flags
            .difference(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC)
            .union(self.sync_flags())
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.data_file.as_raw_fd()
    }

    fn snapshot(&self) -> (StoreView, u64) {
        let committed = self.committed.read();
        (committed.view.clone(), committed.last_txn_id)
    }

    /// Claim a reader slot, reusing one whose owner is gone.
    fn claim_reader_slot(&self, id: u64) -> EngineResult<Arc<()>> {
        let token = Arc::new(());
        let mut readers = self.readers.lock();
        match readers.iter_mut().find(|s| s.token.strong_count() == 0) {
            Some(slot) => {
                slot.token = Arc::downgrade(&token);
                slot.txn_id = id;
            }
            None => {
                if readers.len() >= self.max_readers as usize {
                    return Err(EngineStatus(codes::READERS_FULL));
                }
                readers.push(ReaderSlot { token: Arc::downgrade(&token), txn_id: id });
            }
        }
        Ok(token)
    }

    pub fn begin_read(&self) -> EngineResult<EngineTxn> {
        let (base, id) = self.snapshot();
        let token = self.claim_reader_slot(id)?;
        Ok(EngineTxn {
            id,
            read_only: true,
            max_dbs: self.max_dbs,
            base,
            frames: Vec::new(),
            reader_token: Some(token),
        })
    }

    pub fn begin_write(&self) -> EngineResult<EngineTxn> {
        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(EngineStatus(codes::EACCES));
        }
        let (base, last_id) = self.snapshot();
        let frame = base.clone();
        Ok(EngineTxn {
            id: last_id + 1,
            read_only: false,
            max_dbs: self.max_dbs,
            base,
            frames: vec![frame],
            reader_token: None,
        })
    }

    /// Publish a root write transaction: serialize, check the map budget,
    /// replace the image atomically, then install the new view. Failure
    /// leaves the committed state untouched.
    pub fn commit(&self, txn: EngineTxn) -> EngineResult<()> {
        if txn.read_only {
            return Ok(());
        }
        let view = match txn.frames.into_iter().last() {
            Some(view) => view,
            None => return Err(EngineStatus(codes::BAD_TXN)),
        };
        self.persist(&view, txn.id)?;
        let mut committed = self.committed.write();
        committed.view = view;
        committed.last_txn_id = txn.id;
        trace!("committed txn {}", txn.id);
        Ok(())
    }

    /// Refresh a reset read transaction onto the latest snapshot. A
    /// transaction that gave back its slot must win one again; slot
    /// exhaustion leaves it unchanged.
    pub fn renew_read(&self, txn: &mut EngineTxn) -> EngineResult<()> {
        if !txn.read_only {
            return Err(EngineStatus(codes::EINVAL));
        }
        let (base, id) = self.snapshot();
        match txn.reader_token.as_ref() {
            Some(token) => {
                let target = Arc::downgrade(token);
                let mut readers = self.readers.lock();
                if let Some(slot) = readers.iter_mut().find(|s| s.token.ptr_eq(&target)) {
                    slot.txn_id = id;
                }
            }
            None => txn.reader_token = Some(self.claim_reader_slot(id)?),
        }
        txn.base = base;
        txn.id = id;
        Ok(())
    }

    fn persist(&self, view: &StoreView, txn_id: u64) -> EngineResult<()> {
        if self.flags.contains(EnvFlags::RDONLY) {
            return Ok(());
        }
        let image = build_image(view, txn_id);
        if image.len() > self.map_size {
            return Err(EngineStatus(codes::MAP_FULL));
        }
        write_image(&self.data_path, &image, self.sync_flags()).map_err(|e| io_status(&e))
    }

    /// Rewrite and flush the image from the committed state. `force`
    /// bypasses NOSYNC.
    pub fn sync(&self, force: bool) -> EngineResult<()> {
        if self.flags.contains(EnvFlags::RDONLY) {
            return Ok(());
        }
        let committed = self.committed.read();
        let image = build_image(&committed.view, committed.last_txn_id);
        if image.len() > self.map_size {
            return Err(EngineStatus(codes::MAP_FULL));
        }
        let flags = if force { EnvFlags::empty() } else { self.sync_flags() };
        write_image(&self.data_path, &image, flags).map_err(|e| io_status(&e))
    }

    pub fn copy_image(&self) -> Vec<u8> {
        let committed = self.committed.read();
        build_image(&committed.view, committed.last_txn_id)
    }

    pub fn stat(&self) -> Stat {
        let committed = self.committed.read();
        match committed.view.dbs.first() {
            Some(Some(main)) => derive_stat(main),
            _ => Stat::default(),
        }
    }

    pub fn info(&self) -> EnvInfo {
        let committed = self.committed.read();
        let pages: u64 = committed
            .view
            .dbs
            .iter()
            .flatten()
            .map(|db| {
                let s = derive_stat(db);
                s.branch_pages + s.leaf_pages + s.overflow_pages
            })
            .sum();
        let num_readers =
            self.readers.lock().iter().filter(|s| s.token.strong_count() > 0).count() as u32;
        EnvInfo {
            map_address: 0,
            map_size: self.map_size,
            last_page_number: pages,
            last_transaction_id: committed.last_txn_id,
            max_readers: self.max_readers,
            num_readers,
        }
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Clear reader slots whose owner is gone. Returns how many were
    /// reclaimed.
    pub fn reader_check(&self) -> usize {
        let mut readers = self.readers.lock();
        let before = readers.len();
        readers.retain(|s| s.token.strong_count() > 0);
        before - readers.len()
    }

    pub fn reader_list(&self) -> Vec<u64> {
        self.readers
            .lock()
            .iter()
            .filter(|s| s.token.strong_count() > 0)
            .map(|s| s.txn_id)
            .collect()
    }
}

fn apply_mode(file: &File, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = file.set_permissions(fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    {
        let _ = (file, mode);
    }
}

/// Replace the image atomically: write a sibling temp file, flush it per
/// the sync flags, then rename over the data file.
fn write_image(data_path: &Path, image: &[u8], flags: EnvFlags) -> std::io::Result<()> {
    let tmp = data_path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(image)?;
    if !flags.contains(EnvFlags::NOSYNC) {
        if flags.contains(EnvFlags::NOMETASYNC) {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
    }
    drop(file);
    fs::rename(&tmp, data_path)
}

// Image layout, all little-endian:
//   magic u32, version u32, page_size u32, db_count u32, last_txn_id u64
//   per db: flags u32, name_len u32, name bytes, key_count u64,
//     per key: key_len u32, key bytes, dup_count u32,
//       per dup: len u32, bytes
//   crc32 of everything above, u32

fn build_image(view: &StoreView, txn_id: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
    buf.extend_from_slice(&(DEFAULT_PAGE_SIZE as u32).to_le_bytes());
    buf.extend_from_slice(&(view.dbs.len() as u32).to_le_bytes());
    buf.extend_from_slice(&txn_id.to_le_bytes());
    for slot in &view.dbs {
        match slot {
            None => {
                // Tombstone: impossible flag pattern marks a dropped slot.
                buf.extend_from_slice(&u32::MAX.to_le_bytes());
            }
            Some(db) => {
                buf.extend_from_slice(&db.flags.bits().to_le_bytes());
                let name = db.name.as_deref().unwrap_or("");
                buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&(db.map.len() as u64).to_le_bytes());
                for (key, dups) in db.map.iter() {
                    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                    buf.extend_from_slice(key);
                    buf.extend_from_slice(&(dups.len() as u32).to_le_bytes());
                    for value in dups {
                        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                        buf.extend_from_slice(value);
                    }
                }
            }
        }
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

struct ImageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        match self.buf.get(self.pos..self.pos + n) {
            Some(slice) => {
                self.pos += n;
                Ok(slice)
            }
            None => Err(EngineStatus(codes::CORRUPTED)),
        }
    }

    fn u32(&mut self) -> EngineResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> EngineResult<u64> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }
}

fn parse_image(data: &[u8], map_size: usize) -> EngineResult<CommittedState> {
    if data.len() < 4 + 4 {
        return Err(EngineStatus(codes::INVALID));
    }
    let body_len = data.len() - 4;
    let stored_crc = u32::from_le_bytes([
        data[body_len],
        data[body_len + 1],
        data[body_len + 2],
        data[body_len + 3],
    ]);
    let body = &data[..body_len];
    let mut r = ImageReader { buf: body, pos: 0 };
    if r.u32()? != IMAGE_MAGIC {
        return Err(EngineStatus(codes::INVALID));
    }
    if r.u32()? != IMAGE_VERSION {
        return Err(EngineStatus(codes::VERSION_MISMATCH));
    }
    if crc32fast::hash(body) != stored_crc {
        return Err(EngineStatus(codes::CORRUPTED));
    }
    let _page_size = r.u32()?;
    let db_count = r.u32()? as usize;
    let last_txn_id = r.u64()?;
    if data.len() > map_size {
        return Err(EngineStatus(codes::MAP_RESIZED));
    }

    let mut view = StoreView::default();
    for dbi in 0..db_count {
        let flag_bits = r.u32()?;
        if flag_bits == u32::MAX {
            view.dbs.push(None);
            continue;
        }
        let flags = DbFlags::from_bits_retain(flag_bits);
        let name_len = r.u32()? as usize;
        let name_bytes = r.take(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| EngineStatus(codes::CORRUPTED))?
            .to_string();
        let name = if name.is_empty() { None } else { Some(name) };
        let key_count = r.u64()?;
        let mut map = BTreeMap::new();
        for _ in 0..key_count {
            let key_len = r.u32()? as usize;
            let key = r.take(key_len)?.to_vec();
            let dup_count = r.u32()? as usize;
            let mut dups = Vec::with_capacity(dup_count);
            for _ in 0..dup_count {
                let len = r.u32()? as usize;
                dups.push(Bytes::from(r.take(len)?));
            }
            if dups.is_empty() {
                return Err(EngineStatus(codes::CORRUPTED));
            }
            map.insert(key, dups);
        }
        if let Some(name) = &name {
            view.names.insert(name.clone(), dbi as u32);
        }
        view.dbs.push(Some(DbState { name, flags, map: Arc::new(map) }));
    }
    if view.dbs.is_empty() {
        return Err(EngineStatus(codes::CORRUPTED));
    }
    Ok(CommittedState { view, last_txn_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAP_SIZE;

    fn test_engine(dir: &Path) -> Engine {
        let cfg = EngineConfig {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: 8,
            max_dbs: 4,
        };
        match Engine::open(dir, EnvFlags::empty(), &cfg, 0o644) {
            Ok(engine) => engine,
            Err(status) => panic!("open failed with status {}", status.0),
        }
    }

    #[test]
    fn snapshot_isolation_across_commit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());

        let mut w = engine.begin_write().unwrap();
        w.put(0, b"k", b"v1", WriteFlags::empty()).unwrap();
        engine.commit(w).unwrap();

        let r = engine.begin_read().unwrap();
        let mut w = engine.begin_write().unwrap();
        w.put(0, b"k", b"v2", WriteFlags::empty()).unwrap();
        engine.commit(w).unwrap();

        // The reader still sees the snapshot it started on.
        assert_eq!(r.get(0, b"k").unwrap().as_deref(), Some(&b"v1"[..]));
        let r2 = engine.begin_read().unwrap();
        assert_eq!(r2.get(0, b"k").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn image_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = test_engine(dir.path());
            let mut w = engine.begin_write().unwrap();
            let dbi = w.dbi_open(Some("names"), DbFlags::CREATE).unwrap();
            w.put(dbi, b"a", b"1", WriteFlags::empty()).unwrap();
            w.put(0, b"main", b"x", WriteFlags::empty()).unwrap();
            engine.commit(w).unwrap();
        }
        let engine = test_engine(dir.path());
        let mut r = engine.begin_read().unwrap();
        let dbi = r.dbi_open(Some("names"), DbFlags::empty()).unwrap();
        assert_eq!(r.get(dbi, b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(r.get(0, b"main").unwrap().as_deref(), Some(&b"x"[..]));
        assert_eq!(engine.info().last_transaction_id, 1);
    }

    #[test]
    fn nested_frame_abort_discards() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let mut w = engine.begin_write().unwrap();
        w.put(0, b"outer", b"1", WriteFlags::empty()).unwrap();
        w.push_frame().unwrap();
        w.put(0, b"inner", b"2", WriteFlags::empty()).unwrap();
        w.abort_frame().unwrap();
        assert!(w.get(0, b"inner").unwrap().is_none());
        assert_eq!(w.get(0, b"outer").unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn reverse_key_orders_from_the_end() {
        let flags = DbFlags::REVERSEKEY;
        let a = key_encode(flags, b"abc");
        let b = key_encode(flags, b"zbc");
        // "abc" reversed is "cba", "zbc" reversed is "cbz".
        assert!(a < b);
        assert_eq!(key_decode(flags, &a), b"abc");
    }

    #[test]
    fn renew_reacquires_a_released_slot() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig { map_size: DEFAULT_MAP_SIZE, max_readers: 1, max_dbs: 4 };
        let engine = Engine::open(dir.path(), EnvFlags::empty(), &cfg, 0o644).unwrap();

        let mut r = engine.begin_read().unwrap();
        r.release_reader();
        // The freed slot is available to a new reader.
        let r2 = engine.begin_read().unwrap();
        assert_eq!(engine.renew_read(&mut r).unwrap_err(), EngineStatus(codes::READERS_FULL));
        drop(r2);
        engine.renew_read(&mut r).unwrap();
    }

    #[test]
    fn readers_full_after_limit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let held: Vec<_> = (0..8).map(|_| engine.begin_read().unwrap()).collect();
        assert_eq!(engine.begin_read().unwrap_err(), EngineStatus(codes::READERS_FULL));
        drop(held);
        // Dead slots are reclaimed on the next begin.
        assert!(engine.begin_read().is_ok());
    }
}
