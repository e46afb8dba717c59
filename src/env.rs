//! Environment lifecycle. An environment is created unconfigured, tuned
//! with the `env_set_*` calls, opened against a path, and closed once no
//! transactions remain. Opening spawns the environment's writer thread and
//! its single-writer gate; both live as long as the environment.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::constants::{
    codes, CopyFlags, EnvFlags, DATA_FILE, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_READERS, MAX_KEY_SIZE,
};
use crate::dispatch::{WriterContext, WriterGate};
use crate::engine::{io_status, Engine, EngineConfig, EnvInfo, Stat};
use crate::error::{Error, Result, UsageError};
use crate::handle::{DbHandle, EnvHandle, HandleTable};
use crate::Bridge;

struct EnvConfig {
    map_size: usize,
    max_readers: u32,
    max_dbs: u32,
}

enum EnvPhase {
    Created,
    Open { engine: Arc<Engine>, path: PathBuf, flags: EnvFlags },
}

/// A cached database handle of one environment. `dbi` is the engine's
/// stable index for the database.
pub(crate) struct DbSlot {
    pub dbi: u32,
    pub name: Option<String>,
}

/// Per-environment database handle cache, memoizing name resolution so a
/// repeat open returns the existing handle without touching the engine.
pub(crate) struct DbRegistry {
    pub table: HandleTable<DbSlot>,
    pub by_name: HashMap<Option<String>, DbHandle>,
}

pub(crate) struct Environment {
    cfg: Mutex<EnvConfig>,
    phase: RwLock<EnvPhase>,
    pub(crate) gate: WriterGate,
    writer: OnceCell<WriterContext>,
    pub(crate) live_txns: AtomicUsize,
    pub(crate) dbs: Mutex<DbRegistry>,
}

impl Environment {
    fn new() -> Environment {
        Environment {
            cfg: Mutex::new(EnvConfig {
                map_size: DEFAULT_MAP_SIZE,
                max_readers: DEFAULT_MAX_READERS,
                max_dbs: DEFAULT_MAX_DBS,
            }),
            phase: RwLock::new(EnvPhase::Created),
            gate: WriterGate::new(),
            writer: OnceCell::new(),
            live_txns: AtomicUsize::new(0),
            dbs: Mutex::new(DbRegistry { table: HandleTable::new(), by_name: HashMap::new() }),
        }
    }

    fn configure<F: FnOnce(&mut EnvConfig)>(&self, f: F) -> Result<()> {
        let phase = self.phase.read();
        if let EnvPhase::Open { .. } = *phase {
            return Err(Error::Usage(UsageError::ConfigAfterOpen));
        }
        f(&mut self.cfg.lock());
        Ok(())
    }

    fn open(&self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()> {
        let mut phase = self.phase.write();
        if let EnvPhase::Open { .. } = *phase {
            return Err(Error::from_code(codes::EINVAL));
        }
        let cfg = {
            let cfg = self.cfg.lock();
            EngineConfig {
                map_size: cfg.map_size,
                max_readers: cfg.max_readers,
                max_dbs: cfg.max_dbs,
            }
        };
        let engine =
            Arc::new(Engine::open(path, flags, &cfg, mode).map_err(|s| Error::from_code(s.0))?);
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "env".to_string());
        let _ = self.writer.set(WriterContext::spawn(&label));
        *phase = EnvPhase::Open { engine, path: path.to_path_buf(), flags };
        info!("environment opened at {}", path.display());
        Ok(())
    }

    pub(crate) fn engine(&self) -> Result<Arc<Engine>> {
        match &*self.phase.read() {
            EnvPhase::Open { engine, .. } => Ok(engine.clone()),
            EnvPhase::Created => Err(Error::Usage(UsageError::EnvNotOpen)),
        }
    }

    pub(crate) fn flags(&self) -> Result<EnvFlags> {
        match &*self.phase.read() {
            EnvPhase::Open { flags, .. } => Ok(*flags),
            EnvPhase::Created => Err(Error::Usage(UsageError::EnvNotOpen)),
        }
    }

    fn path(&self) -> Result<PathBuf> {
        match &*self.phase.read() {
            EnvPhase::Open { path, .. } => Ok(path.clone()),
            EnvPhase::Created => Err(Error::Usage(UsageError::EnvNotOpen)),
        }
    }

    /// Run a closure on the environment's writer thread.
    pub(crate) fn run_write<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        match self.writer.get() {
            Some(ctx) => ctx.run(f),
            None => Err(Error::Usage(UsageError::EnvNotOpen)),
        }
    }
}

impl Bridge {
    /// Create an unconfigured environment.
    pub fn env_create(&self) -> EnvHandle {
        let mut envs = self.inner.envs.lock();
        EnvHandle(envs.insert(Arc::new(Environment::new())))
    }

    /// Set the upper bound for the persisted image. Only before open.
    pub fn env_set_map_size(&self, env: EnvHandle, size: usize) -> Result<()> {
        self.inner.env(env)?.configure(|cfg| cfg.map_size = size)
    }

    /// Set the reader-slot capacity. Only before open.
    pub fn env_set_max_readers(&self, env: EnvHandle, readers: u32) -> Result<()> {
        self.inner.env(env)?.configure(|cfg| cfg.max_readers = readers)
    }

    /// Set how many named databases may exist. Only before open.
    pub fn env_set_max_dbs(&self, env: EnvHandle, dbs: u32) -> Result<()> {
        self.inner.env(env)?.configure(|cfg| cfg.max_dbs = dbs)
    }

    /// Open the environment at `path` and spawn its writer thread.
    pub fn env_open(&self, env: EnvHandle, path: &Path, flags: EnvFlags, mode: u32) -> Result<()> {
        self.inner.env(env)?.open(path, flags, mode)
    }

    /// Close the environment. Refused while any of its transactions is
    /// live; the count is reported so the host can find the leak.
    pub fn env_close(&self, env: EnvHandle) -> Result<()> {
        let mut envs = self.inner.envs.lock();
        let environment = envs.get(env.0)?.clone();
        let live = environment.live_txns.load(std::sync::atomic::Ordering::Acquire);
        if live > 0 {
            return Err(Error::Usage(UsageError::EnvBusy { live_txns: live }));
        }
        envs.remove(env.0)?;
        debug!("environment closed");
        // The writer thread stops when the last reference drops.
        Ok(())
    }

    pub fn env_stat(&self, env: EnvHandle) -> Result<Stat> {
        Ok(self.inner.env(env)?.engine()?.stat())
    }

    pub fn env_info(&self, env: EnvHandle) -> Result<EnvInfo> {
        Ok(self.inner.env(env)?.engine()?.info())
    }

    /// Flush the committed state to disk, even under NOSYNC.
    pub fn env_sync(&self, env: EnvHandle, force: bool) -> Result<()> {
        let engine = self.inner.env(env)?.engine()?;
        engine.sync(force).map_err(|s| Error::from_code(s.0))
    }

    /// Effective environment flags, including runtime sync toggles.
    pub fn env_flags(&self, env: EnvHandle) -> Result<EnvFlags> {
        Ok(self.inner.env(env)?.engine()?.effective_flags())
    }

    /// Toggle the runtime-changeable durability flags (NOSYNC/NOMETASYNC).
    pub fn env_set_flags(&self, env: EnvHandle, flags: EnvFlags, on: bool) -> Result<()> {
        let engine = self.inner.env(env)?.engine()?;
        engine.set_flags(flags, on).map_err(|s| Error::from_code(s.0))
    }

    /// Descriptor of the data file backing the environment.
    #[cfg(unix)]
    pub fn env_fd(&self, env: EnvHandle) -> Result<std::os::unix::io::RawFd> {
        Ok(self.inner.env(env)?.engine()?.raw_fd())
    }

    pub fn env_path(&self, env: EnvHandle) -> Result<PathBuf> {
        self.inner.env(env)?.path()
    }

    pub fn env_max_readers(&self, env: EnvHandle) -> Result<u32> {
        Ok(self.inner.env(env)?.engine()?.max_readers())
    }

    /// Largest accepted key, in bytes.
    pub fn env_max_key_size(&self, _env: EnvHandle) -> usize {
        MAX_KEY_SIZE
    }

    /// Write a consistent copy of the environment under `path`. The target
    /// follows the environment's NOSUBDIR convention.
    pub fn env_copy(&self, env: EnvHandle, path: &Path, _flags: CopyFlags) -> Result<()> {
        let environment = self.inner.env(env)?;
        let engine = environment.engine()?;
        let target = if environment.flags()?.contains(EnvFlags::NOSUBDIR) {
            path.to_path_buf()
        } else {
            if !path.is_dir() {
                return Err(Error::from_code(codes::ENOENT));
            }
            path.join(DATA_FILE)
        };
        let image = engine.copy_image();
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&target)?;
            file.write_all(&image)?;
            file.sync_all()
        };
        write().map_err(|e| Error::from_code(io_status(&e).0))
    }

    /// Write a consistent copy of the environment to an open descriptor.
    #[cfg(unix)]
    pub fn env_copy_fd(&self, env: EnvHandle, fd: std::os::unix::io::RawFd) -> Result<()> {
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        let engine = self.inner.env(env)?.engine()?;
        let image = engine.copy_image();
        // Safety: the caller owns the descriptor; into_raw_fd gives it back
        // without closing.
        let mut file = unsafe { File::from_raw_fd(fd) };
        let mut write = || -> std::io::Result<()> {
            file.write_all(&image)?;
            file.flush()
        };
        let outcome = write();
        let _ = file.into_raw_fd();
        outcome.map_err(|e| Error::from_code(io_status(&e).0))
    }

    /// Clear reader slots left behind by vanished readers. Returns how many
    /// were reclaimed.
    pub fn env_reader_check(&self, env: EnvHandle) -> Result<usize> {
        Ok(self.inner.env(env)?.engine()?.reader_check())
    }

    /// Snapshot transaction ids of the live readers.
    pub fn env_reader_list(&self, env: EnvHandle) -> Result<Vec<u64>> {
        Ok(self.inner.env(env)?.engine()?.reader_list())
    }
}
