//! Open/close lifecycle and the small set of operations that don't
//! need a client-held [`Transaction`]: a direct-read shortcut and the
//! synchronous GC trigger.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::FileExt;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::error::{CResult, Error};
use crate::ephemeron::Ephemerons;
use crate::frame::Frames;
use crate::hash::{Hash, SHORT_HASH_LEN};
use crate::tx::Transaction;
use crate::writer::{CommitRequest, Writer};

/// Volatile resources stowed but not yet visible in the backend's
/// stowage table, keyed by shortHash.
pub(crate) type StowBuffer = HashMap<[u8; SHORT_HASH_LEN], (Hash, Vec<u8>)>;

/// Configuration for [`Db::open`]: map size, and the incremental-GC
/// cadence constants that bound how much GC effort one writer cycle
/// takes on.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// Maximum size, in bytes, the backend's memory map may grow to.
    pub map_size: usize,
    /// Base GC seed count `qc = gc_seed_base + gc_seed_per_delta * |delta|`.
    pub gc_seed_base: usize,
    /// Per-delta-entry contribution to `qc`.
    pub gc_seed_per_delta: usize,
    /// Multiplier turning `qc` into the hard cap `qgc` on one cycle's
    /// GC effort.
    pub gc_budget_multiplier: usize,
    /// Whether the writer calls `fsync` after every commit. Disabling
    /// this trades durability for throughput; it exists for tests and
    /// bulk-load callers, not for ordinary use.
    pub fsync_each_cycle: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            map_size: 10 * 1024 * 1024 * 1024,
            gc_seed_base: 50,
            gc_seed_per_delta: 2,
            gc_budget_multiplier: 5,
            fsync_each_cycle: true,
        }
    }
}

impl OpenOptions {
    pub fn map_size(mut self, bytes: usize) -> Self {
        self.map_size = bytes;
        self
    }

    pub fn gc_seed_base(mut self, n: usize) -> Self {
        self.gc_seed_base = n;
        self
    }

    pub fn gc_seed_per_delta(mut self, n: usize) -> Self {
        self.gc_seed_per_delta = n;
        self
    }

    pub fn gc_budget_multiplier(mut self, n: usize) -> Self {
        self.gc_budget_multiplier = n;
        self
    }

    pub fn fsync_each_cycle(mut self, yes: bool) -> Self {
        self.fsync_each_cycle = yes;
        self
    }
}

/// State shared between every `Db` handle and the writer thread.
/// Deliberately separate from the `Db` struct itself: the writer holds
/// an `Arc<Shared>` of its own, but never a full `Db` (and so never a
/// commit-queue `Sender`), or dropping the last `Db` handle would
/// never close the channel the writer is blocked reading from.
pub(crate) struct Shared {
    pub(crate) backend: Backend,
    pub(crate) frames: Frames,
    pub(crate) ephemerons: Ephemerons,
    pub(crate) stow_buffer: Mutex<StowBuffer>,
}

/// A persistent content-addressed key-value engine.
///
/// Cloning a `Db` is cheap (it's a handle over shared, reference-counted
/// state); the underlying database is closed once every clone is
/// dropped.
#[derive(Clone)]
pub struct Db {
    pub(crate) shared: Arc<Shared>,
    pub(crate) commit_tx: crossbeam_channel::Sender<CommitRequest>,
    // Held only to keep the advisory file lock alive for this handle's
    // lifetime; never read.
    _lock_file: Arc<File>,
}

impl Db {
    /// Opens (creating if absent) the database rooted at `path`.
    ///
    /// Takes an exclusive advisory lock on `path/LOCK` -- a second
    /// `open` of the same path, from this or any other process, fails
    /// until every handle on the first is dropped.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> CResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let lock_file = File::options().read(true).write(true).create(true).open(path.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            Error::Internal(format!("database at {:?} is already locked by another process", path))
        })?;

        let backend = Backend::open(&path, options.map_size)?;
        let shared = Arc::new(Shared {
            backend,
            frames: Frames::new(),
            ephemerons: Ephemerons::new(),
            stow_buffer: Mutex::new(StowBuffer::new()),
        });

        let (commit_tx, commit_rx) = crossbeam_channel::unbounded();

        {
            let writer_shared = shared.clone();
            let writer_options = options.clone();
            std::thread::Builder::new()
                .name("stowdb-writer".to_string())
                .spawn(move || Writer::new(writer_shared, commit_rx, writer_options).run())
                .map_err(Error::Io)?;
        }

        log::info!("stowdb: opened database at {:?}", path);
        Ok(Db { shared, commit_tx, _lock_file: Arc::new(lock_file) })
    }

    /// Begins a new transaction with empty read and write sets.
    pub fn begin(&self) -> CResult<Transaction> {
        Ok(Transaction::new(self.clone()))
    }

    /// Shortcut for `self.begin()?.read(key)`, for callers that only
    /// need a single point-in-time read and have no ongoing TX to
    /// batch it with.
    pub fn read(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.begin()?.read(key)
    }

    /// Forces a synchronous incremental-GC cycle: submits an empty
    /// commit and waits for the writer's reply.
    pub fn gc(&self) -> CResult<()> {
        self.begin()?.commit()?;
        Ok(())
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.shared.backend
    }

    pub(crate) fn frames(&self) -> &Frames {
        &self.shared.frames
    }

    pub(crate) fn ephemerons(&self) -> &Ephemerons {
        &self.shared.ephemerons
    }

    pub(crate) fn stow_buffer(&self) -> &Mutex<StowBuffer> {
        &self.shared.stow_buffer
    }

    pub(crate) fn commit_sender(&self) -> &crossbeam_channel::Sender<CommitRequest> {
        &self.commit_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_twice_on_the_same_path_fails_the_second_time() {
        let dir = tempdir().unwrap();
        let _db = Db::open(dir.path(), OpenOptions::default()).unwrap();
        let second = Db::open(dir.path(), OpenOptions::default());
        assert!(second.is_err());
    }

    #[test]
    fn direct_read_on_empty_db_is_empty() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path(), OpenOptions::default()).unwrap();
        assert_eq!(db.read(b"missing").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn reopen_after_close_succeeds() {
        let dir = tempdir().unwrap();
        {
            let _db = Db::open(dir.path(), OpenOptions::default()).unwrap();
        }
        let _db2 = Db::open(dir.path(), OpenOptions::default()).unwrap();
    }
}
