//! Thin adapter over the memory-mapped, ordered key-value backend.
//!
//! Four named tables live in one `heed` environment: roots (`@`),
//! stowage (`$`), refcounts (`#`) and the zero-set (`0`). The adapter
//! does not run its own reader-lock accounting -- that is the engine's
//! job (see [`crate::writer`]) -- it only exposes read/write
//! transactions and per-table get/put/delete/iter.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use crate::error::CResult;

/// A read-only transaction borrowed from the backend.
pub type RTxn<'e> = heed::RoTxn<'e>;

/// The single writer transaction in flight at any time.
pub type WTxn<'e> = heed::RwTxn<'e>;

const ROOTS_DB: &str = "@";
const STOW_DB: &str = "$";
const REFCOUNTS_DB: &str = "#";
const ZEROSET_DB: &str = "0";

/// The four-table mmap backend.
#[derive(Clone)]
pub struct Backend {
    env: Env,
    roots: Database<Bytes, Bytes>,
    stow: Database<Bytes, Bytes>,
    refcounts: Database<Bytes, Bytes>,
    zeroset: Database<Bytes, Bytes>,
}

impl Backend {
    /// Opens (creating if absent) the backend rooted at `path`, with a
    /// map sized to hold up to `max_bytes`.
    pub fn open(path: &Path, max_bytes: usize) -> CResult<Self> {
        std::fs::create_dir_all(path)?;
        // Safety: `path` is exclusively ours -- `Db::open` takes the
        // directory's advisory file lock before calling here.
        let env = unsafe { EnvOpenOptions::new().map_size(max_bytes).max_dbs(4).open(path)? };

        let mut wtxn = env.write_txn()?;
        let roots = env.create_database(&mut wtxn, Some(ROOTS_DB))?;
        let stow = env.create_database(&mut wtxn, Some(STOW_DB))?;
        let refcounts = env.create_database(&mut wtxn, Some(REFCOUNTS_DB))?;
        let zeroset = env.create_database(&mut wtxn, Some(ZEROSET_DB))?;
        wtxn.commit()?;

        Ok(Backend { env, roots, stow, refcounts, zeroset })
    }

    pub fn begin_read(&self) -> CResult<RTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    pub fn begin_write(&self) -> CResult<WTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    /// Commits `w`. This is the point at which the mmap frame swaps;
    /// the writer is responsible for the reader-frame handshake around
    /// this call (see `writer::Writer`).
    pub fn commit(&self, w: WTxn<'_>) -> CResult<()> {
        w.commit()?;
        Ok(())
    }

    /// Flushes the backend's data file to durable storage. Commits do
    /// not imply a sync; callers that need durability call this
    /// explicitly after `commit`.
    pub fn fsync(&self) -> CResult<()> {
        self.env.force_sync()?;
        Ok(())
    }

    // -- roots --------------------------------------------------------

    pub fn get_root<'t>(&self, rtxn: &'t RTxn<'_>, key: &[u8]) -> CResult<Option<&'t [u8]>> {
        Ok(self.roots.get(rtxn, key)?)
    }

    pub fn put_root(&self, wtxn: &mut WTxn<'_>, key: &[u8], value: &[u8]) -> CResult<()> {
        self.roots.put(wtxn, key, value)?;
        Ok(())
    }

    pub fn delete_root(&self, wtxn: &mut WTxn<'_>, key: &[u8]) -> CResult<()> {
        self.roots.delete(wtxn, key)?;
        Ok(())
    }

    // -- stowage --------------------------------------------------------

    /// Looks up a stowed blob by its shortHash. The returned slice is
    /// `hashSuffix ++ blob` with no further framing.
    pub fn get_stow<'t>(&self, rtxn: &'t RTxn<'_>, short_hash: &[u8]) -> CResult<Option<&'t [u8]>> {
        Ok(self.stow.get(rtxn, short_hash)?)
    }

    /// Inserts a new stowed blob. Callers must already have checked
    /// the shortHash is absent; insertion here is unconditional.
    pub fn put_stow(&self, wtxn: &mut WTxn<'_>, short_hash: &[u8], suffix_and_blob: &[u8]) -> CResult<()> {
        self.stow.put(wtxn, short_hash, suffix_and_blob)?;
        Ok(())
    }

    pub fn delete_stow(&self, wtxn: &mut WTxn<'_>, short_hash: &[u8]) -> CResult<()> {
        self.stow.delete(wtxn, short_hash)?;
        Ok(())
    }

    // -- refcounts --------------------------------------------------------

    pub fn get_refcount(&self, wtxn: &WTxn<'_>, short_hash: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.refcounts.get(wtxn, short_hash)?.map(|v| v.to_vec()))
    }

    pub fn put_refcount(&self, wtxn: &mut WTxn<'_>, short_hash: &[u8], encoded: &[u8]) -> CResult<()> {
        self.refcounts.put(wtxn, short_hash, encoded)?;
        Ok(())
    }

    pub fn delete_refcount(&self, wtxn: &mut WTxn<'_>, short_hash: &[u8]) -> CResult<()> {
        self.refcounts.delete(wtxn, short_hash)?;
        Ok(())
    }

    // -- zero-set --------------------------------------------------------

    pub fn zeroset_contains(&self, wtxn: &WTxn<'_>, short_hash: &[u8]) -> CResult<bool> {
        Ok(self.zeroset.get(wtxn, short_hash)?.is_some())
    }

    pub fn zeroset_insert(&self, wtxn: &mut WTxn<'_>, short_hash: &[u8]) -> CResult<()> {
        self.zeroset.put(wtxn, short_hash, &[])?;
        Ok(())
    }

    pub fn zeroset_delete(&self, wtxn: &mut WTxn<'_>, short_hash: &[u8]) -> CResult<()> {
        self.zeroset.delete(wtxn, short_hash)?;
        Ok(())
    }

    /// Materializes every shortHash currently in the zero-set. Callers
    /// apply their own hold predicate afterwards; the backend has no
    /// notion of ephemerons or frame holds.
    pub fn zeroset_all(&self, wtxn: &WTxn<'_>) -> CResult<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for item in self.zeroset.iter(wtxn)? {
            let (k, _) = item?;
            out.push(k.to_vec());
        }
        Ok(out)
    }
}
