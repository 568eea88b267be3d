//! Client-facing transactions: buffered reads and writes, stowage
//! allocation, ephemeral-root tracking, and commit.

use std::collections::{HashMap, HashSet};

use crate::db::Db;
use crate::error::{CResult, Error};
use crate::hash::{self, Hash};
use crate::key;
use crate::writer::CommitRequest;

/// A client-facing transaction.
///
/// A `Transaction` buffers reads and writes locally; nothing reaches
/// the backend until [`commit`](Transaction::commit) or
/// [`commit_async`](Transaction::commit_async) is called. Internally
/// serialized: safe to move between threads, but a single `Transaction`
/// is not meant to be driven by two threads at once (there is no
/// internal locking -- a `Transaction` is exclusive to whichever caller
/// holds it, enforced via `&mut self` rather than a runtime lock).
pub struct Transaction {
    db: Db,
    write_set: HashMap<Vec<u8>, Vec<u8>>,
    read_set: HashMap<Vec<u8>, Vec<u8>>,
    /// Per-hash hold counts this TX has registered in the DB's
    /// ephemeron table; mirrors the multiset in the global table so
    /// `Drop` and `clear_rsc` know exactly how many times to release.
    eph: HashMap<Hash, usize>,
    /// Hashes this TX has `stow`ed, kept reachable across `clear_rsc`
    /// even before any write mentions them.
    own_stowed: HashSet<Hash>,
}

impl Transaction {
    pub(crate) fn new(db: Db) -> Self {
        Transaction {
            db,
            write_set: HashMap::new(),
            read_set: HashMap::new(),
            eph: HashMap::new(),
            own_stowed: HashSet::new(),
        }
    }

    fn hold_one(&mut self, h: Hash) {
        *self.eph.entry(h).or_insert(0) += 1;
        self.db.ephemerons().add([&h]);
    }

    fn hold_many(&mut self, hashes: impl IntoIterator<Item = Hash>) {
        for h in hashes {
            self.hold_one(h);
        }
    }

    fn release_all(&mut self) {
        for (h, n) in self.eph.drain() {
            self.db.ephemerons().release(std::iter::repeat(&h).take(n));
        }
    }

    /// Returns the current value of `key`: first the write set, then
    /// the read set, then the backend. A backend hit records the read
    /// assumption and bumps ephemerons for every hash the value
    /// mentions. Absent keys read as the empty value.
    pub fn read(&mut self, key: &[u8]) -> CResult<Vec<u8>> {
        let norm = key::normalize(key)?;
        if let Some(v) = self.write_set.get(&norm) {
            return Ok(v.clone());
        }
        if let Some(v) = self.read_set.get(&norm) {
            return Ok(v.clone());
        }

        let value = {
            let _guard = self.db.frames().enter();
            let rtxn = self.db.backend().begin_read()?;
            self.db.backend().get_root(&rtxn, &norm)?.map(|s| s.to_vec()).unwrap_or_default()
        };

        self.read_set.insert(norm, value.clone());
        if !value.is_empty() {
            let deps = hash::deps(&value);
            self.hold_many(deps);
        }
        Ok(value)
    }

    /// Fetches every key in `keys` not already buffered, under a single
    /// read transaction so the whole batch shares one snapshot.
    pub fn read_many(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<Vec<u8>>> {
        let normalized =
            keys.iter().map(|k| key::normalize(k)).collect::<CResult<Vec<_>>>()?;

        let mut out = vec![Vec::new(); normalized.len()];
        let mut missing = Vec::new();
        for (i, k) in normalized.iter().enumerate() {
            if let Some(v) = self.write_set.get(k) {
                out[i] = v.clone();
            } else if let Some(v) = self.read_set.get(k) {
                out[i] = v.clone();
            } else {
                missing.push(i);
            }
        }

        if !missing.is_empty() {
            let _guard = self.db.frames().enter();
            let rtxn = self.db.backend().begin_read()?;
            let mut newly_held = Vec::new();
            for i in missing {
                let k = &normalized[i];
                let value =
                    self.db.backend().get_root(&rtxn, k)?.map(|s| s.to_vec()).unwrap_or_default();
                self.read_set.insert(k.clone(), value.clone());
                if !value.is_empty() {
                    newly_held.extend(hash::deps(&value));
                }
                out[i] = value;
            }
            drop(rtxn);
            self.hold_many(newly_held);
        }
        Ok(out)
    }

    /// Buffers `key ← value` in the write set. An empty `value` means
    /// delete. Takes effect only once `commit`/`commit_async` succeeds.
    pub fn write(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let norm = key::normalize(key)?;
        self.write_set.insert(norm, value);
        Ok(())
    }

    /// Sets (`Some`) or clears (`None`) this TX's read assumption for
    /// `key` without performing a read.
    pub fn assume(&mut self, key: &[u8], value: Option<Vec<u8>>) -> CResult<()> {
        let norm = key::normalize(key)?;
        match value {
            Some(v) => {
                self.read_set.insert(norm, v);
            }
            None => {
                self.read_set.remove(&norm);
            }
        }
        Ok(())
    }

    /// Computes `hash(value)`, queues it in the DB's stow buffer
    /// (immediately visible to any TX's `load`), and bumps this TX's
    /// own ephemeron hold on it so it survives until commit even
    /// though nothing references it yet.
    pub fn stow(&mut self, value: &[u8]) -> CResult<Hash> {
        let h = hash::hash(value);
        {
            let mut buf = self.db.stow_buffer().lock();
            buf.entry(hash::short_key(&h)).or_insert_with(|| (h, value.to_vec()));
        }
        self.own_stowed.insert(h);
        self.hold_one(h);
        Ok(h)
    }

    /// Looks up a stowed resource by hash: the stow buffer first, then
    /// the backend's stowage table with a timing-safe suffix check.
    pub fn load(&self, h: &Hash) -> CResult<Option<Vec<u8>>> {
        self.with_rsc(h, |blob| blob.to_vec())
    }

    /// Zero-copy variant of `load`: `f` sees a byte view valid only for
    /// the duration of the call.
    pub fn with_rsc<R>(&self, h: &Hash, f: impl FnOnce(&[u8]) -> R) -> CResult<Option<R>> {
        if let Some((_, blob)) = self.db.stow_buffer().lock().get(&hash::short_key(h)) {
            return Ok(Some(f(blob)));
        }

        let _guard = self.db.frames().enter();
        let rtxn = self.db.backend().begin_read()?;
        match self.db.backend().get_stow(&rtxn, h.short())? {
            Some(entry) if entry.len() >= hash::SHORT_HASH_LEN => {
                let (suffix, blob) = entry.split_at(hash::SHORT_HASH_LEN);
                if hash::ct_eq(suffix, h.suffix()) {
                    Ok(Some(f(blob)))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    /// Replaces this TX's ephemeron set with exactly the hashes
    /// reachable from its current read/write sets, its own stowed
    /// resources, and `extras`. Adds the new holds before releasing
    /// the old ones, so a resource reachable from both sets is never
    /// momentarily unprotected.
    pub fn clear_rsc(&mut self, extras: &[Hash]) {
        let mut replacement: HashMap<Hash, usize> = HashMap::new();
        for v in self.write_set.values().chain(self.read_set.values()) {
            for h in hash::deps(v) {
                *replacement.entry(h).or_insert(0) += 1;
            }
        }
        for h in &self.own_stowed {
            *replacement.entry(*h).or_insert(0) += 1;
        }
        for h in extras {
            *replacement.entry(*h).or_insert(0) += 1;
        }

        for (h, n) in &replacement {
            for _ in 0..*n {
                self.db.ephemerons().add([h]);
            }
        }
        for (h, n) in self.eph.drain() {
            self.db.ephemerons().release(std::iter::repeat(&h).take(n));
        }
        self.eph = replacement;
    }

    /// Submits this TX's (read set, write set) to the writer and
    /// blocks until it replies. `false` means a read assumption was
    /// stale; the write set is left untouched so the caller can retry.
    /// On success the write set merges into the read set, so a
    /// committed TX can be reused as the starting point for the next
    /// one without re-reading what it just wrote.
    pub fn commit(&mut self) -> CResult<bool> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.db
            .commit_sender()
            .send(CommitRequest {
                reads: self.read_set.clone(),
                writes: self.write_set.clone(),
                reply: reply_tx,
            })
            .map_err(|_| Error::Internal("writer thread is gone".to_string()))?;

        let ok = reply_rx.blocking_recv().unwrap_or(false);
        if ok {
            for (k, v) in self.write_set.drain() {
                self.read_set.insert(k, v);
            }
        }
        Ok(ok)
    }

    /// Same as `commit`, but returns a future instead of blocking the
    /// calling thread; the writer thread itself never awaits, it's
    /// only the caller-side receiver half that's async.
    pub fn commit_async(&mut self) -> CResult<impl std::future::Future<Output = bool> + '_> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.db
            .commit_sender()
            .send(CommitRequest {
                reads: self.read_set.clone(),
                writes: self.write_set.clone(),
                reply: reply_tx,
            })
            .map_err(|_| Error::Internal("writer thread is gone".to_string()))?;

        Ok(async move {
            let ok = reply_rx.await.unwrap_or(false);
            if ok {
                for (k, v) in self.write_set.drain() {
                    self.read_set.insert(k, v);
                }
            }
            ok
        })
    }

    /// Deep-copies this TX's state, duplicating its ephemeron holds so
    /// the fork is independent: releasing one copy's holds does not
    /// affect the other's.
    pub fn dup(&self) -> Self {
        for (h, n) in &self.eph {
            for _ in 0..*n {
                self.db.ephemerons().add([h]);
            }
        }
        Transaction {
            db: self.db.clone(),
            write_set: self.write_set.clone(),
            read_set: self.read_set.clone(),
            eph: self.eph.clone(),
            own_stowed: self.own_stowed.clone(),
        }
    }

    /// Returns every key whose current read assumption disagrees with
    /// the backend's present value.
    pub fn check(&self) -> CResult<Vec<Vec<u8>>> {
        let _guard = self.db.frames().enter();
        let rtxn = self.db.backend().begin_read()?;
        let mut mismatched = Vec::new();
        for (k, expected) in &self.read_set {
            let current = self.db.backend().get_root(&rtxn, k)?.map(|s| s.to_vec()).unwrap_or_default();
            if &current != expected {
                mismatched.push(k.clone());
            }
        }
        Ok(mismatched)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OpenOptions;
    use crate::db::Db;
    use tempfile::tempdir;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path(), OpenOptions::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn write_then_read_observes_own_write_before_commit() {
        let (_dir, db) = open_db();
        let mut tx = db.begin().unwrap();
        tx.write(b"k", b"v".to_vec()).unwrap();
        assert_eq!(tx.read(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn commit_then_fresh_tx_observes_value() {
        let (_dir, db) = open_db();
        let mut tx = db.begin().unwrap();
        tx.write(b"k", b"v".to_vec()).unwrap();
        assert!(tx.commit().unwrap());

        let mut tx2 = db.begin().unwrap();
        assert_eq!(tx2.read(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn stow_then_load_without_commit() {
        let (_dir, db) = open_db();
        let mut tx = db.begin().unwrap();
        let h = tx.stow(b"abc").unwrap();
        assert_eq!(tx.load(&h).unwrap(), Some(b"abc".to_vec()));
    }

    #[test]
    fn rewritten_key_round_trips() {
        let (_dir, db) = open_db();
        let long_key = vec![b'x'; 300];
        let mut tx = db.begin().unwrap();
        tx.write(&long_key, b"value".to_vec()).unwrap();
        assert!(tx.commit().unwrap());

        let mut tx2 = db.begin().unwrap();
        assert_eq!(tx2.read(&long_key).unwrap(), b"value".to_vec());
    }

    #[test]
    fn empty_key_is_rejected() {
        let (_dir, db) = open_db();
        let mut tx = db.begin().unwrap();
        assert!(tx.write(b"", b"value".to_vec()).is_err());
    }

    #[test]
    fn checkpointing_commit_reuses_tx() {
        let (_dir, db) = open_db();
        let mut tx = db.begin().unwrap();
        tx.write(b"k", b"v1".to_vec()).unwrap();
        assert!(tx.commit().unwrap());
        tx.write(b"k", b"v2".to_vec()).unwrap();
        assert!(tx.commit().unwrap());
        drop(tx);

        assert_eq!(db.read(b"k").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn conflicting_commit_is_rejected() {
        let (_dir, db) = open_db();

        let mut tx1 = db.begin().unwrap();
        let mut tx2 = db.begin().unwrap();

        assert_eq!(tx2.read(b"k").unwrap(), Vec::<u8>::new());

        tx1.write(b"k", b"1".to_vec()).unwrap();
        assert!(tx1.commit().unwrap());

        tx2.write(b"k", b"2".to_vec()).unwrap();
        assert!(!tx2.commit().unwrap());

        assert_eq!(db.read(b"k").unwrap(), b"1".to_vec());
    }

    #[test]
    fn batched_reads_share_one_snapshot() {
        let (_dir, db) = open_db();
        let mut reader = db.begin().unwrap();
        let keys = vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()];

        // Establish the snapshot: all three keys read as empty and are
        // now cached in the TX's read set.
        let values = reader.read_many(&keys).unwrap();
        assert_eq!(values, vec![Vec::<u8>::new(), Vec::<u8>::new(), Vec::<u8>::new()]);

        // A different, concurrently-committed TX writes all three keys
        // after the snapshot was taken.
        let mut writer = db.begin().unwrap();
        for k in &keys {
            writer.write(k, b"late".to_vec()).unwrap();
        }
        assert!(writer.commit().unwrap());

        // The reader's view is unaffected: its read set already pinned
        // these keys to empty.
        let values_again = reader.read_many(&keys).unwrap();
        assert_eq!(values_again, vec![Vec::<u8>::new(), Vec::<u8>::new(), Vec::<u8>::new()]);
    }
}
