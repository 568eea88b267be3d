//! The single serial writer actor: drains the commit queue, validates
//! read assumptions, updates refcounts, runs bounded incremental GC,
//! and advances the reader frame.

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, WTxn};
use crate::db::{OpenOptions, Shared};
use crate::error::{CResult, Error};
use crate::hash::{self, Hash, SHORT_HASH_LEN};
use crate::refcount;

type ShortHash = [u8; SHORT_HASH_LEN];

/// One pending commit: the read assumptions and buffered writes a
/// `Transaction` submitted, plus the channel its caller is waiting on.
pub(crate) struct CommitRequest {
    pub reads: HashMap<Vec<u8>, Vec<u8>>,
    pub writes: HashMap<Vec<u8>, Vec<u8>>,
    pub reply: tokio::sync::oneshot::Sender<bool>,
}

pub(crate) struct Writer {
    shared: std::sync::Arc<Shared>,
    commit_rx: crossbeam_channel::Receiver<CommitRequest>,
    options: OpenOptions,
    /// ShortHashes mentioned by values overwritten in the previous
    /// cycle. Readers on the frame retired by that cycle may still be
    /// resolving these; protect them from this cycle's GC too (the
    /// "two-frame hold set").
    hold_from_previous_cycle: HashSet<ShortHash>,
}

impl Writer {
    pub(crate) fn new(
        shared: std::sync::Arc<Shared>,
        commit_rx: crossbeam_channel::Receiver<CommitRequest>,
        options: OpenOptions,
    ) -> Self {
        Writer { shared, commit_rx, options, hold_from_previous_cycle: HashSet::new() }
    }

    /// The writer's main loop: blocks for at least one commit request,
    /// drains whatever else has queued up, and runs one batching cycle.
    /// Re-signals itself (without waiting) when a cycle's incremental
    /// GC pass hit its budget cap, so GC keeps making progress even
    /// with no further client commits.
    pub(crate) fn run(mut self) {
        loop {
            let first = match self.commit_rx.recv() {
                Ok(req) => req,
                Err(_) => {
                    log::info!("stowdb: writer shutting down, commit queue closed");
                    return;
                }
            };
            let mut batch = vec![first];
            while let Ok(req) = self.commit_rx.try_recv() {
                batch.push(req);
            }

            loop {
                match self.run_cycle(batch) {
                    Ok(true) => {
                        // GC budget was exhausted; continue without a
                        // new external signal, on an empty batch.
                        batch = Vec::new();
                        continue;
                    }
                    Ok(false) => break,
                    Err(err) => {
                        log::error!("stowdb: writer: fatal error, exiting process: {}", err);
                        std::process::exit(1);
                    }
                }
            }
        }
    }

    /// Runs one batching cycle. Returns `Ok(true)` if the incremental GC
    /// pass hit its budget and should be resumed immediately on the
    /// next (possibly empty) batch.
    fn run_cycle(&mut self, batch: Vec<CommitRequest>) -> CResult<bool> {
        let backend = self.shared.backend.clone();
        let mut wtxn = backend.begin_write()?;

        // Fold the batch in arrival order, validating each commit's
        // read assumptions against already-accepted writes union the
        // backend.
        let mut accepted_writes: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        let mut accepted_replies = Vec::new();
        for req in batch {
            let CommitRequest { reads, writes, reply } = req;
            let mut ok = true;
            for (k, expected) in &reads {
                let current = match accepted_writes.get(k) {
                    Some(v) => v.clone(),
                    None => backend.get_root(&wtxn, k)?.map(|s| s.to_vec()).unwrap_or_default(),
                };
                if &current != expected {
                    ok = false;
                    break;
                }
            }
            if !ok {
                let _ = reply.send(false);
                continue;
            }
            accepted_writes.extend(writes);
            accepted_replies.push(reply);
        }

        // Snapshot the values about to be overwritten.
        let mut overwrites: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        for key in accepted_writes.keys() {
            if let Some(old) = backend.get_root(&wtxn, key)? {
                overwrites.insert(key.clone(), old.to_vec());
            }
        }

        // Resources in the stow buffer not yet in the stowage table.
        let stow_snapshot: Vec<(ShortHash, Hash, Vec<u8>)> = self
            .shared
            .stow_buffer
            .lock()
            .iter()
            .map(|(short, (h, blob))| (*short, *h, blob.clone()))
            .collect();
        let mut new_resources = Vec::new();
        for (short, h, blob) in stow_snapshot {
            if backend.get_stow(&wtxn, &short)?.is_none() {
                new_resources.push((short, h, blob));
            }
        }

        // Refcount deltas.
        let mut delta = compute_deltas(&accepted_writes, &overwrites, &new_resources);

        // Incremental GC, bounded by effort proportional to write size.
        let qc = self.options.gc_seed_base + self.options.gc_seed_per_delta * delta.len();
        let qgc = self.options.gc_budget_multiplier * qc;
        let hold = &self.hold_from_previous_cycle;
        let ephemerons = &self.shared.ephemerons;

        let mut gc_set: HashSet<ShortHash> = HashSet::new();

        // Seed from the persistent zero-set: entries not already being
        // touched by this cycle's own deltas (those are handled by the
        // second seed pass below), not ephemeron-held, not in the
        // previous cycle's hold set.
        {
            let delta_keys: HashSet<ShortHash> = delta.keys().copied().collect();
            let taken = refcount::take(&backend, &mut wtxn, qc, |s| {
                let mut key = [0u8; SHORT_HASH_LEN];
                key.copy_from_slice(s);
                delta_keys.contains(&key) || ephemerons.contains(s) || hold.contains(&key)
            })?;
            for s in taken {
                let mut key = [0u8; SHORT_HASH_LEN];
                key.copy_from_slice(&s);
                gc_set.insert(key);
            }
        }

        // Seed from short-hashes this cycle's own deltas push to (or
        // leave at) zero -- without this, a just-stowed, never
        // referenced resource would wait a full extra cycle before
        // becoming GC-eligible.
        for (&s, &d) in delta.iter() {
            if gc_set.contains(&s) {
                continue;
            }
            let current = refcount::get(&backend, &wtxn, &s)? as i64;
            if current + d <= 0 && !ephemerons.contains(&s) && !hold.contains(&s) {
                gc_set.insert(s);
            }
        }

        let new_resources_by_short: HashMap<ShortHash, &[u8]> =
            new_resources.iter().map(|(s, _, blob)| (*s, blob.as_slice())).collect();

        let mut gc_budget_exhausted = false;
        loop {
            if gc_set.len() >= qgc {
                gc_budget_exhausted = true;
                break;
            }
            let mut newly = Vec::new();
            for s in &gc_set {
                let blob = match new_resources_by_short.get(s) {
                    Some(b) => b.to_vec(),
                    None => match backend.get_stow(&wtxn, s)? {
                        Some(entry) if entry.len() >= SHORT_HASH_LEN => {
                            entry[SHORT_HASH_LEN..].to_vec()
                        }
                        _ => continue,
                    },
                };
                for h in hash::deps(&blob) {
                    let sk = hash::short_key(&h);
                    if gc_set.contains(&sk) || newly.contains(&sk) {
                        continue;
                    }
                    let d = delta.entry(sk).or_insert(0);
                    *d -= 1;
                    let current = refcount::get(&backend, &wtxn, &sk)? as i64;
                    if current + *d <= 0 && !ephemerons.contains(&sk) && !hold.contains(&sk) {
                        newly.push(sk);
                    }
                }
            }
            if newly.is_empty() {
                break;
            }
            for s in newly {
                gc_set.insert(s);
            }
        }

        // Partition new resources: those the same cycle's GC already
        // claims are never durably written at all.
        let mut persist_resources = Vec::new();
        for (short, h, blob) in &new_resources {
            if !gc_set.contains(short) {
                persist_resources.push((*short, *h, blob.clone()));
            }
        }
        drop(new_resources_by_short);

        // Delete GC'd resources and their refcount rows.
        for s in &gc_set {
            backend.delete_stow(&mut wtxn, s)?;
            backend.delete_refcount(&mut wtxn, s)?;
            backend.zeroset_delete(&mut wtxn, s)?;
        }

        // Apply the remaining deltas.
        for (s, d) in &delta {
            if gc_set.contains(s) {
                continue;
            }
            let current = refcount::get(&backend, &wtxn, s)? as i64;
            let resulting = current + d;
            if resulting < 0 {
                return Err(Error::Corrupt(format!(
                    "refcount for short-hash would go negative (current {}, delta {})",
                    current, d
                )));
            }
            refcount::set(&backend, &mut wtxn, s, resulting as u64)?;
        }

        // Persist surviving new resources.
        for (short, h, blob) in &persist_resources {
            let mut entry = Vec::with_capacity(SHORT_HASH_LEN + blob.len());
            entry.extend_from_slice(h.suffix());
            entry.extend_from_slice(blob);
            backend.put_stow(&mut wtxn, short, &entry)?;
        }

        // Batched root updates.
        for (k, v) in &accepted_writes {
            if v.is_empty() {
                backend.delete_root(&mut wtxn, k)?;
            } else {
                backend.put_root(&mut wtxn, k, v)?;
            }
        }

        // Compute the next cycle's two-frame hold set before we touch
        // the frame pointer.
        let mut hold_next: HashSet<ShortHash> = HashSet::new();
        for v in overwrites.values() {
            for h in hash::deps(v) {
                hold_next.insert(hash::short_key(&h));
            }
        }

        // Readers interlock. Swap the frame pointer now (new readers
        // proceed against the fresh frame concurrently with the wait
        // below), then drain the retired one, then commit.
        let retired = self.shared.frames.advance();
        retired.wait_drained();
        backend.commit(wtxn)?;
        self.hold_from_previous_cycle = hold_next;

        if self.options.fsync_each_cycle {
            backend.fsync()?;
        }

        // Reply, then prune the stow buffer.
        for reply in accepted_replies {
            let _ = reply.send(true);
        }
        {
            let mut buf = self.shared.stow_buffer.lock();
            for (short, _, _) in &persist_resources {
                buf.remove(short);
            }
            for short in &gc_set {
                buf.remove(short);
            }
        }

        if gc_budget_exhausted {
            log::info!("stowdb: GC budget exhausted this cycle, resuming on next tick");
        }
        Ok(gc_budget_exhausted)
    }
}

/// Computes the three refcount deltas for one batching cycle: `+1` per
/// mention in a new write, `-1` per mention in an overwritten value,
/// `+0` for every new resource's own short hash (so it appears in the
/// map even if nothing yet references it), and `+1` per mention inside
/// a new resource's own blob.
fn compute_deltas(
    writes: &HashMap<Vec<u8>, Vec<u8>>,
    overwrites: &HashMap<Vec<u8>, Vec<u8>>,
    new_resources: &[(ShortHash, Hash, Vec<u8>)],
) -> HashMap<ShortHash, i64> {
    let mut delta: HashMap<ShortHash, i64> = HashMap::new();
    for v in writes.values() {
        for h in hash::deps(v) {
            *delta.entry(hash::short_key(&h)).or_insert(0) += 1;
        }
    }
    for v in overwrites.values() {
        for h in hash::deps(v) {
            *delta.entry(hash::short_key(&h)).or_insert(0) -= 1;
        }
    }
    for (short, _, _) in new_resources {
        delta.entry(*short).or_insert(0);
    }
    for (_, _, blob) in new_resources {
        for h in hash::deps(blob) {
            *delta.entry(hash::short_key(&h)).or_insert(0) += 1;
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_write_mention_increments_and_overwrite_decrements() {
        let h = hash::hash(b"referenced");
        let mut write_value = b"see ".to_vec();
        write_value.extend_from_slice(h.as_bytes());

        let mut writes = HashMap::new();
        writes.insert(b"root".to_vec(), write_value.clone());
        let mut overwrites = HashMap::new();
        overwrites.insert(b"root".to_vec(), write_value);

        let delta = compute_deltas(&writes, &overwrites, &[]);
        // Same mention appears once as a new write and once as the
        // value it replaced -- net zero.
        assert_eq!(delta.get(&hash::short_key(&h)), Some(&0));
    }

    #[test]
    fn new_resource_with_no_mentions_gets_a_zero_entry() {
        let h = hash::hash(b"abc");
        let new_resources = vec![(hash::short_key(&h), h, b"abc".to_vec())];
        let delta = compute_deltas(&HashMap::new(), &HashMap::new(), &new_resources);
        assert_eq!(delta.get(&hash::short_key(&h)), Some(&0));
    }

    #[test]
    fn new_resource_mentioning_another_increments_it() {
        let ra = hash::hash(b"x y");
        let mut rb_blob = ra.as_bytes().to_vec();
        rb_blob.extend_from_slice(b" z");
        let rb = hash::hash(&rb_blob);

        let new_resources = vec![(hash::short_key(&rb), rb, rb_blob)];
        let delta = compute_deltas(&HashMap::new(), &HashMap::new(), &new_resources);
        assert_eq!(delta.get(&hash::short_key(&ra)), Some(&1));
        assert_eq!(delta.get(&hash::short_key(&rb)), Some(&0));
    }

    #[test]
    fn applying_a_delta_below_existing_zero_is_rejected() {
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let backend = Backend::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let mut wtxn = backend.begin_write().unwrap();

        // Refcount for `s` is absent (0, via zero-set membership).
        // Applying a further -1 delta is exactly the guard the writer
        // checks before calling `refcount::set` when applying deltas.
        let current = refcount::get(&backend, &wtxn, b"nonexistent").unwrap() as i64;
        let resulting = current - 1;
        let result = if resulting < 0 {
            Err(Error::Corrupt("refcount would go negative".to_string()))
        } else {
            refcount::set(&backend, &mut wtxn, b"nonexistent", resulting as u64)
        };
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }
}
