//! Persistent per-hash reference counts and the zero-set GC index.
//!
//! All operations here run inside the writer's single [`WTxn`]; there
//! is no internal locking, since the writer thread is the only caller.

use crate::backend::{Backend, WTxn};
use crate::error::{CResult, Error};

/// Reads the current count for `short_hash`, or 0 if absent from both
/// the refcount table and the zero-set.
pub fn get(backend: &Backend, wtxn: &WTxn<'_>, short_hash: &[u8]) -> CResult<u64> {
    match backend.get_refcount(wtxn, short_hash)? {
        Some(encoded) => decode(&encoded),
        None => Ok(0),
    }
}

/// Sets the count for `short_hash` to `n`. `n = 0` moves the
/// short-hash into the zero-set; any other value moves it into the
/// refcount table, ASCII-decimal encoded with no leading zero.
pub fn set(backend: &Backend, wtxn: &mut WTxn<'_>, short_hash: &[u8], n: u64) -> CResult<()> {
    if n == 0 {
        backend.delete_refcount(wtxn, short_hash)?;
        backend.zeroset_insert(wtxn, short_hash)?;
    } else {
        backend.zeroset_delete(wtxn, short_hash)?;
        backend.put_refcount(wtxn, short_hash, &encode(n))?;
    }
    Ok(())
}

/// Pops up to `limit` short-hashes from the zero-set, skipping any for
/// which `forbidden` returns `true`. Popped entries are removed from
/// the zero-set; callers that decide a popped entry must survive after
/// all are responsible for calling [`set`] again to reinstate it.
pub fn take(
    backend: &Backend,
    wtxn: &mut WTxn<'_>,
    limit: usize,
    mut forbidden: impl FnMut(&[u8]) -> bool,
) -> CResult<Vec<Vec<u8>>> {
    let mut taken = Vec::with_capacity(limit);
    for short_hash in backend.zeroset_all(wtxn)? {
        if taken.len() >= limit {
            break;
        }
        if forbidden(&short_hash) {
            continue;
        }
        taken.push(short_hash);
    }
    for short_hash in &taken {
        backend.zeroset_delete(wtxn, short_hash)?;
    }
    Ok(taken)
}

fn encode(n: u64) -> Vec<u8> {
    debug_assert!(n > 0, "zero must be represented by zero-set membership, not an encoded 0");
    n.to_string().into_bytes()
}

fn decode(bytes: &[u8]) -> CResult<u64> {
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::Corrupt("refcount entry is not valid ASCII".to_string()))?;
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
        return Err(Error::Corrupt(format!("malformed refcount encoding {:?}", s)));
    }
    s.parse::<u64>().map_err(|_| Error::Corrupt(format!("unparsable refcount encoding {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_backend() -> (tempfile::TempDir, Backend) {
        let dir = tempdir().unwrap();
        let backend = Backend::open(dir.path(), 10 * 1024 * 1024).unwrap();
        (dir, backend)
    }

    #[test]
    fn fresh_short_hash_has_count_zero() {
        let (_dir, backend) = open_backend();
        let wtxn = backend.begin_write().unwrap();
        assert_eq!(get(&backend, &wtxn, b"abc").unwrap(), 0);
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, backend) = open_backend();
        let mut wtxn = backend.begin_write().unwrap();
        set(&backend, &mut wtxn, b"abc", 3).unwrap();
        assert_eq!(get(&backend, &wtxn, b"abc").unwrap(), 3);
        backend.commit(wtxn).unwrap();
    }

    #[test]
    fn setting_to_zero_moves_into_zero_set() {
        let (_dir, backend) = open_backend();
        let mut wtxn = backend.begin_write().unwrap();
        set(&backend, &mut wtxn, b"abc", 2).unwrap();
        set(&backend, &mut wtxn, b"abc", 0).unwrap();
        assert_eq!(get(&backend, &wtxn, b"abc").unwrap(), 0);
        let taken = take(&backend, &mut wtxn, 10, |_| false).unwrap();
        assert_eq!(taken, vec![b"abc".to_vec()]);
    }

    #[test]
    fn take_honors_forbidden_predicate() {
        let (_dir, backend) = open_backend();
        let mut wtxn = backend.begin_write().unwrap();
        set(&backend, &mut wtxn, b"abc", 0).unwrap();
        set(&backend, &mut wtxn, b"xyz", 0).unwrap();
        let taken = take(&backend, &mut wtxn, 10, |s| s == b"abc").unwrap();
        assert_eq!(taken, vec![b"xyz".to_vec()]);
    }
}
