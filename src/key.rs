//! Key validation and the hash-rewrite fallback for oversized or
//! control-prefixed keys.

use crate::error::{CResult, Error};
use crate::hash::{self, HASH_LEN};

/// Largest key accepted without rewriting.
pub const MAX_KEY_LEN: usize = 255;

/// First byte of a rewritten key, used to tell it apart from a
/// directly-stored key (whose first byte is always `>= 0x20`).
pub const KEY_REWRITE_MARKER: u8 = 0x1A;

/// Returns `true` if `key` can be stored as-is: non-empty, at most
/// [`MAX_KEY_LEN`] bytes, first byte `>= 0x20`.
pub fn is_storable_as_is(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN && key[0] >= 0x20
}

/// Maps a client-supplied key to the form actually stored in the
/// backend's root table.
///
/// An empty key is rejected outright. A non-empty key that is too long
/// or starts with a control byte is rewritten, deterministically and
/// invisibly to the caller, to `0x1A ++ hash(key)`: callers that
/// present the same oversized key again compute the same rewritten
/// form and so transparently round-trip through the same backend row.
pub fn normalize(key: &[u8]) -> CResult<Vec<u8>> {
    if key.is_empty() {
        return Err(Error::TooLarge("key must not be empty".to_string()));
    }
    if is_storable_as_is(key) {
        return Ok(key.to_vec());
    }
    let mut out = Vec::with_capacity(1 + HASH_LEN);
    out.push(KEY_REWRITE_MARKER);
    out.extend_from_slice(hash::hash(key).as_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        assert!(normalize(b"").is_err());
    }

    #[test]
    fn ordinary_key_passes_through() {
        assert_eq!(normalize(b"hello").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn oversized_key_is_rewritten_and_stable() {
        let long_key = vec![b'x'; 256];
        let rewritten1 = normalize(&long_key).unwrap();
        let rewritten2 = normalize(&long_key).unwrap();
        assert_eq!(rewritten1, rewritten2);
        assert_eq!(rewritten1[0], KEY_REWRITE_MARKER);
        assert_eq!(rewritten1.len(), 1 + HASH_LEN);
    }

    #[test]
    fn control_prefixed_key_is_rewritten() {
        let key = [0x01, b'a', b'b'];
        let rewritten = normalize(&key).unwrap();
        assert_eq!(rewritten[0], KEY_REWRITE_MARKER);
    }

    #[test]
    fn max_length_key_is_not_rewritten() {
        let key = vec![b'x'; MAX_KEY_LEN];
        assert_eq!(normalize(&key).unwrap(), key);
    }
}
