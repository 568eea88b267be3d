//! Secure content hashing and the conservative `deps` scanner.
//!
//! A [`Hash`] is a fixed-width, 60-character base-32 string over a
//! 32-symbol alphabet. The first half (`shortHash`) is used as the
//! lookup key into the stowage table; the second half is only ever
//! compared in constant time (see [`ct_eq`]), so that probing the
//! stowage table for a forged hash does not leak timing information
//! about which short hashes are present.

use std::fmt;
use std::sync::OnceLock;
use subtle::ConstantTimeEq;

use crate::error::{CResult, Error};

/// Total length, in ASCII bytes, of a [`Hash`].
pub const HASH_LEN: usize = 60;

/// Length of the lookup-key half of a [`Hash`].
pub const SHORT_HASH_LEN: usize = HASH_LEN / 2;

/// The 32-symbol alphabet `Hash`es are drawn from: lowercase RFC 4648
/// base-32, chosen because it is disjoint from the separator bytes
/// (space, newline, the `0x1A` key-rewrite marker) callers use to flank
/// an embedded hash, and is therefore self-delimiting under [`deps`].
pub const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz234567";

/// Number of raw bytes drawn from the BLAKE3 XOF before base-32
/// encoding. `40 * 8 = 320` bits encodes to exactly `320 / 5 = 64`
/// base-32 characters with no padding; the first [`HASH_LEN`] of those
/// are kept.
const XOF_BYTES: usize = 40;

fn encoding() -> &'static data_encoding::Encoding {
    static ENCODING: OnceLock<data_encoding::Encoding> = OnceLock::new();
    ENCODING.get_or_init(|| {
        let mut spec = data_encoding::Specification::new();
        spec.symbols.push_str(ALPHABET);
        spec.encoding().expect("fixed 32-symbol alphabet is a valid base32 spec")
    })
}

fn alphabet_table() -> &'static [bool; 256] {
    static TABLE: OnceLock<[bool; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [false; 256];
        for b in ALPHABET.bytes() {
            table[b as usize] = true;
        }
        table
    })
}

/// True if `b` is one of the 32 alphabet symbols a `Hash` is drawn from.
pub fn is_alphabet_byte(b: u8) -> bool {
    alphabet_table()[b as usize]
}

/// A secure hash of a blob's contents: `HASH_LEN` ASCII bytes from
/// [`ALPHABET`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Validates and wraps a raw byte string as a `Hash`. Fails if the
    /// length is wrong or any byte is outside the alphabet.
    pub fn from_bytes(bytes: &[u8]) -> CResult<Self> {
        if bytes.len() != HASH_LEN {
            return Err(Error::TooLarge(format!(
                "hash must be {} bytes, got {}",
                HASH_LEN,
                bytes.len()
            )));
        }
        if !bytes.iter().all(|&b| is_alphabet_byte(b)) {
            return Err(Error::Internal("hash contains non-alphabet byte".to_string()));
        }
        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(bytes);
        Ok(Hash(buf))
    }

    /// The full `HASH_LEN`-byte ASCII representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The first half: the lookup key into the stowage table.
    pub fn short(&self) -> &[u8] {
        &self.0[..SHORT_HASH_LEN]
    }

    /// The second half: only ever compared with [`ct_eq`].
    pub fn suffix(&self) -> &[u8] {
        &self.0[SHORT_HASH_LEN..]
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Safe: every byte was validated to be an ASCII alphabet symbol.
        write!(f, "{}", std::str::from_utf8(&self.0).unwrap_or("<invalid>"))
    }
}

/// Computes the secure hash of a blob's contents.
pub fn hash(data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let mut xof = hasher.finalize_xof();
    let mut raw = [0u8; XOF_BYTES];
    xof.fill(&mut raw);

    let encoded = encoding().encode(&raw);
    let mut buf = [0u8; HASH_LEN];
    buf.copy_from_slice(&encoded.as_bytes()[..HASH_LEN]);
    Hash(buf)
}

/// Conservatively scans `data` for embedded hash mentions: maximal runs
/// of alphabet bytes exactly [`HASH_LEN`] long, flanked by non-alphabet
/// bytes (or the start/end of the slice). Runs of any other length are
/// skipped entirely rather than sub-matched -- false positives are
/// tolerated (they only extend refcount chains harmlessly) but the
/// writer's embedding discipline is what keeps this accurate in
/// practice: every hash it writes out is already flanked by separator
/// bytes outside the alphabet.
pub fn deps(data: &[u8]) -> Vec<Hash> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if is_alphabet_byte(data[i]) {
            let start = i;
            while i < data.len() && is_alphabet_byte(data[i]) {
                i += 1;
            }
            if i - start == HASH_LEN {
                if let Ok(h) = Hash::from_bytes(&data[start..i]) {
                    out.push(h);
                }
            }
        } else {
            i += 1;
        }
    }
    out
}

/// Reduces a [`Hash`] to the fixed-size array form used as a map key
/// for ephemerons, refcount deltas, and frame hold-sets.
pub fn short_key(h: &Hash) -> [u8; SHORT_HASH_LEN] {
    let mut key = [0u8; SHORT_HASH_LEN];
    key.copy_from_slice(h.short());
    key
}

/// Constant-time equality for byte strings of equal length. Used to
/// compare a stowage lookup's hash suffix against the caller's claimed
/// hash, so that probing for a short-hash collision with a wrong
/// suffix takes the same time as a genuine hit.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_right_length() {
        let h1 = hash(b"hello world");
        let h2 = hash(b"hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.as_bytes().len(), HASH_LEN);
        assert_eq!(h1.short().len(), SHORT_HASH_LEN);
        assert_eq!(h1.suffix().len(), HASH_LEN - SHORT_HASH_LEN);
    }

    #[test]
    fn hash_differs_for_different_content() {
        assert_ne!(hash(b"a"), hash(b"b"));
    }

    #[test]
    fn hash_bytes_are_all_alphabet() {
        let h = hash(b"some content");
        assert!(h.as_bytes().iter().all(|&b| is_alphabet_byte(b)));
    }

    #[test]
    fn deps_finds_flanked_hash() {
        let h = hash(b"referenced blob");
        let mut blob = b"see ".to_vec();
        blob.extend_from_slice(h.as_bytes());
        blob.extend_from_slice(b" for details");

        let found = deps(&blob);
        assert_eq!(found, vec![h]);
    }

    #[test]
    fn deps_ignores_runs_of_wrong_length() {
        // A run one byte too short must not be mistaken for a hash.
        let short_run = vec![b'a'; HASH_LEN - 1];
        assert!(deps(&short_run).is_empty());

        // A run one byte too long must not be sub-matched either.
        let long_run = vec![b'a'; HASH_LEN + 1];
        assert!(deps(&long_run).is_empty());
    }

    #[test]
    fn deps_finds_multiple_mentions() {
        let h1 = hash(b"first");
        let h2 = hash(b"second");
        let mut blob = Vec::new();
        blob.extend_from_slice(h1.as_bytes());
        blob.push(b'\n');
        blob.extend_from_slice(h2.as_bytes());

        let found = deps(&blob);
        assert_eq!(found, vec![h1, h2]);
    }

    #[test]
    fn ct_eq_matches_and_detects_mismatch() {
        assert!(ct_eq(b"abcdef", b"abcdef"));
        assert!(!ct_eq(b"abcdef", b"abcdeg"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }

    #[test]
    fn from_bytes_rejects_bad_length_and_alphabet() {
        assert!(Hash::from_bytes(&[b'a'; HASH_LEN - 1]).is_err());
        let mut bad = vec![b'a'; HASH_LEN];
        bad[0] = b'!';
        assert!(Hash::from_bytes(&bad).is_err());
    }
}
