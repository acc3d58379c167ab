//! Memory-hard digest used to bind node addresses to public keys.
//!
//! Address derivation must be moderately expensive to compute and hard to
//! shortcut with small circuits, so that grinding a key pair to a chosen
//! 40-bit address is impractical. The digest here fills a 2 MiB scratch
//! space from a Salsa20/12 keystream seeded by SHA-512 of the input, walks
//! the scratch space performing data-dependent word swaps against a 64-byte
//! state, and folds state plus scratch through SHA-512. Every pass touches
//! the whole scratch space and each swap depends on the values produced by
//! the previous ones.

use crate::salsa::Salsa12Stream;
use crate::sha512::{sha512, Sha512Hasher};

/// Scratch space size in bytes.
pub const MEMHARD_MEMORY: usize = 1 << 21;

const WORD_COUNT: usize = MEMHARD_MEMORY / 8;

fn read_word(buf: &[u8], word: usize) -> u64 {
    let off = word * 8;
    u64::from_le_bytes(buf[off..off + 8].try_into().expect("8-byte slice"))
}

fn write_word(buf: &mut [u8], word: usize, value: u64) {
    let off = word * 8;
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Compute the 64-byte memory-hard digest of `input`.
#[must_use]
pub fn memory_hard_digest(input: &[u8]) -> [u8; 64] {
    let seed = sha512(input);

    let mut key = [0u8; 32];
    key.copy_from_slice(&seed[..32]);
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&seed[32..40]);

    let mut scratch = vec![0u8; MEMHARD_MEMORY];
    Salsa12Stream::new(&key, &iv).keystream(&mut scratch);

    // Data-dependent swap walk: each pair of scratch words selects a state
    // word and a scratch word to exchange. idx2 may point backwards, so the
    // walk cannot be parallelized or computed lazily.
    let mut state = seed;
    let mut i = 0usize;
    while i + 1 < WORD_COUNT {
        let idx1 = (read_word(&scratch, i) % 8) as usize;
        let idx2 = (read_word(&scratch, i + 1) % WORD_COUNT as u64) as usize;
        let state_word = read_word(&state, idx1);
        let scratch_word = read_word(&scratch, idx2);
        write_word(&mut state, idx1, scratch_word);
        write_word(&mut scratch, idx2, state_word);
        i += 2;
    }

    let mut hasher = Sha512Hasher::new();
    hasher.update(&state);
    hasher.update(&scratch);
    hasher.finalize()
}
