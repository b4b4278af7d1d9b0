use bincode::{Decode, Encode};
use std::fmt;
use std::str::FromStr;
use tiny_keccak::{Hasher, Keccak, keccakf};

/// 32-byte hash value (block ids, transaction ids, PoW results).
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Hash, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", &hex::encode(self.0)[..16])
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s)
    }
}

/// Keccak-256, the CryptoNote "fast hash". Used for every object id.
pub fn fast_hash(data: &[u8]) -> Hash {
    let mut keccak = Keccak::v256();
    keccak.update(data);
    let mut out = [0u8; 32];
    keccak.finalize(&mut out);
    Hash(out)
}

// Slow-hash geometry. The scratchpad must not fit in L1/L2 for the
// memory-hardness to mean anything; 512 KiB with 2^18 dependent reads
// keeps verification tractable on one worker thread.
const SCRATCHPAD_WORDS: usize = 1 << 16; // 64 Ki u64 = 512 KiB
const MIX_ITERATIONS: usize = 1 << 18;

/// Memory-hard PoW hash: keccak-f[1600] seeded scratchpad, a
/// data-dependent read/write mixing walk, then a final absorb.
///
/// Every step keeps the full 25-word keccak state as the running
/// accumulator, so shortcuts would need the whole scratchpad resident.
pub fn slow_hash(data: &[u8]) -> Hash {
    let seed = fast_hash(data);

    // seed the permutation state from the fast hash and the input length
    let mut state = [0u64; 25];
    for (i, chunk) in seed.0.chunks(8).enumerate() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        state[i] = u64::from_le_bytes(word);
    }
    state[4] = data.len() as u64;
    state[5] = 0x0101010101010101;
    keccakf(&mut state);

    // expand the state into the scratchpad, one permutation per 25 words
    let mut pad = vec![0u64; SCRATCHPAD_WORDS];
    let mut filled = 0;
    while filled < SCRATCHPAD_WORDS {
        let n = 25.min(SCRATCHPAD_WORDS - filled);
        pad[filled..filled + n].copy_from_slice(&state[..n]);
        keccakf(&mut state);
        filled += n;
    }

    // data-dependent mixing walk
    let mask = (SCRATCHPAD_WORDS - 1) as u64;
    let mut acc = state[0];
    for round in 0..MIX_ITERATIONS {
        let idx = (acc ^ state[round % 25]) & mask;
        let word = pad[idx as usize];
        acc = acc
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .rotate_left((word & 63) as u32)
            ^ word;
        pad[idx as usize] = acc.wrapping_add(state[(round + 1) % 25]);
        state[round % 25] ^= acc;
        if round % 25 == 24 {
            keccakf(&mut state);
        }
    }

    // fold the scratchpad back into the state and squeeze
    for (i, word) in pad.iter().enumerate() {
        state[i % 25] ^= word;
        if i % 25 == 24 {
            keccakf(&mut state);
        }
    }
    keccakf(&mut state);

    let mut out = [0u8; 32];
    for i in 0..4 {
        out[i * 8..(i + 1) * 8].copy_from_slice(&state[i].to_le_bytes());
    }
    Hash(out)
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left.0);
    buf[32..].copy_from_slice(&right.0);
    fast_hash(&buf)
}

/// CryptoNote tree hash over the transaction hashes of a block.
///
/// Not a padded Bitcoin merkle: a leading partial level folds the tail
/// down to the largest power of two, then pairs reduce to the root.
pub fn tree_hash(hashes: &[Hash]) -> Hash {
    match hashes.len() {
        0 => fast_hash(&[]),
        1 => hashes[0],
        2 => hash_pair(&hashes[0], &hashes[1]),
        len => {
            let mut cnt = len.next_power_of_two();
            if cnt > len {
                cnt /= 2;
            }

            let mut level: Vec<Hash> = Vec::with_capacity(cnt);
            let untouched = 2 * cnt - len;
            level.extend_from_slice(&hashes[..untouched]);
            let mut i = untouched;
            while i < len {
                level.push(hash_pair(&hashes[i], &hashes[i + 1]));
                i += 2;
            }
            debug_assert_eq!(level.len(), cnt);

            while level.len() > 1 {
                let mut next = Vec::with_capacity(level.len() / 2);
                for pair in level.chunks(2) {
                    next.push(hash_pair(&pair[0], &pair[1]));
                }
                level = next;
            }
            level[0]
        }
    }
}
