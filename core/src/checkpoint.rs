//! Hard-coded and file-loaded chain checkpoints.
//!
//! A block at a checkpointed height must carry exactly the recorded
//! hash; any branch contradicting a checkpoint is rejected outright.

use crate::crypto::Hash;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Embedded mainnet checkpoints.
const EMBEDDED: &[(u64, &str)] = &[
    (
        15191,
        "983ccab3bc1dbd67d2f7caef25571e91f2ab1f3f7fbfb9437033c2c01e1440a1",
    ),
    (
        16334,
        "74ac00598a5e89b5a865919758bbeef3513c6d8a75d4ea315c0cdd7350106809",
    ),
];

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("checkpoint line {line}: expected `height,hash`")]
    Malformed { line: usize },
    #[error("checkpoint line {line}: bad height")]
    BadHeight { line: usize },
    #[error("checkpoint line {line}: bad block hash")]
    BadHash { line: usize },
    // Duplicate heights with different hashes mean the operator's inputs
    // disagree about history; refusing to start is the only safe answer.
    #[error("conflicting checkpoints at height {height}: {existing} vs {incoming}")]
    Conflict {
        height: u64,
        existing: Hash,
        incoming: Hash,
    },
}

#[derive(Clone, Default)]
pub struct Checkpoints {
    points: BTreeMap<u64, Hash>,
}

impl Checkpoints {
    pub fn new() -> Checkpoints {
        Checkpoints::default()
    }

    /// The compiled-in list.
    pub fn embedded() -> Checkpoints {
        let mut cp = Checkpoints::new();
        for &(height, hash) in EMBEDDED {
            let hash = Hash::from_hex(hash).expect("embedded checkpoint hash");
            cp.add(height, hash).expect("embedded checkpoints conflict");
        }
        cp
    }

    pub fn add(&mut self, height: u64, hash: Hash) -> Result<(), CheckpointError> {
        if let Some(&existing) = self.points.get(&height) {
            if existing != hash {
                return Err(CheckpointError::Conflict {
                    height,
                    existing,
                    incoming: hash,
                });
            }
            return Ok(());
        }
        self.points.insert(height, hash);
        Ok(())
    }

    /// Merge CSV checkpoints (`height,hex_hash` per line; blank lines
    /// and `#` comments ignored). Any parse error is fatal.
    pub fn load_csv(&mut self, path: &Path) -> Result<usize, CheckpointError> {
        let text = fs::read_to_string(path)
            .map_err(|e| CheckpointError::Io(path.display().to_string(), e))?;
        let mut loaded = 0;
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (height_str, hash_str) = trimmed
                .split_once(',')
                .ok_or(CheckpointError::Malformed { line })?;
            let height: u64 = height_str
                .trim()
                .parse()
                .map_err(|_| CheckpointError::BadHeight { line })?;
            let hash = Hash::from_hex(hash_str.trim())
                .map_err(|_| CheckpointError::BadHash { line })?;
            self.add(height, hash)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_checkpointed(&self, height: u64) -> bool {
        self.points.contains_key(&height)
    }

    /// True if a block with this (height, hash) is compatible with the
    /// table: either the height is unconstrained or the hash matches.
    pub fn check_block(&self, height: u64, hash: &Hash) -> bool {
        match self.points.get(&height) {
            Some(expected) => expected == hash,
            None => true,
        }
    }

    /// Heights at or below the last checkpoint may never be rolled back.
    pub fn top_checkpoint_height(&self) -> u64 {
        self.points.keys().next_back().copied().unwrap_or(0)
    }

    pub fn is_reorg_allowed(&self, split_height: u64) -> bool {
        split_height >= self.top_checkpoint_height()
    }
}

impl fmt::Debug for Checkpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checkpoints({} entries)", self.points.len())
    }
}
