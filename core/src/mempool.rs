//! Transaction pool: pending transactions keyed by hash, gated by
//! key-image exclusivity and the fee floor, drained into block
//! templates by descending fee density.

use crate::blockchain::{Blockchain, TxRejectReason};
use crate::crypto::{Hash, KeyImage};
use crate::transaction::Transaction;
use anyhow::Result;
use std::collections::{HashMap, HashSet};

/// Which checks the caller has already performed; signature batches run
/// on the verification workers before a transaction reaches the pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct TxVerifyFlags {
    pub signatures_verified: bool,
}

#[derive(Debug)]
pub enum AddTxResult {
    Added,
    AlreadyHave,
    Rejected(TxRejectReason),
}

#[derive(Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub blob_size: usize,
    pub fee: u64,
    pub receive_time: u64,
    pub key_images: Vec<KeyImage>,
}

impl PoolEntry {
    /// Fee density comparison without floating point:
    /// self.fee/self.size > other.fee/other.size
    fn denser_than(&self, other: &PoolEntry) -> bool {
        (self.fee as u128) * (other.blob_size as u128)
            > (other.fee as u128) * (self.blob_size as u128)
    }
}

#[derive(Default)]
pub struct TxPool {
    entries: HashMap<Hash, PoolEntry>,
    /// invariant: no two entries share a key image
    key_images: HashMap<KeyImage, Hash>,
}

impl TxPool {
    pub fn new() -> TxPool {
        TxPool::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn have_tx(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.entries.get(hash).map(|entry| &entry.tx)
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.entries.keys().copied().collect()
    }

    pub fn uses_key_image(&self, image: &KeyImage) -> bool {
        self.key_images.contains_key(image)
    }

    /// Admit a transaction after policy and contextual validation.
    pub fn add_tx(
        &mut self,
        tx: Transaction,
        chain: &Blockchain,
        flags: TxVerifyFlags,
        now: u64,
    ) -> Result<AddTxResult> {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) || chain.have_transaction(&hash)? {
            return Ok(AddTxResult::AlreadyHave);
        }

        // pool-level gate first: a pending double spend is cheaper to
        // detect than a ring signature check
        for image in tx.key_images() {
            if self.key_images.contains_key(image) {
                return Ok(AddTxResult::Rejected(TxRejectReason::KeyImageAlreadyUsed));
            }
        }

        let blob_size = tx.blob_size();
        let fee = tx.fee().unwrap_or(0);
        if fee < chain.currency().minimum_fee(blob_size) {
            return Ok(AddTxResult::Rejected(TxRejectReason::FeeBelowMinimum));
        }

        // contextual validation against the chain the next block builds on
        let next_height = chain.tip().1 + 1;
        let mut scratch = HashSet::new();
        match chain.validate_transaction(
            &tx,
            next_height,
            now,
            &mut scratch,
            !flags.signatures_verified,
        )? {
            Ok(_) => {}
            Err(reason) => return Ok(AddTxResult::Rejected(reason)),
        }

        let key_images: Vec<KeyImage> = tx.key_images().copied().collect();
        for image in &key_images {
            self.key_images.insert(*image, hash);
        }
        self.entries.insert(
            hash,
            PoolEntry {
                tx,
                blob_size,
                fee,
                receive_time: now,
                key_images,
            },
        );
        log::debug!("tx {} added to pool ({} pending)", hash, self.entries.len());
        Ok(AddTxResult::Added)
    }

    /// Remove and return an entry (block inclusion, or explicit drop).
    pub fn take_tx(&mut self, hash: &Hash) -> Option<Transaction> {
        let entry = self.entries.remove(hash)?;
        for image in &entry.key_images {
            self.key_images.remove(image);
        }
        Some(entry.tx)
    }

    /// Select transactions by descending fee-per-byte until `budget_size`
    /// bytes are used. Key-image exclusion holds by pool invariant; the
    /// guard is kept for defense against future selection changes.
    pub fn fill_block_template(&self, budget_size: usize) -> Vec<Transaction> {
        let mut ordered: Vec<&PoolEntry> = self.entries.values().collect();
        ordered.sort_by(|a, b| {
            if a.denser_than(b) {
                std::cmp::Ordering::Less
            } else if b.denser_than(a) {
                std::cmp::Ordering::Greater
            } else {
                // deterministic tie-break by hash
                a.tx.hash().cmp(&b.tx.hash())
            }
        });

        let mut used = 0usize;
        let mut images: HashSet<KeyImage> = HashSet::new();
        let mut selected = Vec::new();
        for entry in ordered {
            if used + entry.blob_size > budget_size {
                continue;
            }
            if entry.key_images.iter().any(|image| images.contains(image)) {
                continue;
            }
            images.extend(entry.key_images.iter().copied());
            used += entry.blob_size;
            selected.push(entry.tx.clone());
        }
        selected
    }

    /// Blockchain advanced: drop entries that have outlived the pool
    /// lifetime.
    pub fn on_blockchain_inc(&mut self, now: u64, lifetime: u64) -> usize {
        let expired: Vec<Hash> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.receive_time) > lifetime)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            self.take_tx(hash);
        }
        if !expired.is_empty() {
            log::info!("expired {} transactions from the pool", expired.len());
        }
        expired.len()
    }

    /// Blockchain rolled back or reorganized: re-check every entry
    /// against the new chain and evict what no longer validates
    /// (spent key image, vanished ring member). Signatures were proven
    /// on admission and are not re-run.
    pub fn revalidate(&mut self, chain: &Blockchain, now: u64) -> Result<usize> {
        let next_height = chain.tip().1 + 1;
        let mut evict = Vec::new();
        for (hash, entry) in &self.entries {
            let mut scratch = HashSet::new();
            match chain.validate_transaction(&entry.tx, next_height, now, &mut scratch, false)? {
                Ok(_) => {}
                Err(reason) => {
                    log::info!("evicting pool tx {}: {}", hash, reason);
                    evict.push(*hash);
                }
            }
        }
        for hash in &evict {
            self.take_tx(hash);
        }
        Ok(evict.len())
    }
}
