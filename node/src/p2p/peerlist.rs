//! White/gray/anchor peer bookkeeping.
//!
//! Gray holds advertised-but-unverified addresses, white holds peers we
//! have actually spoken to, anchors are long-lived peers re-dialed
//! across restarts. Every list is bounded with least-recently-seen
//! eviction; repeated connect failures demote and eventually drop an
//! entry.

use crate::p2p::messages::PeerEntry;
use bincode::{Decode, Encode};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const WHITE_CAP: usize = 1000;
pub const GRAY_CAP: usize = 5000;
pub const ANCHOR_CAP: usize = 100;
/// connect failures before a white entry drops to gray / a gray entry is removed
pub const FAIL_THRESHOLD: u32 = 3;
/// seconds an address stays blacklisted after a handshake offense
pub const BLACKLIST_SECS: u64 = 600;

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: String,
    pub id: u64,
    pub last_seen: u64,
    pub fail_count: u32,
    pub last_connect_attempt: u64,
}

#[derive(Encode, Decode, Default)]
struct PersistedPeers {
    white: Vec<PeerRecord>,
    gray: Vec<PeerRecord>,
    anchor: Vec<PeerRecord>,
}

#[derive(Default)]
pub struct PeerStore {
    white: HashMap<String, PeerRecord>,
    gray: HashMap<String, PeerRecord>,
    anchor: HashMap<String, PeerRecord>,
    blacklist: HashMap<String, u64>,
}

impl PeerStore {
    pub fn new() -> PeerStore {
        PeerStore::default()
    }

    pub fn white_len(&self) -> usize {
        self.white.len()
    }

    pub fn gray_len(&self) -> usize {
        self.gray.len()
    }

    pub fn anchor_len(&self) -> usize {
        self.anchor.len()
    }

    fn evict_lru(map: &mut HashMap<String, PeerRecord>, cap: usize) {
        while map.len() > cap {
            let oldest = map
                .values()
                .min_by_key(|record| record.last_seen)
                .map(|record| record.address.clone());
            match oldest {
                Some(address) => {
                    map.remove(&address);
                }
                None => break,
            }
        }
    }

    /// Advertised address from a peer-list exchange; lands in gray until
    /// we talk to it ourselves.
    pub fn add_gray(&mut self, entry: &PeerEntry) {
        if self.white.contains_key(&entry.address) || self.anchor.contains_key(&entry.address) {
            return;
        }
        let record = self
            .gray
            .entry(entry.address.clone())
            .or_insert_with(|| PeerRecord {
                address: entry.address.clone(),
                id: entry.id,
                last_seen: entry.last_seen,
                fail_count: 0,
                last_connect_attempt: 0,
            });
        record.last_seen = record.last_seen.max(entry.last_seen);
        Self::evict_lru(&mut self.gray, GRAY_CAP);
    }

    /// Successful contact: promote to white and clear the failure score.
    pub fn note_seen(&mut self, address: &str, id: u64, now: u64) {
        self.gray.remove(address);
        if let Some(anchor) = self.anchor.get_mut(address) {
            anchor.last_seen = now;
            anchor.id = id;
            anchor.fail_count = 0;
        }
        let record = self
            .white
            .entry(address.to_string())
            .or_insert_with(|| PeerRecord {
                address: address.to_string(),
                id,
                last_seen: now,
                fail_count: 0,
                last_connect_attempt: 0,
            });
        record.id = id;
        record.last_seen = now;
        record.fail_count = 0;
        Self::evict_lru(&mut self.white, WHITE_CAP);
    }

    /// Long, healthy relationship: keep across restarts and dial first.
    pub fn mark_anchor(&mut self, address: &str, now: u64) {
        if let Some(record) = self.white.get(address).cloned() {
            self.anchor.insert(address.to_string(), record);
        } else {
            self.anchor.insert(
                address.to_string(),
                PeerRecord {
                    address: address.to_string(),
                    id: 0,
                    last_seen: now,
                    fail_count: 0,
                    last_connect_attempt: 0,
                },
            );
        }
        Self::evict_lru(&mut self.anchor, ANCHOR_CAP);
    }

    pub fn note_connect_attempt(&mut self, address: &str, now: u64) {
        for map in [&mut self.anchor, &mut self.white, &mut self.gray] {
            if let Some(record) = map.get_mut(address) {
                record.last_connect_attempt = now;
            }
        }
    }

    /// Failed dial or broken handshake: bump fail_count, demote past the
    /// threshold.
    pub fn record_failure(&mut self, address: &str) {
        if let Some(record) = self.anchor.get_mut(address) {
            record.fail_count += 1;
            // anchors are not demoted; they only stop being preferred
        }
        if let Some(record) = self.white.get_mut(address) {
            record.fail_count += 1;
            if record.fail_count >= FAIL_THRESHOLD {
                let mut demoted = self.white.remove(address).expect("checked above");
                demoted.fail_count = 0;
                self.gray.insert(address.to_string(), demoted);
                Self::evict_lru(&mut self.gray, GRAY_CAP);
            }
            return;
        }
        if let Some(record) = self.gray.get_mut(address) {
            record.fail_count += 1;
            if record.fail_count >= FAIL_THRESHOLD {
                self.gray.remove(address);
            }
        }
    }

    pub fn blacklist(&mut self, address: &str, until: u64) {
        self.blacklist.insert(address.to_string(), until);
    }

    pub fn is_blacklisted(&self, address: &str, now: u64) -> bool {
        match self.blacklist.get(address) {
            Some(&until) => now < until,
            None => false,
        }
    }

    /// Dial candidates: anchor > white > gray; within a list, the most
    /// recently seen with the fewest failures first.
    pub fn select_outbound(
        &self,
        count: usize,
        exclude: &dyn Fn(&str) -> bool,
        now: u64,
    ) -> Vec<PeerRecord> {
        let mut picked = Vec::with_capacity(count);
        for map in [&self.anchor, &self.white, &self.gray] {
            if picked.len() >= count {
                break;
            }
            let mut candidates: Vec<&PeerRecord> = map
                .values()
                .filter(|record| !exclude(&record.address))
                .filter(|record| !self.is_blacklisted(&record.address, now))
                .filter(|record| {
                    picked
                        .iter()
                        .all(|chosen: &PeerRecord| chosen.address != record.address)
                })
                .collect();
            candidates.sort_by_key(|record| (record.fail_count, u64::MAX - record.last_seen));
            for record in candidates.into_iter().take(count - picked.len()) {
                picked.push(record.clone());
            }
        }
        picked
    }

    /// Sample of white peers advertised in handshakes and timed syncs.
    pub fn exchange_entries(&self, limit: usize) -> Vec<PeerEntry> {
        let mut records: Vec<&PeerRecord> = self.white.values().collect();
        records.sort_by_key(|record| u64::MAX - record.last_seen);
        records
            .into_iter()
            .take(limit)
            .map(|record| PeerEntry {
                address: record.address.clone(),
                id: record.id,
                last_seen: record.last_seen,
            })
            .collect()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let persisted = PersistedPeers {
            white: self.white.values().cloned().collect(),
            gray: self.gray.values().cloned().collect(),
            anchor: self.anchor.values().cloned().collect(),
        };
        let bytes = bincode::encode_to_vec(&persisted, bincode::config::standard())?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> PeerStore {
        let mut store = PeerStore::new();
        let Ok(bytes) = fs::read(path) else {
            return store;
        };
        let Ok((persisted, _)) = bincode::decode_from_slice::<PersistedPeers, _>(
            &bytes,
            bincode::config::standard(),
        ) else {
            log::warn!("peer list file {} unreadable, starting fresh", path.display());
            return store;
        };
        for record in persisted.white {
            store.white.insert(record.address.clone(), record);
        }
        for record in persisted.gray {
            store.gray.insert(record.address.clone(), record);
        }
        for record in persisted.anchor {
            store.anchor.insert(record.address.clone(), record);
        }
        store
    }
}
