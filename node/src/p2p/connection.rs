//! Per-connection state: the sync state machine position, in-flight
//! request bookkeeping, and the misbehavior score.

use cache_core::crypto::Hash;
use std::collections::{HashSet, VecDeque};

pub type PeerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    BeforeHandshake,
    SynchronizingRequested,
    SynchronizingDownloading,
    Normal,
    Closing,
}

/// What the manager should do about a misbehaving peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Escalation {
    Warn,
    Throttle,
    Disconnect,
}

/// request-rate window
const RATE_WINDOW_SECS: u64 = 10;
const RATE_MAX_REQUESTS: u32 = 50;
const THROTTLE_SECS: u64 = 30;

pub struct ConnectionContext {
    pub peer_id: PeerId,
    pub address: String,
    pub direction: Direction,
    pub state: SyncState,
    pub peer_height: u64,
    pub peer_top_hash: Hash,
    /// object hashes requested and not yet answered
    pub requested_objects: HashSet<Hash>,
    /// hashes scheduled for download during sync, in chain order
    pub download_queue: VecDeque<Hash>,
    /// relayed block parked while its transactions are fetched
    pub pending_block: Option<Vec<u8>>,
    pub remote_total_height: u64,
    pub last_response_time: u64,
    violations: u32,
    throttled_until: u64,
    window_start: u64,
    requests_in_window: u32,
}

impl ConnectionContext {
    pub fn new(peer_id: PeerId, address: String, direction: Direction, now: u64) -> Self {
        ConnectionContext {
            peer_id,
            address,
            direction,
            state: SyncState::BeforeHandshake,
            peer_height: 0,
            peer_top_hash: Hash::ZERO,
            requested_objects: HashSet::new(),
            download_queue: VecDeque::new(),
            pending_block: None,
            remote_total_height: 0,
            last_response_time: now,
            violations: 0,
            throttled_until: 0,
            window_start: now,
            requests_in_window: 0,
        }
    }

    /// Record a protocol violation; repeated offenses escalate.
    pub fn note_violation(&mut self, now: u64, what: &str) -> Escalation {
        self.violations += 1;
        log::warn!(
            "peer {} ({}) protocol violation #{}: {}",
            self.peer_id,
            self.address,
            self.violations,
            what
        );
        match self.violations {
            1 => Escalation::Warn,
            2 => {
                self.throttled_until = now + THROTTLE_SECS;
                Escalation::Throttle
            }
            _ => {
                self.state = SyncState::Closing;
                Escalation::Disconnect
            }
        }
    }

    /// Request-rate accounting for inbound requests. Exceeding the
    /// window budget counts as a violation.
    pub fn note_request(&mut self, now: u64) -> Option<Escalation> {
        if now.saturating_sub(self.window_start) >= RATE_WINDOW_SECS {
            self.window_start = now;
            self.requests_in_window = 0;
        }
        self.requests_in_window += 1;
        if self.requests_in_window > RATE_MAX_REQUESTS {
            return Some(self.note_violation(now, "request rate exceeded"));
        }
        None
    }

    pub fn is_throttled(&self, now: u64) -> bool {
        now < self.throttled_until
    }

    pub fn is_closing(&self) -> bool {
        self.state == SyncState::Closing
    }

    /// Idle if nothing has arrived for `limit` seconds.
    pub fn is_idle(&self, now: u64, limit: u64) -> bool {
        now.saturating_sub(self.last_response_time) > limit
    }
}
