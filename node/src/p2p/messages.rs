//! Wire envelopes and command payloads.
//!
//! Frames are length-prefixed by the codec; inside each frame sits an
//! [`Envelope`] of (command_id, is_response, request_id, payload).
//! Container payloads are bincode; block and transaction bodies travel
//! as canonical consensus bytes so hashes survive the trip.

use bincode::{Decode, Encode};
use cache_core::crypto::Hash;
use thiserror::Error;

pub const P2P_COMMAND_BASE: u32 = 1000;
pub const COMMAND_HANDSHAKE: u32 = P2P_COMMAND_BASE + 1;
pub const COMMAND_TIMED_SYNC: u32 = P2P_COMMAND_BASE + 2;
pub const COMMAND_PING: u32 = P2P_COMMAND_BASE + 3;

pub const BC_COMMAND_BASE: u32 = 2000;
pub const NOTIFY_NEW_BLOCK: u32 = BC_COMMAND_BASE + 1;
pub const NOTIFY_NEW_TRANSACTIONS: u32 = BC_COMMAND_BASE + 2;
pub const NOTIFY_REQUEST_GET_OBJECTS: u32 = BC_COMMAND_BASE + 3;
pub const NOTIFY_RESPONSE_GET_OBJECTS: u32 = BC_COMMAND_BASE + 4;
pub const NOTIFY_REQUEST_CHAIN: u32 = BC_COMMAND_BASE + 6;
pub const NOTIFY_RESPONSE_CHAIN_ENTRY: u32 = BC_COMMAND_BASE + 7;

/// Hard cap on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
/// Longest sparse chain / chain entry response accepted.
pub const MAX_CHAIN_ENTRY_IDS: usize = 10_000;
/// Most objects a single request may name.
pub const MAX_OBJECT_REQUEST: usize = 200;
/// Blocks requested per GET_OBJECTS batch while synchronizing.
pub const SYNC_BATCH_SIZE: usize = 100;

#[derive(Encode, Decode, Clone, Debug)]
pub struct Envelope {
    pub command: u32,
    pub is_response: bool,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct BasicNodeData {
    pub network_id: [u8; 16],
    pub peer_id: u64,
    pub local_time: u64,
    /// listening port, for reconnects and self-connection detection
    pub my_port: u16,
}

/// Chain summary piggybacked on handshakes and timed syncs.
#[derive(Encode, Decode, Clone, Copy, Debug)]
pub struct CoreSyncData {
    pub current_height: u64,
    pub top_hash: Hash,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct PeerEntry {
    pub address: String,
    pub id: u64,
    pub last_seen: u64,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct HandshakeRequest {
    pub node_data: BasicNodeData,
    pub payload: CoreSyncData,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct HandshakeResponse {
    pub node_data: BasicNodeData,
    pub payload: CoreSyncData,
    pub peers: Vec<PeerEntry>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct TimedSyncRequest {
    pub payload: CoreSyncData,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct TimedSyncResponse {
    pub local_time: u64,
    pub payload: CoreSyncData,
    pub peers: Vec<PeerEntry>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct NotifyNewBlock {
    pub block: Vec<u8>,
    pub current_height: u64,
    pub hop: u32,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct NotifyNewTransactions {
    pub txs: Vec<Vec<u8>>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct NotifyRequestChain {
    /// sparse chain, tip first
    pub block_ids: Vec<Hash>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct NotifyResponseChainEntry {
    pub start_height: u64,
    pub total_height: u64,
    pub block_ids: Vec<Hash>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct NotifyRequestGetObjects {
    pub blocks: Vec<Hash>,
    pub txs: Vec<Hash>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct RawBlockEntry {
    pub block: Vec<u8>,
    pub txs: Vec<Vec<u8>>,
}

#[derive(Encode, Decode, Clone, Debug)]
pub struct NotifyResponseGetObjects {
    pub blocks: Vec<RawBlockEntry>,
    pub txs: Vec<Vec<u8>>,
    pub missed_ids: Vec<Hash>,
    pub current_height: u64,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Decode(bincode::error::DecodeError),
    #[error("payload larger than frame limit")]
    Oversized,
}

pub fn encode_payload<T: Encode>(value: &T) -> Vec<u8> {
    bincode::encode_to_vec(value, bincode::config::standard()).expect("payload encoding")
}

pub fn decode_payload<T: Decode<()>>(bytes: &[u8]) -> Result<T, WireError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::Oversized);
    }
    let (value, consumed) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(WireError::Decode)?;
    if consumed != bytes.len() {
        return Err(WireError::Decode(
            bincode::error::DecodeError::Other("trailing bytes in payload"),
        ));
    }
    Ok(value)
}

impl Envelope {
    pub fn request(command: u32, request_id: u64, payload: Vec<u8>) -> Envelope {
        Envelope {
            command,
            is_response: false,
            request_id,
            payload,
        }
    }

    pub fn response(command: u32, request_id: u64, payload: Vec<u8>) -> Envelope {
        Envelope {
            command,
            is_response: true,
            request_id,
            payload,
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        encode_payload(self)
    }

    pub fn from_frame(bytes: &[u8]) -> Result<Envelope, WireError> {
        decode_payload(bytes)
    }
}
