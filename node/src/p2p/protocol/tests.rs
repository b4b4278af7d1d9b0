use super::*;
use crate::p2p::connection::Direction;
use cache_core::checkpoint::Checkpoints;
use cache_core::core::{Core, FeePolicy};
use cache_core::crypto::{Hash, fast_hash, hash_to_point};
use cache_core::currency::Currency;
use cache_core::{Blockchain, PublicKey};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

struct Node {
    core: Arc<Core>,
    handler: Arc<ProtocolHandler>,
    workers: Arc<WorkerPool>,
    peer_set: Arc<MockPeerSet>,
    path: std::path::PathBuf,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.workers.shutdown();
        std::fs::remove_dir_all(&self.path).ok();
    }
}

#[derive(Default)]
struct MockPeerSet {
    broadcasts: Mutex<Vec<(Envelope, Option<PeerId>)>>,
}

impl PeerSet for MockPeerSet {
    fn broadcast(&self, envelope: Envelope, exclude: Option<PeerId>) {
        self.broadcasts.lock().push((envelope, exclude));
    }
    fn exchange_entries(&self) -> Vec<PeerEntry> {
        Vec::new()
    }
    fn local_peer_id(&self) -> u64 {
        1
    }
}

fn dest() -> PublicKey {
    PublicKey(hash_to_point(b"protocol miner").compress().to_bytes())
}

/// Node with `height - 1` blocks above genesis, built through the same
/// ingestion path the network uses (PoW precomputed as already-verified).
fn node_with_height(height: u64) -> Node {
    let path = std::env::temp_dir().join(format!(
        "cache-protocol-test-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, AtomicOrdering::SeqCst)
    ));
    let chain = Blockchain::open(
        &path,
        Arc::new(Currency::mainnet()),
        Checkpoints::new(),
    )
    .unwrap();
    let core = Arc::new(Core::new(chain, FeePolicy::default(), None));
    for _ in 1..height {
        let (block, _) = core.get_block_template(dest(), &[]).unwrap();
        let outcome = core
            .handle_incoming_block(block, Vec::new(), BlockSource::Local, Some(Hash::ZERO))
            .unwrap();
        assert!(matches!(
            outcome,
            BlockHandleOutcome::Outcome(AddBlockResult::AcceptedMain { .. })
        ));
    }
    let workers = Arc::new(WorkerPool::new(2));
    let handler = Arc::new(ProtocolHandler::new(
        core.clone() as Arc<dyn ChainSink>,
        workers.clone(),
    ));
    let peer_set = Arc::new(MockPeerSet::default());
    handler.set_peer_set(peer_set.clone() as Arc<dyn PeerSet>);
    Node {
        core,
        handler,
        workers,
        peer_set,
        path,
    }
}

fn ctx_for(peer: PeerId) -> Mutex<ConnectionContext> {
    Mutex::new(ConnectionContext::new(
        peer,
        format!("10.7.0.{peer}:39999"),
        Direction::Outbound,
        1_000,
    ))
}

#[test]
fn consider_sync_only_when_peer_is_ahead() {
    let node = node_with_height(3);
    let ctx = ctx_for(7);

    // behind us: nothing to do
    let behind = CoreSyncData {
        current_height: 1,
        top_hash: fast_hash(b"their genesis"),
    };
    assert!(node.handler.consider_sync(&ctx, &behind).is_none());
    assert_eq!(ctx.lock().state, SyncState::BeforeHandshake);

    // ahead: request its chain with our sparse chain
    let ahead = CoreSyncData {
        current_height: 10,
        top_hash: fast_hash(b"their tip"),
    };
    let request = node.handler.consider_sync(&ctx, &ahead).unwrap();
    assert_eq!(request.command, NOTIFY_REQUEST_CHAIN);
    assert!(!request.is_response);
    assert_eq!(ctx.lock().state, SyncState::SynchronizingRequested);
    let sparse: NotifyRequestChain = decode_payload(&request.payload).unwrap();
    assert_eq!(sparse.block_ids[0], node.core.top().0);
}

#[test]
fn same_height_different_tip_triggers_sync() {
    let node = node_with_height(3);
    let ctx = ctx_for(7);
    let rival = CoreSyncData {
        current_height: 3,
        top_hash: fast_hash(b"rival tip"),
    };
    assert!(node.handler.consider_sync(&ctx, &rival).is_some());
}

#[tokio::test]
async fn request_chain_is_served_from_the_split_point() {
    let node = node_with_height(5);
    let ctx = ctx_for(2);
    let genesis = node.core.get_block_by_height(0).unwrap().unwrap().hash();

    let request = Envelope::request(
        NOTIFY_REQUEST_CHAIN,
        9,
        encode_payload(&NotifyRequestChain {
            block_ids: vec![fast_hash(b"unknown tip"), genesis],
        }),
    );
    let action = node.handler.handle_envelope(&ctx, request, 1_000).await;
    assert!(!action.disconnect);
    assert_eq!(action.replies.len(), 1);
    let reply = &action.replies[0];
    assert_eq!(reply.command, NOTIFY_RESPONSE_CHAIN_ENTRY);
    assert!(reply.is_response);
    assert_eq!(reply.request_id, 9);

    let entry: NotifyResponseChainEntry = decode_payload(&reply.payload).unwrap();
    assert_eq!(entry.start_height, 0);
    assert_eq!(entry.total_height, 5);
    assert_eq!(entry.block_ids.len(), 5);
    assert_eq!(entry.block_ids[0], genesis);
}

#[tokio::test]
async fn foreign_sparse_chain_escalates_to_disconnect() {
    let node = node_with_height(2);
    let ctx = ctx_for(3);
    let request = || {
        Envelope::request(
            NOTIFY_REQUEST_CHAIN,
            1,
            encode_payload(&NotifyRequestChain {
                block_ids: vec![fast_hash(b"foreign genesis")],
            }),
        )
    };
    // warn, throttle, disconnect
    let first = node.handler.handle_envelope(&ctx, request(), 1_000).await;
    assert!(!first.disconnect);
    let second = node.handler.handle_envelope(&ctx, request(), 1_001).await;
    assert!(!second.disconnect);
    // throttled requests are shed until the window passes
    let shed = node.handler.handle_envelope(&ctx, request(), 1_002).await;
    assert!(shed.replies.is_empty() && !shed.disconnect);
    let third = node.handler.handle_envelope(&ctx, request(), 2_000).await;
    assert!(third.disconnect && third.ban);
}

#[tokio::test]
async fn unsolicited_chain_entry_is_a_violation() {
    let node = node_with_height(2);
    let ctx = ctx_for(4);
    ctx.lock().state = SyncState::Normal;
    let envelope = Envelope::response(
        NOTIFY_RESPONSE_CHAIN_ENTRY,
        5,
        encode_payload(&NotifyResponseChainEntry {
            start_height: 0,
            total_height: 9,
            block_ids: vec![node.core.top().0],
        }),
    );
    node.handler.handle_envelope(&ctx, envelope.clone(), 1_000).await;
    node.handler.handle_envelope(&ctx, envelope.clone(), 1_100).await;
    let third = node.handler.handle_envelope(&ctx, envelope, 1_200).await;
    assert!(third.disconnect);
}

#[tokio::test]
async fn chain_entry_with_unknown_split_point_is_a_violation() {
    let node = node_with_height(2);
    let ctx = ctx_for(4);
    ctx.lock().state = SyncState::SynchronizingRequested;
    let envelope = Envelope::response(
        NOTIFY_RESPONSE_CHAIN_ENTRY,
        5,
        encode_payload(&NotifyResponseChainEntry {
            start_height: 0,
            total_height: 9,
            block_ids: vec![fast_hash(b"not our chain")],
        }),
    );
    let action = node.handler.handle_envelope(&ctx, envelope, 1_000).await;
    assert!(action.replies.is_empty());
    assert_eq!(ctx.lock().state, SyncState::SynchronizingRequested);
}

#[tokio::test]
async fn non_requested_object_drops_the_peer() {
    let alpha = node_with_height(3);
    let beta = node_with_height(1);
    let ctx = ctx_for(6);
    ctx.lock().state = SyncState::SynchronizingDownloading;

    // a block beta never asked for
    let stray = alpha.core.get_block_by_height(2).unwrap().unwrap();
    let envelope = Envelope::response(
        NOTIFY_RESPONSE_GET_OBJECTS,
        11,
        encode_payload(&NotifyResponseGetObjects {
            blocks: vec![RawBlockEntry {
                block: to_bytes(&stray),
                txs: Vec::new(),
            }],
            txs: Vec::new(),
            missed_ids: Vec::new(),
            current_height: 3,
        }),
    );
    let action = beta.handler.handle_envelope(&ctx, envelope, 1_000).await;
    assert!(action.disconnect && action.ban);
    assert!(ctx.lock().is_closing());
}

/// Cold sync end to end at the handler level: a fresh node pulls the
/// whole chain from a peer by exchanging envelopes until both go quiet.
#[tokio::test]
async fn cold_sync_converges_to_the_remote_tip() {
    let alpha = node_with_height(5);
    let beta = node_with_height(1);
    assert_ne!(alpha.core.top(), beta.core.top());

    let ctx_alpha = ctx_for(100); // alpha's view of beta
    let ctx_beta = ctx_for(200); // beta's view of alpha

    let alpha_sync = CoreSyncData {
        current_height: alpha.core.get_height(),
        top_hash: alpha.core.top().0,
    };
    let mut to_alpha: Vec<Envelope> = Vec::new();
    let mut to_beta: Vec<Envelope> = Vec::new();
    to_alpha.extend(beta.handler.consider_sync(&ctx_beta, &alpha_sync));

    for round in 0..32 {
        if to_alpha.is_empty() && to_beta.is_empty() {
            break;
        }
        for envelope in std::mem::take(&mut to_alpha) {
            let action = alpha
                .handler
                .handle_envelope(&ctx_alpha, envelope, 1_000 + round)
                .await;
            assert!(!action.disconnect, "alpha dropped beta");
            to_beta.extend(action.replies);
        }
        for envelope in std::mem::take(&mut to_beta) {
            let action = beta
                .handler
                .handle_envelope(&ctx_beta, envelope, 1_000 + round)
                .await;
            assert!(!action.disconnect, "beta dropped alpha");
            to_alpha.extend(action.replies);
        }
    }

    assert_eq!(beta.core.top(), alpha.core.top());
    assert_eq!(ctx_beta.lock().state, SyncState::Normal);
}

#[tokio::test]
async fn relayed_block_is_rebroadcast_but_not_to_the_sender() {
    let node = node_with_height(2);
    // a peer found the next block on our chain
    let (block, _) = node.core.get_block_template(dest(), &[]).unwrap();

    let ctx = ctx_for(42);
    ctx.lock().state = SyncState::Normal;
    let envelope = Envelope::request(
        NOTIFY_NEW_BLOCK,
        13,
        encode_payload(&NotifyNewBlock {
            block: to_bytes(&block),
            current_height: 3,
            hop: 0,
        }),
    );
    let action = node.handler.handle_envelope(&ctx, envelope, 1_000).await;
    assert!(!action.disconnect);
    assert_eq!(node.core.get_height(), 3);

    let broadcasts = node.peer_set.broadcasts.lock();
    assert_eq!(broadcasts.len(), 1);
    let (rebroadcast, exclude) = &broadcasts[0];
    assert_eq!(rebroadcast.command, NOTIFY_NEW_BLOCK);
    assert_eq!(*exclude, Some(42));
    let relayed: NotifyNewBlock = decode_payload(&rebroadcast.payload).unwrap();
    assert_eq!(relayed.hop, 1);
    assert_eq!(relayed.current_height, 3);
}

#[tokio::test]
async fn orphan_relay_falls_back_to_sync() {
    let node = node_with_height(2);
    let stranger = node_with_height(4);
    let foreign = stranger.core.get_block_by_height(3).unwrap().unwrap();

    let ctx = ctx_for(8);
    {
        let mut guard = ctx.lock();
        guard.state = SyncState::Normal;
        guard.peer_height = 4;
        guard.peer_top_hash = stranger.core.top().0;
    }
    let envelope = Envelope::request(
        NOTIFY_NEW_BLOCK,
        21,
        encode_payload(&NotifyNewBlock {
            block: to_bytes(&foreign),
            current_height: 4,
            hop: 0,
        }),
    );
    let action = node.handler.handle_envelope(&ctx, envelope, 1_000).await;
    assert!(!action.disconnect, "orphans from relay are not an offense");
    assert_eq!(action.replies.len(), 1);
    assert_eq!(action.replies[0].command, NOTIFY_REQUEST_CHAIN);
    assert_eq!(ctx.lock().state, SyncState::SynchronizingRequested);
}
