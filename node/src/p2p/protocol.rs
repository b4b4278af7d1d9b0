//! Per-peer protocol handler: the sync state machine, block and
//! transaction relay, and the anti-abuse escalation ladder.
//!
//! Commands on one connection are processed strictly in order; the
//! manager calls [`ProtocolHandler::handle_envelope`] from each
//! connection's read task. Fork choice itself lives in the chain store;
//! this layer only feeds it and rebroadcasts what it commits.

use crate::dispatcher::WorkerPool;
use crate::p2p::connection::{ConnectionContext, Escalation, PeerId, SyncState};
use crate::p2p::messages::*;
use cache_core::blockchain::{AddBlockResult, BlockRejectReason, BlockSource};
use cache_core::core::{BlockHandleOutcome, ChainSink};
use cache_core::mempool::{AddTxResult, TxVerifyFlags};
use cache_core::serialize::{from_bytes, to_bytes};
use cache_core::{Block, Transaction};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Longest chain-entry response we are willing to serve in one go.
const CHAIN_ENTRY_RESPONSE_LIMIT: usize = 500;

/// Connection-set capability implemented by the node server; the
/// handler broadcasts and exchanges peers through it without owning
/// any connection.
pub trait PeerSet: Send + Sync {
    fn broadcast(&self, envelope: Envelope, exclude: Option<PeerId>);
    fn exchange_entries(&self) -> Vec<PeerEntry>;
    fn local_peer_id(&self) -> u64;
}

/// What the manager should do after a command is handled.
#[derive(Default)]
pub struct HandlerAction {
    pub replies: Vec<Envelope>,
    pub disconnect: bool,
    /// drop AND blacklist the address for a cooldown
    pub ban: bool,
}

impl HandlerAction {
    fn reply(envelope: Envelope) -> HandlerAction {
        HandlerAction {
            replies: vec![envelope],
            ..Default::default()
        }
    }

    fn drop_peer() -> HandlerAction {
        HandlerAction {
            disconnect: true,
            ..Default::default()
        }
    }

    fn ban_peer() -> HandlerAction {
        HandlerAction {
            disconnect: true,
            ban: true,
            ..Default::default()
        }
    }
}

pub struct ProtocolHandler {
    core: Arc<dyn ChainSink>,
    workers: Arc<WorkerPool>,
    peers: OnceLock<Arc<dyn PeerSet>>,
    request_seq: AtomicU64,
}

impl ProtocolHandler {
    pub fn new(core: Arc<dyn ChainSink>, workers: Arc<WorkerPool>) -> ProtocolHandler {
        ProtocolHandler {
            core,
            workers,
            peers: OnceLock::new(),
            request_seq: AtomicU64::new(1),
        }
    }

    /// Wire the connection-set capability once the server exists.
    pub fn set_peer_set(&self, peers: Arc<dyn PeerSet>) {
        if self.peers.set(peers).is_err() {
            log::warn!("peer set was already wired");
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn peers(&self) -> Option<&Arc<dyn PeerSet>> {
        self.peers.get()
    }

    pub fn local_sync_data(&self) -> CoreSyncData {
        let (top_hash, _) = self.core.top();
        CoreSyncData {
            current_height: self.core_height(),
            top_hash,
        }
    }

    fn core_height(&self) -> u64 {
        self.core.top().1 + 1
    }

    /// React to a peer's advertised chain summary (handshake payload or
    /// timed sync): when the peer is ahead, or claims a different top at
    /// our height, ask for its chain.
    pub fn consider_sync(
        &self,
        ctx: &Mutex<ConnectionContext>,
        remote: &CoreSyncData,
    ) -> Option<Envelope> {
        let sparse = match self.core.build_sparse_chain() {
            Ok(sparse) => sparse,
            Err(e) => {
                log::error!("cannot build sparse chain: {e:#}");
                return None;
            }
        };
        let (local_top, _) = self.core.top();
        let local_height = self.core_height();

        let mut guard = ctx.lock();
        guard.peer_height = remote.current_height;
        guard.peer_top_hash = remote.top_hash;

        let behind = remote.current_height > local_height
            || (remote.current_height == local_height && remote.top_hash != local_top);
        let idle = matches!(guard.state, SyncState::BeforeHandshake | SyncState::Normal);
        if !(behind && idle) {
            return None;
        }
        guard.state = SyncState::SynchronizingRequested;
        log::info!(
            "peer {} is ahead ({} vs {}), requesting chain",
            guard.peer_id,
            remote.current_height,
            local_height
        );
        drop(guard);

        Some(Envelope::request(
            NOTIFY_REQUEST_CHAIN,
            self.next_request_id(),
            encode_payload(&NotifyRequestChain { block_ids: sparse }),
        ))
    }

    fn violation(
        &self,
        ctx: &Mutex<ConnectionContext>,
        now: u64,
        what: &str,
    ) -> HandlerAction {
        let escalation = ctx.lock().note_violation(now, what);
        match escalation {
            Escalation::Warn | Escalation::Throttle => HandlerAction::default(),
            Escalation::Disconnect => HandlerAction::ban_peer(),
        }
    }

    /// Entry point for every framed command after the handshake.
    pub async fn handle_envelope(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
        now: u64,
    ) -> HandlerAction {
        {
            let mut guard = ctx.lock();
            guard.last_response_time = now;
            if guard.is_throttled(now) && !envelope.is_response {
                // shed requests while throttled, keep responses flowing
                return HandlerAction::default();
            }
            if !envelope.is_response {
                if let Some(Escalation::Disconnect) = guard.note_request(now) {
                    return HandlerAction::ban_peer();
                }
            }
        }

        match (envelope.command, envelope.is_response) {
            (COMMAND_TIMED_SYNC, false) => self.on_timed_sync_request(ctx, envelope),
            (COMMAND_TIMED_SYNC, true) => self.on_timed_sync_response(ctx, envelope),
            (COMMAND_PING, false) => {
                HandlerAction::reply(Envelope::response(COMMAND_PING, envelope.request_id, Vec::new()))
            }
            (COMMAND_PING, true) => HandlerAction::default(),
            (NOTIFY_REQUEST_CHAIN, false) => self.on_request_chain(ctx, envelope, now),
            (NOTIFY_RESPONSE_CHAIN_ENTRY, true) => self.on_chain_entry(ctx, envelope, now),
            (NOTIFY_REQUEST_GET_OBJECTS, false) => self.on_request_objects(ctx, envelope, now),
            (NOTIFY_RESPONSE_GET_OBJECTS, true) => {
                self.on_objects_response(ctx, envelope, now).await
            }
            (NOTIFY_NEW_BLOCK, false) => self.on_new_block(ctx, envelope, now).await,
            (NOTIFY_NEW_TRANSACTIONS, false) => self.on_new_transactions(ctx, envelope, now).await,
            _ => self.violation(ctx, now, "unknown or misdirected command"),
        }
    }

    // ------------------------------------------------------------------
    // timed sync
    // ------------------------------------------------------------------

    fn on_timed_sync_request(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
    ) -> HandlerAction {
        let request: TimedSyncRequest = match decode_payload(&envelope.payload) {
            Ok(request) => request,
            Err(_) => return HandlerAction::ban_peer(),
        };
        let mut action = HandlerAction::default();
        if let Some(sync) = self.consider_sync(ctx, &request.payload) {
            action.replies.push(sync);
        }
        let peers = self
            .peers()
            .map(|set| set.exchange_entries())
            .unwrap_or_default();
        action.replies.push(Envelope::response(
            COMMAND_TIMED_SYNC,
            envelope.request_id,
            encode_payload(&TimedSyncResponse {
                local_time: chrono::Utc::now().timestamp().max(0) as u64,
                payload: self.local_sync_data(),
                peers,
            }),
        ));
        action
    }

    fn on_timed_sync_response(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
    ) -> HandlerAction {
        let response: TimedSyncResponse = match decode_payload(&envelope.payload) {
            Ok(response) => response,
            Err(_) => return HandlerAction::ban_peer(),
        };
        // the peer-list half of the exchange is absorbed by the manager,
        // which owns the peer store; it sees the same payload
        match self.consider_sync(ctx, &response.payload) {
            Some(sync) => HandlerAction::reply(sync),
            None => HandlerAction::default(),
        }
    }

    // ------------------------------------------------------------------
    // chain sync, responder side
    // ------------------------------------------------------------------

    fn on_request_chain(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
        now: u64,
    ) -> HandlerAction {
        let request: NotifyRequestChain = match decode_payload(&envelope.payload) {
            Ok(request) => request,
            Err(_) => return HandlerAction::ban_peer(),
        };
        if request.block_ids.is_empty() || request.block_ids.len() > MAX_CHAIN_ENTRY_IDS {
            return self.violation(ctx, now, "bad sparse chain length");
        }
        match self
            .core
            .find_blockchain_supplement(&request.block_ids, CHAIN_ENTRY_RESPONSE_LIMIT)
        {
            Ok(Some(supplement)) => HandlerAction::reply(Envelope::response(
                NOTIFY_RESPONSE_CHAIN_ENTRY,
                envelope.request_id,
                encode_payload(&NotifyResponseChainEntry {
                    start_height: supplement.start_height,
                    total_height: supplement.total_height,
                    block_ids: supplement.block_ids,
                }),
            )),
            // no shared history at all: different network or fabricated
            // sparse chain
            Ok(None) => self.violation(ctx, now, "sparse chain shares no history"),
            Err(e) => {
                log::error!("supplement lookup failed: {e:#}");
                HandlerAction::drop_peer()
            }
        }
    }

    fn on_request_objects(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
        now: u64,
    ) -> HandlerAction {
        let request: NotifyRequestGetObjects = match decode_payload(&envelope.payload) {
            Ok(request) => request,
            Err(_) => return HandlerAction::ban_peer(),
        };
        if request.blocks.len() + request.txs.len() > MAX_OBJECT_REQUEST {
            return self.violation(ctx, now, "object request too large");
        }
        let response = match self.core.get_objects(&request.blocks, &request.txs) {
            Ok(response) => response,
            Err(e) => {
                log::error!("object lookup failed: {e:#}");
                return HandlerAction::drop_peer();
            }
        };
        let blocks = response
            .blocks
            .iter()
            .map(|(block, txs)| RawBlockEntry {
                block: to_bytes(block),
                txs: txs.iter().map(to_bytes).collect(),
            })
            .collect();
        HandlerAction::reply(Envelope::response(
            NOTIFY_RESPONSE_GET_OBJECTS,
            envelope.request_id,
            encode_payload(&NotifyResponseGetObjects {
                blocks,
                txs: response.txs.iter().map(to_bytes).collect(),
                missed_ids: response.missed,
                current_height: response.current_height,
            }),
        ))
    }

    // ------------------------------------------------------------------
    // chain sync, requester side
    // ------------------------------------------------------------------

    fn on_chain_entry(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
        now: u64,
    ) -> HandlerAction {
        let response: NotifyResponseChainEntry = match decode_payload(&envelope.payload) {
            Ok(response) => response,
            Err(_) => return HandlerAction::ban_peer(),
        };
        if ctx.lock().state != SyncState::SynchronizingRequested {
            return self.violation(ctx, now, "unsolicited chain entry");
        }
        if response.block_ids.is_empty() || response.block_ids.len() > MAX_CHAIN_ENTRY_IDS {
            return self.violation(ctx, now, "bad chain entry length");
        }
        // the first id is the split point and must be on our main chain
        match self.core.is_known_main_block(&response.block_ids[0]) {
            Ok(true) => {}
            Ok(false) => return self.violation(ctx, now, "chain entry split point unknown"),
            Err(e) => {
                log::error!("split point lookup failed: {e:#}");
                return HandlerAction::drop_peer();
            }
        }

        let mut queue = Vec::new();
        for hash in &response.block_ids[1..] {
            match self.core.have_block(hash) {
                Ok(true) => {}
                Ok(false) => queue.push(*hash),
                Err(e) => {
                    log::error!("have_block failed: {e:#}");
                    return HandlerAction::drop_peer();
                }
            }
        }

        let mut guard = ctx.lock();
        guard.remote_total_height = response.total_height;
        guard.download_queue.extend(queue);
        guard.state = SyncState::SynchronizingDownloading;
        log::info!(
            "chain entry from peer {}: {} ids starting at height {}, {} to download",
            guard.peer_id,
            response.block_ids.len(),
            response.start_height,
            guard.download_queue.len()
        );
        match self.build_objects_request(&mut guard) {
            Some(request) => {
                drop(guard);
                HandlerAction::reply(request)
            }
            None => {
                // nothing new in this entry; either we are done or the
                // next entry continues from our new top
                drop(guard);
                self.after_download_step(ctx)
            }
        }
    }

    /// Pop the next download batch and build its GET_OBJECTS request.
    fn build_objects_request(&self, guard: &mut ConnectionContext) -> Option<Envelope> {
        if guard.download_queue.is_empty() || !guard.requested_objects.is_empty() {
            return None;
        }
        let mut batch = Vec::with_capacity(SYNC_BATCH_SIZE);
        while batch.len() < SYNC_BATCH_SIZE {
            match guard.download_queue.pop_front() {
                Some(hash) => {
                    guard.requested_objects.insert(hash);
                    batch.push(hash);
                }
                None => break,
            }
        }
        Some(Envelope::request(
            NOTIFY_REQUEST_GET_OBJECTS,
            self.next_request_id(),
            encode_payload(&NotifyRequestGetObjects {
                blocks: batch,
                txs: Vec::new(),
            }),
        ))
    }

    /// After a download step: request more, continue with a fresh chain
    /// request, or declare the connection synchronized.
    fn after_download_step(&self, ctx: &Mutex<ConnectionContext>) -> HandlerAction {
        let local_height = self.core_height();
        let mut guard = ctx.lock();
        if let Some(request) = self.build_objects_request(&mut guard) {
            return HandlerAction::reply(request);
        }
        if !guard.requested_objects.is_empty() {
            return HandlerAction::default();
        }
        if local_height >= guard.remote_total_height {
            if guard.state == SyncState::SynchronizingDownloading {
                log::info!(
                    "synchronized with peer {} at height {}",
                    guard.peer_id,
                    local_height
                );
            }
            guard.state = SyncState::Normal;
            return HandlerAction::default();
        }
        // more remote history than one entry could carry
        guard.state = SyncState::SynchronizingRequested;
        drop(guard);
        let sparse = match self.core.build_sparse_chain() {
            Ok(sparse) => sparse,
            Err(e) => {
                log::error!("cannot build sparse chain: {e:#}");
                return HandlerAction::drop_peer();
            }
        };
        HandlerAction::reply(Envelope::request(
            NOTIFY_REQUEST_CHAIN,
            self.next_request_id(),
            encode_payload(&NotifyRequestChain { block_ids: sparse }),
        ))
    }

    async fn on_objects_response(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
        now: u64,
    ) -> HandlerAction {
        let response: NotifyResponseGetObjects = match decode_payload(&envelope.payload) {
            Ok(response) => response,
            Err(_) => return HandlerAction::ban_peer(),
        };

        // parse before taking the lock; malformed bodies are an offense
        let mut blocks: Vec<(Block, Vec<Transaction>)> = Vec::with_capacity(response.blocks.len());
        for entry in &response.blocks {
            let block: Block = match from_bytes(&entry.block) {
                Ok(block) => block,
                Err(_) => return HandlerAction::ban_peer(),
            };
            let mut txs = Vec::with_capacity(entry.txs.len());
            for blob in &entry.txs {
                match from_bytes::<Transaction>(blob) {
                    Ok(tx) => txs.push(tx),
                    Err(_) => return HandlerAction::ban_peer(),
                }
            }
            blocks.push((block, txs));
        }
        let mut loose_txs = Vec::with_capacity(response.txs.len());
        for blob in &response.txs {
            match from_bytes::<Transaction>(blob) {
                Ok(tx) => loose_txs.push(tx),
                Err(_) => return HandlerAction::ban_peer(),
            }
        }

        // everything in the response must have been asked for
        let pending_blob = {
            let mut guard = ctx.lock();
            for (block, _) in &blocks {
                let hash = block.hash();
                if !guard.requested_objects.remove(&hash) {
                    guard.state = SyncState::Closing;
                    log::warn!(
                        "peer {} sent non-requested block {}",
                        guard.peer_id,
                        hash
                    );
                    return HandlerAction::ban_peer();
                }
            }
            for tx in &loose_txs {
                let hash = tx.hash();
                if !guard.requested_objects.remove(&hash) {
                    guard.state = SyncState::Closing;
                    return HandlerAction::ban_peer();
                }
            }
            for hash in &response.missed_ids {
                guard.requested_objects.remove(hash);
            }
            guard.peer_height = guard.peer_height.max(response.current_height);
            guard.pending_block.take()
        };

        // blocks answered from a chain entry arrive in chain order;
        // an orphan here means the peer lied about that order
        for (block, txs) in blocks {
            let pow = match self.workers.pow_hash(block.hashing_blob()).await {
                Ok(pow) => pow,
                Err(_) => return HandlerAction::drop_peer(), // shutting down
            };
            let outcome = match self
                .core
                .handle_incoming_block(block, txs, BlockSource::Sync, Some(pow))
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("block handling failed: {e:#}");
                    return HandlerAction::drop_peer();
                }
            };
            match outcome {
                BlockHandleOutcome::Outcome(AddBlockResult::Rejected(
                    BlockRejectReason::Orphan,
                )) => {
                    return self.violation(ctx, now, "orphan inside solicited chain");
                }
                BlockHandleOutcome::Outcome(AddBlockResult::Rejected(reason)) => {
                    log::warn!("solicited block rejected: {reason}");
                    return HandlerAction::ban_peer();
                }
                BlockHandleOutcome::MissingTransactions(_) => {
                    // a raw block entry must be self-contained
                    return self.violation(ctx, now, "incomplete raw block entry");
                }
                BlockHandleOutcome::Outcome(_) => {}
            }
        }

        // a parked relay block whose transactions just arrived
        if let Some(blob) = pending_blob {
            if let Ok(block) = from_bytes::<Block>(&blob) {
                let action = self
                    .process_relayed_block(ctx, block, loose_txs.clone(), 0, now)
                    .await;
                if action.disconnect {
                    return action;
                }
            }
        } else if !loose_txs.is_empty() {
            // solicited pool transactions go through the normal path
            let action = self.admit_transactions(ctx, loose_txs, now, false).await;
            if action.disconnect {
                return action;
            }
        }

        self.after_download_step(ctx)
    }

    // ------------------------------------------------------------------
    // relay
    // ------------------------------------------------------------------

    async fn on_new_block(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
        now: u64,
    ) -> HandlerAction {
        let notify: NotifyNewBlock = match decode_payload(&envelope.payload) {
            Ok(notify) => notify,
            Err(_) => return HandlerAction::ban_peer(),
        };
        let block: Block = match from_bytes(&notify.block) {
            Ok(block) => block,
            Err(_) => return HandlerAction::ban_peer(),
        };
        {
            let mut guard = ctx.lock();
            guard.peer_height = guard.peer_height.max(notify.current_height);
        }
        self.process_relayed_block(ctx, block, Vec::new(), notify.hop, now)
            .await
    }

    async fn process_relayed_block(
        &self,
        ctx: &Mutex<ConnectionContext>,
        block: Block,
        provided_txs: Vec<Transaction>,
        hop: u32,
        now: u64,
    ) -> HandlerAction {
        let blob = to_bytes(&block);
        let pow = match self.workers.pow_hash(block.hashing_blob()).await {
            Ok(pow) => pow,
            Err(_) => return HandlerAction::drop_peer(),
        };
        let outcome = match self
            .core
            .handle_incoming_block(block, provided_txs, BlockSource::Relay, Some(pow))
        {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("block handling failed: {e:#}");
                return HandlerAction::drop_peer();
            }
        };
        match outcome {
            BlockHandleOutcome::Outcome(AddBlockResult::AcceptedMain { height, .. }) => {
                // new tip: pass it on, never back to the sender
                let exclude = Some(ctx.lock().peer_id);
                if let Some(peers) = self.peers() {
                    peers.broadcast(
                        Envelope::request(
                            NOTIFY_NEW_BLOCK,
                            self.next_request_id(),
                            encode_payload(&NotifyNewBlock {
                                block: blob,
                                current_height: height + 1,
                                hop: hop + 1,
                            }),
                        ),
                        exclude,
                    );
                }
                HandlerAction::default()
            }
            BlockHandleOutcome::Outcome(AddBlockResult::AcceptedAlternative { .. })
            | BlockHandleOutcome::Outcome(AddBlockResult::AlreadyHave) => HandlerAction::default(),
            BlockHandleOutcome::Outcome(AddBlockResult::Rejected(BlockRejectReason::Orphan)) => {
                // unsolicited orphan: the peer knows a chain we do not;
                // fall back to sync instead of penalizing
                let remote = {
                    let guard = ctx.lock();
                    CoreSyncData {
                        current_height: guard.peer_height,
                        top_hash: guard.peer_top_hash,
                    }
                };
                match self.consider_sync(ctx, &remote) {
                    Some(request) => HandlerAction::reply(request),
                    None => HandlerAction::default(),
                }
            }
            BlockHandleOutcome::Outcome(AddBlockResult::Rejected(reason)) => {
                log::warn!("relayed block rejected: {reason}");
                self.violation(ctx, now, "relayed an invalid block")
            }
            BlockHandleOutcome::MissingTransactions(missing) => {
                let request = {
                    let mut guard = ctx.lock();
                    guard.pending_block = Some(blob);
                    for hash in &missing {
                        guard.requested_objects.insert(*hash);
                    }
                    Envelope::request(
                        NOTIFY_REQUEST_GET_OBJECTS,
                        self.next_request_id(),
                        encode_payload(&NotifyRequestGetObjects {
                            blocks: Vec::new(),
                            txs: missing,
                        }),
                    )
                };
                HandlerAction::reply(request)
            }
        }
    }

    async fn on_new_transactions(
        &self,
        ctx: &Mutex<ConnectionContext>,
        envelope: Envelope,
        now: u64,
    ) -> HandlerAction {
        let notify: NotifyNewTransactions = match decode_payload(&envelope.payload) {
            Ok(notify) => notify,
            Err(_) => return HandlerAction::ban_peer(),
        };
        let mut txs = Vec::with_capacity(notify.txs.len());
        for blob in &notify.txs {
            match from_bytes::<Transaction>(blob) {
                Ok(tx) => txs.push(tx),
                Err(_) => return HandlerAction::ban_peer(),
            }
        }
        self.admit_transactions(ctx, txs, now, true).await
    }

    /// Verify signatures off-loop, admit to the pool, relay what was
    /// accepted. Duplicates are dropped silently; an invalid signature
    /// is an offense.
    async fn admit_transactions(
        &self,
        ctx: &Mutex<ConnectionContext>,
        txs: Vec<Transaction>,
        now: u64,
        relay: bool,
    ) -> HandlerAction {
        let mut verified = Vec::with_capacity(txs.len());
        for tx in txs {
            let jobs = match self.core.ring_check_jobs(&tx) {
                Ok(Some(jobs)) => jobs,
                // unknown ring member: cannot verify, quietly skip; the
                // pool would reject it with the same reason anyway
                Ok(None) => continue,
                Err(e) => {
                    log::error!("ring resolution failed: {e:#}");
                    return HandlerAction::drop_peer();
                }
            };
            match self.workers.verify_ring_batch(jobs).await {
                Ok(true) => verified.push(tx),
                Ok(false) => return self.violation(ctx, now, "transaction signature invalid"),
                Err(_) => return HandlerAction::drop_peer(),
            }
        }
        if verified.is_empty() {
            return HandlerAction::default();
        }

        let results = match self.core.handle_incoming_transactions(
            verified.clone(),
            TxVerifyFlags {
                signatures_verified: true,
            },
        ) {
            Ok(results) => results,
            Err(e) => {
                log::error!("transaction handling failed: {e:#}");
                return HandlerAction::drop_peer();
            }
        };

        let accepted: Vec<Transaction> = verified
            .into_iter()
            .zip(&results)
            .filter(|(_, (_, result))| matches!(result, AddTxResult::Added))
            .map(|(tx, _)| tx)
            .collect();
        if relay && !accepted.is_empty() {
            let exclude = Some(ctx.lock().peer_id);
            if let Some(peers) = self.peers() {
                peers.broadcast(
                    Envelope::request(
                        NOTIFY_NEW_TRANSACTIONS,
                        self.next_request_id(),
                        encode_payload(&NotifyNewTransactions {
                            txs: accepted.iter().map(to_bytes).collect(),
                        }),
                    ),
                    exclude,
                );
            }
        }
        HandlerAction::default()
    }
}

#[cfg(test)]
mod tests;
