//! P2P node server: listener, outbound dialer, handshake enforcement,
//! connection registry, and the housekeeping timers.
//!
//! Every connection gets a reader task (strictly serial command
//! processing through the protocol handler) and a writer task fed by an
//! unbounded mailbox. The server owns the peer store; the protocol
//! handler reaches the connection set only through the [`PeerSet`]
//! capability.

use crate::dispatcher::StopToken;
use crate::p2p::connection::{ConnectionContext, Direction, PeerId, SyncState};
use crate::p2p::messages::*;
use crate::p2p::peerlist::{BLACKLIST_SECS, PeerStore};
use crate::p2p::protocol::{HandlerAction, PeerSet, ProtocolHandler};
use anyhow::{Context as _, Result};
use bytes::Bytes;
use cache_core::block::Block;
use cache_core::core::ProtocolRelay;
use cache_core::transaction::Transaction;
use cache_core::serialize::to_bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Bootstrap peers baked into the binary; dialed when the peer store is
/// empty. Testnet ignores them.
pub const SEED_NODES: &[&str] = &[
    "51.79.26.4:39999",
    "95.111.246.231:39999",
    "136.244.96.121:39999",
    "161.97.74.64:39999",
];

pub const PEERS_FILE: &str = "peers.bin";

pub const TARGET_OUT_DEGREE: usize = 8;
const HANDSHAKE_TIMEOUT_SECS: u64 = 30;
const IDLE_DROP_SECS: u64 = 300;
const TIMED_SYNC_INTERVAL_SECS: u64 = 60;
const DIAL_INTERVAL_SECS: u64 = 10;
const PEER_EXCHANGE_LIMIT: usize = 50;

pub struct NodeServerConfig {
    pub bind_addr: String,
    pub my_port: u16,
    pub network_id: [u8; 16],
    pub data_dir: PathBuf,
    pub seed_nodes: Vec<String>,
    pub add_peers: Vec<String>,
    pub out_degree: usize,
}

struct PeerHandle {
    sender: UnboundedSender<Envelope>,
    ctx: Arc<Mutex<ConnectionContext>>,
    /// remote node id learned in the handshake
    remote_id: u64,
    outbound: bool,
}

pub struct NodeServer {
    config: NodeServerConfig,
    handler: Arc<ProtocolHandler>,
    my_peer_id: u64,
    connections: Mutex<HashMap<PeerId, PeerHandle>>,
    peers: Mutex<PeerStore>,
    conn_seq: AtomicU64,
    stop: StopToken,
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

impl NodeServer {
    pub fn new(config: NodeServerConfig, handler: Arc<ProtocolHandler>, stop: StopToken) -> NodeServer {
        let peers = PeerStore::load(&config.data_dir.join(PEERS_FILE));
        // the random node id is what makes self-connections detectable
        let my_peer_id: u64 = rand::random();
        log::info!("p2p node id {:016x}", my_peer_id);
        NodeServer {
            config,
            handler,
            my_peer_id,
            connections: Mutex::new(HashMap::new()),
            peers: Mutex::new(peers),
            conn_seq: AtomicU64::new(1),
            stop,
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.my_peer_id
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn basic_node_data(&self) -> BasicNodeData {
        BasicNodeData {
            network_id: self.config.network_id,
            peer_id: self.my_peer_id,
            local_time: now_secs(),
            my_port: self.config.my_port,
        }
    }

    /// Main P2P loop: accept, dial, housekeep. Returns once the stop
    /// token fires and the helper tasks have drained.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("binding p2p listener on {}", self.config.bind_addr))?;
        log::info!("p2p listener bound to {}", self.config.bind_addr);

        let dialer = tokio::spawn(self.clone().dial_loop());
        let housekeeper = tokio::spawn(self.clone().housekeeping_loop());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = self.clone();
                            let address = addr.to_string();
                            if server.peers.lock().is_blacklisted(&address, now_secs()) {
                                log::debug!("refusing blacklisted {address}");
                                continue;
                            }
                            tokio::spawn(async move {
                                if let Err(e) = server
                                    .handle_connection(stream, address.clone(), Direction::Inbound)
                                    .await
                                {
                                    log::debug!("inbound {address} ended: {e:#}");
                                }
                            });
                        }
                        Err(e) => log::warn!("accept failed: {e}"),
                    }
                }
                _ = self.stop.cancelled() => break,
            }
        }

        log::info!("p2p loop stopping, draining connections");
        // dropping the senders ends every writer; readers observe the
        // stop token at their next suspension point
        self.connections.lock().clear();
        dialer.abort();
        housekeeper.abort();
        let _ = dialer.await;
        let _ = housekeeper.await;
        Ok(())
    }

    /// Persist the peer lists; called during ordered shutdown.
    pub fn deinit(&self) -> Result<()> {
        let path = self.config.data_dir.join(PEERS_FILE);
        self.peers.lock().save(&path)?;
        log::info!("peer lists saved to {}", path.display());
        Ok(())
    }

    async fn dial_loop(self: Arc<Self>) {
        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(DIAL_INTERVAL_SECS)) => {}
                    _ = self.stop.cancelled() => return,
                }
            }
            first = false;

            let now = now_secs();
            let outbound = self
                .connections
                .lock()
                .values()
                .filter(|handle| handle.outbound)
                .count();
            if outbound >= self.config.out_degree {
                continue;
            }
            let want = self.config.out_degree - outbound;

            let connected: Vec<String> = self
                .connections
                .lock()
                .values()
                .map(|handle| handle.ctx.lock().address.clone())
                .collect();
            let mut candidates: Vec<String> = {
                let peers = self.peers.lock();
                peers
                    .select_outbound(want, &|addr| connected.iter().any(|c| c == addr), now)
                    .into_iter()
                    .map(|record| record.address)
                    .collect()
            };
            if candidates.is_empty() {
                // nothing known yet: bootstrap from seeds and configured peers
                candidates = self
                    .config
                    .seed_nodes
                    .iter()
                    .chain(self.config.add_peers.iter())
                    .filter(|addr| !connected.contains(*addr))
                    .take(want)
                    .cloned()
                    .collect();
            }

            for address in candidates {
                if self.peers.lock().is_blacklisted(&address, now) {
                    continue;
                }
                self.peers.lock().note_connect_attempt(&address, now);
                let server = self.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(&address).await {
                        Ok(stream) => {
                            if let Err(e) = server
                                .clone()
                                .handle_connection(stream, address.clone(), Direction::Outbound)
                                .await
                            {
                                log::debug!("outbound {address} ended: {e:#}");
                                server.peers.lock().record_failure(&address);
                            }
                        }
                        Err(e) => {
                            log::debug!("dial {address} failed: {e}");
                            server.peers.lock().record_failure(&address);
                        }
                    }
                });
            }
        }
    }

    async fn housekeeping_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(TIMED_SYNC_INTERVAL_SECS)) => {}
                _ = self.stop.cancelled() => return,
            }
            let now = now_secs();

            // drop idle connections and unfinished handshakes
            let stale: Vec<PeerId> = self
                .connections
                .lock()
                .iter()
                .filter(|(_, handle)| {
                    let ctx = handle.ctx.lock();
                    ctx.is_idle(now, IDLE_DROP_SECS)
                        || (ctx.state == SyncState::BeforeHandshake
                            && ctx.is_idle(now, HANDSHAKE_TIMEOUT_SECS))
                })
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                log::info!("dropping idle connection {id}");
                self.connections.lock().remove(&id);
            }

            // periodic ping / chain comparison / peer exchange
            let request = Envelope::request(
                COMMAND_TIMED_SYNC,
                rand::random(),
                encode_payload(&TimedSyncRequest {
                    payload: self.handler.local_sync_data(),
                }),
            );
            for handle in self.connections.lock().values() {
                if handle.ctx.lock().state != SyncState::BeforeHandshake {
                    let _ = handle.sender.send(request.clone());
                }
            }
        }
    }

    /// Full lifecycle of one connection: handshake, serial command
    /// processing, teardown.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        address: String,
        direction: Direction,
    ) -> Result<()> {
        let conn_id: PeerId = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, codec());
        let mut writer = FramedWrite::new(write_half, codec());

        let ctx = Arc::new(Mutex::new(ConnectionContext::new(
            conn_id,
            address.clone(),
            direction,
            now_secs(),
        )));
        let (sender, mut outbox) = mpsc::unbounded_channel::<Envelope>();

        // writer task: drains the mailbox until every sender is gone
        let writer_stop = self.stop.clone();
        let write_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = outbox.recv() => match next {
                        Some(envelope) => {
                            let frame = Bytes::from(envelope.to_frame());
                            if writer.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_stop.cancelled() => break,
                }
            }
            let _ = writer.close().await;
        });

        // the connecting side introduces itself first
        if direction == Direction::Outbound {
            let request = Envelope::request(
                COMMAND_HANDSHAKE,
                rand::random(),
                encode_payload(&HandshakeRequest {
                    node_data: self.basic_node_data(),
                    payload: self.handler.local_sync_data(),
                }),
            );
            let _ = sender.send(request);
        }

        let result = self
            .clone()
            .connection_loop(conn_id, &ctx, &sender, &mut reader, direction, &address)
            .await;

        self.connections.lock().remove(&conn_id);
        drop(sender);
        let _ = write_task.await;
        result
    }

    async fn connection_loop(
        self: Arc<Self>,
        conn_id: PeerId,
        ctx: &Arc<Mutex<ConnectionContext>>,
        sender: &UnboundedSender<Envelope>,
        reader: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, LengthDelimitedCodec>,
        direction: Direction,
        address: &str,
    ) -> Result<()> {
        let mut handshaken = false;
        loop {
            let frame = tokio::select! {
                frame = reader.next() => frame,
                _ = self.stop.cancelled() => return Ok(()),
            };
            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    log::debug!("frame error from {address}: {e}");
                    self.peers.lock().record_failure(address);
                    return Ok(());
                }
                None => return Ok(()), // peer closed
            };
            let envelope = match Envelope::from_frame(bytes.as_ref()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::warn!("malformed envelope from {address}: {e}");
                    self.penalize(address);
                    return Ok(());
                }
            };

            if !handshaken {
                // nothing but a handshake is acceptable as the first command
                if envelope.command != COMMAND_HANDSHAKE {
                    log::warn!("{address} spoke before handshake");
                    self.penalize(address);
                    return Ok(());
                }
                match self
                    .process_handshake(conn_id, ctx, sender, envelope, direction, address)
                    .await?
                {
                    true => handshaken = true,
                    false => return Ok(()),
                }
                continue;
            }

            // the peer-list half of a timed sync belongs to the store,
            // which the protocol handler deliberately cannot touch
            if envelope.command == COMMAND_TIMED_SYNC && envelope.is_response {
                if let Ok(response) = decode_payload::<TimedSyncResponse>(&envelope.payload) {
                    let mut peers = self.peers.lock();
                    for entry in &response.peers {
                        peers.add_gray(entry);
                    }
                }
            }

            // commands on one connection are handled strictly in order
            let action = self
                .handler
                .handle_envelope(ctx, envelope, now_secs())
                .await;
            let disconnect = action.disconnect;
            self.apply_action(action, sender, address);
            if disconnect || ctx.lock().is_closing() {
                return Ok(());
            }
            // housekeeping may have evicted this connection meanwhile
            if !self.connections.lock().contains_key(&conn_id) {
                return Ok(());
            }
        }
    }

    fn apply_action(&self, action: HandlerAction, sender: &UnboundedSender<Envelope>, address: &str) {
        for reply in action.replies {
            let _ = sender.send(reply);
        }
        if action.ban {
            self.penalize(address);
        }
    }

    fn penalize(&self, address: &str) {
        let mut peers = self.peers.lock();
        peers.record_failure(address);
        peers.blacklist(address, now_secs() + BLACKLIST_SECS);
    }

    /// Validate the remote identity and finish the handshake. Returns
    /// false when the connection must be dropped.
    async fn process_handshake(
        self: &Arc<Self>,
        conn_id: PeerId,
        ctx: &Arc<Mutex<ConnectionContext>>,
        sender: &UnboundedSender<Envelope>,
        envelope: Envelope,
        direction: Direction,
        address: &str,
    ) -> Result<bool> {
        let now = now_secs();
        let (node_data, payload, peer_entries) = match (direction, envelope.is_response) {
            (Direction::Inbound, false) => {
                let request: HandshakeRequest = match decode_payload(&envelope.payload) {
                    Ok(request) => request,
                    Err(_) => {
                        self.penalize(address);
                        return Ok(false);
                    }
                };
                (request.node_data, request.payload, Vec::new())
            }
            (Direction::Outbound, true) => {
                let response: HandshakeResponse = match decode_payload(&envelope.payload) {
                    Ok(response) => response,
                    Err(_) => {
                        self.penalize(address);
                        return Ok(false);
                    }
                };
                (response.node_data, response.payload, response.peers)
            }
            _ => {
                self.penalize(address);
                return Ok(false);
            }
        };

        // wrong network: a sibling deployment, close immediately
        if node_data.network_id != self.config.network_id {
            log::warn!("{address} is on a different network, closing");
            return Ok(false);
        }
        // our own node id looped back to us: drop and briefly blacklist
        // so the dialer stops trying this address
        if node_data.peer_id == self.my_peer_id {
            log::warn!("self-connection detected via {address}");
            self.peers.lock().blacklist(address, now + BLACKLIST_SECS);
            return Ok(false);
        }
        // already connected to this peer: the newer connection loses
        {
            let connections = self.connections.lock();
            if connections
                .values()
                .any(|handle| handle.remote_id == node_data.peer_id)
            {
                log::info!("duplicate connection to peer {:016x}", node_data.peer_id);
                return Ok(false);
            }
        }

        // the peer's reachable address uses its advertised listen port
        let peer_address = match address.rsplit_once(':') {
            Some((host, _)) => format!("{}:{}", host, node_data.my_port),
            None => address.to_string(),
        };
        {
            let mut peers = self.peers.lock();
            peers.note_seen(&peer_address, node_data.peer_id, now);
            if direction == Direction::Outbound {
                peers.mark_anchor(&peer_address, now);
            }
            for entry in &peer_entries {
                peers.add_gray(entry);
            }
        }

        self.connections.lock().insert(
            conn_id,
            PeerHandle {
                sender: sender.clone(),
                ctx: ctx.clone(),
                remote_id: node_data.peer_id,
                outbound: direction == Direction::Outbound,
            },
        );

        if direction == Direction::Inbound {
            let peers = self.peers.lock().exchange_entries(PEER_EXCHANGE_LIMIT);
            let response = Envelope::response(
                COMMAND_HANDSHAKE,
                envelope.request_id,
                encode_payload(&HandshakeResponse {
                    node_data: self.basic_node_data(),
                    payload: self.handler.local_sync_data(),
                    peers,
                }),
            );
            let _ = sender.send(response);
        }

        ctx.lock().state = SyncState::Normal;
        log::info!(
            "handshake complete with {:016x} at {} (height {})",
            node_data.peer_id,
            peer_address,
            payload.current_height
        );
        // the handshake payload doubles as the first chain comparison
        if let Some(request) = self.handler.consider_sync(ctx, &payload) {
            let _ = sender.send(request);
        }
        Ok(true)
    }
}

impl PeerSet for NodeServer {
    /// Relay to every synchronized peer except the originator.
    fn broadcast(&self, envelope: Envelope, exclude: Option<PeerId>) {
        let connections = self.connections.lock();
        for (id, handle) in connections.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if handle.ctx.lock().state != SyncState::Normal {
                continue;
            }
            let _ = handle.sender.send(envelope.clone());
        }
    }

    fn exchange_entries(&self) -> Vec<PeerEntry> {
        self.peers.lock().exchange_entries(PEER_EXCHANGE_LIMIT)
    }

    fn local_peer_id(&self) -> u64 {
        self.my_peer_id
    }
}

impl ProtocolRelay for NodeServer {
    fn relay_block(&self, block: &Block, height: u64) {
        let envelope = Envelope::request(
            NOTIFY_NEW_BLOCK,
            rand::random(),
            encode_payload(&NotifyNewBlock {
                block: to_bytes(block),
                current_height: height + 1,
                hop: 0,
            }),
        );
        self.broadcast(envelope, None);
    }

    fn relay_transactions(&self, txs: &[Transaction]) {
        let envelope = Envelope::request(
            NOTIFY_NEW_TRANSACTIONS,
            rand::random(),
            encode_payload(&NotifyNewTransactions {
                txs: txs.iter().map(to_bytes).collect(),
            }),
        );
        self.broadcast(envelope, None);
    }
}
