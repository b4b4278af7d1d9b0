//! Core orchestrator: owns the chain store and the transaction pool,
//! exposes the narrow surfaces the protocol handler and the RPC server
//! call into, and emits relay events after state is committed.

use crate::address::AccountAddress;
use crate::block::Block;
use crate::blockchain::{AddBlockResult, BlockSource, Blockchain, ChainSupplement};
use crate::crypto::{Hash, KeyImage, PublicKey, RingSignature};
use crate::mempool::{AddTxResult, TxPool, TxVerifyFlags};
use crate::serialize::from_bytes;
use crate::transaction::{Transaction, TransactionInput};
use anyhow::{Result, anyhow};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Relay capability implemented by the protocol layer. The orchestrator
/// only calls it for locally originated objects (RPC submissions);
/// network-received objects are rebroadcast by the protocol handler
/// itself, which knows hop counts and the originating peer.
pub trait ProtocolRelay: Send + Sync {
    fn relay_block(&self, block: &Block, height: u64);
    fn relay_transactions(&self, txs: &[Transaction]);
}

/// Chain capability the protocol handler drives. Implemented by [`Core`];
/// handed out as a non-owning view to break the core ↔ protocol cycle.
pub trait ChainSink: Send + Sync {
    fn handle_incoming_block(
        &self,
        block: Block,
        provided_txs: Vec<Transaction>,
        source: BlockSource,
        pow_hash: Option<Hash>,
    ) -> Result<BlockHandleOutcome>;
    fn handle_incoming_transactions(
        &self,
        txs: Vec<Transaction>,
        flags: TxVerifyFlags,
    ) -> Result<Vec<(Hash, AddTxResult)>>;
    fn build_sparse_chain(&self) -> Result<Vec<Hash>>;
    fn find_blockchain_supplement(
        &self,
        remote_sparse: &[Hash],
        max_count: usize,
    ) -> Result<Option<ChainSupplement>>;
    fn get_objects(&self, blocks: &[Hash], txs: &[Hash]) -> Result<ObjectsResponse>;
    fn top(&self) -> (Hash, u64);
    fn have_block(&self, hash: &Hash) -> Result<bool>;
    fn is_known_main_block(&self, hash: &Hash) -> Result<bool>;
    fn ring_check_jobs(&self, tx: &Transaction) -> Result<Option<Vec<RingCheckJob>>>;
    fn hashing_blob(&self, block: &Block) -> Vec<u8>;
}

#[derive(Debug)]
pub enum BlockHandleOutcome {
    Outcome(AddBlockResult),
    /// Block body references transactions the node does not have; the
    /// protocol handler requests them before retrying.
    MissingTransactions(Vec<Hash>),
}

pub struct ObjectsResponse {
    pub blocks: Vec<(Block, Vec<Transaction>)>,
    pub txs: Vec<Transaction>,
    pub missed: Vec<Hash>,
    pub current_height: u64,
}

/// Inputs of one ring signature check, detached from chain state so the
/// verification workers can run it without holding any lock.
#[derive(Clone)]
pub struct RingCheckJob {
    pub prefix_hash: Hash,
    pub key_image: KeyImage,
    pub ring: Vec<PublicKey>,
    pub signature: RingSignature,
}

impl RingCheckJob {
    pub fn check(&self) -> bool {
        crate::crypto::check_ring_signature(
            &self.prefix_hash,
            &self.key_image,
            &self.ring,
            &self.signature,
        )
    }
}

/// Remote-node fee parameters, validated at startup and held for the
/// RPC server to read.
#[derive(Clone, Default)]
pub struct FeePolicy {
    pub address: Option<AccountAddress>,
    pub amount: u64,
    pub view_key: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CoreInfo {
    pub height: u64,
    pub top_block_hash: String,
    pub difficulty: u64,
    pub cumulative_difficulty: u128,
    pub tx_pool_size: usize,
    pub testnet: bool,
}

// Lock order: chain before pool, never the reverse.
pub struct Core {
    chain: RwLock<Blockchain>,
    pool: RwLock<TxPool>,
    relay: OnceCell<Arc<dyn ProtocolRelay>>,
    fee_policy: FeePolicy,
    node_id: Option<String>,
}

impl Core {
    pub fn new(chain: Blockchain, fee_policy: FeePolicy, node_id: Option<String>) -> Core {
        Core {
            chain: RwLock::new(chain),
            pool: RwLock::new(TxPool::new()),
            relay: OnceCell::new(),
            fee_policy,
            node_id,
        }
    }

    /// Wire the relay capability once the protocol layer exists.
    pub fn set_protocol_relay(&self, relay: Arc<dyn ProtocolRelay>) {
        if self.relay.set(relay).is_err() {
            log::warn!("protocol relay was already wired");
        }
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        &self.fee_policy
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    fn now() -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }

    // ------------------------------------------------------------------
    // RPC hook surface
    // ------------------------------------------------------------------

    pub fn get_info(&self) -> Result<CoreInfo> {
        let chain = self.chain.read();
        let (top, _) = chain.tip();
        Ok(CoreInfo {
            height: chain.height(),
            top_block_hash: top.to_string(),
            difficulty: chain.next_difficulty()?,
            cumulative_difficulty: chain.cumulative_difficulty(),
            tx_pool_size: self.pool.read().len(),
            testnet: chain.currency().is_testnet(),
        })
    }

    pub fn get_height(&self) -> u64 {
        self.chain.read().height()
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<(Block, u64)>> {
        self.chain.read().get_block(hash)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.chain.read().get_block_by_height(height)
    }

    /// Bodies for the requested hashes, checking the pool before the
    /// chain; unknown hashes come back in the second list.
    pub fn get_transactions(&self, hashes: &[Hash]) -> Result<(Vec<Transaction>, Vec<Hash>)> {
        let chain = self.chain.read();
        let pool = self.pool.read();
        let mut found = Vec::new();
        let mut missed = Vec::new();
        for hash in hashes {
            if let Some(tx) = pool.get(hash) {
                found.push(tx.clone());
            } else if let Some((tx, _)) = chain.get_transaction(hash)? {
                found.push(tx);
            } else {
                missed.push(*hash);
            }
        }
        Ok((found, missed))
    }

    /// Wallet submission path: parse, admit to the pool, relay.
    pub fn send_raw_tx(&self, tx_blob: &[u8]) -> Result<AddTxResult> {
        let tx: Transaction = from_bytes(tx_blob)
            .map_err(|e| anyhow!("unparseable transaction blob: {}", e))?;
        let results =
            self.handle_incoming_transactions(vec![tx.clone()], TxVerifyFlags::default())?;
        let (_, result) = results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("transaction vanished during admission"))?;
        if matches!(result, AddTxResult::Added) {
            if let Some(relay) = self.relay.get() {
                relay.relay_transactions(&[tx]);
            }
        }
        Ok(result)
    }

    /// Candidate block for a miner paying `destination`.
    pub fn get_block_template(
        &self,
        destination: PublicKey,
        extra_nonce: &[u8],
    ) -> Result<(Block, u64)> {
        let chain = self.chain.read();
        let budget = chain.currency().max_block_blob_size() / 2;
        let txs = self.pool.read().fill_block_template(budget);
        chain.create_block_template(&txs, destination, extra_nonce, Self::now())
    }

    /// Miner submission path: full acceptance, then relay on success.
    pub fn submit_block(&self, block_blob: &[u8]) -> Result<AddBlockResult> {
        let block: Block =
            from_bytes(block_blob).map_err(|e| anyhow!("unparseable block blob: {}", e))?;
        let outcome = self.handle_incoming_block(block.clone(), Vec::new(), BlockSource::Local, None)?;
        match outcome {
            BlockHandleOutcome::Outcome(result) => {
                if let AddBlockResult::AcceptedMain { height, .. } = &result {
                    if let Some(relay) = self.relay.get() {
                        relay.relay_block(&block, *height);
                    }
                }
                Ok(result)
            }
            BlockHandleOutcome::MissingTransactions(_) => Err(anyhow!(
                "submitted block references transactions not in this node's pool"
            )),
        }
    }

    pub fn is_key_image_spent(&self, image: &KeyImage) -> Result<bool> {
        if self.pool.read().uses_key_image(image) {
            return Ok(true);
        }
        self.chain.read().is_key_image_spent(image)
    }

    pub fn get_random_outputs(
        &self,
        amount: u64,
        count: usize,
    ) -> Result<Vec<(u64, PublicKey)>> {
        self.chain.read().get_random_outputs(amount, count, Self::now())
    }
}

impl ChainSink for Core {
    /// The block ingestion path shared by sync, relay and RPC submission.
    fn handle_incoming_block(
        &self,
        block: Block,
        provided_txs: Vec<Transaction>,
        source: BlockSource,
        pow_hash: Option<Hash>,
    ) -> Result<BlockHandleOutcome> {
        let now = Self::now();
        let mut chain = self.chain.write();
        let mut pool = self.pool.write();

        // resolve every hash the block names: wire payload first, then
        // the pool, then the store
        let provided: HashMap<Hash, Transaction> = provided_txs
            .into_iter()
            .map(|tx| (tx.hash(), tx))
            .collect();
        let mut txs = Vec::with_capacity(block.tx_hashes.len());
        let mut missing = Vec::new();
        for hash in &block.tx_hashes {
            if let Some(tx) = provided.get(hash) {
                txs.push(tx.clone());
            } else if let Some(tx) = pool.get(hash) {
                txs.push(tx.clone());
            } else if let Some((tx, _)) = chain.get_transaction(hash)? {
                txs.push(tx);
            } else {
                missing.push(*hash);
            }
        }
        if !missing.is_empty() {
            return Ok(BlockHandleOutcome::MissingTransactions(missing));
        }

        let result = chain.add_block(block.clone(), txs, source, pow_hash, now)?;

        if let AddBlockResult::AcceptedMain { reorg, .. } = &result {
            // committed transactions leave the pool
            for hash in &block.tx_hashes {
                pool.take_tx(hash);
            }
            if let Some(summary) = reorg {
                // retired branch transactions return to the pool when
                // still valid; their signatures were proven on the chain
                for tx in &summary.retired_txs {
                    let outcome = pool.add_tx(
                        tx.clone(),
                        &chain,
                        TxVerifyFlags {
                            signatures_verified: true,
                        },
                        now,
                    )?;
                    if let AddTxResult::Rejected(reason) = outcome {
                        log::info!(
                            "retired tx {} not reinstated after reorg: {}",
                            tx.hash(),
                            reason
                        );
                    }
                }
                // the switch may have invalidated older entries
                pool.revalidate(&chain, now)?;
            }
            let lifetime = chain.currency().mempool_tx_lifetime();
            pool.on_blockchain_inc(now, lifetime);
        }
        Ok(BlockHandleOutcome::Outcome(result))
    }

    /// Offer transactions to the pool; returns per-tx outcomes so the
    /// protocol handler can decide what to relay and whom to penalize.
    fn handle_incoming_transactions(
        &self,
        txs: Vec<Transaction>,
        flags: TxVerifyFlags,
    ) -> Result<Vec<(Hash, AddTxResult)>> {
        let now = Self::now();
        let chain = self.chain.read();
        let mut pool = self.pool.write();
        let mut results = Vec::with_capacity(txs.len());
        for tx in txs {
            let hash = tx.hash();
            let result = pool.add_tx(tx, &chain, flags, now)?;
            results.push((hash, result));
        }
        Ok(results)
    }

    fn build_sparse_chain(&self) -> Result<Vec<Hash>> {
        self.chain.read().build_sparse_chain()
    }

    fn find_blockchain_supplement(
        &self,
        remote_sparse: &[Hash],
        max_count: usize,
    ) -> Result<Option<ChainSupplement>> {
        self.chain
            .read()
            .find_blockchain_supplement(remote_sparse, max_count)
    }

    /// Responder side of NOTIFY_REQUEST_GET_OBJECTS.
    fn get_objects(&self, blocks: &[Hash], txs: &[Hash]) -> Result<ObjectsResponse> {
        let chain = self.chain.read();
        let pool = self.pool.read();
        let mut out_blocks = Vec::new();
        let mut missed = Vec::new();
        for hash in blocks {
            match chain.get_block(hash)? {
                Some((block, _)) => {
                    let bodies = chain.get_block_transactions(&block)?;
                    out_blocks.push((block, bodies));
                }
                None => missed.push(*hash),
            }
        }
        let mut found_txs = Vec::new();
        for hash in txs {
            if let Some(tx) = pool.get(hash) {
                found_txs.push(tx.clone());
            } else if let Some((tx, _)) = chain.get_transaction(hash)? {
                found_txs.push(tx);
            } else {
                missed.push(*hash);
            }
        }
        Ok(ObjectsResponse {
            blocks: out_blocks,
            txs: found_txs,
            missed,
            current_height: chain.height(),
        })
    }

    fn top(&self) -> (Hash, u64) {
        self.chain.read().tip()
    }

    fn have_block(&self, hash: &Hash) -> Result<bool> {
        self.chain.read().have_block(hash)
    }

    fn is_known_main_block(&self, hash: &Hash) -> Result<bool> {
        self.chain.read().is_main_block(hash)
    }

    /// Resolve the rings of `tx` under a read lock so signature checks
    /// can run off-loop. None when a ring member is unknown.
    fn ring_check_jobs(&self, tx: &Transaction) -> Result<Option<Vec<RingCheckJob>>> {
        let chain = self.chain.read();
        let prefix_hash = tx.prefix_hash();
        let mut jobs = Vec::new();
        for (input, sig) in tx.prefix.inputs.iter().zip(&tx.signatures) {
            let key_input = match input {
                TransactionInput::Key(key) => key,
                TransactionInput::Coinbase(_) => return Ok(None),
            };
            let mut ring = Vec::with_capacity(key_input.output_indices.len());
            for &index in &key_input.output_indices {
                match chain.get_output(key_input.amount, index)? {
                    Some(record) => ring.push(PublicKey(record.target)),
                    None => return Ok(None),
                }
            }
            jobs.push(RingCheckJob {
                prefix_hash,
                key_image: key_input.key_image,
                ring,
                signature: sig.clone(),
            });
        }
        Ok(Some(jobs))
    }

    fn hashing_blob(&self, block: &Block) -> Vec<u8> {
        block.hashing_blob()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoints;
    use crate::crypto::keys::generate_keys;
    use crate::crypto::{generate_key_image, generate_ring_signature, hash_to_point};
    use crate::currency::Currency;
    use crate::serialize::to_bytes;
    use crate::transaction::{
        KeyInput, TRANSACTION_VERSION, TransactionOutput, TransactionPrefix,
    };
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicU64, Ordering};

    static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    struct Harness {
        core: Core,
        path: std::path::PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.path).ok();
        }
    }

    fn harness() -> Harness {
        let path = std::env::temp_dir().join(format!(
            "cache-core-test-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        let chain = Blockchain::open(
            &path,
            Arc::new(Currency::mainnet()),
            Checkpoints::new(),
        )
        .unwrap();
        Harness {
            core: Core::new(chain, FeePolicy::default(), Some("unit".into())),
            path,
        }
    }

    fn dest() -> PublicKey {
        PublicKey(hash_to_point(b"core miner").compress().to_bytes())
    }

    struct CountingRelay {
        blocks: AtomicU64,
    }

    impl ProtocolRelay for CountingRelay {
        fn relay_block(&self, _block: &Block, _height: u64) {
            self.blocks.fetch_add(1, Ordering::SeqCst);
        }
        fn relay_transactions(&self, _txs: &[Transaction]) {}
    }

    #[test]
    fn template_mine_submit_relays_and_grows_chain() {
        let h = harness();
        let relay = Arc::new(CountingRelay {
            blocks: AtomicU64::new(0),
        });
        h.core.set_protocol_relay(relay.clone());

        let (block, difficulty) = h.core.get_block_template(dest(), b"nonce").unwrap();
        assert_eq!(difficulty, 1);
        let result = h.core.submit_block(&to_bytes(&block)).unwrap();
        assert!(matches!(result, AddBlockResult::AcceptedMain { .. }));
        assert_eq!(h.core.get_height(), 2);
        assert_eq!(relay.blocks.load(Ordering::SeqCst), 1);

        // resubmission is idempotent and not re-relayed
        let result = h.core.submit_block(&to_bytes(&block)).unwrap();
        assert!(matches!(result, AddBlockResult::AlreadyHave));
        assert_eq!(relay.blocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_info_reflects_state() {
        let h = harness();
        let info = h.core.get_info().unwrap();
        assert_eq!(info.height, 1);
        assert!(!info.testnet);
        assert_eq!(info.tx_pool_size, 0);
        assert_eq!(h.core.node_id(), Some("unit"));

        let (block, _) = h.core.get_block_template(dest(), &[]).unwrap();
        h.core.submit_block(&to_bytes(&block)).unwrap();
        let info = h.core.get_info().unwrap();
        assert_eq!(info.height, 2);
        assert_eq!(info.top_block_hash, block.hash().to_string());
    }

    #[test]
    fn queries_cover_pool_and_chain() {
        let h = harness();
        let (block, _) = h.core.get_block_template(dest(), &[]).unwrap();
        h.core.submit_block(&to_bytes(&block)).unwrap();

        let (found, missed) = h
            .core
            .get_transactions(&[block.miner_tx.hash(), crate::crypto::fast_hash(b"nope")])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(missed.len(), 1);

        let objects = h
            .core
            .get_objects(&[block.hash(), crate::crypto::fast_hash(b"ghost")], &[])
            .unwrap();
        assert_eq!(objects.blocks.len(), 1);
        assert_eq!(objects.missed.len(), 1);
        assert_eq!(objects.current_height, 2);
    }

    #[test]
    fn malformed_blobs_are_errors_not_panics() {
        let h = harness();
        assert!(h.core.send_raw_tx(&[0xde, 0xad]).is_err());
        assert!(h.core.submit_block(&[0xbe, 0xef]).is_err());
    }

    /// Extend the main chain by one template block, PoW handed in as
    /// already verified the way the sync workers do it.
    fn grow(core: &Core, destination: PublicKey) -> Block {
        let (block, _) = core.get_block_template(destination, &[]).unwrap();
        let outcome = core
            .handle_incoming_block(
                block.clone(),
                Vec::new(),
                BlockSource::Local,
                Some(Hash::ZERO),
            )
            .unwrap();
        assert!(matches!(
            outcome,
            BlockHandleOutcome::Outcome(AddBlockResult::AcceptedMain { .. })
        ));
        block
    }

    /// A transaction committed on the losing side of a chain switch and
    /// still valid on the winning side must be back in the pool after
    /// the reorg.
    #[test]
    fn reorg_reinstates_rolled_back_transactions() {
        let node = harness();
        let rival = harness();
        let miner = generate_keys(&mut OsRng);

        // block 1 pays the test key; ten more blocks mature it past the
        // coinbase unlock window
        let block1 = grow(&node.core, miner.public);
        let mut shared = vec![block1.clone()];
        for _ in 0..10 {
            shared.push(grow(&node.core, dest()));
        }

        // the rival node follows the same prefix
        for block in &shared {
            let outcome = rival
                .core
                .handle_incoming_block(
                    block.clone(),
                    Vec::new(),
                    BlockSource::Sync,
                    Some(Hash::ZERO),
                )
                .unwrap();
            assert!(matches!(
                outcome,
                BlockHandleOutcome::Outcome(AddBlockResult::AcceptedMain { .. })
            ));
        }
        assert_eq!(node.core.top(), rival.core.top());

        // spend the matured coinbase; it enters the pool and then a block
        let reward = block1.miner_tx.prefix.outputs[0].amount;
        let image = generate_key_image(&miner.public, &miner.secret);
        let fee = 1_000_000;
        let mut tx = Transaction {
            prefix: TransactionPrefix {
                version: TRANSACTION_VERSION,
                unlock_time: 0,
                inputs: vec![TransactionInput::Key(KeyInput {
                    amount: reward,
                    output_indices: vec![0],
                    key_image: image,
                })],
                outputs: vec![TransactionOutput {
                    amount: reward - fee,
                    target: dest(),
                }],
                extra: Vec::new(),
            },
            signatures: Vec::new(),
        };
        let sig = generate_ring_signature(
            &tx.prefix_hash(),
            &image,
            &[miner.public],
            &miner.secret,
            0,
            &mut OsRng,
        )
        .unwrap();
        tx.signatures.push(sig);

        let result = node.core.send_raw_tx(&to_bytes(&tx)).unwrap();
        assert!(matches!(result, AddTxResult::Added));
        assert!(node.core.pool.read().have_tx(&tx.hash()));

        let spend_block = grow(&node.core, dest());
        assert_eq!(spend_block.tx_hashes, vec![tx.hash()]);
        assert!(
            !node.core.pool.read().have_tx(&tx.hash()),
            "committed transactions leave the pool"
        );

        // the rival mines two empty blocks on the fork point and wins
        let rival_blocks = [grow(&rival.core, dest()), grow(&rival.core, dest())];
        let outcome = node
            .core
            .handle_incoming_block(
                rival_blocks[0].clone(),
                Vec::new(),
                BlockSource::Relay,
                Some(Hash::ZERO),
            )
            .unwrap();
        assert!(matches!(
            outcome,
            BlockHandleOutcome::Outcome(AddBlockResult::AcceptedAlternative { .. })
        ));
        let outcome = node
            .core
            .handle_incoming_block(
                rival_blocks[1].clone(),
                Vec::new(),
                BlockSource::Relay,
                Some(Hash::ZERO),
            )
            .unwrap();
        match outcome {
            BlockHandleOutcome::Outcome(AddBlockResult::AcceptedMain {
                reorg: Some(summary),
                ..
            }) => {
                assert_eq!(summary.retired_txs.len(), 1);
                assert_eq!(summary.retired_txs[0].hash(), tx.hash());
            }
            other => panic!("expected a reorg, got {other:?}"),
        }
        assert_eq!(node.core.top(), rival.core.top());

        // the rolled-back spend is valid on the new chain and back in
        // the pool
        assert!(node.core.pool.read().have_tx(&tx.hash()));
        let (found, missed) = node.core.get_transactions(&[tx.hash()]).unwrap();
        assert_eq!(found.len(), 1);
        assert!(missed.is_empty());
        assert!(
            node.core.is_key_image_spent(&image).unwrap(),
            "the pool claims the key image again"
        );
    }
}
