use crate::block::{Block, BlockHeader};
use crate::checkpoint::Checkpoints;
use crate::crypto::{Hash, KeyImage, PublicKey, check_ring_signature};
use crate::currency::Currency;
use crate::db::{open_db, put_batch};
use crate::serialize::{from_bytes, to_bytes};
use crate::transaction::{Transaction, TransactionInput, TxShapeError};
use anyhow::{Result, anyhow, bail};
use bincode::config;
use bincode::{Decode, Encode};
use once_cell::sync::Lazy;
use rand::Rng;
use rocksdb::{DB, WriteBatch};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub static BINCODE_CONFIG: Lazy<config::Configuration> = Lazy::new(config::standard);

/// Deepest alternative-branch switch this node will perform; alt blocks
/// forking below this are dropped rather than tracked.
pub const MAX_REORG_DEPTH: u64 = 100;

/// Where a block came from; the caller grades rejections with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSource {
    /// mined locally or submitted over RPC
    Local,
    /// solicited during chain sync
    Sync,
    /// unsolicited NOTIFY_NEW_BLOCK relay
    Relay,
}

/// Why a transaction failed validation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TxRejectReason {
    #[error("malformed transaction: {0}")]
    InvalidSemantics(TxShapeError),
    #[error("key image already used")]
    KeyImageAlreadyUsed,
    #[error("fee below minimum")]
    FeeBelowMinimum,
    #[error("transaction exceeds size limit")]
    TooLarge,
    #[error("ring references an unknown output")]
    RingMemberUnknown,
    #[error("ring signature invalid")]
    SignatureInvalid,
    #[error("ring member still locked")]
    UnlockInFuture,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockRejectReason {
    #[error("parent block unknown")]
    Orphan,
    #[error("unsupported block version {0}")]
    InvalidVersion(u8),
    #[error("timestamp below median of recent blocks")]
    TimestampTooOld,
    #[error("timestamp too far in the future")]
    TimestampTooNew,
    #[error("proof of work does not meet difficulty")]
    InvalidProofOfWork,
    #[error("hash contradicts checkpoint at height {0}")]
    CheckpointMismatch(u64),
    #[error("invalid coinbase: {0}")]
    InvalidCoinbase(String),
    #[error("block blob exceeds size limit")]
    BlockTooLarge,
    #[error("transactions do not match tx_hashes")]
    TxHashMismatch,
    #[error("transaction {0} invalid: {1}")]
    InvalidTransaction(Hash, TxRejectReason),
    #[error("branch forks below the reorg window")]
    ForkTooDeep,
}

/// Outcome of a completed chain switch; transactions of rolled-back
/// blocks go back through the mempool if still valid.
#[derive(Debug)]
pub struct ReorgSummary {
    pub split_height: u64,
    pub retired_txs: Vec<Transaction>,
    pub new_tip: Hash,
}

#[derive(Debug)]
pub enum AddBlockResult {
    AcceptedMain {
        height: u64,
        reorg: Option<ReorgSummary>,
    },
    AcceptedAlternative {
        height: u64,
    },
    AlreadyHave,
    Rejected(BlockRejectReason),
}

/// Continuation of the main chain relative to a remote sparse chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSupplement {
    pub start_height: u64,
    pub total_height: u64,
    pub block_ids: Vec<Hash>,
}

// --- persisted records ---

#[derive(Encode, Decode)]
struct BlockRecord {
    block: Vec<u8>,
    height: u64,
    cumulative_difficulty: u128,
    already_generated: u64,
    timestamp: u64,
    on_main: bool,
}

#[derive(Encode, Decode)]
struct TxRecord {
    tx: Vec<u8>,
    block_hash: [u8; 32],
    global_indices: Vec<u64>,
}

#[derive(Encode, Decode, Clone)]
pub struct OutputRecord {
    pub tx_hash: [u8; 32],
    pub out_index: u32,
    pub target: [u8; 32],
    pub unlock_time: u64,
    pub height: u64,
}

fn block_key(hash: &Hash) -> Vec<u8> {
    [b"b:".as_slice(), &hash.0].concat()
}

fn height_key(height: u64) -> Vec<u8> {
    format!("h:{}", height).into_bytes()
}

fn tx_key(hash: &Hash) -> Vec<u8> {
    [b"t:".as_slice(), &hash.0].concat()
}

fn output_key(amount: u64, index: u64) -> Vec<u8> {
    format!("o:{}:{}", amount, index).into_bytes()
}

fn output_count_key(amount: u64) -> Vec<u8> {
    format!("oc:{}", amount).into_bytes()
}

fn key_image_key(image: &KeyImage) -> Vec<u8> {
    [b"k:".as_slice(), &image.0].concat()
}

const TIP_KEY: &[u8] = b"tip";
const REORG_MARKER_KEY: &[u8] = b"reorg!";

struct AltBlock {
    block: Block,
    txs: Vec<Transaction>,
    height: u64,
    cumulative_difficulty: u128,
}

/// The chain store: single source of truth for blocks, the per-amount
/// global output index, and the spent key-image set.
pub struct Blockchain {
    db: DB,
    currency: Arc<Currency>,
    checkpoints: Checkpoints,
    tip_hash: Hash,
    tip_height: u64,
    tip_cumulative_difficulty: u128,
    tip_already_generated: u64,
    alternative: HashMap<Hash, AltBlock>,
}

impl Blockchain {
    /// Open the store, creating and applying the genesis block on first run.
    pub fn open(
        path: &Path,
        currency: Arc<Currency>,
        checkpoints: Checkpoints,
    ) -> Result<Blockchain> {
        let db = open_db(path)?;

        if db.get(REORG_MARKER_KEY)?.is_some() {
            // every reorg step commits atomically, so the store sits on a
            // consistent per-block boundary; the marker only records that
            // the switch did not run to completion
            log::warn!("unfinished reorg marker found; resuming from the last committed block");
            db.delete(REORG_MARKER_KEY)?;
        }

        let mut chain = Blockchain {
            db,
            currency,
            checkpoints,
            tip_hash: Hash::ZERO,
            tip_height: 0,
            tip_cumulative_difficulty: 0,
            tip_already_generated: 0,
            alternative: HashMap::new(),
        };

        match chain.db.get(TIP_KEY)? {
            Some(raw) => {
                if raw.len() != 32 {
                    bail!("corrupt tip record");
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&raw);
                let tip = Hash(hash);
                let record = chain
                    .load_block_record(&tip)?
                    .ok_or_else(|| anyhow!("tip block {} missing from store", tip))?;
                chain.tip_hash = tip;
                chain.tip_height = record.height;
                chain.tip_cumulative_difficulty = record.cumulative_difficulty;
                chain.tip_already_generated = record.already_generated;
                log::info!(
                    "blockchain loaded, height {} tip {}",
                    chain.tip_height,
                    chain.tip_hash
                );
            }
            None => chain.apply_genesis()?,
        }
        Ok(chain)
    }

    fn apply_genesis(&mut self) -> Result<()> {
        let genesis = self.currency.genesis_block();
        let hash = genesis.hash();
        let reward = genesis.miner_tx.output_amount().unwrap_or(0);

        let mut batch = WriteBatch::default();
        self.stage_block(&mut batch, &genesis, &[], hash, 0, 1, reward)?;
        batch.put(TIP_KEY, hash.0);
        put_batch(&self.db, batch)?;

        self.tip_hash = hash;
        self.tip_height = 0;
        self.tip_cumulative_difficulty = 1;
        self.tip_already_generated = reward;
        log::info!("genesis block created: {}", hash);
        Ok(())
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    /// (tip hash, tip height)
    pub fn tip(&self) -> (Hash, u64) {
        (self.tip_hash, self.tip_height)
    }

    /// Number of blocks on the main chain.
    pub fn height(&self) -> u64 {
        self.tip_height + 1
    }

    pub fn cumulative_difficulty(&self) -> u128 {
        self.tip_cumulative_difficulty
    }

    pub fn already_generated(&self) -> u64 {
        self.tip_already_generated
    }

    fn load_block_record(&self, hash: &Hash) -> Result<Option<BlockRecord>> {
        match self.db.get(block_key(hash))? {
            Some(blob) => {
                let (record, _) = bincode::decode_from_slice(&blob, *BINCODE_CONFIG)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn have_block(&self, hash: &Hash) -> Result<bool> {
        if self.alternative.contains_key(hash) {
            return Ok(true);
        }
        Ok(self.db.get(block_key(hash))?.is_some())
    }

    /// Only main-chain blocks are persisted, so a stored record is a
    /// main-chain membership proof.
    pub fn is_main_block(&self, hash: &Hash) -> Result<bool> {
        Ok(self.db.get(block_key(hash))?.is_some())
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<(Block, u64)>> {
        if let Some(alt) = self.alternative.get(hash) {
            return Ok(Some((alt.block.clone(), alt.height)));
        }
        match self.load_block_record(hash)? {
            Some(record) => {
                let block = from_bytes::<Block>(&record.block)
                    .map_err(|e| anyhow!("corrupt block record {}: {}", hash, e))?;
                Ok(Some((block, record.height)))
            }
            None => Ok(None),
        }
    }

    pub fn main_block_hash_at(&self, height: u64) -> Result<Option<Hash>> {
        match self.db.get(height_key(height))? {
            Some(raw) if raw.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&raw);
                Ok(Some(Hash(hash)))
            }
            Some(_) => bail!("corrupt height index at {}", height),
            None => Ok(None),
        }
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.main_block_hash_at(height)? {
            Some(hash) => Ok(self.get_block(&hash)?.map(|(block, _)| block)),
            None => Ok(None),
        }
    }

    pub fn get_blocks_by_height(&self, start: u64, count: usize) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        for height in start..start.saturating_add(count as u64) {
            match self.get_block_by_height(height)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Transactions of a stored block, in `tx_hashes` order.
    pub fn get_block_transactions(&self, block: &Block) -> Result<Vec<Transaction>> {
        let mut txs = Vec::with_capacity(block.tx_hashes.len());
        for hash in &block.tx_hashes {
            let (tx, _) = self
                .get_transaction(hash)?
                .ok_or_else(|| anyhow!("stored block missing tx {}", hash))?;
            txs.push(tx);
        }
        Ok(txs)
    }

    pub fn get_transaction(&self, hash: &Hash) -> Result<Option<(Transaction, Hash)>> {
        match self.db.get(tx_key(hash))? {
            Some(blob) => {
                let (record, _): (TxRecord, _) =
                    bincode::decode_from_slice(&blob, *BINCODE_CONFIG)?;
                let tx = from_bytes::<Transaction>(&record.tx)
                    .map_err(|e| anyhow!("corrupt tx record {}: {}", hash, e))?;
                Ok(Some((tx, Hash(record.block_hash))))
            }
            None => Ok(None),
        }
    }

    pub fn have_transaction(&self, hash: &Hash) -> Result<bool> {
        Ok(self.db.get(tx_key(hash))?.is_some())
    }

    pub fn is_key_image_spent(&self, image: &KeyImage) -> Result<bool> {
        Ok(self.db.get(key_image_key(image))?.is_some())
    }

    fn output_count(&self, amount: u64) -> Result<u64> {
        match self.db.get(output_count_key(amount))? {
            Some(raw) if raw.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw);
                Ok(u64::from_le_bytes(buf))
            }
            Some(_) => bail!("corrupt output counter for amount {}", amount),
            None => Ok(0),
        }
    }

    pub fn get_output(&self, amount: u64, index: u64) -> Result<Option<OutputRecord>> {
        match self.db.get(output_key(amount, index))? {
            Some(blob) => {
                let (record, _) = bincode::decode_from_slice(&blob, *BINCODE_CONFIG)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Random unlocked outputs of `amount`, for ring construction.
    pub fn get_random_outputs(
        &self,
        amount: u64,
        count: usize,
        now: u64,
    ) -> Result<Vec<(u64, PublicKey)>> {
        let total = self.output_count(amount)?;
        if total == 0 {
            return Ok(Vec::new());
        }
        let mut rng = rand::thread_rng();
        let mut picked: HashSet<u64> = HashSet::new();
        let mut outs = Vec::new();
        let mut attempts = 0usize;
        while outs.len() < count && attempts < count * 16 {
            attempts += 1;
            let index = rng.gen_range(0..total);
            if !picked.insert(index) {
                continue;
            }
            if let Some(record) = self.get_output(amount, index)? {
                if self
                    .currency
                    .is_unlocked(record.unlock_time, self.tip_height + 1, now)
                {
                    outs.push((index, PublicKey(record.target)));
                }
            }
        }
        Ok(outs)
    }

    /// [tip, tip-1, tip-2, tip-4, tip-8, …, genesis]
    pub fn build_sparse_chain(&self) -> Result<Vec<Hash>> {
        let mut ids = Vec::new();
        let mut offset: u64 = 0;
        loop {
            if offset > self.tip_height {
                break;
            }
            let height = self.tip_height - offset;
            let hash = self
                .main_block_hash_at(height)?
                .ok_or_else(|| anyhow!("hole in main chain at height {}", height))?;
            ids.push(hash);
            if height == 0 {
                return Ok(ids);
            }
            offset = if offset == 0 { 1 } else { offset * 2 };
        }
        let genesis = self
            .main_block_hash_at(0)?
            .ok_or_else(|| anyhow!("missing genesis"))?;
        ids.push(genesis);
        Ok(ids)
    }

    /// Highest entry of `remote_sparse` that lies on our main chain,
    /// plus up to `max_count` main-chain ids continuing from it; the
    /// split block itself is the first id. None when not even genesis
    /// matches, which means the peer follows a different chain.
    pub fn find_blockchain_supplement(
        &self,
        remote_sparse: &[Hash],
        max_count: usize,
    ) -> Result<Option<ChainSupplement>> {
        let mut split_height = None;
        for hash in remote_sparse {
            if let Some(record) = self.load_block_record(hash)? {
                if record.on_main {
                    split_height = Some(record.height);
                    break;
                }
            }
        }
        let split_height = match split_height {
            Some(height) => height,
            None => return Ok(None),
        };

        let mut block_ids = Vec::new();
        for height in split_height..=self.tip_height {
            if block_ids.len() >= max_count {
                break;
            }
            let hash = self
                .main_block_hash_at(height)?
                .ok_or_else(|| anyhow!("hole in main chain at height {}", height))?;
            block_ids.push(hash);
        }
        Ok(Some(ChainSupplement {
            start_height: split_height,
            total_height: self.height(),
            block_ids,
        }))
    }

    /// Timestamps and cumulative difficulties of up to `count` blocks
    /// ending at `from` (inclusive), oldest first. Walks prev pointers
    /// through the alternative map first, then the store, so it works
    /// on any branch.
    fn branch_window(&self, from: &Hash, count: usize) -> Result<(Vec<u64>, Vec<u128>)> {
        let mut timestamps = Vec::with_capacity(count);
        let mut difficulties = Vec::with_capacity(count);
        let mut cursor = *from;
        while timestamps.len() < count {
            if let Some(alt) = self.alternative.get(&cursor) {
                timestamps.push(alt.block.header.timestamp);
                difficulties.push(alt.cumulative_difficulty);
                if alt.height == 0 {
                    break;
                }
                cursor = alt.block.header.prev_hash;
                continue;
            }
            match self.load_block_record(&cursor)? {
                Some(record) => {
                    let block = from_bytes::<Block>(&record.block)
                        .map_err(|e| anyhow!("corrupt block record: {}", e))?;
                    timestamps.push(record.timestamp);
                    difficulties.push(record.cumulative_difficulty);
                    if record.height == 0 {
                        break;
                    }
                    cursor = block.header.prev_hash;
                }
                None => bail!("broken prev link at {}", cursor),
            }
        }
        timestamps.reverse();
        difficulties.reverse();
        Ok((timestamps, difficulties))
    }

    /// Difficulty required of a block extending `parent`.
    fn difficulty_for_next(&self, parent: &Hash) -> Result<u64> {
        let (timestamps, difficulties) =
            self.branch_window(parent, self.currency.difficulty_window())?;
        Ok(self.currency.next_difficulty(timestamps, difficulties))
    }

    pub fn next_difficulty(&self) -> Result<u64> {
        let tip = self.tip_hash;
        self.difficulty_for_next(&tip)
    }

    fn median_timestamp_for(&self, parent: &Hash) -> Result<Option<u64>> {
        let (mut timestamps, _) =
            self.branch_window(parent, self.currency.timestamp_check_window())?;
        if timestamps.is_empty() {
            return Ok(None);
        }
        timestamps.sort_unstable();
        Ok(Some(timestamps[timestamps.len() / 2]))
    }

    /// (height, cumulative_difficulty, on_main) of a known block.
    fn info_for(&self, hash: &Hash) -> Result<Option<(u64, u128, bool)>> {
        if let Some(alt) = self.alternative.get(hash) {
            return Ok(Some((alt.height, alt.cumulative_difficulty, false)));
        }
        Ok(self
            .load_block_record(hash)?
            .map(|record| (record.height, record.cumulative_difficulty, record.on_main)))
    }

    // ------------------------------------------------------------------
    // validation
    // ------------------------------------------------------------------

    fn validate_header(
        &self,
        block: &Block,
        height: u64,
        parent: &Hash,
        difficulty: u64,
        pow_hash: &Hash,
        now: u64,
    ) -> Result<Option<BlockRejectReason>> {
        if block.header.major_version != 1 {
            return Ok(Some(BlockRejectReason::InvalidVersion(
                block.header.major_version,
            )));
        }
        if block.header.timestamp > now + self.currency.block_future_time_limit() {
            return Ok(Some(BlockRejectReason::TimestampTooNew));
        }
        if let Some(median) = self.median_timestamp_for(parent)? {
            // equal to the median is acceptable, below it is not
            if block.header.timestamp < median {
                return Ok(Some(BlockRejectReason::TimestampTooOld));
            }
        }
        if !self.currency.check_proof_of_work(pow_hash, difficulty) {
            return Ok(Some(BlockRejectReason::InvalidProofOfWork));
        }
        if !self.checkpoints.check_block(height, &block.hash()) {
            return Ok(Some(BlockRejectReason::CheckpointMismatch(height)));
        }
        Ok(None)
    }

    fn validate_coinbase(
        &self,
        block: &Block,
        height: u64,
        parent_generated: u64,
        fees: u64,
    ) -> Option<BlockRejectReason> {
        let miner_tx = &block.miner_tx;
        if miner_tx.check_shape().is_err() || !miner_tx.is_coinbase() {
            return Some(BlockRejectReason::InvalidCoinbase(
                "not a well-formed coinbase".into(),
            ));
        }
        match block.coinbase_height() {
            Some(h) if h == height => {}
            _ => {
                return Some(BlockRejectReason::InvalidCoinbase(format!(
                    "coinbase height does not match block height {}",
                    height
                )));
            }
        }
        let expected = self
            .currency
            .block_reward(parent_generated)
            .saturating_add(fees);
        let minted = miner_tx.output_amount().unwrap_or(u64::MAX);
        if minted != expected {
            return Some(BlockRejectReason::InvalidCoinbase(format!(
                "coinbase mints {} but reward + fees is {}",
                minted, expected
            )));
        }
        None
    }

    /// Full contextual validation of one transaction against current
    /// UTXO/key-image state. `block_images` carries key images already
    /// claimed by earlier transactions of the same block.
    /// `check_signatures` is false when a verification worker already
    /// proved the ring signatures against this exact prefix hash.
    pub fn validate_transaction(
        &self,
        tx: &Transaction,
        height: u64,
        now: u64,
        block_images: &mut HashSet<KeyImage>,
        check_signatures: bool,
    ) -> Result<Result<u64, TxRejectReason>> {
        if let Err(shape) = tx.check_shape() {
            return Ok(Err(TxRejectReason::InvalidSemantics(shape)));
        }
        if tx.is_coinbase() {
            return Ok(Err(TxRejectReason::InvalidSemantics(
                TxShapeError::MixedCoinbase,
            )));
        }
        if tx.blob_size() > self.currency.max_tx_blob_size() {
            return Ok(Err(TxRejectReason::TooLarge));
        }
        let fee = match tx.fee() {
            Some(fee) => fee,
            // outputs exceed inputs
            None => {
                return Ok(Err(TxRejectReason::InvalidSemantics(
                    TxShapeError::AmountOverflow,
                )));
            }
        };

        let prefix_hash = tx.prefix_hash();
        for (input, sig) in tx.prefix.inputs.iter().zip(&tx.signatures) {
            let key_input = match input {
                TransactionInput::Key(key) => key,
                // check_shape rejected mixed coinbase inputs already
                TransactionInput::Coinbase(_) => {
                    return Ok(Err(TxRejectReason::InvalidSemantics(
                        TxShapeError::MixedCoinbase,
                    )));
                }
            };

            if !key_input.key_image.is_canonical() {
                return Ok(Err(TxRejectReason::SignatureInvalid));
            }
            if self.is_key_image_spent(&key_input.key_image)?
                || block_images.contains(&key_input.key_image)
            {
                return Ok(Err(TxRejectReason::KeyImageAlreadyUsed));
            }

            let mut ring = Vec::with_capacity(key_input.output_indices.len());
            for &index in &key_input.output_indices {
                match self.get_output(key_input.amount, index)? {
                    Some(out) => {
                        if !self.currency.is_unlocked(out.unlock_time, height, now) {
                            return Ok(Err(TxRejectReason::UnlockInFuture));
                        }
                        ring.push(PublicKey(out.target));
                    }
                    None => return Ok(Err(TxRejectReason::RingMemberUnknown)),
                }
            }

            if check_signatures
                && !check_ring_signature(&prefix_hash, &key_input.key_image, &ring, sig)
            {
                return Ok(Err(TxRejectReason::SignatureInvalid));
            }
        }

        for image in tx.key_images() {
            block_images.insert(*image);
        }
        Ok(Ok(fee))
    }

    // ------------------------------------------------------------------
    // application
    // ------------------------------------------------------------------

    /// Stage every mutation for one block into `batch`: block record,
    /// height index, tx records, output index entries, key images.
    fn stage_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        txs: &[Transaction],
        hash: Hash,
        height: u64,
        cumulative_difficulty: u128,
        already_generated: u64,
    ) -> Result<()> {
        let record = BlockRecord {
            block: to_bytes(block),
            height,
            cumulative_difficulty,
            already_generated,
            timestamp: block.header.timestamp,
            on_main: true,
        };
        batch.put(
            block_key(&hash),
            bincode::encode_to_vec(&record, *BINCODE_CONFIG)?,
        );
        batch.put(height_key(height), hash.0);

        let mut all: Vec<(&Transaction, Hash)> = Vec::with_capacity(1 + txs.len());
        all.push((&block.miner_tx, block.miner_tx.hash()));
        for tx in txs {
            all.push((tx, tx.hash()));
        }

        // global output indices are assigned in block order, per amount
        let mut counters: HashMap<u64, u64> = HashMap::new();
        for (tx, tx_hash) in &all {
            let mut indices = Vec::with_capacity(tx.prefix.outputs.len());
            for (out_index, output) in tx.prefix.outputs.iter().enumerate() {
                if !counters.contains_key(&output.amount) {
                    counters.insert(output.amount, self.output_count(output.amount)?);
                }
                let next = counters
                    .get_mut(&output.amount)
                    .expect("counter seeded above");
                let index = *next;
                *next += 1;

                let out_record = OutputRecord {
                    tx_hash: tx_hash.0,
                    out_index: out_index as u32,
                    target: output.target.0,
                    unlock_time: tx.prefix.unlock_time,
                    height,
                };
                batch.put(
                    output_key(output.amount, index),
                    bincode::encode_to_vec(&out_record, *BINCODE_CONFIG)?,
                );
                indices.push(index);
            }
            for image in tx.key_images() {
                batch.put(key_image_key(image), [1u8]);
            }
            let tx_record = TxRecord {
                tx: to_bytes(*tx),
                block_hash: hash.0,
                global_indices: indices,
            };
            batch.put(
                tx_key(tx_hash),
                bincode::encode_to_vec(&tx_record, *BINCODE_CONFIG)?,
            );
        }

        for (amount, next) in counters {
            batch.put(output_count_key(amount), next.to_le_bytes());
        }
        Ok(())
    }

    /// Extend the main chain with a fully validated block.
    fn apply_main_block(
        &mut self,
        block: &Block,
        txs: &[Transaction],
        hash: Hash,
        difficulty: u64,
    ) -> Result<u64> {
        let height = self.tip_height + 1;
        let cumulative = self.tip_cumulative_difficulty + difficulty as u128;
        // fees recirculate; only the reward adds to supply
        let generated = self
            .tip_already_generated
            .saturating_add(self.currency.block_reward(self.tip_already_generated));

        let mut batch = WriteBatch::default();
        self.stage_block(&mut batch, block, txs, hash, height, cumulative, generated)?;
        batch.put(TIP_KEY, hash.0);
        put_batch(&self.db, batch)?;

        self.tip_hash = hash;
        self.tip_height = height;
        self.tip_cumulative_difficulty = cumulative;
        self.tip_already_generated = generated;
        Ok(height)
    }

    /// Roll back exactly the tip block, revoking its output indices and
    /// key images. Returns it with its transactions so the caller can
    /// reinstate them into the mempool. The block stays known, off-main.
    pub fn pop_block(&mut self) -> Result<(Block, Vec<Transaction>)> {
        if self.tip_height == 0 {
            bail!("refusing to pop the genesis block");
        }
        let tip = self.tip_hash;
        let record = self
            .load_block_record(&tip)?
            .ok_or_else(|| anyhow!("tip record missing"))?;
        let block = from_bytes::<Block>(&record.block)
            .map_err(|e| anyhow!("corrupt tip block: {}", e))?;
        let txs = self.get_block_transactions(&block)?;
        let parent = block.header.prev_hash;
        let parent_record = self
            .load_block_record(&parent)?
            .ok_or_else(|| anyhow!("parent of tip missing"))?;

        let mut batch = WriteBatch::default();
        let mut counters: HashMap<u64, u64> = HashMap::new();

        let mut all: Vec<(&Transaction, Hash)> = Vec::with_capacity(1 + txs.len());
        all.push((&block.miner_tx, block.miner_tx.hash()));
        for tx in &txs {
            all.push((tx, tx.hash()));
        }

        for (tx, tx_hash) in &all {
            let tx_record = match self.db.get(tx_key(tx_hash))? {
                Some(blob) => {
                    let (r, _): (TxRecord, _) =
                        bincode::decode_from_slice(&blob, *BINCODE_CONFIG)?;
                    r
                }
                None => bail!("tx record missing while popping {}", tx_hash),
            };
            for (output, &index) in tx.prefix.outputs.iter().zip(&tx_record.global_indices) {
                batch.delete(output_key(output.amount, index));
                // indices in the tip block are the newest for each
                // amount, so the counter rolls back to the smallest
                // index removed
                let counter = counters.entry(output.amount).or_insert(u64::MAX);
                *counter = (*counter).min(index);
            }
            for image in tx.key_images() {
                batch.delete(key_image_key(image));
            }
            batch.delete(tx_key(tx_hash));
        }

        for (amount, first_removed) in counters {
            batch.put(output_count_key(amount), first_removed.to_le_bytes());
        }

        // on-disk state always describes exactly the main chain; a
        // reorg re-inserts the replaced suffix into the alternative map
        batch.delete(height_key(record.height));
        batch.delete(block_key(&tip));
        batch.put(TIP_KEY, parent.0);
        put_batch(&self.db, batch)?;

        self.tip_hash = parent;
        self.tip_height = parent_record.height;
        self.tip_cumulative_difficulty = parent_record.cumulative_difficulty;
        self.tip_already_generated = parent_record.already_generated;
        Ok((block, txs))
    }

    // ------------------------------------------------------------------
    // acceptance
    // ------------------------------------------------------------------

    /// The acceptance pipeline. `txs` must carry the body of every hash
    /// in `block.tx_hashes`, in order; the caller resolves them from the
    /// mempool, the store, or the wire payload.
    ///
    /// `pow_hash` is the precomputed slow hash of the hashing blob when
    /// a verification worker already did the heavy part; None computes
    /// it inline.
    pub fn add_block(
        &mut self,
        block: Block,
        txs: Vec<Transaction>,
        source: BlockSource,
        pow_hash: Option<Hash>,
        now: u64,
    ) -> Result<AddBlockResult> {
        let hash = block.hash();
        if self.have_block(&hash)? {
            return Ok(AddBlockResult::AlreadyHave);
        }

        let total_size =
            block.blob_size() + txs.iter().map(Transaction::blob_size).sum::<usize>();
        if total_size > self.currency.max_block_blob_size() {
            return Ok(AddBlockResult::Rejected(BlockRejectReason::BlockTooLarge));
        }

        if txs.len() != block.tx_hashes.len()
            || txs
                .iter()
                .zip(&block.tx_hashes)
                .any(|(tx, expected)| tx.hash() != *expected)
        {
            return Ok(AddBlockResult::Rejected(BlockRejectReason::TxHashMismatch));
        }

        let parent = block.header.prev_hash;
        let (parent_height, parent_cumulative, parent_on_main) = match self.info_for(&parent)? {
            Some(info) => info,
            None => {
                log::debug!("orphan block {} from {:?}", hash, source);
                return Ok(AddBlockResult::Rejected(BlockRejectReason::Orphan));
            }
        };
        let height = parent_height + 1;

        let difficulty = self.difficulty_for_next(&parent)?;
        let pow_hash = match pow_hash {
            Some(h) => h,
            None => block.pow_hash(),
        };
        if let Some(reason) =
            self.validate_header(&block, height, &parent, difficulty, &pow_hash, now)?
        {
            log::warn!("block {} rejected [{}] from {:?}", hash, reason, source);
            return Ok(AddBlockResult::Rejected(reason));
        }

        if parent_on_main && parent == self.tip_hash {
            // main-chain extension: full contextual validation
            let mut block_images = HashSet::new();
            let mut fees = 0u64;
            for tx in &txs {
                match self.validate_transaction(tx, height, now, &mut block_images, true)? {
                    Ok(fee) => fees = fees.saturating_add(fee),
                    Err(reason) => {
                        log::warn!("block {} carries invalid tx: {}", hash, reason);
                        return Ok(AddBlockResult::Rejected(
                            BlockRejectReason::InvalidTransaction(tx.hash(), reason),
                        ));
                    }
                }
            }
            if let Some(reason) =
                self.validate_coinbase(&block, height, self.tip_already_generated, fees)
            {
                return Ok(AddBlockResult::Rejected(reason));
            }

            let height = self.apply_main_block(&block, &txs, hash, difficulty)?;
            log::info!("block {} accepted at height {}", hash, height);
            return Ok(AddBlockResult::AcceptedMain {
                height,
                reorg: None,
            });
        }

        // alternative branch
        if height + MAX_REORG_DEPTH <= self.tip_height {
            return Ok(AddBlockResult::Rejected(BlockRejectReason::ForkTooDeep));
        }
        let cumulative = parent_cumulative + difficulty as u128;
        self.alternative.insert(
            hash,
            AltBlock {
                block,
                txs,
                height,
                cumulative_difficulty: cumulative,
            },
        );
        log::info!(
            "alternative block {} at height {} (cumulative {} vs main {})",
            hash,
            height,
            cumulative,
            self.tip_cumulative_difficulty
        );

        // strictly greater: equal work keeps the first-seen chain
        if cumulative > self.tip_cumulative_difficulty {
            return self.try_reorg(hash, now);
        }
        Ok(AddBlockResult::AcceptedAlternative { height })
    }

    /// Switch the main chain to the alternative branch ending at
    /// `alt_tip`: pop main blocks to the split point, then replay the
    /// branch with full validation. Any invalid branch block aborts the
    /// switch and restores the original chain.
    fn try_reorg(&mut self, alt_tip: Hash, now: u64) -> Result<AddBlockResult> {
        // collect the branch, newest first, down to a main-chain parent
        let mut branch: Vec<Hash> = Vec::new();
        let mut cursor = alt_tip;
        let split_height = loop {
            match self.alternative.get(&cursor) {
                Some(alt) => {
                    branch.push(cursor);
                    cursor = alt.block.header.prev_hash;
                }
                None => match self.load_block_record(&cursor)? {
                    Some(record) if record.on_main => break record.height,
                    _ => bail!("alternative branch does not meet the main chain"),
                },
            }
        };
        branch.reverse();

        if !self.checkpoints.is_reorg_allowed(split_height) {
            // never roll back through a checkpoint
            for hash in &branch {
                self.alternative.remove(hash);
            }
            return Ok(AddBlockResult::Rejected(
                BlockRejectReason::CheckpointMismatch(split_height),
            ));
        }
        if self.tip_height.saturating_sub(split_height) > MAX_REORG_DEPTH {
            return Ok(AddBlockResult::Rejected(BlockRejectReason::ForkTooDeep));
        }

        log::warn!(
            "reorganization: switching to a branch of {} blocks from height {}",
            branch.len(),
            split_height + 1
        );
        self.db.put(REORG_MARKER_KEY, [1u8])?;

        // pop main blocks down to the split point, remembering enough to
        // retain them as an alternative branch afterwards
        let mut retired: Vec<(Hash, u64, u128, Block, Vec<Transaction>)> = Vec::new();
        while self.tip_height > split_height {
            let (hash, height, cumulative) = (
                self.tip_hash,
                self.tip_height,
                self.tip_cumulative_difficulty,
            );
            let (block, txs) = self.pop_block()?;
            retired.push((hash, height, cumulative, block, txs));
        }

        // replay the branch with full validation
        let mut applied: Vec<Hash> = Vec::new();
        let mut failure: Option<BlockRejectReason> = None;
        for hash in &branch {
            let (block, txs) = {
                let alt = self
                    .alternative
                    .get(hash)
                    .ok_or_else(|| anyhow!("alternative block vanished during reorg"))?;
                (alt.block.clone(), alt.txs.clone())
            };
            let height = self.tip_height + 1;
            let tip = self.tip_hash;
            let difficulty = self.difficulty_for_next(&tip)?;

            let mut block_images = HashSet::new();
            let mut fees = 0u64;
            let mut block_failure = None;
            for tx in &txs {
                match self.validate_transaction(tx, height, now, &mut block_images, true)? {
                    Ok(fee) => fees = fees.saturating_add(fee),
                    Err(reason) => {
                        block_failure = Some(BlockRejectReason::InvalidTransaction(
                            tx.hash(),
                            reason,
                        ));
                        break;
                    }
                }
            }
            if block_failure.is_none() {
                block_failure =
                    self.validate_coinbase(&block, height, self.tip_already_generated, fees);
            }
            if let Some(reason) = block_failure {
                failure = Some(reason);
                break;
            }

            self.apply_main_block(&block, &txs, *hash, difficulty)?;
            self.alternative.remove(hash);
            applied.push(*hash);
        }

        if let Some(reason) = failure {
            // undo the partial switch and restore the original chain
            log::warn!("reorg aborted, branch invalid: {}", reason);
            while applied.pop().is_some() {
                let _ = self.pop_block()?;
            }
            for (hash, _, _, block, txs) in retired.into_iter().rev() {
                let difficulty = self.difficulty_for_next(&block.header.prev_hash)?;
                self.apply_main_block(&block, &txs, hash, difficulty)?;
            }
            for hash in &branch {
                self.alternative.remove(hash);
            }
            self.db.delete(REORG_MARKER_KEY)?;
            return Ok(AddBlockResult::Rejected(reason));
        }

        self.db.delete(REORG_MARKER_KEY)?;

        // transactions of retired blocks the new branch did not include
        let mut included: HashSet<Hash> = HashSet::new();
        for hash in &branch {
            if let Some((block, _)) = self.get_block(hash)? {
                included.extend(block.tx_hashes);
            }
        }
        // the replaced suffix stays known as an alternative branch while
        // it remains inside the reorg window
        let mut retired_txs = Vec::new();
        for (hash, height, cumulative, block, txs) in retired {
            for tx in &txs {
                if !included.contains(&tx.hash()) {
                    retired_txs.push(tx.clone());
                }
            }
            self.alternative.insert(
                hash,
                AltBlock {
                    block,
                    txs,
                    height,
                    cumulative_difficulty: cumulative,
                },
            );
        }
        self.prune_alternative();

        log::warn!(
            "reorganization complete, new tip {} at height {}",
            self.tip_hash,
            self.tip_height
        );
        Ok(AddBlockResult::AcceptedMain {
            height: self.tip_height,
            reorg: Some(ReorgSummary {
                split_height,
                retired_txs,
                new_tip: self.tip_hash,
            }),
        })
    }

    /// Drop alternative blocks too far below the tip to ever win.
    fn prune_alternative(&mut self) {
        let floor = self.tip_height.saturating_sub(MAX_REORG_DEPTH);
        self.alternative.retain(|_, alt| alt.height >= floor);
    }

    /// Candidate block for miners: header on the current tip, coinbase
    /// paying reward plus the fees of `txs` to `destination`.
    pub fn create_block_template(
        &self,
        txs: &[Transaction],
        destination: PublicKey,
        extra_nonce: &[u8],
        now: u64,
    ) -> Result<(Block, u64)> {
        let height = self.tip_height + 1;
        let fees = txs.iter().filter_map(Transaction::fee).sum::<u64>();
        let miner_tx = self.currency.construct_miner_tx(
            height,
            self.tip_already_generated,
            fees,
            destination,
            extra_nonce,
        );
        let tip = self.tip_hash;
        let median = self.median_timestamp_for(&tip)?.unwrap_or(0);
        let block = Block {
            header: BlockHeader {
                major_version: 1,
                minor_version: 0,
                timestamp: now.max(median),
                prev_hash: self.tip_hash,
                nonce: 0,
            },
            miner_tx,
            tx_hashes: txs.iter().map(Transaction::hash).collect(),
        };
        let difficulty = self.next_difficulty()?;
        Ok((block, difficulty))
    }
}

#[cfg(test)]
mod tests;
