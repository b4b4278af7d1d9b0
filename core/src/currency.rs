use crate::block::{Block, BlockHeader};
use crate::crypto::{Hash, PublicKey};
use crate::transaction::{
    CoinbaseInput, TRANSACTION_VERSION, Transaction, TransactionInput, TransactionOutput,
    TransactionPrefix,
};
use primitive_types::U256;

/// Network magic: "thecache project". A handshake with anything else
/// is a different deployment and is closed on sight.
pub const MAINNET_NETWORK_ID: [u8; 16] = [
    0x74, 0x68, 0x65, 0x63, 0x61, 0x63, 0x68, 0x65, 0x20, 0x70, 0x72, 0x6f, 0x6a, 0x65, 0x63,
    0x74,
];

/// Testnet magic differs in the trailing bytes so the nets can never mix.
pub const TESTNET_NETWORK_ID: [u8; 16] = [
    0x74, 0x68, 0x65, 0x63, 0x61, 0x63, 0x68, 0x65, 0x20, 0x74, 0x65, 0x73, 0x74, 0x6e, 0x65,
    0x74,
];

pub const P2P_DEFAULT_PORT: u16 = 39999;
pub const RPC_DEFAULT_PORT: u16 = 40000;

/// Compressed ed25519 basepoint; destination of the embedded genesis coinbase.
const GENESIS_OUTPUT_KEY: [u8; 32] = [
    0x58, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66,
];

const GENESIS_NONCE: u32 = 70;
const GENESIS_TIMESTAMP: u64 = 0;

/// Frozen consensus profile. Built once at startup and shared by
/// reference; nothing here changes after construction.
#[derive(Clone, Debug)]
pub struct Currency {
    testnet: bool,
    network_id: [u8; 16],
    /// base58 address tag
    public_address_prefix: u64,
    money_supply: u64,
    emission_speed_factor: u32,
    /// target seconds between blocks
    difficulty_target: u64,
    difficulty_window: usize,
    difficulty_cut: usize,
    /// coinbase outputs stay locked for this many blocks
    mined_money_unlock_window: u64,
    /// median window for timestamp sanity
    timestamp_check_window: usize,
    block_future_time_limit: u64,
    max_block_blob_size: usize,
    max_tx_blob_size: usize,
    min_fee_per_byte: u64,
    /// seconds a transaction may sit in the pool before eviction
    mempool_tx_lifetime: u64,
}

impl Currency {
    pub fn mainnet() -> Currency {
        Currency {
            testnet: false,
            network_id: MAINNET_NETWORK_ID,
            public_address_prefix: 0x1c8e5,
            money_supply: u64::MAX,
            emission_speed_factor: 18,
            difficulty_target: 120,
            difficulty_window: 720,
            difficulty_cut: 60,
            mined_money_unlock_window: 10,
            timestamp_check_window: 60,
            block_future_time_limit: 60 * 60 * 2,
            max_block_blob_size: 500_000,
            max_tx_blob_size: 100_000,
            min_fee_per_byte: 100,
            mempool_tx_lifetime: 60 * 60 * 24,
        }
    }

    pub fn testnet() -> Currency {
        Currency {
            testnet: true,
            network_id: TESTNET_NETWORK_ID,
            ..Currency::mainnet()
        }
    }

    pub fn is_testnet(&self) -> bool {
        self.testnet
    }

    pub fn network_id(&self) -> [u8; 16] {
        self.network_id
    }

    pub fn public_address_prefix(&self) -> u64 {
        self.public_address_prefix
    }

    pub fn difficulty_target(&self) -> u64 {
        self.difficulty_target
    }

    pub fn difficulty_window(&self) -> usize {
        self.difficulty_window
    }

    pub fn mined_money_unlock_window(&self) -> u64 {
        self.mined_money_unlock_window
    }

    pub fn timestamp_check_window(&self) -> usize {
        self.timestamp_check_window
    }

    pub fn block_future_time_limit(&self) -> u64 {
        self.block_future_time_limit
    }

    pub fn max_block_blob_size(&self) -> usize {
        self.max_block_blob_size
    }

    pub fn max_tx_blob_size(&self) -> usize {
        self.max_tx_blob_size
    }

    pub fn mempool_tx_lifetime(&self) -> u64 {
        self.mempool_tx_lifetime
    }

    #[cfg(test)]
    pub fn set_min_fee_per_byte(&mut self, fee: u64) {
        self.min_fee_per_byte = fee;
    }

    /// Reward for the next block given coins already in circulation.
    pub fn block_reward(&self, already_generated: u64) -> u64 {
        (self.money_supply - already_generated) >> self.emission_speed_factor
    }

    /// Fee floor for a transaction of `blob_size` bytes. Boundary is
    /// inclusive: a fee of exactly the floor passes.
    pub fn minimum_fee(&self, blob_size: usize) -> u64 {
        self.min_fee_per_byte.saturating_mul(blob_size as u64)
    }

    /// Is an output with this unlock constraint spendable in a block at
    /// `height` mined around `time`? Small values are heights, large
    /// ones unix timestamps, per CryptoNote convention.
    pub fn is_unlocked(&self, unlock_time: u64, height: u64, time: u64) -> bool {
        const UNLOCK_TIME_IS_TIMESTAMP: u64 = 500_000_000;
        if unlock_time < UNLOCK_TIME_IS_TIMESTAMP {
            height >= unlock_time
        } else {
            time >= unlock_time
        }
    }

    /// PoW test: accepts iff `pow_hash * difficulty` fits in 256 bits,
    /// i.e. the hash is at or below the target for this difficulty.
    pub fn check_proof_of_work(&self, pow_hash: &Hash, difficulty: u64) -> bool {
        if difficulty == 0 {
            return false;
        }
        let value = U256::from_little_endian(&pow_hash.0);
        value.checked_mul(U256::from(difficulty)).is_some()
    }

    /// Windowed trimmed-mean difficulty over recent solve times.
    ///
    /// `timestamps` and `cumulative_difficulties` are the last blocks of
    /// the branch being extended, oldest first, at most
    /// `difficulty_window` entries. Timestamps are sorted and each tail
    /// is cut before measuring the span, so single bogus clocks cannot
    /// swing the target.
    pub fn next_difficulty(
        &self,
        mut timestamps: Vec<u64>,
        mut cumulative_difficulties: Vec<u128>,
    ) -> u64 {
        debug_assert_eq!(timestamps.len(), cumulative_difficulties.len());
        if timestamps.len() > self.difficulty_window {
            let excess = timestamps.len() - self.difficulty_window;
            timestamps.drain(..excess);
            cumulative_difficulties.drain(..excess);
        }
        let length = timestamps.len();
        if length <= 1 {
            return 1;
        }

        timestamps.sort_unstable();
        let trim = if length > 2 * self.difficulty_cut + 2 {
            self.difficulty_cut
        } else {
            0
        };
        let cut_begin = trim;
        let cut_end = length - trim;

        let time_span = (timestamps[cut_end - 1] - timestamps[cut_begin]).max(1);
        let total_work =
            cumulative_difficulties[cut_end - 1] - cumulative_difficulties[cut_begin];
        if total_work == 0 {
            return 1;
        }

        let next = (total_work * self.difficulty_target as u128 + time_span as u128 - 1)
            / time_span as u128;
        next.clamp(1, u64::MAX as u128) as u64
    }

    /// Assemble the coinbase transaction for a block at `height`.
    pub fn construct_miner_tx(
        &self,
        height: u64,
        already_generated: u64,
        fees: u64,
        destination: PublicKey,
        extra_nonce: &[u8],
    ) -> Transaction {
        let reward = self.block_reward(already_generated).saturating_add(fees);
        Transaction {
            prefix: TransactionPrefix {
                version: TRANSACTION_VERSION,
                unlock_time: height + self.mined_money_unlock_window,
                inputs: vec![TransactionInput::Coinbase(CoinbaseInput { height })],
                outputs: vec![TransactionOutput {
                    amount: reward,
                    target: destination,
                }],
                extra: extra_nonce.to_vec(),
            },
            signatures: Vec::new(),
        }
    }

    /// The embedded genesis block. Deterministic: every node derives the
    /// identical block, so its hash anchors the network.
    pub fn genesis_block(&self) -> Block {
        let miner_tx = self.construct_miner_tx(0, 0, 0, PublicKey(GENESIS_OUTPUT_KEY), &[]);
        Block {
            header: BlockHeader {
                major_version: 1,
                minor_version: 0,
                timestamp: GENESIS_TIMESTAMP,
                prev_hash: Hash::ZERO,
                nonce: if self.testnet {
                    GENESIS_NONCE + 1
                } else {
                    GENESIS_NONCE
                },
            },
            miner_tx,
            tx_hashes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic_and_net_specific() {
        let main = Currency::mainnet();
        let test = Currency::testnet();
        assert_eq!(main.genesis_block().hash(), main.genesis_block().hash());
        assert_ne!(main.genesis_block().hash(), test.genesis_block().hash());
        assert_eq!(main.genesis_block().coinbase_height(), Some(0));
    }

    #[test]
    fn reward_decays_with_emission() {
        let c = Currency::mainnet();
        let first = c.block_reward(0);
        assert!(first > 0);
        let later = c.block_reward(first * 1000);
        assert!(later < first);
    }

    #[test]
    fn pow_check_boundary() {
        let c = Currency::mainnet();
        // difficulty 1 accepts anything
        assert!(c.check_proof_of_work(&Hash([0xff; 32]), 1));
        // an all-ones hash fails any higher difficulty
        assert!(!c.check_proof_of_work(&Hash([0xff; 32]), 2));
        // zero hash passes the hardest difficulty
        assert!(c.check_proof_of_work(&Hash::ZERO, u64::MAX));
        assert!(!c.check_proof_of_work(&Hash::ZERO, 0));
    }

    #[test]
    fn difficulty_with_no_history_is_one() {
        let c = Currency::mainnet();
        assert_eq!(c.next_difficulty(vec![], vec![]), 1);
        assert_eq!(c.next_difficulty(vec![100], vec![1]), 1);
    }

    #[test]
    fn difficulty_tracks_solve_time() {
        let c = Currency::mainnet();
        let target = c.difficulty_target();

        // 100 blocks exactly on target at difficulty 1000
        let timestamps: Vec<u64> = (0..100).map(|i| i * target).collect();
        let diffs: Vec<u128> = (0..100).map(|i| (i as u128 + 1) * 1000).collect();
        let on_target = c.next_difficulty(timestamps.clone(), diffs.clone());
        assert!((900..=1100).contains(&on_target), "got {on_target}");

        // same work found twice as fast -> difficulty roughly doubles
        let fast: Vec<u64> = (0..100).map(|i| i * target / 2).collect();
        let faster = c.next_difficulty(fast, diffs);
        assert!(faster > on_target + on_target / 2, "got {faster}");
    }

    #[test]
    fn fee_floor_scales_with_size() {
        let c = Currency::mainnet();
        assert_eq!(c.minimum_fee(0), 0);
        assert!(c.minimum_fee(1000) > c.minimum_fee(100));
    }

    #[test]
    fn unlock_window_semantics() {
        let c = Currency::mainnet();
        assert!(c.is_unlocked(10, 10, 0));
        assert!(!c.is_unlocked(11, 10, 0));
        // timestamp-style lock
        assert!(c.is_unlocked(1_600_000_000, 0, 1_600_000_000));
        assert!(!c.is_unlocked(1_600_000_000, 0, 1_599_999_999));
    }
}
