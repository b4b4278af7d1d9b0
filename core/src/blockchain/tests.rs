use super::*;
use crate::crypto::keys::generate_keys;
use crate::crypto::{generate_key_image, generate_ring_signature, hash_to_point};
use crate::transaction::{KeyInput, TRANSACTION_VERSION, TransactionOutput, TransactionPrefix};
use rand::rngs::OsRng;
use std::sync::atomic::{AtomicU64, Ordering};

static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Throwaway store under the system temp dir; removed on drop.
struct TestChain {
    chain: Blockchain,
    path: std::path::PathBuf,
}

impl Drop for TestChain {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.path).ok();
    }
}

fn open_chain(checkpoints: Checkpoints) -> TestChain {
    let path = std::env::temp_dir().join(format!(
        "cache-chain-test-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    let currency = Arc::new(Currency::mainnet());
    let chain = Blockchain::open(&path, currency, checkpoints).unwrap();
    TestChain { chain, path }
}

fn miner_dest() -> PublicKey {
    PublicKey(hash_to_point(b"test miner").compress().to_bytes())
}

const SPACING: u64 = 120;

fn ts_for(height: u64) -> u64 {
    height * SPACING
}

/// Template on the current tip; PoW is handed in as an already-verified
/// zero hash, the way the verification workers do it in production.
fn push_block(chain: &mut Blockchain, txs: Vec<Transaction>, dest: PublicKey) -> Block {
    let height = chain.tip().1 + 1;
    let (block, _difficulty) = chain
        .create_block_template(&txs, dest, &[], ts_for(height))
        .unwrap();
    let result = chain
        .add_block(
            block.clone(),
            txs,
            BlockSource::Local,
            Some(Hash::ZERO),
            ts_for(height),
        )
        .unwrap();
    match result {
        AddBlockResult::AcceptedMain { reorg: None, .. } => block,
        other => panic!("block not accepted: {other:?}"),
    }
}

#[test]
fn genesis_is_created_on_open() {
    let t = open_chain(Checkpoints::new());
    let (tip, height) = t.chain.tip();
    assert_eq!(height, 0);
    assert_eq!(
        tip,
        t.chain.currency().genesis_block().hash(),
        "tip must be the embedded genesis"
    );
    assert_eq!(t.chain.cumulative_difficulty(), 1);
}

#[test]
fn extend_main_chain_and_queries() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    let mut hashes = vec![t.chain.tip().0];
    for _ in 0..5 {
        hashes.push(push_block(&mut t.chain, vec![], dest).hash());
    }
    assert_eq!(t.chain.height(), 6);
    for (height, hash) in hashes.iter().enumerate() {
        assert_eq!(
            t.chain.main_block_hash_at(height as u64).unwrap(),
            Some(*hash)
        );
        assert!(t.chain.have_block(hash).unwrap());
    }
    let range = t.chain.get_blocks_by_height(2, 3).unwrap();
    assert_eq!(range.len(), 3);
    assert_eq!(range[0].hash(), hashes[2]);
}

#[test]
fn duplicate_add_is_already_have_and_idempotent() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    let block = push_block(&mut t.chain, vec![], dest);
    let tip_before = t.chain.tip();
    let cumulative = t.chain.cumulative_difficulty();

    let result = t
        .chain
        .add_block(block, vec![], BlockSource::Relay, Some(Hash::ZERO), ts_for(1))
        .unwrap();
    assert!(matches!(result, AddBlockResult::AlreadyHave));
    assert_eq!(t.chain.tip(), tip_before);
    assert_eq!(t.chain.cumulative_difficulty(), cumulative);
}

#[test]
fn orphan_is_rejected_not_buffered() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    let (mut block, _) = t
        .chain
        .create_block_template(&[], dest, &[], ts_for(1))
        .unwrap();
    block.header.prev_hash = crate::crypto::fast_hash(b"unknown parent");
    let result = t
        .chain
        .add_block(block, vec![], BlockSource::Relay, Some(Hash::ZERO), ts_for(1))
        .unwrap();
    assert!(matches!(
        result,
        AddBlockResult::Rejected(BlockRejectReason::Orphan)
    ));
}

#[test]
fn timestamp_median_boundary() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    push_block(&mut t.chain, vec![], dest);

    // median of [0, 120] is 120; equal passes
    let (mut block, _) = t
        .chain
        .create_block_template(&[], dest, &[], ts_for(2))
        .unwrap();
    block.header.timestamp = SPACING;
    let ok = t
        .chain
        .add_block(
            block.clone(),
            vec![],
            BlockSource::Local,
            Some(Hash::ZERO),
            ts_for(2),
        )
        .unwrap();
    assert!(matches!(ok, AddBlockResult::AcceptedMain { .. }));

    // one below the median is rejected
    let (mut late, _) = t
        .chain
        .create_block_template(&[], dest, &[], ts_for(3))
        .unwrap();
    late.header.timestamp = SPACING - 1;
    let rejected = t
        .chain
        .add_block(late, vec![], BlockSource::Local, Some(Hash::ZERO), ts_for(3))
        .unwrap();
    assert!(matches!(
        rejected,
        AddBlockResult::Rejected(BlockRejectReason::TimestampTooOld)
    ));
}

#[test]
fn far_future_timestamp_rejected() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    let now = ts_for(1);
    let (mut block, _) = t.chain.create_block_template(&[], dest, &[], now).unwrap();
    block.header.timestamp = now + t.chain.currency().block_future_time_limit() + 1;
    let result = t
        .chain
        .add_block(block, vec![], BlockSource::Relay, Some(Hash::ZERO), now)
        .unwrap();
    assert!(matches!(
        result,
        AddBlockResult::Rejected(BlockRejectReason::TimestampTooNew)
    ));
}

#[test]
fn wrong_coinbase_amount_rejected() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    let (mut block, _) = t
        .chain
        .create_block_template(&[], dest, &[], ts_for(1))
        .unwrap();
    block.miner_tx.prefix.outputs[0].amount += 1;
    let result = t
        .chain
        .add_block(block, vec![], BlockSource::Local, Some(Hash::ZERO), ts_for(1))
        .unwrap();
    assert!(matches!(
        result,
        AddBlockResult::Rejected(BlockRejectReason::InvalidCoinbase(_))
    ));
}

#[test]
fn checkpoint_mismatch_rejects_block() {
    let dest = miner_dest();

    // find out what the honest block at height 1 looks like
    let mut probe = open_chain(Checkpoints::new());
    let honest = push_block(&mut probe.chain, vec![], dest);
    drop(probe);

    // checkpoint height 1 to something else
    let mut checkpoints = Checkpoints::new();
    checkpoints
        .add(1, crate::crypto::fast_hash(b"the real block 1"))
        .unwrap();
    let mut t = open_chain(checkpoints);
    let result = t
        .chain
        .add_block(
            honest,
            vec![],
            BlockSource::Sync,
            Some(Hash::ZERO),
            ts_for(1),
        )
        .unwrap();
    assert!(matches!(
        result,
        AddBlockResult::Rejected(BlockRejectReason::CheckpointMismatch(1))
    ));
}

#[test]
fn sparse_chain_samples_logarithmically() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    for _ in 0..10 {
        push_block(&mut t.chain, vec![], dest);
    }
    let sparse = t.chain.build_sparse_chain().unwrap();
    // tip=10: offsets 0,1,2,4,8 then genesis
    let expected_heights = [10u64, 9, 8, 6, 2, 0];
    assert_eq!(sparse.len(), expected_heights.len());
    for (hash, height) in sparse.iter().zip(expected_heights) {
        assert_eq!(
            t.chain.main_block_hash_at(height).unwrap(),
            Some(*hash),
            "sparse entry should be height {height}"
        );
    }
}

#[test]
fn supplement_finds_split_point() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    for _ in 0..8 {
        push_block(&mut t.chain, vec![], dest);
    }
    let five = t.chain.main_block_hash_at(5).unwrap().unwrap();
    let remote = vec![
        crate::crypto::fast_hash(b"their tip we do not know"),
        five,
        t.chain.main_block_hash_at(0).unwrap().unwrap(),
    ];
    let supplement = t
        .chain
        .find_blockchain_supplement(&remote, 100)
        .unwrap()
        .unwrap();
    assert_eq!(supplement.start_height, 5);
    assert_eq!(supplement.total_height, 9);
    assert_eq!(supplement.block_ids[0], five);
    assert_eq!(supplement.block_ids.len(), 4); // heights 5..=8

    // a sparse chain sharing nothing with us has no supplement
    let stranger = vec![crate::crypto::fast_hash(b"foreign genesis")];
    assert!(
        t.chain
            .find_blockchain_supplement(&stranger, 100)
            .unwrap()
            .is_none()
    );
}

/// Spend the coinbase of block 1 once its unlock window passes, then
/// verify key-image accounting across spend, double-spend and pop.
#[test]
fn spend_pop_and_double_spend() {
    let mut t = open_chain(Checkpoints::new());
    let miner = generate_keys(&mut OsRng);
    let dest = miner.public;

    let block1 = push_block(&mut t.chain, vec![], dest);
    let reward1 = block1.miner_tx.prefix.outputs[0].amount;
    for _ in 0..10 {
        push_block(&mut t.chain, vec![], miner_dest());
    }
    // height is now 11; the block-1 coinbase (unlock 11) is spendable
    assert_eq!(t.chain.tip().1, 11);

    let image = generate_key_image(&dest, &miner.secret);
    let fee = 500u64;
    let mut tx = Transaction {
        prefix: TransactionPrefix {
            version: TRANSACTION_VERSION,
            unlock_time: 0,
            inputs: vec![TransactionInput::Key(KeyInput {
                amount: reward1,
                output_indices: vec![0],
                key_image: image,
            })],
            outputs: vec![TransactionOutput {
                amount: reward1 - fee,
                target: miner_dest(),
            }],
            extra: Vec::new(),
        },
        signatures: Vec::new(),
    };
    let sig = generate_ring_signature(
        &tx.prefix_hash(),
        &image,
        &[dest],
        &miner.secret,
        0,
        &mut OsRng,
    )
    .unwrap();
    tx.signatures.push(sig);

    assert!(!t.chain.is_key_image_spent(&image).unwrap());
    let spend_block = push_block(&mut t.chain, vec![tx.clone()], miner_dest());
    assert!(t.chain.is_key_image_spent(&image).unwrap());
    assert!(t.chain.have_transaction(&tx.hash()).unwrap());
    assert_eq!(spend_block.tx_hashes, vec![tx.hash()]);

    // spending the same key image again must fail
    let mut replay = tx.clone();
    replay.prefix.outputs[0].amount -= 1; // different tx, same image
    let sig = generate_ring_signature(
        &replay.prefix_hash(),
        &image,
        &[dest],
        &miner.secret,
        0,
        &mut OsRng,
    )
    .unwrap();
    replay.signatures = vec![sig];
    let height = t.chain.tip().1 + 1;
    let (block, _) = t
        .chain
        .create_block_template(&[replay.clone()], miner_dest(), &[], ts_for(height))
        .unwrap();
    let result = t
        .chain
        .add_block(
            block,
            vec![replay],
            BlockSource::Relay,
            Some(Hash::ZERO),
            ts_for(height),
        )
        .unwrap();
    assert!(matches!(
        result,
        AddBlockResult::Rejected(BlockRejectReason::InvalidTransaction(
            _,
            TxRejectReason::KeyImageAlreadyUsed
        ))
    ));

    // pop the spend block: key image unspent again, tx gone, and
    // re-adding restores the exact pre-pop state
    let tip_before = t.chain.tip();
    let cumulative_before = t.chain.cumulative_difficulty();
    let (popped, popped_txs) = t.chain.pop_block().unwrap();
    assert_eq!(popped.hash(), spend_block.hash());
    assert_eq!(popped_txs.len(), 1);
    assert!(!t.chain.is_key_image_spent(&image).unwrap());
    assert!(!t.chain.have_transaction(&tx.hash()).unwrap());

    let result = t
        .chain
        .add_block(
            popped,
            popped_txs,
            BlockSource::Local,
            Some(Hash::ZERO),
            ts_for(12),
        )
        .unwrap();
    assert!(matches!(result, AddBlockResult::AcceptedMain { .. }));
    assert_eq!(t.chain.tip(), tip_before);
    assert_eq!(t.chain.cumulative_difficulty(), cumulative_before);
    assert!(t.chain.is_key_image_spent(&image).unwrap());
}

#[test]
fn unlocked_window_is_enforced() {
    let mut t = open_chain(Checkpoints::new());
    let miner = generate_keys(&mut OsRng);
    let block1 = push_block(&mut t.chain, vec![], miner.public);
    let reward1 = block1.miner_tx.prefix.outputs[0].amount;

    // only 5 confirmations; coinbase unlocks at height 11
    for _ in 0..4 {
        push_block(&mut t.chain, vec![], miner_dest());
    }

    let image = generate_key_image(&miner.public, &miner.secret);
    let mut tx = Transaction {
        prefix: TransactionPrefix {
            version: TRANSACTION_VERSION,
            unlock_time: 0,
            inputs: vec![TransactionInput::Key(KeyInput {
                amount: reward1,
                output_indices: vec![0],
                key_image: image,
            })],
            outputs: vec![TransactionOutput {
                amount: reward1 - 100,
                target: miner_dest(),
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

    let height = t.chain.tip().1 + 1;
    let (block, _) = t
        .chain
        .create_block_template(&[tx.clone()], miner_dest(), &[], ts_for(height))
        .unwrap();
    let result = t
        .chain
        .add_block(
            block,
            vec![tx],
            BlockSource::Relay,
            Some(Hash::ZERO),
            ts_for(height),
        )
        .unwrap();
    assert!(matches!(
        result,
        AddBlockResult::Rejected(BlockRejectReason::InvalidTransaction(
            _,
            TxRejectReason::UnlockInFuture
        ))
    ));
}

#[test]
fn global_output_indices_stay_contiguous() {
    let mut t = open_chain(Checkpoints::new());
    let dest = miner_dest();
    let mut amounts = Vec::new();
    for _ in 0..4 {
        let block = push_block(&mut t.chain, vec![], dest);
        amounts.push(block.miner_tx.prefix.outputs[0].amount);
    }
    for amount in &amounts {
        let count = t.chain.output_count(*amount).unwrap();
        assert!(count >= 1);
        for index in 0..count {
            assert!(
                t.chain.get_output(*amount, index).unwrap().is_some(),
                "index {index} for amount {amount} must exist"
            );
        }
        assert!(t.chain.get_output(*amount, count).unwrap().is_none());
    }

    // popping the tip revokes its indices
    let tip_block = t.chain.get_block_by_height(4).unwrap().unwrap();
    let tip_amount = tip_block.miner_tx.prefix.outputs[0].amount;
    let before = t.chain.output_count(tip_amount).unwrap();
    t.chain.pop_block().unwrap();
    assert_eq!(t.chain.output_count(tip_amount).unwrap(), before - 1);
}

/// Longer alternative branch with more work replaces the main chain;
/// shorter one is retained as an alternative.
#[test]
fn reorg_to_heavier_branch() {
    let dest_a = miner_dest();
    let dest_b = PublicKey(hash_to_point(b"rival miner").compress().to_bytes());

    let mut t = open_chain(Checkpoints::new());
    // both nodes share height 1
    let shared = push_block(&mut t.chain, vec![], dest_a);

    // a rival node builds 3 blocks on top of the shared prefix
    let mut rival = open_chain(Checkpoints::new());
    let shared_result = rival
        .chain
        .add_block(
            shared.clone(),
            vec![],
            BlockSource::Sync,
            Some(Hash::ZERO),
            ts_for(1),
        )
        .unwrap();
    assert!(matches!(shared_result, AddBlockResult::AcceptedMain { .. }));
    let mut rival_blocks = Vec::new();
    for _ in 0..3 {
        rival_blocks.push(push_block(&mut rival.chain, vec![], dest_b));
    }

    // we extend only to height 3 (cumulative work 4)
    push_block(&mut t.chain, vec![], dest_a);
    push_block(&mut t.chain, vec![], dest_a);
    assert_eq!(t.chain.tip().1, 3);

    // rival blocks arrive: the first two cannot beat our work yet
    for (i, block) in rival_blocks.iter().take(2).enumerate() {
        let result = t
            .chain
            .add_block(
                block.clone(),
                vec![],
                BlockSource::Relay,
                Some(Hash::ZERO),
                ts_for(2 + i as u64),
            )
            .unwrap();
        assert!(
            matches!(result, AddBlockResult::AcceptedAlternative { .. }),
            "expected alternative, got {result:?}"
        );
    }

    // the third pushes cumulative work past ours and triggers the switch
    let result = t
        .chain
        .add_block(
            rival_blocks[2].clone(),
            vec![],
            BlockSource::Relay,
            Some(Hash::ZERO),
            ts_for(4),
        )
        .unwrap();
    match result {
        AddBlockResult::AcceptedMain {
            height,
            reorg: Some(summary),
        } => {
            assert_eq!(height, 4);
            assert_eq!(summary.split_height, 1);
            assert_eq!(summary.new_tip, rival_blocks[2].hash());
        }
        other => panic!("expected reorg, got {other:?}"),
    }
    assert_eq!(t.chain.tip().0, rival_blocks[2].hash());
    assert_eq!(t.chain.tip().1, 4);
    for (i, block) in rival_blocks.iter().enumerate() {
        assert_eq!(
            t.chain.main_block_hash_at(2 + i as u64).unwrap(),
            Some(block.hash())
        );
    }
    // our old height-2 block is retained as an alternative
    assert!(t.chain.have_block(&shared.hash()).unwrap());
}

#[test]
fn equal_work_keeps_first_seen_chain() {
    let dest_a = miner_dest();
    let dest_b = PublicKey(hash_to_point(b"rival miner").compress().to_bytes());

    let mut t = open_chain(Checkpoints::new());
    let ours = push_block(&mut t.chain, vec![], dest_a);

    let mut rival = open_chain(Checkpoints::new());
    let theirs = push_block(&mut rival.chain, vec![], dest_b);
    assert_ne!(ours.hash(), theirs.hash());

    let result = t
        .chain
        .add_block(
            theirs,
            vec![],
            BlockSource::Relay,
            Some(Hash::ZERO),
            ts_for(1),
        )
        .unwrap();
    assert!(matches!(result, AddBlockResult::AcceptedAlternative { .. }));
    assert_eq!(t.chain.tip().0, ours.hash());
}

#[test]
fn reload_restores_state() {
    let path = std::env::temp_dir().join(format!(
        "cache-chain-reload-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    let currency = Arc::new(Currency::mainnet());
    let tip;
    let generated;
    {
        let mut chain =
            Blockchain::open(&path, currency.clone(), Checkpoints::new()).unwrap();
        for height in 1..=3u64 {
            let (block, _) = chain
                .create_block_template(&[], miner_dest(), &[], ts_for(height))
                .unwrap();
            let result = chain
                .add_block(
                    block,
                    vec![],
                    BlockSource::Local,
                    Some(Hash::ZERO),
                    ts_for(height),
                )
                .unwrap();
            assert!(matches!(result, AddBlockResult::AcceptedMain { .. }));
        }
        tip = chain.tip();
        generated = chain.already_generated();
    }
    let reopened = Blockchain::open(&path, currency, Checkpoints::new()).unwrap();
    assert_eq!(reopened.tip(), tip);
    assert_eq!(reopened.already_generated(), generated);
    drop(reopened);
    std::fs::remove_dir_all(path).ok();
}
