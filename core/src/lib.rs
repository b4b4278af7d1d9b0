pub mod address;
pub mod block;
pub mod blockchain;
pub mod checkpoint;
pub mod core;
pub mod crypto;
pub mod currency;
pub mod db;
pub mod mempool;
pub mod serialize;
pub mod transaction;

// Explicit re-exports to avoid ambiguous glob re-exports
pub use address::AccountAddress;
pub use block::{Block, BlockHeader};
pub use blockchain::{
    AddBlockResult, BlockRejectReason, BlockSource, Blockchain, ChainSupplement, TxRejectReason,
};
pub use checkpoint::Checkpoints;
pub use core::{BlockHandleOutcome, ChainSink, Core, CoreInfo, FeePolicy, ProtocolRelay};
pub use crypto::{Hash, KeyImage, PublicKey, RingSignature, SecretKey};
pub use currency::Currency;
pub use mempool::{AddTxResult, TxPool, TxVerifyFlags};
pub use transaction::{Transaction, TransactionInput, TransactionOutput, TransactionPrefix};
