use crate::crypto::{Hash, fast_hash, slow_hash, tree_hash};
use crate::serialize::{BinRead, BinWrite, ReadError, Reader, Writer, to_bytes};
use crate::transaction::Transaction;

/// block header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: u64,
    pub prev_hash: Hash,
    pub nonce: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub miner_tx: Transaction,
    pub tx_hashes: Vec<Hash>,
}

impl Block {
    /// Tree hash over the miner transaction and every included tx hash.
    pub fn tx_tree_hash(&self) -> Hash {
        let mut hashes = Vec::with_capacity(1 + self.tx_hashes.len());
        hashes.push(self.miner_tx.hash());
        hashes.extend_from_slice(&self.tx_hashes);
        tree_hash(&hashes)
    }

    /// Bytes both the id hash and the PoW hash are computed over:
    /// header, tree root, transaction count (miner tx included).
    pub fn hashing_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.header.write(&mut w);
        self.tx_tree_hash().write(&mut w);
        w.put_varint(1 + self.tx_hashes.len() as u64);
        w.into_bytes()
    }

    /// Block id.
    pub fn hash(&self) -> Hash {
        fast_hash(&self.hashing_blob())
    }

    /// PoW hash. Expensive; run on a verification worker, not the
    /// event loop.
    pub fn pow_hash(&self) -> Hash {
        slow_hash(&self.hashing_blob())
    }

    pub fn blob_size(&self) -> usize {
        to_bytes(self).len()
    }

    /// Height claimed by the coinbase input, if well-formed.
    pub fn coinbase_height(&self) -> Option<u64> {
        match self.miner_tx.prefix.inputs.as_slice() {
            [crate::transaction::TransactionInput::Coinbase(input)] => Some(input.height),
            _ => None,
        }
    }
}

impl BinWrite for BlockHeader {
    fn write(&self, w: &mut Writer) {
        w.put_varint(self.major_version as u64);
        w.put_varint(self.minor_version as u64);
        w.put_varint(self.timestamp);
        self.prev_hash.write(w);
        w.put_bytes(&self.nonce.to_le_bytes());
    }
}

impl BinRead for BlockHeader {
    fn read(r: &mut Reader<'_>) -> Result<Self, ReadError> {
        let major = r.get_varint()?;
        let minor = r.get_varint()?;
        if major > u8::MAX as u64 || minor > u8::MAX as u64 {
            return Err(ReadError::InvalidValue("block version"));
        }
        Ok(BlockHeader {
            major_version: major as u8,
            minor_version: minor as u8,
            timestamp: r.get_varint()?,
            prev_hash: Hash::read(r)?,
            nonce: u32::from_le_bytes(r.get_array()?),
        })
    }
}

impl BinWrite for Block {
    fn write(&self, w: &mut Writer) {
        self.header.write(w);
        self.miner_tx.write(w);
        w.put_seq(&self.tx_hashes);
    }
}

impl BinRead for Block {
    fn read(r: &mut Reader<'_>) -> Result<Self, ReadError> {
        Ok(Block {
            header: BlockHeader::read(r)?,
            miner_tx: Transaction::read(r)?,
            tx_hashes: r.get_seq()?,
        })
    }
}
