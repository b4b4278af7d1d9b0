use crate::crypto::{Hash, KeyImage, PublicKey, RingSignature, Signature, fast_hash};
use crate::serialize::{BinRead, BinWrite, ReadError, Reader, Writer, to_bytes};
use thiserror::Error;

pub const TRANSACTION_VERSION: u8 = 1;

/// Upper bound on the `extra` field; anything larger is spam.
pub const MAX_TX_EXTRA_SIZE: usize = 1024;

// wire tags, CryptoNote layout
const TAG_INPUT_COINBASE: u8 = 0xff;
const TAG_INPUT_KEY: u8 = 0x02;
const TAG_OUTPUT_KEY: u8 = 0x02;

/// Coinbase input: mints the block reward at `height`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinbaseInput {
    pub height: u64,
}

/// Spend input: ring of same-amount outputs plus the spend tag.
///
/// `output_indices` are absolute per-amount global indices in memory;
/// the codec delta-encodes them on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInput {
    pub amount: u64,
    pub output_indices: Vec<u64>,
    pub key_image: KeyImage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionInput {
    Coinbase(CoinbaseInput),
    Key(KeyInput),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionOutput {
    pub amount: u64,
    pub target: PublicKey,
}

/// Everything the ring signatures commit to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionPrefix {
    pub version: u8,
    pub unlock_time: u64,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub extra: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub prefix: TransactionPrefix,
    pub signatures: Vec<RingSignature>,
}

/// Structural defects found without touching chain state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TxShapeError {
    #[error("unsupported transaction version {0}")]
    Version(u8),
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("coinbase input not alone")]
    MixedCoinbase,
    #[error("input {0} has an empty ring")]
    EmptyRing(usize),
    #[error("input {0} repeats a ring member")]
    DuplicateRingMember(usize),
    #[error("duplicate key image inside transaction")]
    DuplicateKeyImage,
    #[error("signature count {got} does not match input count {want}")]
    SignatureCount { got: usize, want: usize },
    #[error("input {0} signature size does not match its ring")]
    SignatureSize(usize),
    #[error("output {0} has zero amount")]
    ZeroAmount(usize),
    #[error("amounts overflow")]
    AmountOverflow,
    #[error("extra field too large ({0} bytes)")]
    ExtraTooLarge(usize),
}

impl Transaction {
    /// Hash of the canonical bytes of the whole transaction.
    pub fn hash(&self) -> Hash {
        fast_hash(&to_bytes(self))
    }

    /// Hash the signatures commit to.
    pub fn prefix_hash(&self) -> Hash {
        fast_hash(&to_bytes(&self.prefix))
    }

    pub fn blob_size(&self) -> usize {
        to_bytes(self).len()
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(
            self.prefix.inputs.as_slice(),
            [TransactionInput::Coinbase(_)]
        )
    }

    pub fn key_images(&self) -> impl Iterator<Item = &KeyImage> {
        self.prefix.inputs.iter().filter_map(|input| match input {
            TransactionInput::Key(key) => Some(&key.key_image),
            TransactionInput::Coinbase(_) => None,
        })
    }

    /// Sum of key-input amounts. None for coinbase or on overflow.
    pub fn input_amount(&self) -> Option<u64> {
        let mut sum: u64 = 0;
        for input in &self.prefix.inputs {
            match input {
                TransactionInput::Key(key) => sum = sum.checked_add(key.amount)?,
                TransactionInput::Coinbase(_) => return None,
            }
        }
        Some(sum)
    }

    pub fn output_amount(&self) -> Option<u64> {
        let mut sum: u64 = 0;
        for output in &self.prefix.outputs {
            sum = sum.checked_add(output.amount)?;
        }
        Some(sum)
    }

    /// inputs − outputs, for non-coinbase transactions.
    pub fn fee(&self) -> Option<u64> {
        let inputs = self.input_amount()?;
        let outputs = self.output_amount()?;
        inputs.checked_sub(outputs)
    }

    /// Shape checks shared by mempool admission and block validation.
    pub fn check_shape(&self) -> Result<(), TxShapeError> {
        if self.prefix.version != TRANSACTION_VERSION {
            return Err(TxShapeError::Version(self.prefix.version));
        }
        if self.prefix.inputs.is_empty() {
            return Err(TxShapeError::NoInputs);
        }
        if self.prefix.outputs.is_empty() {
            return Err(TxShapeError::NoOutputs);
        }
        if self.prefix.extra.len() > MAX_TX_EXTRA_SIZE {
            return Err(TxShapeError::ExtraTooLarge(self.prefix.extra.len()));
        }

        let coinbase_inputs = self
            .prefix
            .inputs
            .iter()
            .filter(|i| matches!(i, TransactionInput::Coinbase(_)))
            .count();
        if coinbase_inputs > 0 && self.prefix.inputs.len() != 1 {
            return Err(TxShapeError::MixedCoinbase);
        }

        for (idx, output) in self.prefix.outputs.iter().enumerate() {
            if output.amount == 0 {
                return Err(TxShapeError::ZeroAmount(idx));
            }
        }
        if self.output_amount().is_none() {
            return Err(TxShapeError::AmountOverflow);
        }

        let mut images: Vec<&KeyImage> = Vec::new();
        for (idx, input) in self.prefix.inputs.iter().enumerate() {
            if let TransactionInput::Key(key) = input {
                if key.output_indices.is_empty() {
                    return Err(TxShapeError::EmptyRing(idx));
                }
                // absolute indices are kept sorted; equality means a reused decoy
                if key.output_indices.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(TxShapeError::DuplicateRingMember(idx));
                }
                if images.contains(&&key.key_image) {
                    return Err(TxShapeError::DuplicateKeyImage);
                }
                images.push(&key.key_image);
            }
        }
        if !images.is_empty() && self.input_amount().is_none() {
            return Err(TxShapeError::AmountOverflow);
        }

        if self.is_coinbase() {
            if !self.signatures.is_empty() {
                return Err(TxShapeError::SignatureCount {
                    got: self.signatures.len(),
                    want: 0,
                });
            }
        } else {
            if self.signatures.len() != self.prefix.inputs.len() {
                return Err(TxShapeError::SignatureCount {
                    got: self.signatures.len(),
                    want: self.prefix.inputs.len(),
                });
            }
            for (idx, (input, sig)) in
                self.prefix.inputs.iter().zip(&self.signatures).enumerate()
            {
                let ring = match input {
                    TransactionInput::Key(key) => key.output_indices.len(),
                    TransactionInput::Coinbase(_) => return Err(TxShapeError::MixedCoinbase),
                };
                if sig.0.len() != ring {
                    return Err(TxShapeError::SignatureSize(idx));
                }
            }
        }
        Ok(())
    }
}

// --- canonical encoding ---

impl BinWrite for TransactionInput {
    fn write(&self, w: &mut Writer) {
        match self {
            TransactionInput::Coinbase(input) => {
                w.put_u8(TAG_INPUT_COINBASE);
                w.put_varint(input.height);
            }
            TransactionInput::Key(input) => {
                w.put_u8(TAG_INPUT_KEY);
                w.put_varint(input.amount);
                // delta-encode: first offset absolute, the rest as gaps
                w.put_varint(input.output_indices.len() as u64);
                let mut prev = 0u64;
                for (i, &index) in input.output_indices.iter().enumerate() {
                    if i == 0 {
                        w.put_varint(index);
                    } else {
                        w.put_varint(index - prev);
                    }
                    prev = index;
                }
                w.put_bytes(&input.key_image.0);
            }
        }
    }
}

impl BinRead for TransactionInput {
    fn read(r: &mut Reader<'_>) -> Result<Self, ReadError> {
        match r.get_u8()? {
            TAG_INPUT_COINBASE => Ok(TransactionInput::Coinbase(CoinbaseInput {
                height: r.get_varint()?,
            })),
            TAG_INPUT_KEY => {
                let amount = r.get_varint()?;
                let count = r.get_seq_len()?;
                let mut indices = Vec::with_capacity(count.min(4096));
                let mut prev: u64 = 0;
                for i in 0..count {
                    let delta = r.get_varint()?;
                    let absolute = if i == 0 {
                        delta
                    } else {
                        if delta == 0 {
                            return Err(ReadError::InvalidValue("ring offset delta"));
                        }
                        prev.checked_add(delta)
                            .ok_or(ReadError::InvalidValue("ring offset overflow"))?
                    };
                    indices.push(absolute);
                    prev = absolute;
                }
                Ok(TransactionInput::Key(KeyInput {
                    amount,
                    output_indices: indices,
                    key_image: KeyImage(r.get_array()?),
                }))
            }
            _ => Err(ReadError::InvalidValue("input tag")),
        }
    }
}

impl BinWrite for TransactionOutput {
    fn write(&self, w: &mut Writer) {
        w.put_varint(self.amount);
        w.put_u8(TAG_OUTPUT_KEY);
        w.put_bytes(&self.target.0);
    }
}

impl BinRead for TransactionOutput {
    fn read(r: &mut Reader<'_>) -> Result<Self, ReadError> {
        let amount = r.get_varint()?;
        if r.get_u8()? != TAG_OUTPUT_KEY {
            return Err(ReadError::InvalidValue("output tag"));
        }
        Ok(TransactionOutput {
            amount,
            target: PublicKey(r.get_array()?),
        })
    }
}

impl BinWrite for TransactionPrefix {
    fn write(&self, w: &mut Writer) {
        w.put_varint(self.version as u64);
        w.put_varint(self.unlock_time);
        w.put_seq(&self.inputs);
        w.put_seq(&self.outputs);
        w.put_blob(&self.extra);
    }
}

impl BinRead for TransactionPrefix {
    fn read(r: &mut Reader<'_>) -> Result<Self, ReadError> {
        let version = r.get_varint()?;
        if version > u8::MAX as u64 {
            return Err(ReadError::InvalidValue("transaction version"));
        }
        Ok(TransactionPrefix {
            version: version as u8,
            unlock_time: r.get_varint()?,
            inputs: r.get_seq()?,
            outputs: r.get_seq()?,
            extra: r.get_blob()?,
        })
    }
}

impl BinWrite for RingSignature {
    fn write(&self, w: &mut Writer) {
        w.put_seq(&self.0);
    }
}

impl BinRead for RingSignature {
    fn read(r: &mut Reader<'_>) -> Result<Self, ReadError> {
        Ok(RingSignature(r.get_seq::<Signature>()?))
    }
}

impl BinWrite for Transaction {
    fn write(&self, w: &mut Writer) {
        self.prefix.write(w);
        w.put_seq(&self.signatures);
    }
}

impl BinRead for Transaction {
    fn read(r: &mut Reader<'_>) -> Result<Self, ReadError> {
        Ok(Transaction {
            prefix: TransactionPrefix::read(r)?,
            signatures: r.get_seq()?,
        })
    }
}
