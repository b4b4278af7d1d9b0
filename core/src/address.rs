//! Account addresses: base58 over (prefix, spend key, view key, checksum).

use crate::crypto::{PublicKey, fast_hash};
use crate::serialize::Writer;
use thiserror::Error;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58 character")]
    InvalidCharacter,
    #[error("address payload truncated")]
    Truncated,
    #[error("address checksum mismatch")]
    Checksum,
    #[error("address prefix {got:#x} does not match network prefix {want:#x}")]
    WrongPrefix { got: u64, want: u64 },
    #[error("spend or view key is not a valid point")]
    InvalidKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountAddress {
    pub spend_key: PublicKey,
    pub view_key: PublicKey,
}

fn base58_encode(data: &[u8]) -> String {
    let zeros = data.iter().take_while(|&&b| b == 0).count();
    // base58 digits, least significant first
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 138 / 100 + 1);
    for &byte in data {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let mut out = String::with_capacity(zeros + digits.len());
    for _ in 0..zeros {
        out.push('1');
    }
    for &digit in digits.iter().rev() {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

fn base58_decode(s: &str) -> Result<Vec<u8>, AddressError> {
    let mut zeros = 0usize;
    let mut seen_nonzero = false;
    // bytes, least significant first
    let mut bytes: Vec<u8> = Vec::with_capacity(s.len());
    for ch in s.chars() {
        let value = ALPHABET
            .iter()
            .position(|&a| a as char == ch)
            .ok_or(AddressError::InvalidCharacter)? as u32;
        if value == 0 && !seen_nonzero {
            zeros += 1;
            continue;
        }
        seen_nonzero = true;
        let mut carry = value;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

impl AccountAddress {
    pub fn to_base58(&self, prefix: u64) -> String {
        let mut w = Writer::new();
        w.put_varint(prefix);
        w.put_bytes(&self.spend_key.0);
        w.put_bytes(&self.view_key.0);
        let mut payload = w.into_bytes();
        let checksum = fast_hash(&payload);
        payload.extend_from_slice(&checksum.0[..CHECKSUM_SIZE]);
        base58_encode(&payload)
    }

    /// Parse and fully validate: checksum, network prefix, and both keys
    /// must decompress. This is what `--fee-address` goes through at
    /// startup.
    pub fn from_base58(s: &str, expected_prefix: u64) -> Result<AccountAddress, AddressError> {
        let payload = base58_decode(s)?;
        if payload.len() < CHECKSUM_SIZE + 64 + 1 {
            return Err(AddressError::Truncated);
        }
        let (body, checksum) = payload.split_at(payload.len() - CHECKSUM_SIZE);
        if &fast_hash(body).0[..CHECKSUM_SIZE] != checksum {
            return Err(AddressError::Checksum);
        }

        let mut r = crate::serialize::Reader::new(body);
        let prefix = r.get_varint().map_err(|_| AddressError::Truncated)?;
        if prefix != expected_prefix {
            return Err(AddressError::WrongPrefix {
                got: prefix,
                want: expected_prefix,
            });
        }
        let spend: [u8; 32] = r.get_array().map_err(|_| AddressError::Truncated)?;
        let view: [u8; 32] = r.get_array().map_err(|_| AddressError::Truncated)?;
        if !r.is_empty() {
            return Err(AddressError::Truncated);
        }

        let address = AccountAddress {
            spend_key: PublicKey(spend),
            view_key: PublicKey(view),
        };
        if address.spend_key.decompress().is_none() || address.view_key.decompress().is_none() {
            return Err(AddressError::InvalidKey);
        }
        Ok(address)
    }
}
