use bincode::{Decode, Encode};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::RngCore;
use std::fmt;

use super::hash::{Hash, fast_hash};

/// Compressed edwards25519 point.
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PublicKey(pub [u8; 32]);

/// Scalar secret key. Never logged, never serialized into consensus objects.
#[derive(Clone, Copy)]
pub struct SecretKey(pub [u8; 32]);

#[derive(Clone, Copy)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<PublicKey, hex::FromHexError> {
        Hash::from_hex(s).map(|h| PublicKey(h.0))
    }

    /// Decompress, rejecting encodings that are not valid curve points.
    pub fn decompress(&self) -> Option<EdwardsPoint> {
        CompressedEdwardsY(self.0).decompress()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", &hex::encode(self.0)[..16])
    }
}

impl SecretKey {
    pub fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

pub fn random_scalar<R: RngCore>(rng: &mut R) -> Scalar {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

pub fn generate_keys<R: RngCore>(rng: &mut R) -> KeyPair {
    let secret = random_scalar(rng);
    let public = EdwardsPoint::mul_base(&secret).compress().to_bytes();
    KeyPair {
        public: PublicKey(public),
        secret: SecretKey(secret.to_bytes()),
    }
}

pub fn secret_to_public(secret: &SecretKey) -> PublicKey {
    PublicKey(EdwardsPoint::mul_base(&secret.scalar()).compress().to_bytes())
}

/// Reduce a keccak digest into the scalar field.
pub fn hash_to_scalar(data: &[u8]) -> Scalar {
    Scalar::from_bytes_mod_order(fast_hash(data).0)
}

/// Deterministic hash-to-point by iterated decompression.
///
/// Re-hashes until the candidate bytes decompress to a curve point,
/// then clears the cofactor so the result lives in the prime-order
/// subgroup. Identity output is re-rolled; key images derived from it
/// would be forgeable.
pub fn hash_to_point(data: &[u8]) -> EdwardsPoint {
    let mut candidate = fast_hash(data);
    loop {
        if let Some(point) = CompressedEdwardsY(candidate.0).decompress() {
            let cleared = point.mul_by_cofactor();
            if !cleared.is_identity() {
                return cleared;
            }
        }
        candidate = fast_hash(&candidate.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn generated_key_roundtrips() {
        let pair = generate_keys(&mut OsRng);
        assert_eq!(secret_to_public(&pair.secret), pair.public);
        assert!(pair.public.decompress().is_some());
    }

    #[test]
    fn hash_to_point_lands_on_curve() {
        for i in 0u8..16 {
            let p = hash_to_point(&[i]);
            assert!(!p.is_identity());
            assert!(p.is_torsion_free());
        }
    }

    #[test]
    fn hash_to_point_is_deterministic() {
        assert_eq!(
            hash_to_point(b"output key").compress(),
            hash_to_point(b"output key").compress()
        );
    }

    #[test]
    fn invalid_public_key_rejected() {
        // all-ones is not a valid y coordinate encoding
        let bad = PublicKey([0xff; 32]);
        assert!(bad.decompress().is_none());
    }
}
