use bincode::{Decode, Encode};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::RngCore;
use std::fmt;

use super::hash::Hash;
use super::keys::{PublicKey, SecretKey, hash_to_point, hash_to_scalar, random_scalar};

/// Key image: the double-spend tag `x * Hp(P)` of a spent output.
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KeyImage(pub [u8; 32]);

impl KeyImage {
    pub fn from_hex(s: &str) -> Result<KeyImage, hex::FromHexError> {
        Hash::from_hex(s).map(|h| KeyImage(h.0))
    }

    /// A key image outside the prime-order subgroup lets an attacker
    /// mint several distinct tags for one output; reject at the door.
    pub fn is_canonical(&self) -> bool {
        match CompressedEdwardsY(self.0).decompress() {
            Some(point) => point.is_torsion_free() && !point.is_identity(),
            None => false,
        }
    }
}

impl fmt::Display for KeyImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", &hex::encode(self.0)[..16])
    }
}

/// One (c, r) pair per ring member.
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Signature {
    pub c: [u8; 32],
    pub r: [u8; 32],
}

/// Ring signature over one input: proves one ring member signed
/// without revealing which, bound to that member's key image.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug, Default)]
pub struct RingSignature(pub Vec<Signature>);

pub fn generate_key_image(public: &PublicKey, secret: &SecretKey) -> KeyImage {
    let base = hash_to_point(&public.0);
    KeyImage((secret.scalar() * base).compress().to_bytes())
}

struct ChallengeAccum {
    buf: Vec<u8>,
}

impl ChallengeAccum {
    fn new(prefix_hash: &Hash) -> Self {
        let mut buf = Vec::with_capacity(32 * 33);
        buf.extend_from_slice(&prefix_hash.0);
        ChallengeAccum { buf }
    }

    fn push(&mut self, l: &EdwardsPoint, r: &EdwardsPoint) {
        self.buf.extend_from_slice(&l.compress().to_bytes());
        self.buf.extend_from_slice(&r.compress().to_bytes());
    }

    fn finish(self) -> Scalar {
        hash_to_scalar(&self.buf)
    }
}

/// Sign `prefix_hash` with the secret key of `ring[real_index]`.
///
/// Classic CryptoNote construction: commitments for every decoy are
/// built from random (c, r); the signer's slot is closed afterwards so
/// the challenges sum to the aggregate hash.
pub fn generate_ring_signature<R: RngCore>(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    ring: &[PublicKey],
    secret: &SecretKey,
    real_index: usize,
    rng: &mut R,
) -> Option<RingSignature> {
    if real_index >= ring.len() {
        return None;
    }
    let image = CompressedEdwardsY(key_image.0).decompress()?;
    let x = secret.scalar();

    let mut sigs = vec![
        Signature {
            c: [0u8; 32],
            r: [0u8; 32]
        };
        ring.len()
    ];
    let mut accum = ChallengeAccum::new(prefix_hash);
    let mut c_sum = Scalar::ZERO;
    let mut k = Scalar::ZERO;

    for (i, member) in ring.iter().enumerate() {
        let hp = hash_to_point(&member.0);
        if i == real_index {
            k = random_scalar(rng);
            accum.push(&EdwardsPoint::mul_base(&k), &(k * hp));
        } else {
            let point = member.decompress()?;
            let c = random_scalar(rng);
            let r = random_scalar(rng);
            let l = EdwardsPoint::vartime_double_scalar_mul_basepoint(&c, &point, &r);
            let rh = r * hp + c * image;
            accum.push(&l, &rh);
            sigs[i] = Signature {
                c: c.to_bytes(),
                r: r.to_bytes(),
            };
            c_sum += c;
        }
    }

    let c_real = accum.finish() - c_sum;
    let r_real = k - c_real * x;
    sigs[real_index] = Signature {
        c: c_real.to_bytes(),
        r: r_real.to_bytes(),
    };
    Some(RingSignature(sigs))
}

/// Verify a ring signature. Returns false for any malformed input:
/// wrong ring size, non-canonical scalars, invalid points, torsioned
/// key image, or a challenge sum that does not match.
pub fn check_ring_signature(
    prefix_hash: &Hash,
    key_image: &KeyImage,
    ring: &[PublicKey],
    sig: &RingSignature,
) -> bool {
    if ring.is_empty() || sig.0.len() != ring.len() {
        return false;
    }
    if !key_image.is_canonical() {
        return false;
    }
    let image = match CompressedEdwardsY(key_image.0).decompress() {
        Some(p) => p,
        None => return false,
    };

    let mut accum = ChallengeAccum::new(prefix_hash);
    let mut c_sum = Scalar::ZERO;

    for (member, pair) in ring.iter().zip(&sig.0) {
        let point = match member.decompress() {
            Some(p) => p,
            None => return false,
        };
        let c = match Option::<Scalar>::from(Scalar::from_canonical_bytes(pair.c)) {
            Some(s) => s,
            None => return false,
        };
        let r = match Option::<Scalar>::from(Scalar::from_canonical_bytes(pair.r)) {
            Some(s) => s,
            None => return false,
        };

        let hp = hash_to_point(&member.0);
        let l = EdwardsPoint::vartime_double_scalar_mul_basepoint(&c, &point, &r);
        let rh = r * hp + c * image;
        accum.push(&l, &rh);
        c_sum += c;
    }

    accum.finish() == c_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::fast_hash;
    use crate::crypto::keys::generate_keys;
    use rand::rngs::OsRng;

    fn ring_with_signer(size: usize, real: usize) -> (Vec<PublicKey>, SecretKey, KeyImage) {
        let mut ring = Vec::with_capacity(size);
        let mut secret = None;
        for i in 0..size {
            let pair = generate_keys(&mut OsRng);
            if i == real {
                secret = Some(pair.secret);
            }
            ring.push(pair.public);
        }
        let secret = secret.unwrap();
        let image = generate_key_image(&ring[real], &secret);
        (ring, secret, image)
    }

    #[test]
    fn sign_and_check() {
        let prefix = fast_hash(b"tx prefix");
        for (size, real) in [(1, 0), (4, 0), (4, 3), (7, 2)] {
            let (ring, secret, image) = ring_with_signer(size, real);
            let sig =
                generate_ring_signature(&prefix, &image, &ring, &secret, real, &mut OsRng).unwrap();
            assert!(check_ring_signature(&prefix, &image, &ring, &sig));
        }
    }

    #[test]
    fn tampered_prefix_fails() {
        let prefix = fast_hash(b"tx prefix");
        let (ring, secret, image) = ring_with_signer(4, 1);
        let sig =
            generate_ring_signature(&prefix, &image, &ring, &secret, 1, &mut OsRng).unwrap();
        assert!(!check_ring_signature(&fast_hash(b"other"), &image, &ring, &sig));
    }

    #[test]
    fn wrong_key_image_fails() {
        let prefix = fast_hash(b"tx prefix");
        let (ring, secret, image) = ring_with_signer(4, 1);
        let sig =
            generate_ring_signature(&prefix, &image, &ring, &secret, 1, &mut OsRng).unwrap();

        let other = generate_keys(&mut OsRng);
        let forged = generate_key_image(&other.public, &other.secret);
        assert!(!check_ring_signature(&prefix, &forged, &ring, &sig));
    }

    #[test]
    fn truncated_ring_fails() {
        let prefix = fast_hash(b"tx prefix");
        let (ring, secret, image) = ring_with_signer(4, 0);
        let sig =
            generate_ring_signature(&prefix, &image, &ring, &secret, 0, &mut OsRng).unwrap();
        assert!(!check_ring_signature(&prefix, &image, &ring[..3], &sig));
    }

    #[test]
    fn key_image_is_deterministic_per_output() {
        let pair = generate_keys(&mut OsRng);
        let a = generate_key_image(&pair.public, &pair.secret);
        let b = generate_key_image(&pair.public, &pair.secret);
        assert_eq!(a, b);
        assert!(a.is_canonical());
    }
}
