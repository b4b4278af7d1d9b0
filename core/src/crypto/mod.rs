pub mod hash;
pub mod keys;
pub mod ring;

pub use hash::{Hash, fast_hash, slow_hash, tree_hash};
pub use keys::{KeyPair, PublicKey, SecretKey, hash_to_point, hash_to_scalar};
pub use ring::{
    KeyImage, RingSignature, Signature, check_ring_signature, generate_key_image,
    generate_ring_signature,
};
