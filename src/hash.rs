use {auto_impl::auto_impl, md5::{Digest, Md5}};

/// Position of a value on the hash ring.
pub type RingPosition = u128;

/// Hash function used to place keys and shards on the ring.
#[auto_impl(&, Box, Arc)]
pub trait KeyHasher: Send + Sync {
    /// Returns the ring position of the given canonical key rendering.
    fn hash_key(&self, key: &str) -> RingPosition;
}

/// Default hasher.
///
/// Takes the full 128-bit MD5 digest of the key as a big-endian integer.
/// The output is portable across platforms and releases, so ring placement
/// of existing shards never changes between versions.
#[derive(Debug, Default, Clone, Copy)]
pub struct Md5Hasher;

impl KeyHasher for Md5Hasher {
    fn hash_key(&self, key: &str) -> RingPosition {
        let digest = Md5::digest(key.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        u128::from_be_bytes(bytes)
    }
}

/// Non-cryptographic alternative based on rapidhash.
///
/// The 64-bit hash of the key fills the upper half of the position, the hash
/// of that hash fills the lower half.
#[derive(Debug, Default, Clone, Copy)]
pub struct RapidHasher;

impl KeyHasher for RapidHasher {
    fn hash_key(&self, key: &str) -> RingPosition {
        let hi = rapidhash::rapidhash(key.as_bytes());
        let lo = rapidhash::rapidhash(&hi.to_le_bytes());
        ((hi as u128) << 64) | lo as u128
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    #[test]
    fn sanity_checks() {
        // Known MD5 digests.
        assert_eq!(
            Md5Hasher.hash_key(""),
            0xd41d8cd98f00b204e9800998ecf8427e
        );
        assert_eq!(
            Md5Hasher.hash_key("hello world"),
            0x5eb63bbbe01eeed093cb22bb8f5acdc3
        );

        // Deterministic across calls and through forwarding impls.
        let boxed: Box<dyn KeyHasher> = Box::new(RapidHasher);
        let shared: Arc<dyn KeyHasher> = Arc::new(RapidHasher);
        assert_eq!(boxed.hash_key("shard_1"), RapidHasher.hash_key("shard_1"));
        assert_eq!(shared.hash_key("shard_1"), RapidHasher.hash_key("shard_1"));
        assert_ne!(RapidHasher.hash_key("a"), RapidHasher.hash_key("b"));
    }
}
