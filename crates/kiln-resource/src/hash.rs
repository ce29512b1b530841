use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hashing of a value with the default hasher.
pub trait DefaultHash {
    /// Returns a 64-bit hash of `self`.
    fn default_hash(&self) -> u64;
}

impl<T: Hash> DefaultHash for T {
    fn default_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}
