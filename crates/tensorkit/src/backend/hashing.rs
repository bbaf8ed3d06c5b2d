use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Process-local fingerprint builder for cache keys and region identities.
pub struct FingerprintHasher {
    inner: DefaultHasher,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            inner: DefaultHasher::new(),
        }
    }

    pub fn write<T: Hash + ?Sized>(&mut self, value: &T) {
        value.hash(&mut self.inner);
    }

    pub fn finish(self) -> u64 {
        self.inner.finish()
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}
