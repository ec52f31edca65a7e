//! Seeded, stable user hashing
//!
//! Provides [`UserHash`], the ordering key that replaces random shuffling:
//! the same seed and user id always yield the same value, across runs,
//! processes and platforms.

use crate::candidate::UserId;
use std::fmt::{self, Display, Formatter};

/// 64-bit ordering key derived from Blake3 over `(seed, user_id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserHash(u64);

impl UserHash {
    /// Compute hash for a user under a seed
    #[must_use]
    pub fn compute(seed: u64, user_id: &UserId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seed.to_le_bytes());
        hasher.update(user_id.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_be_bytes(prefix))
    }

    /// Raw value
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl Display for UserHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}
