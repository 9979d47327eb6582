//! Cross-context texture names and the ordering tokens that guard them.

use crate::limits::MAILBOX_SIZE;
use std::fmt;
use uuid::Uuid;

/// Opaque name binding one texture across GPU command streams.
///
/// An all-zero mailbox denotes failure-to-produce.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mailbox {
    pub name: [u8; MAILBOX_SIZE],
}

impl Mailbox {
    /// The zero mailbox.
    pub const fn zero() -> Self {
        Self {
            name: [0; MAILBOX_SIZE],
        }
    }

    /// Generate a fresh, non-zero name.
    pub fn generate() -> Self {
        let mut name = [0u8; MAILBOX_SIZE];
        // Four v4 UUIDs fill the name; the version nibble keeps it non-zero.
        for chunk in name.chunks_exact_mut(16) {
            chunk.copy_from_slice(Uuid::new_v4().as_bytes());
        }
        Self { name }
    }

    pub fn is_zero(&self) -> bool {
        self.name.iter().all(|&b| b == 0)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mailbox(")?;
        for byte in &self.name[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

/// Ordering token marking a position in one GPU command stream.
///
/// Issued monotonically; zero means "no synchronization needed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SyncPoint(pub u32);

impl SyncPoint {
    pub const NONE: Self = Self(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_mailboxes_are_unique_and_non_zero() {
        let a = Mailbox::generate();
        let b = Mailbox::generate();
        assert!(!a.is_zero());
        assert_ne!(a, b);
        assert!(Mailbox::zero().is_zero());
    }
}
