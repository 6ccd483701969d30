//! Single-use symmetric key material issued by the key-management service.
//!
//! A [`SymmetricKey`] is deliberately not `Clone`: it is acquired for one
//! send, lent to one cipher call, and zeroized when dropped.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Identifier used when the KMS response carries no key id.
pub const FALLBACK_KEY_ID: &str = "KMS-ID-UNKNOWN";

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    #[zeroize(skip)]
    id: String,
    bytes: Zeroizing<Vec<u8>>,
}

impl SymmetricKey {
    /// Wrap raw key bytes. An empty id is replaced by [`FALLBACK_KEY_ID`].
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mut id = id.into();
        if id.trim().is_empty() {
            id = FALLBACK_KEY_ID.to_string();
        }
        Self {
            id,
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow the key bytes for a single cryptographic call.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("id", &self.id)
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
