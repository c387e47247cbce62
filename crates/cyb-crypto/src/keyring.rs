//! Signing keys with rotation support.
//!
//! The ring holds one active key (used for every signature) and any number
//! of prior keys that remain resolvable for verification until the operator
//! drops them. Rotation swaps the active key in one step; envelopes signed
//! under the previous key keep verifying through their `key_id`.

use std::collections::HashMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret key material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    /// Wrap raw key material.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes, for MAC construction.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<{} bytes>)", self.0.len())
    }
}

/// All known signing keys plus the identifier of the active one.
#[derive(Debug)]
pub struct KeyRing {
    keys: HashMap<String, SecretKey>,
    active: String,
}

impl KeyRing {
    /// Create a ring with a single active key.
    #[must_use]
    pub fn new(active_id: impl Into<String>, secret: SecretKey) -> Self {
        let active = active_id.into();
        let mut keys = HashMap::new();
        keys.insert(active.clone(), secret);
        Self { keys, active }
    }

    /// Identifier of the key that signs new envelopes.
    #[must_use]
    pub fn active_id(&self) -> &str {
        &self.active
    }

    /// The active key material.
    #[must_use]
    pub fn active_key(&self) -> &SecretKey {
        // The active id always resolves: rotation inserts before it swaps.
        self.keys
            .get(&self.active)
            .unwrap_or_else(|| unreachable!("active key id must resolve"))
    }

    /// Resolve any known key for verification.
    #[must_use]
    pub fn resolve(&self, key_id: &str) -> Option<&SecretKey> {
        self.keys.get(key_id)
    }

    /// Register a new key and make it active in one step.
    ///
    /// The previous key stays resolvable so in-flight envelopes verify.
    pub fn rotate(&mut self, key_id: impl Into<String>, secret: SecretKey) {
        let key_id = key_id.into();
        self.keys.insert(key_id.clone(), secret);
        self.active = key_id;
    }

    /// Drop a retired key. Refuses to drop the active key.
    pub fn retire(&mut self, key_id: &str) -> bool {
        if key_id == self.active {
            return false;
        }
        self.keys.remove(key_id).is_some()
    }

    /// Number of resolvable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the ring is empty (never true by construction).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
