//! Session key agreement
//!
//! Both peers derive the same symmetric key from their own secret and the
//! other side's published public key: X25519 followed by HKDF-SHA256. The
//! HKDF salt is the two public keys in sorted order, so argument order on
//! either side does not change the result.
//!
//! Nothing here proves *which* account published a public key. A matching
//! key only shows that both ends hold the secret halves of the two keys that
//! were read from the profile directory.

use crate::error::{CryptoError, Result};
use crate::keys::AccountKeyPair;
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a derived session key in bytes (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

const HKDF_INFO: &[u8] = b"parley-session-v1/aes-256-gcm";

/// Symmetric key shared by the two members of a thread
///
/// Held in memory for the lifetime of a conversation view and never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        crate::constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SessionKey {}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key for `local` talking to `peer`
///
/// Fails if the peer key is a low-order point (the DH output would not
/// depend on our secret).
///
/// Nothing here proves that `peer` belongs to the account it was fetched
/// for; whoever controls the profile directory can substitute keys.
/// Compare [`crate::fingerprint`] out of band where that matters.
pub fn derive_session_key(local: &AccountKeyPair, peer: &PublicKey) -> Result<SessionKey> {
    let shared = local.secret().diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(CryptoError::KeyDerivationError(
            "peer public key is a low-order point".into(),
        ));
    }

    let ours = local.public_key();
    let (first, second) = if ours.as_bytes() <= peer.as_bytes() {
        (ours.as_bytes(), peer.as_bytes())
    } else {
        (peer.as_bytes(), ours.as_bytes())
    };
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(first);
    salt[32..].copy_from_slice(second);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
    Ok(SessionKey(okm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;

    #[test]
    fn test_derivation_is_symmetric() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        let ab = derive_session_key(&alice, &bob.public_key()).unwrap();
        let ba = derive_session_key(&bob, &alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_different_peers_give_different_keys() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        let carol = generate_key_pair();
        let ab = derive_session_key(&alice, &bob.public_key()).unwrap();
        let ac = derive_session_key(&alice, &carol.public_key()).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = generate_key_pair();
        // u = 1 has order 4; clamped scalars map it to the all-zero output
        let mut low = [0u8; 32];
        low[0] = 1;
        let result = derive_session_key(&alice, &PublicKey::from(low));
        assert!(matches!(result, Err(CryptoError::KeyDerivationError(_))));
    }
}
