//! Tests for key agreement and the message cipher
//!
//! These tests verify the properties both peers rely on:
//! - Key agreement symmetry
//! - Encrypt/decrypt round trips and nonce freshness
//! - Fail-closed decryption
//! - Key document import failures

use parley_shared::*;

fn session_pair() -> (SessionKey, SessionKey) {
    let alice = generate_key_pair();
    let bob = generate_key_pair();
    (
        derive_session_key(&alice, &bob.public_key()).unwrap(),
        derive_session_key(&bob, &alice.public_key()).unwrap(),
    )
}

// ============================================================================
// Key agreement
// ============================================================================

#[test]
fn test_key_agreement_symmetry() {
    for _ in 0..16 {
        let (ab, ba) = session_pair();
        assert_eq!(ab, ba);
    }
}

#[test]
fn test_key_agreement_through_exported_documents() {
    let alice = generate_key_pair();
    let bob = generate_key_pair();
    let alice_doc = export_public(&alice.public_key());
    let bob_doc = export_public(&bob.public_key());

    let ab = derive_session_key(&alice, &import_public(&bob_doc).unwrap()).unwrap();
    let ba = derive_session_key(&bob, &import_public(&alice_doc).unwrap()).unwrap();
    assert_eq!(ab, ba);
}

// ============================================================================
// Cipher
// ============================================================================

#[test]
fn test_roundtrip_various_texts() {
    let (key, _) = session_pair();
    let long = "long ".repeat(2000);
    for text in ["", "hello", "ünïcødé ✓", long.as_str()] {
        let env = encrypt(&key, text).unwrap();
        assert_eq!(decrypt(&key, &env), Decrypted::Plaintext(text.to_string()));
    }
}

#[test]
fn test_receiver_decrypts_with_own_derivation() {
    let (alice_key, bob_key) = session_pair();
    let env = encrypt(&alice_key, "hello").unwrap();
    assert_eq!(decrypt(&bob_key, &env), Decrypted::Plaintext("hello".into()));
}

#[test]
fn test_nonce_freshness() {
    let (key, _) = session_pair();
    let a = encrypt(&key, "same text").unwrap();
    let b = encrypt(&key, "same text").unwrap();
    assert_ne!(a.nonce, b.nonce);
    assert_ne!(a.ciphertext, b.ciphertext);
    assert_eq!(a.nonce.len(), 12);
}

#[test]
fn test_wrong_key_is_undecryptable() {
    let (key, _) = session_pair();
    let (other, _) = session_pair();
    let env = encrypt(&key, "secret").unwrap();
    assert_eq!(decrypt(&other, &env), Decrypted::Undecryptable);
    assert_eq!(
        decrypt(&other, &env).into_display(),
        UNDECRYPTABLE_PLACEHOLDER
    );
}

#[test]
fn test_tampered_ciphertext_is_undecryptable() {
    let (key, _) = session_pair();
    let mut env = encrypt(&key, "secret").unwrap();
    env.ciphertext[0] ^= 0x01;
    assert_eq!(decrypt(&key, &env), Decrypted::Undecryptable);

    let mut env = encrypt(&key, "secret").unwrap();
    env.nonce[11] ^= 0x80;
    assert_eq!(decrypt(&key, &env), Decrypted::Undecryptable);
}

#[test]
fn test_truncated_envelope_is_undecryptable() {
    let (key, _) = session_pair();
    let mut env = encrypt(&key, "secret").unwrap();
    env.ciphertext.truncate(4);
    assert_eq!(decrypt(&key, &env), Decrypted::Undecryptable);

    let mut env = encrypt(&key, "secret").unwrap();
    env.nonce.pop();
    assert_eq!(decrypt(&key, &env), Decrypted::Undecryptable);
}

#[test]
fn test_ciphertext_does_not_contain_plaintext() {
    let (key, _) = session_pair();
    let stored = MessageContent::Encrypted {
        envelope: encrypt(&key, "hello").unwrap(),
    }
    .to_storage();
    assert!(!stored.contains("hello"));
    assert!(looks_encrypted(&serde_json::to_string(&encrypt(&key, "hello").unwrap()).unwrap()));
}

// ============================================================================
// Key documents
// ============================================================================

#[test]
fn test_import_public_rejects_malformed_documents() {
    assert!(matches!(import_public("not json"), Err(CryptoError::InvalidKey(_))));
    assert!(matches!(import_public("{}"), Err(CryptoError::InvalidKey(_))));
    assert!(matches!(
        import_public(r#"{"kty":"EC","crv":"P-256","x":"AAAA"}"#),
        Err(CryptoError::UnsupportedCurve(_))
    ));
    assert!(matches!(
        import_public(r#"{"kty":"OKP","crv":"Ed25519","x":"AAAA"}"#),
        Err(CryptoError::UnsupportedCurve(_))
    ));
    assert!(matches!(
        import_public(r#"{"kty":"OKP","crv":"X25519","x":"AAAA"}"#),
        Err(CryptoError::InvalidKey(_))
    ));
    assert!(matches!(
        import_public(r#"{"kty":"OKP","crv":"X25519","x":"***"}"#),
        Err(CryptoError::InvalidKey(_))
    ));
    let zero = format!(
        r#"{{"kty":"OKP","crv":"X25519","x":"{}"}}"#,
        "A".repeat(43)
    );
    assert!(import_public(&zero).is_err());
}

#[test]
fn test_import_private_requires_secret_component() {
    let pair = generate_key_pair();
    let public_only = export_public(&pair.public_key());
    assert!(matches!(
        import_private(&public_only),
        Err(CryptoError::MissingKey(_))
    ));
    assert!(import_private(&export_private(&pair)).is_ok());
}

#[test]
fn test_secure_storage_roundtrip() {
    let pair = generate_key_pair();
    let sealed = secure_store(&pair, "hunter2").unwrap();
    let loaded = secure_load(&sealed, "hunter2").unwrap();
    assert_eq!(
        fingerprint(&loaded.public_key()),
        fingerprint(&pair.public_key())
    );
    assert!(secure_load(&sealed, "hunter3").is_err());
    assert!(secure_load(&sealed[..10], "hunter2").is_err());
}
