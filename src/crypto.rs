//! AES-256-GCM envelopes for relay payloads and vault backups.
//!
//! Wire format is `nonce (12 bytes) || ciphertext || tag`. Relay payloads
//! are keyed by the session's 32-byte hex key; backups by SHA-256 of the
//! user's password.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{KeysignError, KeysignResult};

const NONCE_LEN: usize = 12;

/// Generate a fresh random 32-byte session key, hex encoded.
pub fn generate_session_key() -> String {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    hex::encode(key)
}

/// Derive a backup key from a password.
pub fn password_key(password: &str) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(Sha256::digest(password.as_bytes()).into())
}

/// Decode a hex session key, rejecting anything but 32 bytes.
pub fn session_key_bytes(key_hex: &str) -> KeysignResult<Zeroizing<Vec<u8>>> {
    let key = Zeroizing::new(hex::decode(key_hex)?);
    if key.len() != 32 {
        return Err(KeysignError::InvalidIntent(format!(
            "Session key must be 32 bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

/// Seal plaintext under a 32-byte key.
pub fn seal(key: &[u8], plaintext: &[u8]) -> KeysignResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KeysignError::Internal(format!("Invalid AES key: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| KeysignError::Internal(format!("Encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed envelope. A wrong key surfaces as [`KeysignError::Decryption`].
pub fn open(key: &[u8], sealed: &[u8]) -> KeysignResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(KeysignError::Decryption("Payload truncated".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KeysignError::Internal(format!("Invalid AES key: {e}")))?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeysignError::Decryption("Authentication tag mismatch".to_string()))
}

/// Convenience: seal with a hex session key and return base64.
pub fn seal_to_base64(key_hex: &str, plaintext: &[u8]) -> KeysignResult<String> {
    let key = session_key_bytes(key_hex)?;
    Ok(BASE64.encode(seal(&key, plaintext)?))
}

/// Convenience: open a base64 envelope with a hex session key.
pub fn open_from_base64(key_hex: &str, sealed_base64: &str) -> KeysignResult<Vec<u8>> {
    let key = session_key_bytes(key_hex)?;
    let sealed = BASE64
        .decode(sealed_base64)
        .map_err(|e| KeysignError::Deserialization(format!("Invalid base64: {e}")))?;
    open(&key, &sealed)
}

/// Hex SHA-256, used for relay message hashes and topic ids.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
