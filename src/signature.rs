//! Signature packages produced by the ceremony and their verification.
//!
//! ECDSA packages carry `r`, `s` and a recovery id; EdDSA packages carry
//! `R` in `r` and `S` in `s`. Verification always uses the vault's public
//! key, never a key supplied alongside the signature.

use ed25519_dalek::{Signature as EdSignature, VerifyingKey};
use secp256k1::{
    Message, PublicKey, SECP256K1,
    ecdsa::{RecoverableSignature, RecoveryId, Signature as EcdsaSignature},
};
use serde::{Deserialize, Serialize};

use crate::codec::PreSignHash;
use crate::error::{KeysignError, KeysignResult};

/// Threshold signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    /// secp256k1 ECDSA (UTXO, EVM, Cosmos chains).
    Ecdsa,
    /// ed25519 EdDSA (Sui, Ton, Cardano, Solana, Polkadot).
    Eddsa,
}

impl std::fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ecdsa => write!(f, "ecdsa"),
            Self::Eddsa => write!(f, "eddsa"),
        }
    }
}

/// Signature for one pre-sign hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePackage {
    pub scheme: SignatureScheme,
    /// 32 bytes.
    pub r: Vec<u8>,
    /// 32 bytes.
    pub s: Vec<u8>,
    /// ECDSA only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_id: Option<u8>,
}

impl SignaturePackage {
    pub fn ecdsa(r: [u8; 32], s: [u8; 32], recovery_id: u8) -> Self {
        Self {
            scheme: SignatureScheme::Ecdsa,
            r: r.to_vec(),
            s: s.to_vec(),
            recovery_id: Some(recovery_id),
        }
    }

    pub fn eddsa(signature: [u8; 64]) -> Self {
        Self {
            scheme: SignatureScheme::Eddsa,
            r: signature[..32].to_vec(),
            s: signature[32..].to_vec(),
            recovery_id: None,
        }
    }

    /// `r || s`.
    pub fn compact(&self) -> KeysignResult<[u8; 64]> {
        if self.r.len() != 32 || self.s.len() != 32 {
            return Err(KeysignError::InvalidSignature(format!(
                "expected 32-byte r and s, got {} and {}",
                self.r.len(),
                self.s.len()
            )));
        }
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        Ok(out)
    }

    /// Low-S normalized ECDSA signature.
    ///
    /// Returns the recovery id adjusted for the normalization: negating `s`
    /// flips the parity of the recovered point.
    pub fn normalized_ecdsa(&self) -> KeysignResult<(EcdsaSignature, Option<u8>)> {
        let compact = self.compact()?;
        let mut sig = EcdsaSignature::from_compact(&compact)
            .map_err(|e| KeysignError::InvalidSignature(e.to_string()))?;
        let before = sig.serialize_compact();
        sig.normalize_s();
        let flipped = sig.serialize_compact() != before;
        let recovery_id = self.recovery_id.map(|v| if flipped { v ^ 1 } else { v });
        Ok((sig, recovery_id))
    }

    /// DER encoding of the low-S ECDSA signature.
    pub fn der(&self) -> KeysignResult<Vec<u8>> {
        let (sig, _) = self.normalized_ecdsa()?;
        Ok(sig.serialize_der().to_vec())
    }
}

/// Verify `signature` over `hash` against the vault public key.
///
/// Any failure to verify, including a malformed signature, is reported as
/// [`KeysignError::SignatureMismatch`]. A malformed public key is reported
/// as [`KeysignError::InvalidPublicKey`].
pub fn verify(
    hash: &PreSignHash,
    signature: &SignaturePackage,
    public_key: &[u8],
) -> KeysignResult<()> {
    let mismatch = || KeysignError::SignatureMismatch {
        hash: hash.to_hex(),
    };

    match signature.scheme {
        SignatureScheme::Ecdsa => {
            let key = PublicKey::from_slice(public_key)
                .map_err(|e| KeysignError::InvalidPublicKey(format!("secp256k1: {e}")))?;
            let message = Message::from_digest_slice(hash.as_bytes()).map_err(|_| mismatch())?;
            let (sig, _) = signature.normalized_ecdsa().map_err(|_| mismatch())?;
            SECP256K1
                .verify_ecdsa(&message, &sig, &key)
                .map_err(|_| mismatch())
        }
        SignatureScheme::Eddsa => {
            let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
                KeysignError::InvalidPublicKey(format!(
                    "ed25519 key must be 32 bytes, got {}",
                    public_key.len()
                ))
            })?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|e| KeysignError::InvalidPublicKey(format!("ed25519: {e}")))?;
            let sig = EdSignature::from_bytes(&signature.compact().map_err(|_| mismatch())?);
            key.verify_strict(hash.as_bytes(), &sig)
                .map_err(|_| mismatch())
        }
    }
}

/// Verify an ECDSA signature and additionally require that its recovery id
/// recovers the vault key. Returns the normalized signature and recovery id.
pub fn verify_recoverable(
    hash: &PreSignHash,
    signature: &SignaturePackage,
    public_key: &[u8],
) -> KeysignResult<(EcdsaSignature, u8)> {
    verify(hash, signature, public_key)?;

    let mismatch = || KeysignError::SignatureMismatch {
        hash: hash.to_hex(),
    };
    let (sig, recovery_id) = signature.normalized_ecdsa()?;
    let recovery_id = recovery_id.ok_or_else(mismatch)?;

    let recid = RecoveryId::from_i32(i32::from(recovery_id)).map_err(|_| mismatch())?;
    let recoverable = RecoverableSignature::from_compact(&sig.serialize_compact(), recid)
        .map_err(|_| mismatch())?;
    let message = Message::from_digest_slice(hash.as_bytes()).map_err(|_| mismatch())?;
    let recovered = SECP256K1
        .recover_ecdsa(&message, &recoverable)
        .map_err(|_| mismatch())?;

    let expected = PublicKey::from_slice(public_key)
        .map_err(|e| KeysignError::InvalidPublicKey(format!("secp256k1: {e}")))?;
    if recovered != expected {
        return Err(mismatch());
    }

    Ok((sig, recovery_id))
}
