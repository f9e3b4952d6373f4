//! Chain transaction codecs.
//!
//! Each chain family implements [`ChainCodec`]: build the unsigned
//! transaction, derive the exact bytes to sign, and assemble the signed
//! transaction once every signature is in the ledger. [`UnsignedTx`] and
//! the free functions below dispatch on the intent's chain tag.
//!
//! ## Finalize contract
//!
//! 1. Every required hash must have a ledger entry, else `SignatureNotFound`.
//! 2. Every signature must verify against the vault key, else `SignatureMismatch`.
//!    Nothing partially signed is ever returned.
//! 3. The transaction hash is recomputed from the final serialized bytes.

pub mod cardano;
pub mod cosmos;
pub mod evm;
pub mod intent;
pub mod polkadot;
pub mod solana;
pub mod sui;
pub mod ton;
pub mod utxo;

use serde::{Deserialize, Serialize};

use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;
use crate::signature::{self, SignaturePackage, SignatureScheme};

pub use intent::{Chain, ChainFamily, ChainSpecific, Coin, SuiCoin, TransactionIntent, UtxoInfo};

/// Bytes that must receive exactly one signature.
///
/// For ECDSA chains this is a 32-byte digest. EdDSA chains sign the
/// message bytes directly, so it may be any length.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreSignHash(Vec<u8>);

impl PreSignHash {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> KeysignResult<Self> {
        Ok(Self(hex::decode(hex_str)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for PreSignHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for PreSignHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PreSignHash({})", self.to_hex())
    }
}

/// Broadcast-ready transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub raw_bytes: Vec<u8>,
    /// Chain-native transaction id derived from `raw_bytes`.
    pub tx_hash: String,
    /// Human-readable signature (Sui, Ton).
    pub signature: Option<String>,
}

impl SignedTransaction {
    pub fn raw_hex(&self) -> String {
        hex::encode(&self.raw_bytes)
    }
}

/// One implementation per chain family.
pub trait ChainCodec {
    type Unsigned;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<Self::Unsigned>;

    /// Ordered bytes to sign. Pure in `unsigned`.
    fn pre_sign_hashes(&self, unsigned: &Self::Unsigned) -> KeysignResult<Vec<PreSignHash>>;

    fn finalize(
        &self,
        unsigned: &Self::Unsigned,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction>;

    /// Transaction id derived from final serialized bytes.
    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String>;
}

/// Unsigned transaction of any family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsignedTx {
    Utxo(utxo::UnsignedUtxoTx),
    Evm(evm::UnsignedEvmTx),
    Cosmos(cosmos::UnsignedCosmosTx),
    Sui(sui::UnsignedSuiTx),
    Ton(ton::UnsignedTonTx),
    Cardano(cardano::UnsignedCardanoTx),
    Solana(solana::UnsignedSolanaTx),
    Polkadot(polkadot::UnsignedPolkadotTx),
}

impl UnsignedTx {
    pub fn family(&self) -> ChainFamily {
        match self {
            Self::Utxo(_) => ChainFamily::Utxo,
            Self::Evm(_) => ChainFamily::Evm,
            Self::Cosmos(_) => ChainFamily::Cosmos,
            Self::Sui(_) => ChainFamily::Sui,
            Self::Ton(_) => ChainFamily::Ton,
            Self::Cardano(_) => ChainFamily::Cardano,
            Self::Solana(_) => ChainFamily::Solana,
            Self::Polkadot(_) => ChainFamily::Polkadot,
        }
    }

    pub fn signature_scheme(&self) -> SignatureScheme {
        match self.family() {
            ChainFamily::Utxo | ChainFamily::Evm | ChainFamily::Cosmos => SignatureScheme::Ecdsa,
            _ => SignatureScheme::Eddsa,
        }
    }
}

/// Build the unsigned transaction for the intent's chain family.
pub fn build_unsigned(intent: &TransactionIntent) -> KeysignResult<UnsignedTx> {
    let unsigned = match intent.coin.chain.family() {
        ChainFamily::Utxo => UnsignedTx::Utxo(utxo::UtxoCodec.build_unsigned(intent)?),
        ChainFamily::Evm => UnsignedTx::Evm(evm::EvmCodec.build_unsigned(intent)?),
        ChainFamily::Cosmos => UnsignedTx::Cosmos(cosmos::CosmosCodec.build_unsigned(intent)?),
        ChainFamily::Sui => UnsignedTx::Sui(sui::SuiCodec.build_unsigned(intent)?),
        ChainFamily::Ton => UnsignedTx::Ton(ton::TonCodec.build_unsigned(intent)?),
        ChainFamily::Cardano => UnsignedTx::Cardano(cardano::CardanoCodec.build_unsigned(intent)?),
        ChainFamily::Solana => UnsignedTx::Solana(solana::SolanaCodec.build_unsigned(intent)?),
        ChainFamily::Polkadot => {
            UnsignedTx::Polkadot(polkadot::PolkadotCodec.build_unsigned(intent)?)
        }
    };
    tracing::debug!(chain = %intent.coin.chain, family = %unsigned.family(), "Built unsigned transaction");
    Ok(unsigned)
}

/// Ordered pre-sign hashes for an unsigned transaction.
pub fn pre_sign_hashes(unsigned: &UnsignedTx) -> KeysignResult<Vec<PreSignHash>> {
    match unsigned {
        UnsignedTx::Utxo(tx) => utxo::UtxoCodec.pre_sign_hashes(tx),
        UnsignedTx::Evm(tx) => evm::EvmCodec.pre_sign_hashes(tx),
        UnsignedTx::Cosmos(tx) => cosmos::CosmosCodec.pre_sign_hashes(tx),
        UnsignedTx::Sui(tx) => sui::SuiCodec.pre_sign_hashes(tx),
        UnsignedTx::Ton(tx) => ton::TonCodec.pre_sign_hashes(tx),
        UnsignedTx::Cardano(tx) => cardano::CardanoCodec.pre_sign_hashes(tx),
        UnsignedTx::Solana(tx) => solana::SolanaCodec.pre_sign_hashes(tx),
        UnsignedTx::Polkadot(tx) => polkadot::PolkadotCodec.pre_sign_hashes(tx),
    }
}

/// Assemble the signed transaction. `public_key_hex` is the chain-specific
/// vault key for the transaction's signature scheme.
pub fn finalize(
    unsigned: &UnsignedTx,
    public_key_hex: &str,
    ledger: &SignatureLedger,
) -> KeysignResult<SignedTransaction> {
    let public_key = hex::decode(public_key_hex)
        .map_err(|e| KeysignError::InvalidPublicKey(format!("Invalid hex: {e}")))?;

    let signed = match unsigned {
        UnsignedTx::Utxo(tx) => utxo::UtxoCodec.finalize(tx, &public_key, ledger),
        UnsignedTx::Evm(tx) => evm::EvmCodec.finalize(tx, &public_key, ledger),
        UnsignedTx::Cosmos(tx) => cosmos::CosmosCodec.finalize(tx, &public_key, ledger),
        UnsignedTx::Sui(tx) => sui::SuiCodec.finalize(tx, &public_key, ledger),
        UnsignedTx::Ton(tx) => ton::TonCodec.finalize(tx, &public_key, ledger),
        UnsignedTx::Cardano(tx) => cardano::CardanoCodec.finalize(tx, &public_key, ledger),
        UnsignedTx::Solana(tx) => solana::SolanaCodec.finalize(tx, &public_key, ledger),
        UnsignedTx::Polkadot(tx) => polkadot::PolkadotCodec.finalize(tx, &public_key, ledger),
    }?;

    tracing::info!(family = %unsigned.family(), tx_hash = %signed.tx_hash, "Finalized transaction");
    Ok(signed)
}

/// Fetch every required signature, then verify each one.
///
/// All lookups happen before any verification so that a missing signature
/// is reported even when another one would fail to verify.
pub(crate) fn collect_verified(
    hashes: &[PreSignHash],
    public_key: &[u8],
    ledger: &SignatureLedger,
) -> KeysignResult<Vec<SignaturePackage>> {
    let signatures = hashes
        .iter()
        .map(|hash| ledger.get(hash))
        .collect::<KeysignResult<Vec<_>>>()?;

    for (hash, sig) in hashes.iter().zip(&signatures) {
        signature::verify(hash, sig, public_key)?;
    }

    Ok(signatures)
}

/// Exactly one hash, as most families produce.
pub(crate) fn single(hashes: Vec<PreSignHash>) -> KeysignResult<PreSignHash> {
    let mut hashes = hashes.into_iter();
    match (hashes.next(), hashes.next()) {
        (Some(hash), None) => Ok(hash),
        _ => Err(KeysignError::Internal(
            "Expected exactly one pre-sign hash".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_sign_hash_hex() {
        let hash = PreSignHash::from_hex("00ff10").unwrap();
        assert_eq!(hash.as_bytes(), &[0x00, 0xff, 0x10]);
        assert_eq!(hash.to_string(), "00ff10");
    }

    #[test]
    fn test_collect_reports_missing_before_mismatch() {
        use crate::signature::test_keys::{ecdsa_public, ecdsa_sign};

        let ledger = SignatureLedger::new();
        let a = PreSignHash::new(vec![1u8; 32]);
        let b = PreSignHash::new(vec![2u8; 32]);
        // Signature for the wrong digest under `a`.
        ledger.put(&a, ecdsa_sign(&[9u8; 32])).unwrap();

        let result = collect_verified(&[a, b.clone()], &ecdsa_public(), &ledger);
        assert!(matches!(
            result,
            Err(KeysignError::SignatureNotFound { hash }) if hash == b.to_hex()
        ));
    }

    #[test]
    fn test_finalize_rejects_bad_public_key_hex() {
        let intent_tx = UnsignedTx::Ton(ton::UnsignedTonTx::default());
        let result = finalize(&intent_tx, "zz", &SignatureLedger::new());
        assert!(matches!(result, Err(KeysignError::InvalidPublicKey(_))));
    }
}
