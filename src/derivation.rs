//! Non-hardened BIP32 derivation of chain public keys from the vault root.
//!
//! Threshold vaults hold no private root, so hardened steps cannot be
//! derived. Hardened markers in standard paths are stripped and every step
//! is derived as a normal child, matching the wallet's address derivation.

use bitcoin::NetworkKind;
use bitcoin::bip32::{ChainCode, ChildNumber, Fingerprint, Xpub};
use bitcoin::secp256k1::{PublicKey, SECP256K1};

use crate::error::{KeysignError, KeysignResult};

/// Parse `m/84'/0'/0'/0/0` into normal child numbers.
pub fn parse_path(path: &str) -> KeysignResult<Vec<ChildNumber>> {
    let invalid = |reason: String| KeysignError::InvalidIntent(format!("Path {path}: {reason}"));

    path.split('/')
        .filter(|part| !part.is_empty() && *part != "m")
        .map(|part| {
            let index: u32 = part
                .trim_end_matches(['\'', 'h'])
                .parse()
                .map_err(|_| invalid(format!("bad segment {part}")))?;
            ChildNumber::from_normal_idx(index).map_err(|e| invalid(e.to_string()))
        })
        .collect()
}

/// Derive the compressed public key at `path`.
pub fn derive_public_key(
    root_public_key_hex: &str,
    chain_code_hex: &str,
    path: &str,
) -> KeysignResult<Vec<u8>> {
    let root = PublicKey::from_slice(&hex::decode(root_public_key_hex)?)
        .map_err(|e| KeysignError::InvalidPublicKey(format!("Root key: {e}")))?;
    let chain_code: [u8; 32] = hex::decode(chain_code_hex)?
        .try_into()
        .map_err(|_| KeysignError::InvalidPublicKey("Chain code must be 32 bytes".to_string()))?;

    let xpub = Xpub {
        network: NetworkKind::Main,
        depth: 0,
        parent_fingerprint: Fingerprint::default(),
        child_number: ChildNumber::Normal { index: 0 },
        public_key: root,
        chain_code: ChainCode::from(chain_code),
    };
    let derived = xpub
        .derive_pub(SECP256K1, &parse_path(path)?)
        .map_err(|e| KeysignError::InvalidPublicKey(format!("Derivation: {e}")))?;

    Ok(derived.public_key.serialize().to_vec())
}
