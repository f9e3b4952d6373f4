//! Vault records and encrypted backups.
//!
//! The signing core only reads vaults. Keygen and reshare ceremonies that
//! create them live elsewhere.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::codec::Chain;
use crate::crypto;
use crate::derivation;
use crate::error::{KeysignError, KeysignResult};
use crate::signature::SignatureScheme;

/// Opaque key share for one of the vault's root keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    /// Root public key this share belongs to, hex.
    pub public_key: String,
    /// Engine-specific share blob.
    pub keyshare: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub name: String,
    pub public_key_ecdsa: String,
    pub public_key_eddsa: String,
    pub hex_chain_code: String,
    pub local_party_id: String,
    /// Every signer of the vault, in keygen order.
    pub signers: Vec<String>,
    #[serde(default)]
    pub reshare_prefix: String,
    #[serde(default)]
    pub key_shares: Vec<KeyShare>,
}

impl Vault {
    /// Vaults are identified by their ECDSA root key.
    pub fn id(&self) -> &str {
        &self.public_key_ecdsa
    }

    pub fn public_key_for(&self, scheme: SignatureScheme) -> &str {
        match scheme {
            SignatureScheme::Ecdsa => &self.public_key_ecdsa,
            SignatureScheme::Eddsa => &self.public_key_eddsa,
        }
    }

    pub fn derived_ecdsa_key(&self, path: &str) -> KeysignResult<Vec<u8>> {
        derivation::derive_public_key(&self.public_key_ecdsa, &self.hex_chain_code, path)
    }

    /// Hex public key that signs for `chain`.
    pub fn chain_public_key(&self, chain: Chain) -> KeysignResult<String> {
        match chain.derivation_path() {
            Some(path) => Ok(hex::encode(self.derived_ecdsa_key(path)?)),
            None => Ok(self.public_key_eddsa.clone()),
        }
    }

    /// Share blob for the root key of `scheme`.
    pub fn key_share(&self, scheme: SignatureScheme) -> KeysignResult<&str> {
        let public_key = self.public_key_for(scheme);
        self.key_shares
            .iter()
            .find(|share| share.public_key == public_key)
            .map(|share| share.keyshare.as_str())
            .ok_or_else(|| {
                KeysignError::Internal(format!("Vault {} has no {scheme} key share", self.name))
            })
    }

    pub fn is_signer(&self, party: &str) -> bool {
        self.signers.iter().any(|s| s == party)
    }
}

/// Persistence collaborator for vaults.
pub trait VaultStore: Send + Sync {
    fn get(&self, id: &str) -> KeysignResult<Vault>;
    fn upsert(&self, vault: &Vault) -> KeysignResult<()>;
    fn list(&self) -> KeysignResult<Vec<Vault>>;
}

/// Backup file container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultBackup {
    pub version: u32,
    pub is_encrypted: bool,
    /// Base64 of the vault JSON, sealed when `is_encrypted`.
    pub vault: String,
}

const BACKUP_VERSION: u32 = 1;

/// Read a backup file. Plain vault JSON is accepted as-is.
///
/// A wrong password yields [`KeysignError::Decryption`], which callers may
/// treat as recoverable and prompt again.
pub fn import_backup(bytes: &[u8], password: Option<&str>) -> KeysignResult<Vault> {
    if let Ok(vault) = serde_json::from_slice::<Vault>(bytes) {
        return Ok(vault);
    }

    let container: VaultBackup = serde_json::from_slice(bytes)?;
    let payload = BASE64
        .decode(container.vault.trim())
        .map_err(|e| KeysignError::Deserialization(format!("Backup payload: {e}")))?;

    let plaintext = if container.is_encrypted {
        let password = password.ok_or_else(|| {
            KeysignError::Decryption("Backup is encrypted; password required".to_string())
        })?;
        let key = crypto::password_key(password);
        crypto::open(key.as_slice(), &payload)?
    } else {
        payload
    };

    let vault: Vault = serde_json::from_slice(&plaintext)?;
    tracing::info!(vault = %vault.name, encrypted = container.is_encrypted, "Imported vault backup");
    Ok(vault)
}

/// Serialize a vault into a backup container, sealed when a password is given.
pub fn export_backup(vault: &Vault, password: Option<&str>) -> KeysignResult<Vec<u8>> {
    let plaintext = serde_json::to_vec(vault)?;
    let (is_encrypted, payload) = match password {
        Some(password) => {
            let key = crypto::password_key(password);
            (true, crypto::seal(key.as_slice(), &plaintext)?)
        }
        None => (false, plaintext),
    };

    let container = VaultBackup {
        version: BACKUP_VERSION,
        is_encrypted,
        vault: BASE64.encode(payload),
    };
    Ok(serde_json::to_vec_pretty(&container)?)
}
