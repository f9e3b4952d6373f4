//! Cardano key and address helpers.

use bech32::{FromBase32, ToBase32, Variant};
use blake2::{Blake2b, Digest, digest::consts::U28};

use crate::error::{KeysignError, KeysignResult};

/// Enterprise address, mainnet: `(6 << 4) | 1`.
pub const ENTERPRISE_MAINNET_HEADER: u8 = 0x61;
pub const ADDRESS_HRP: &str = "addr";

fn require_32(bytes: &[u8], what: &str) -> KeysignResult<()> {
    if bytes.len() != 32 {
        return Err(KeysignError::InvalidPublicKey(format!(
            "{what} must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// `spending_key || spending_key || chain_code || chain_code`
pub fn create_extended_key(spending_key: &[u8], chain_code: &[u8]) -> KeysignResult<[u8; 128]> {
    require_32(spending_key, "spending key")?;
    require_32(chain_code, "chain code")?;

    let mut extended = [0u8; 128];
    extended[..32].copy_from_slice(spending_key);
    extended[32..64].copy_from_slice(spending_key);
    extended[64..96].copy_from_slice(chain_code);
    extended[96..].copy_from_slice(chain_code);
    Ok(extended)
}

/// Raw 29-byte enterprise address payload.
pub fn enterprise_address_bytes(spending_key: &[u8]) -> KeysignResult<[u8; 29]> {
    require_32(spending_key, "spending key")?;

    let hash = Blake2b::<U28>::digest(spending_key);
    let mut payload = [0u8; 29];
    payload[0] = ENTERPRISE_MAINNET_HEADER;
    payload[1..].copy_from_slice(&hash);
    Ok(payload)
}

/// Bech32 `addr1...` enterprise address for a spending key.
pub fn create_enterprise_address(spending_key: &[u8]) -> KeysignResult<String> {
    let payload = enterprise_address_bytes(spending_key)?;
    bech32::encode(ADDRESS_HRP, payload.to_base32(), Variant::Bech32)
        .map_err(|e| KeysignError::Internal(format!("Bech32 encode: {e}")))
}

/// Raw address bytes of any bech32 Shelley address.
pub fn decode_address(address: &str) -> KeysignResult<Vec<u8>> {
    let (hrp, data, _) = bech32::decode(address)
        .map_err(|e| KeysignError::InvalidAddress(format!("{address}: {e}")))?;
    if !hrp.starts_with(ADDRESS_HRP) {
        return Err(KeysignError::InvalidAddress(format!(
            "{address}: not a Cardano address"
        )));
    }
    Vec::<u8>::from_base32(&data)
        .map_err(|e| KeysignError::InvalidAddress(format!("{address}: {e}")))
}
