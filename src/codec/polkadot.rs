//! Polkadot `Balances.transfer_allow_death` extrinsics (v4, Ed25519).

use blake2::{
    Blake2b, Digest,
    digest::consts::{U32, U64},
};
use parity_scale_codec::{Compact, Encode};

use super::{ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, TransactionIntent};
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;

pub const POLKADOT_SS58_PREFIX: u16 = 0;
pub const ERA_PERIOD: u64 = 64;

const BALANCES_PALLET: u8 = 5;
const TRANSFER_ALLOW_DEATH: u8 = 0;
const MULTI_ADDRESS_ID: u8 = 0x00;
const MULTI_SIGNATURE_ED25519: u8 = 0x00;
/// Signed bit plus extrinsic format version 4.
const SIGNED_EXTRINSIC_V4: u8 = 0x84;
const MAX_UNHASHED_PAYLOAD: usize = 256;

fn blake2b256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2b::<U32>::digest(data));
    out
}

fn ss58_checksum(data: &[u8]) -> [u8; 2] {
    let mut hasher = Blake2b::<U64>::new();
    hasher.update(b"SS58PRE");
    hasher.update(data);
    let hash = hasher.finalize();
    [hash[0], hash[1]]
}

/// Account id and network prefix of an SS58 address.
pub fn decode_ss58(address: &str) -> KeysignResult<([u8; 32], u16)> {
    let invalid = |reason: &str| KeysignError::InvalidAddress(format!("{address}: {reason}"));
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|_| invalid("not base58"))?;

    let (prefix, prefix_len) = match bytes.first() {
        Some(b) if *b < 64 => (u16::from(*b), 1),
        Some(b) if *b < 128 => {
            let second = *bytes.get(1).ok_or_else(|| invalid("truncated"))?;
            let lower = (u16::from(*b & 0x3f) << 2) | u16::from(second >> 6);
            let upper = u16::from(second & 0x3f) << 8;
            (lower | upper, 2)
        }
        _ => return Err(invalid("unsupported prefix")),
    };
    if bytes.len() != prefix_len + 32 + 2 {
        return Err(invalid("expected a 32-byte account id"));
    }

    let (body, checksum) = bytes.split_at(prefix_len + 32);
    if ss58_checksum(body).as_slice() != checksum {
        return Err(invalid("checksum mismatch"));
    }

    let mut account = [0u8; 32];
    account.copy_from_slice(&body[prefix_len..]);
    Ok((account, prefix))
}

/// SS58 address for a simple (single-byte) prefix.
pub fn encode_ss58(account: &[u8; 32], prefix: u8) -> String {
    let mut bytes = Vec::with_capacity(35);
    bytes.push(prefix);
    bytes.extend_from_slice(account);
    let checksum = ss58_checksum(&bytes);
    bytes.extend_from_slice(&checksum);
    bs58::encode(bytes).into_string()
}

/// Two-byte mortal era encoding.
pub fn mortal_era(period: u64, current_block: u64) -> [u8; 2] {
    let period = period
        .checked_next_power_of_two()
        .unwrap_or(1 << 16)
        .clamp(4, 1 << 16);
    let phase = current_block % period;
    let quantize_factor = (period >> 12).max(1);
    let quantized_phase = phase / quantize_factor * quantize_factor;

    let low = u64::from(period.trailing_zeros().saturating_sub(1).clamp(1, 15));
    let encoded = low | ((quantized_phase / quantize_factor) << 4);
    (encoded as u16).to_le_bytes()
}

fn decode_hash(value: &str, field: &str) -> KeysignResult<[u8; 32]> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(stripped)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| KeysignError::InvalidIntent(format!("{field} must be 32-byte hex")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedPolkadotTx {
    pub call: Vec<u8>,
    /// Era, nonce, tip and metadata-hash mode.
    pub extra: Vec<u8>,
    /// Spec and transaction versions, genesis hash, checkpoint hash, metadata hash.
    pub additional: Vec<u8>,
}

impl UnsignedPolkadotTx {
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload =
            Vec::with_capacity(self.call.len() + self.extra.len() + self.additional.len());
        payload.extend_from_slice(&self.call);
        payload.extend_from_slice(&self.extra);
        payload.extend_from_slice(&self.additional);
        if payload.len() > MAX_UNHASHED_PAYLOAD {
            blake2b256(&payload).to_vec()
        } else {
            payload
        }
    }
}

pub struct PolkadotCodec;

impl ChainCodec for PolkadotCodec {
    type Unsigned = UnsignedPolkadotTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedPolkadotTx> {
        let ChainSpecific::Polkadot {
            recent_block_hash,
            nonce,
            current_block_number,
            spec_version,
            transaction_version,
            genesis_hash,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("Polkadot"));
        };

        let (destination, prefix) = decode_ss58(&intent.to_address)?;
        if prefix != POLKADOT_SS58_PREFIX {
            return Err(KeysignError::InvalidAddress(format!(
                "{}: not a Polkadot address",
                intent.to_address
            )));
        }

        let mut call = vec![BALANCES_PALLET, TRANSFER_ALLOW_DEATH, MULTI_ADDRESS_ID];
        call.extend_from_slice(&destination);
        Compact(intent.amount).encode_to(&mut call);

        let mut extra = mortal_era(ERA_PERIOD, *current_block_number).to_vec();
        Compact(*nonce).encode_to(&mut extra);
        Compact(0u128).encode_to(&mut extra);
        // CheckMetadataHash disabled.
        extra.push(0);

        let mut additional = Vec::with_capacity(4 + 4 + 32 + 32 + 1);
        spec_version.encode_to(&mut additional);
        transaction_version.encode_to(&mut additional);
        additional.extend_from_slice(&decode_hash(genesis_hash, "genesis_hash")?);
        additional.extend_from_slice(&decode_hash(recent_block_hash, "recent_block_hash")?);
        None::<[u8; 32]>.encode_to(&mut additional);

        Ok(UnsignedPolkadotTx {
            call,
            extra,
            additional,
        })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedPolkadotTx) -> KeysignResult<Vec<PreSignHash>> {
        Ok(vec![PreSignHash::new(unsigned.signing_payload())])
    }

    fn finalize(
        &self,
        unsigned: &UnsignedPolkadotTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hashes = self.pre_sign_hashes(unsigned)?;
        let signatures = super::collect_verified(&hashes, public_key, ledger)?;

        let mut body = vec![SIGNED_EXTRINSIC_V4, MULTI_ADDRESS_ID];
        body.extend_from_slice(public_key);
        body.push(MULTI_SIGNATURE_ED25519);
        body.extend_from_slice(&signatures[0].compact()?);
        body.extend_from_slice(&unsigned.extra);
        body.extend_from_slice(&unsigned.call);

        let length = u32::try_from(body.len())
            .map_err(|_| KeysignError::Internal("Extrinsic too large".to_string()))?;
        let mut raw_bytes = Compact(length).encode();
        raw_bytes.extend_from_slice(&body);

        let tx_hash = self.tx_hash(&raw_bytes)?;
        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: None,
        })
    }

    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        Ok(format!("0x{}", hex::encode(blake2b256(final_bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::intent::{Chain, Coin};
    use crate::signature::test_keys::{eddsa_public, eddsa_sign};

    const ALICE: &str = "15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5";
    const ALICE_KEY: &str = "d43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d";

    fn intent() -> TransactionIntent {
        TransactionIntent {
            coin: Coin {
                chain: Chain::Polkadot,
                ticker: "DOT".to_string(),
                address: String::new(),
                decimals: 10,
                contract_address: None,
                is_native_token: true,
                hex_public_key: hex::encode(eddsa_public()),
            },
            to_address: ALICE.to_string(),
            amount: 10_000_000_000,
            memo: None,
            chain_specific: ChainSpecific::Polkadot {
                recent_block_hash: format!("0x{}", "11".repeat(32)),
                nonce: 3,
                current_block_number: 20_000_123,
                spec_version: 1_003_000,
                transaction_version: 26,
                genesis_hash: format!("0x{}", "91".repeat(32)),
            },
        }
    }

    #[test]
    fn test_ss58_known_vector() {
        let (account, prefix) = decode_ss58(ALICE).unwrap();
        assert_eq!(hex::encode(account), ALICE_KEY);
        assert_eq!(prefix, 0);
        assert_eq!(encode_ss58(&account, 0), ALICE);
    }

    #[test]
    fn test_ss58_checksum_rejected() {
        let account = [7u8; 32];
        let mut bytes = bs58::decode(encode_ss58(&account, 0)).into_vec().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        assert!(decode_ss58(&bs58::encode(bytes).into_string()).is_err());
    }

    #[test]
    fn test_mortal_era_period_64() {
        let era = u16::from_le_bytes(mortal_era(64, 20_000_123));
        assert_eq!(era & 0x0f, 5);
        assert_eq!(u64::from(era >> 4), 20_000_123 % 64);
    }

    #[test]
    fn test_call_encoding() {
        let unsigned = PolkadotCodec.build_unsigned(&intent()).unwrap();
        assert_eq!(&unsigned.call[..3], &[5, 0, 0]);
        assert_eq!(hex::encode(&unsigned.call[3..35]), ALICE_KEY);
        assert_eq!(
            &unsigned.call[35..],
            Compact(10_000_000_000u128).encode().as_slice()
        );
        // era(2) nonce(1) tip(1) mode(1)
        assert_eq!(unsigned.extra.len(), 5);
        assert_eq!(unsigned.additional.len(), 73);
    }

    #[test]
    fn test_short_payload_signed_unhashed() {
        let unsigned = PolkadotCodec.build_unsigned(&intent()).unwrap();
        let payload = unsigned.signing_payload();
        assert!(payload.len() <= MAX_UNHASHED_PAYLOAD);
        assert!(payload.starts_with(&unsigned.call));
    }

    #[test]
    fn test_extrinsic_layout_and_hash() {
        let unsigned = PolkadotCodec.build_unsigned(&intent()).unwrap();
        let hash = &PolkadotCodec.pre_sign_hashes(&unsigned).unwrap()[0];
        let ledger = SignatureLedger::new();
        ledger.put(hash, eddsa_sign(hash.as_bytes())).unwrap();

        let signed = PolkadotCodec
            .finalize(&unsigned, &eddsa_public(), &ledger)
            .unwrap();
        let body_len = 1 + 1 + 32 + 1 + 64 + unsigned.extra.len() + unsigned.call.len();
        let prefix = Compact(body_len as u32).encode();
        assert!(signed.raw_bytes.starts_with(&prefix));
        assert_eq!(signed.raw_bytes[prefix.len()], SIGNED_EXTRINSIC_V4);
        assert!(signed.raw_bytes.ends_with(&unsigned.call));
        assert_eq!(
            signed.tx_hash,
            format!("0x{}", hex::encode(blake2b256(&signed.raw_bytes)))
        );
    }
}
