//! Ton wallet transfers.
//!
//! The signed payload is the wallet's external message body: wallet id,
//! expiry, sequence number and a single internal transfer.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL},
};
use sha2::{Digest, Sha256};

use super::{ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, TransactionIntent};
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;

pub const WALLET_ID: u32 = 698_983_191;

/// Pay fees separately, ignore action-phase errors.
pub const MODE_DEFAULT: u8 = 1 | 2;
/// Carry the whole remaining balance, ignore action-phase errors.
pub const MODE_SEND_MAX: u8 = 128 | 2;

const TAG_BOUNCEABLE: u8 = 0x11;
const TAG_NON_BOUNCEABLE: u8 = 0x51;
const TAG_TESTNET: u8 = 0x80;

/// CRC-16/XMODEM as used by user-friendly addresses.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl TonAddress {
    /// Accepts raw `wc:hex` and 48-character user-friendly forms.
    pub fn parse(address: &str) -> KeysignResult<Self> {
        let invalid = |reason: &str| KeysignError::InvalidAddress(format!("{address}: {reason}"));

        if let Some((workchain, hash)) = address.split_once(':') {
            let workchain: i8 = workchain.parse().map_err(|_| invalid("bad workchain"))?;
            let hash = hex::decode(hash)
                .map_err(|_| invalid("bad hash hex"))?
                .try_into()
                .map_err(|_| invalid("hash must be 32 bytes"))?;
            return Ok(Self { workchain, hash });
        }

        let bytes = BASE64_URL
            .decode(address)
            .or_else(|_| BASE64.decode(address))
            .map_err(|_| invalid("not base64"))?;
        if bytes.len() != 36 {
            return Err(invalid("expected 36 bytes"));
        }
        let checksum = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != checksum {
            return Err(invalid("checksum mismatch"));
        }
        if !matches!(bytes[0] & !TAG_TESTNET, TAG_BOUNCEABLE | TAG_NON_BOUNCEABLE) {
            return Err(invalid("unknown tag"));
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self {
            workchain: i8::from_be_bytes([bytes[1]]),
            hash,
        })
    }

    pub fn to_user_friendly(&self, bounceable: bool) -> String {
        let mut bytes = Vec::with_capacity(36);
        bytes.push(if bounceable {
            TAG_BOUNCEABLE
        } else {
            TAG_NON_BOUNCEABLE
        });
        bytes.extend_from_slice(&self.workchain.to_be_bytes());
        bytes.extend_from_slice(&self.hash);
        let checksum = crc16(&bytes);
        bytes.extend_from_slice(&checksum.to_be_bytes());
        BASE64_URL.encode(bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsignedTonTx {
    pub wallet_id: u32,
    pub expire_at: u32,
    pub seqno: u32,
    pub mode: u8,
    pub bounce: bool,
    pub workchain: i8,
    pub destination: [u8; 32],
    pub amount: u128,
    pub comment: Option<String>,
}

impl UnsignedTonTx {
    /// Fails when the comment does not fit its 16-bit length prefix.
    pub fn payload(&self) -> KeysignResult<Vec<u8>> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&self.wallet_id.to_be_bytes());
        out.extend_from_slice(&self.expire_at.to_be_bytes());
        out.extend_from_slice(&self.seqno.to_be_bytes());
        // Simple send op.
        out.push(0);

        out.push(self.mode);
        out.push(u8::from(self.bounce));
        out.extend_from_slice(&self.workchain.to_be_bytes());
        out.extend_from_slice(&self.destination);

        // Coins: length-prefixed big-endian without leading zeros.
        let amount = self.amount.to_be_bytes();
        let start = amount.iter().position(|b| *b != 0).unwrap_or(amount.len());
        out.push((amount.len() - start) as u8);
        out.extend_from_slice(&amount[start..]);

        match &self.comment {
            Some(comment) => {
                let text = comment.as_bytes();
                let len = u16::try_from(text.len()).map_err(|_| {
                    KeysignError::InvalidIntent(format!(
                        "Comment is {} bytes, limit {}",
                        text.len(),
                        u16::MAX
                    ))
                })?;
                out.push(1);
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(text);
            }
            None => out.push(0),
        }
        Ok(out)
    }
}

pub struct TonCodec;

impl ChainCodec for TonCodec {
    type Unsigned = UnsignedTonTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedTonTx> {
        let ChainSpecific::Ton {
            sequence_number,
            expire_at,
            bounceable,
            send_max_amount,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("Ton"));
        };

        let to_u32 = |value: u64, field: &str| {
            u32::try_from(value)
                .map_err(|_| KeysignError::InvalidIntent(format!("{field} exceeds u32")))
        };
        let destination = TonAddress::parse(&intent.to_address)?;
        let comment = intent.memo().map(str::to_string);
        if comment
            .as_ref()
            .is_some_and(|c| c.len() > usize::from(u16::MAX))
        {
            return Err(KeysignError::InvalidIntent("Comment too long".to_string()));
        }

        let (mode, amount) = if *send_max_amount {
            (MODE_SEND_MAX, 0)
        } else {
            (MODE_DEFAULT, intent.amount)
        };

        Ok(UnsignedTonTx {
            wallet_id: WALLET_ID,
            expire_at: to_u32(*expire_at, "expire_at")?,
            seqno: to_u32(*sequence_number, "sequence_number")?,
            mode,
            bounce: *bounceable,
            workchain: destination.workchain,
            destination: destination.hash,
            amount,
            comment,
        })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedTonTx) -> KeysignResult<Vec<PreSignHash>> {
        Ok(vec![PreSignHash::new(
            Sha256::digest(unsigned.payload()?).to_vec(),
        )])
    }

    fn finalize(
        &self,
        unsigned: &UnsignedTonTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hashes = self.pre_sign_hashes(unsigned)?;
        let signatures = super::collect_verified(&hashes, public_key, ledger)?;
        let signature = signatures[0].compact()?;

        let payload = unsigned.payload()?;
        let mut raw_bytes = Vec::with_capacity(64 + payload.len());
        raw_bytes.extend_from_slice(&signature);
        raw_bytes.extend_from_slice(&payload);
        let tx_hash = self.tx_hash(&raw_bytes)?;

        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: Some(BASE64.encode(signature)),
        })
    }

    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        Ok(hex::encode(Sha256::digest(final_bytes)))
    }
}
