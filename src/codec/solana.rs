//! Solana legacy-message transfers.
//!
//! EdDSA signs the serialized message itself, so the pre-sign "hash" is the
//! full message.

use super::{ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, TransactionIntent};
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;

pub const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";
pub const COMPUTE_BUDGET_PROGRAM: &str = "ComputeBudget111111111111111111111111111111";
pub const MEMO_PROGRAM: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";

pub const DEFAULT_COMPUTE_UNIT_PRICE: u64 = 1_000_000;
pub const COMPUTE_UNIT_LIMIT: u32 = 100_000;

const SYSTEM_TRANSFER: u32 = 2;
const SET_COMPUTE_UNIT_LIMIT: u8 = 2;
const SET_COMPUTE_UNIT_PRICE: u8 = 3;

/// Decode a base58 32-byte public key or hash.
pub fn decode_key(value: &str) -> KeysignResult<[u8; 32]> {
    bs58::decode(value)
        .into_vec()
        .map_err(|e| KeysignError::InvalidAddress(format!("{value}: {e}")))?
        .try_into()
        .map_err(|_| KeysignError::InvalidAddress(format!("{value}: expected 32 bytes")))
}

/// Solana's compact-u16 ("shortvec") length encoding.
pub fn encode_compact_u16(out: &mut Vec<u8>, mut value: u16) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Returns the value and the number of bytes consumed.
pub fn decode_compact_u16(bytes: &[u8]) -> KeysignResult<(u16, usize)> {
    let mut value: u32 = 0;
    for (i, byte) in bytes.iter().take(3).enumerate() {
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            let value = u16::try_from(value)
                .map_err(|_| KeysignError::Deserialization("compact-u16 overflow".to_string()))?;
            return Ok((value, i + 1));
        }
    }
    Err(KeysignError::Deserialization(
        "Truncated compact-u16".to_string(),
    ))
}

fn compact_len(out: &mut Vec<u8>, len: usize) -> KeysignResult<()> {
    let len = u16::try_from(len)
        .map_err(|_| KeysignError::InvalidIntent("Solana list too long".to_string()))?;
    encode_compact_u16(out, len);
    Ok(())
}

struct Instruction {
    program: u8,
    accounts: Vec<u8>,
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedSolanaTx {
    pub message: Vec<u8>,
}

pub struct SolanaCodec;

impl ChainCodec for SolanaCodec {
    type Unsigned = UnsignedSolanaTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedSolanaTx> {
        let ChainSpecific::Solana {
            recent_block_hash,
            priority_fee,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("Solana"));
        };
        if !intent.coin.is_native_token {
            return Err(KeysignError::InvalidIntent(
                "Solana token transfers are not supported".to_string(),
            ));
        }

        let payer = decode_key(&intent.coin.address)?;
        let destination = decode_key(&intent.to_address)?;
        if payer == destination {
            return Err(KeysignError::InvalidIntent(
                "Sender and recipient must differ".to_string(),
            ));
        }
        let block_hash = decode_key(recent_block_hash)?;
        let lamports = u64::try_from(intent.amount)
            .map_err(|_| KeysignError::InvalidIntent("Amount exceeds u64".to_string()))?;
        let memo = intent.memo();

        // Writable signer, writable recipient, then read-only programs.
        let mut accounts = vec![
            payer,
            destination,
            decode_key(SYSTEM_PROGRAM)?,
            decode_key(COMPUTE_BUDGET_PROGRAM)?,
        ];
        if memo.is_some() {
            accounts.push(decode_key(MEMO_PROGRAM)?);
        }
        let readonly_programs = (accounts.len() - 2) as u8;

        let price = if *priority_fee > 0 {
            *priority_fee
        } else {
            DEFAULT_COMPUTE_UNIT_PRICE
        };
        let mut limit_data = vec![SET_COMPUTE_UNIT_LIMIT];
        limit_data.extend_from_slice(&COMPUTE_UNIT_LIMIT.to_le_bytes());
        let mut price_data = vec![SET_COMPUTE_UNIT_PRICE];
        price_data.extend_from_slice(&price.to_le_bytes());
        let mut transfer_data = SYSTEM_TRANSFER.to_le_bytes().to_vec();
        transfer_data.extend_from_slice(&lamports.to_le_bytes());

        let mut instructions = vec![
            Instruction {
                program: 3,
                accounts: Vec::new(),
                data: limit_data,
            },
            Instruction {
                program: 3,
                accounts: Vec::new(),
                data: price_data,
            },
            Instruction {
                program: 2,
                accounts: vec![0, 1],
                data: transfer_data,
            },
        ];
        if let Some(memo) = memo {
            instructions.push(Instruction {
                program: 4,
                accounts: Vec::new(),
                data: memo.as_bytes().to_vec(),
            });
        }

        let mut message = vec![1, 0, readonly_programs];
        compact_len(&mut message, accounts.len())?;
        for account in &accounts {
            message.extend_from_slice(account);
        }
        message.extend_from_slice(&block_hash);
        compact_len(&mut message, instructions.len())?;
        for instruction in &instructions {
            message.push(instruction.program);
            compact_len(&mut message, instruction.accounts.len())?;
            message.extend_from_slice(&instruction.accounts);
            compact_len(&mut message, instruction.data.len())?;
            message.extend_from_slice(&instruction.data);
        }

        Ok(UnsignedSolanaTx { message })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedSolanaTx) -> KeysignResult<Vec<PreSignHash>> {
        Ok(vec![PreSignHash::new(unsigned.message.clone())])
    }

    fn finalize(
        &self,
        unsigned: &UnsignedSolanaTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hashes = self.pre_sign_hashes(unsigned)?;
        let signatures = super::collect_verified(&hashes, public_key, ledger)?;

        let mut raw_bytes = Vec::with_capacity(1 + 64 + unsigned.message.len());
        encode_compact_u16(&mut raw_bytes, 1);
        raw_bytes.extend_from_slice(&signatures[0].compact()?);
        raw_bytes.extend_from_slice(&unsigned.message);

        let tx_hash = self.tx_hash(&raw_bytes)?;
        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: None,
        })
    }

    /// The first signature, read back out of the serialized transaction.
    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        let (count, offset) = decode_compact_u16(final_bytes)?;
        if count == 0 {
            return Err(KeysignError::Deserialization(
                "Transaction has no signatures".to_string(),
            ));
        }
        let signature = final_bytes.get(offset..offset + 64).ok_or_else(|| {
            KeysignError::Deserialization("Transaction truncated in signature".to_string())
        })?;
        Ok(bs58::encode(signature).into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::intent::{Chain, Coin};
    use crate::signature::test_keys::{eddsa_public, eddsa_sign};

    fn intent(memo: Option<&str>) -> TransactionIntent {
        TransactionIntent {
            coin: Coin {
                chain: Chain::Solana,
                ticker: "SOL".to_string(),
                address: bs58::encode(eddsa_public()).into_string(),
                decimals: 9,
                contract_address: None,
                is_native_token: true,
                hex_public_key: hex::encode(eddsa_public()),
            },
            to_address: bs58::encode([0x44; 32]).into_string(),
            amount: 2_500_000,
            memo: memo.map(str::to_string),
            chain_specific: ChainSpecific::Solana {
                recent_block_hash: bs58::encode([0x55; 32]).into_string(),
                priority_fee: 0,
            },
        }
    }

    #[test]
    fn test_compact_u16() {
        for (value, encoded) in [
            (0u16, vec![0x00]),
            (0x7f, vec![0x7f]),
            (0x80, vec![0x80, 0x01]),
            (0x3fff, vec![0xff, 0x7f]),
            (0xffff, vec![0xff, 0xff, 0x03]),
        ] {
            let mut out = Vec::new();
            encode_compact_u16(&mut out, value);
            assert_eq!(out, encoded);
            assert_eq!(decode_compact_u16(&out).unwrap(), (value, encoded.len()));
        }
    }

    #[test]
    fn test_message_layout() {
        let unsigned = SolanaCodec.build_unsigned(&intent(None)).unwrap();
        let message = &unsigned.message;
        // 1 signer, 0 read-only signed, 2 read-only programs, 4 keys
        assert_eq!(&message[..4], &[1, 0, 2, 4]);
        assert_eq!(&message[4..36], eddsa_public().as_slice());
        assert_eq!(&message[36..68], &[0x44; 32]);
        assert_eq!(&message[68..100], &[0u8; 32]);
    }

    #[test]
    fn test_memo_adds_program_and_instruction() {
        let unsigned = SolanaCodec.build_unsigned(&intent(Some("hello"))).unwrap();
        assert_eq!(&unsigned.message[..4], &[1, 0, 3, 5]);
        assert!(unsigned.message.ends_with(b"\x04\x00\x05hello"));
    }

    #[test]
    fn test_tx_hash_is_signature_from_final_bytes() {
        let unsigned = SolanaCodec.build_unsigned(&intent(None)).unwrap();
        let hash = &SolanaCodec.pre_sign_hashes(&unsigned).unwrap()[0];
        assert_eq!(hash.as_bytes(), unsigned.message.as_slice());

        let ledger = SignatureLedger::new();
        let signature = eddsa_sign(hash.as_bytes());
        ledger.put(hash, signature.clone()).unwrap();

        let signed = SolanaCodec
            .finalize(&unsigned, &eddsa_public(), &ledger)
            .unwrap();
        assert_eq!(signed.raw_bytes[0], 1);
        assert_eq!(
            signed.tx_hash,
            bs58::encode(signature.compact().unwrap()).into_string()
        );
    }

    #[test]
    fn test_self_transfer_rejected() {
        let mut intent = intent(None);
        intent.to_address = intent.coin.address.clone();
        assert!(SolanaCodec.build_unsigned(&intent).is_err());
    }
}
