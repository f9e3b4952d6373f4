//! EIP-1559 (type 2) transactions for EVM chains.

use rlp::RlpStream;
use tiny_keccak::{Hasher, Keccak};

use super::{ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, TransactionIntent};
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;
use crate::signature;

const TX_TYPE_EIP1559: u8 = 0x02;
/// `transfer(address,uint256)`
const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut hasher = Keccak::v256();
    hasher.update(data);
    hasher.finalize(&mut out);
    out
}

/// Parse a 0x-prefixed 20-byte address.
pub fn parse_address(address: &str) -> KeysignResult<[u8; 20]> {
    let stripped = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(stripped)
        .map_err(|e| KeysignError::InvalidAddress(format!("{address}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| KeysignError::InvalidAddress(format!("{address}: expected 20 bytes")))
}

/// `transfer(to, amount)` calldata.
pub fn erc20_transfer_data(to: &[u8; 20], amount: u128) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to);
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(&amount.to_be_bytes());
    data
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvmTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u128,
    pub data: Vec<u8>,
}

impl UnsignedEvmTx {
    fn append_fields(&self, stream: &mut RlpStream) {
        stream.append(&self.chain_id);
        stream.append(&self.nonce);
        stream.append(&self.max_priority_fee_per_gas);
        stream.append(&self.max_fee_per_gas);
        stream.append(&self.gas_limit);
        stream.append(&self.to.to_vec());
        stream.append(&self.value);
        stream.append(&self.data);
        // Empty access list.
        stream.begin_list(0);
    }

    /// `0x02 || rlp([chainId, nonce, ..., accessList])`
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_fields(&mut stream);
        typed(&stream.out())
    }

    fn signed_payload(&self, y_parity: u8, r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut stream = RlpStream::new_list(12);
        self.append_fields(&mut stream);
        stream.append(&y_parity);
        // Integers in RLP carry no leading zeros.
        stream.append(&trim_leading_zeros(r).to_vec());
        stream.append(&trim_leading_zeros(s).to_vec());
        typed(&stream.out())
    }
}

fn typed(rlp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + rlp.len());
    out.push(TX_TYPE_EIP1559);
    out.extend_from_slice(rlp);
    out
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

pub struct EvmCodec;

impl ChainCodec for EvmCodec {
    type Unsigned = UnsignedEvmTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedEvmTx> {
        let ChainSpecific::Ethereum {
            max_fee_per_gas_wei,
            priority_fee_wei,
            nonce,
            gas_limit,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("Ethereum"));
        };

        let chain_id = intent.coin.chain.evm_chain_id()?;
        let recipient = parse_address(&intent.to_address)?;

        let (to, value, data) = if intent.coin.is_native_token {
            let data = intent
                .memo()
                .map(|m| m.as_bytes().to_vec())
                .unwrap_or_default();
            (recipient, intent.amount, data)
        } else {
            let contract = intent.coin.contract_address.as_deref().ok_or_else(|| {
                KeysignError::InvalidIntent("Token transfer without contract address".to_string())
            })?;
            (
                parse_address(contract)?,
                0,
                erc20_transfer_data(&recipient, intent.amount),
            )
        };

        Ok(UnsignedEvmTx {
            chain_id,
            nonce: *nonce,
            max_priority_fee_per_gas: *priority_fee_wei,
            max_fee_per_gas: *max_fee_per_gas_wei,
            gas_limit: *gas_limit,
            to,
            value,
            data,
        })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedEvmTx) -> KeysignResult<Vec<PreSignHash>> {
        Ok(vec![PreSignHash::new(
            keccak256(&unsigned.signing_payload()).to_vec(),
        )])
    }

    fn finalize(
        &self,
        unsigned: &UnsignedEvmTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hash = super::single(self.pre_sign_hashes(unsigned)?)?;
        let package = ledger.get(&hash)?;
        let (sig, y_parity) = signature::verify_recoverable(&hash, &package, public_key)?;

        let compact = sig.serialize_compact();
        let raw_bytes = unsigned.signed_payload(y_parity, &compact[..32], &compact[32..]);
        let tx_hash = self.tx_hash(&raw_bytes)?;

        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: None,
        })
    }

    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        Ok(format!("0x{}", hex::encode(keccak256(final_bytes))))
    }
}
