//! Bitcoin-family P2WPKH transactions.
//!
//! One BIP143 sighash per input, in input order. Fee estimation and dust
//! handling follow the wallet's policy; they are not consensus rules.

use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::script::PushBytes;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness, absolute::LockTime, consensus::encode, sighash::EcdsaSighashType,
    sighash::SighashCache, transaction::Version,
};

use super::{ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, TransactionIntent};
use crate::codec::intent::Chain;
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;

/// Outputs below this many satoshis are folded into the fee.
pub const DUST_THRESHOLD: u64 = 546;

const SIGHASH_ALL: u8 = 0x01;
const MAX_OP_RETURN_LEN: usize = 80;

/// Multiplier applied to the network's fee statistic.
///
/// Wallet policy carried over for compatibility; not a protocol requirement.
pub fn recommended_byte_fee(network_fee_stat: u64) -> u64 {
    network_fee_stat.saturating_mul(5) / 2
}

/// Virtual size estimate for a P2WPKH spend.
pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    11 + 68 * inputs as u64 + 31 * outputs as u64
}

/// Unsigned P2WPKH transaction and the outputs it spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedUtxoTx {
    pub transaction: Transaction,
    /// Spent outputs in input order.
    pub prevouts: Vec<TxOut>,
    pub fee: u64,
}

pub struct UtxoCodec;

fn network_for(chain: Chain) -> KeysignResult<Network> {
    match chain {
        Chain::Bitcoin => Ok(Network::Bitcoin),
        Chain::BitcoinTestnet => Ok(Network::Testnet),
        other => Err(KeysignError::UnsupportedChain(format!(
            "{other} is not a UTXO chain"
        ))),
    }
}

fn parse_address(address: &str, network: Network) -> KeysignResult<ScriptBuf> {
    let address = Address::from_str(address)
        .map_err(|e| KeysignError::InvalidAddress(format!("{address}: {e}")))?
        .require_network(network)
        .map_err(|e| KeysignError::InvalidAddress(e.to_string()))?;
    Ok(address.script_pubkey())
}

fn sender_key(public_key: &[u8]) -> KeysignResult<CompressedPublicKey> {
    CompressedPublicKey::from_slice(public_key)
        .map_err(|e| KeysignError::InvalidPublicKey(format!("secp256k1: {e}")))
}

fn memo_output(memo: &str) -> KeysignResult<TxOut> {
    let bytes = memo.as_bytes();
    if bytes.len() > MAX_OP_RETURN_LEN {
        return Err(KeysignError::InvalidIntent(format!(
            "Memo exceeds {MAX_OP_RETURN_LEN} bytes"
        )));
    }
    let push = <&PushBytes>::try_from(bytes)
        .map_err(|e| KeysignError::InvalidIntent(format!("Memo: {e}")))?;
    Ok(TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(push),
    })
}

impl ChainCodec for UtxoCodec {
    type Unsigned = UnsignedUtxoTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedUtxoTx> {
        let ChainSpecific::Utxo {
            byte_fee,
            send_max_amount,
            utxos,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("UTXO"));
        };

        if utxos.is_empty() {
            return Err(KeysignError::InvalidIntent(
                "No spendable inputs".to_string(),
            ));
        }

        let network = network_for(intent.coin.chain)?;
        let key = sender_key(&hex::decode(&intent.coin.hex_public_key)?)?;
        let change_script = ScriptBuf::new_p2wpkh(&key.wpubkey_hash());
        let destination = parse_address(&intent.to_address, network)?;

        let mut input = Vec::with_capacity(utxos.len());
        let mut prevouts = Vec::with_capacity(utxos.len());
        let mut total: u64 = 0;
        for utxo in utxos {
            let txid = Txid::from_str(&utxo.hash).map_err(|e| {
                KeysignError::InvalidIntent(format!("UTXO hash {}: {e}", utxo.hash))
            })?;
            input.push(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: utxo.index,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            });
            prevouts.push(TxOut {
                value: Amount::from_sat(utxo.amount),
                script_pubkey: change_script.clone(),
            });
            total = total
                .checked_add(utxo.amount)
                .ok_or_else(|| KeysignError::InvalidIntent("Input total overflows".to_string()))?;
        }

        let memo = intent.memo().map(memo_output).transpose()?;
        let extra_outputs = usize::from(memo.is_some());
        let mut output = Vec::new();

        let fee = if *send_max_amount {
            let fee = byte_fee.saturating_mul(estimate_vsize(input.len(), 1 + extra_outputs));
            let value = total
                .checked_sub(fee)
                .filter(|v| *v >= DUST_THRESHOLD)
                .ok_or(KeysignError::InsufficientFunds {
                    needed: u128::from(fee) + u128::from(DUST_THRESHOLD),
                    available: u128::from(total),
                })?;
            output.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: destination,
            });
            output.extend(memo);
            fee
        } else {
            let amount = u64::try_from(intent.amount)
                .map_err(|_| KeysignError::InvalidIntent("Amount exceeds u64".to_string()))?;
            let fee = byte_fee.saturating_mul(estimate_vsize(input.len(), 2 + extra_outputs));
            let needed = amount.saturating_add(fee);
            let change = total
                .checked_sub(needed)
                .ok_or(KeysignError::InsufficientFunds {
                    needed: u128::from(needed),
                    available: u128::from(total),
                })?;

            output.push(TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: destination,
            });
            output.extend(memo);
            if change >= DUST_THRESHOLD {
                output.push(TxOut {
                    value: Amount::from_sat(change),
                    script_pubkey: change_script,
                });
            }
            total - amount - if change >= DUST_THRESHOLD { change } else { 0 }
        };

        Ok(UnsignedUtxoTx {
            transaction: Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input,
                output,
            },
            prevouts,
            fee,
        })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedUtxoTx) -> KeysignResult<Vec<PreSignHash>> {
        let mut cache = SighashCache::new(&unsigned.transaction);
        unsigned
            .prevouts
            .iter()
            .enumerate()
            .map(|(index, prevout)| {
                cache
                    .p2wpkh_signature_hash(
                        index,
                        &prevout.script_pubkey,
                        prevout.value,
                        EcdsaSighashType::All,
                    )
                    .map(|sighash| PreSignHash::new(sighash.to_byte_array().to_vec()))
                    .map_err(|e| KeysignError::Internal(format!("Sighash input {index}: {e}")))
            })
            .collect()
    }

    fn finalize(
        &self,
        unsigned: &UnsignedUtxoTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hashes = self.pre_sign_hashes(unsigned)?;
        let signatures = super::collect_verified(&hashes, public_key, ledger)?;

        let key = sender_key(public_key)?;
        let owner_script = ScriptBuf::new_p2wpkh(&key.wpubkey_hash());
        if unsigned
            .prevouts
            .iter()
            .any(|prevout| prevout.script_pubkey != owner_script)
        {
            return Err(KeysignError::InvalidPublicKey(
                "Public key does not own every input".to_string(),
            ));
        }

        let mut transaction = unsigned.transaction.clone();
        for (input, signature) in transaction.input.iter_mut().zip(&signatures) {
            let mut der = signature.der()?;
            der.push(SIGHASH_ALL);

            let mut witness = Witness::new();
            witness.push(der);
            witness.push(key.0.serialize());
            input.witness = witness;
        }

        let raw_bytes = encode::serialize(&transaction);
        let tx_hash = self.tx_hash(&raw_bytes)?;

        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: None,
        })
    }

    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        let transaction: Transaction = encode::deserialize(final_bytes)
            .map_err(|e| KeysignError::Deserialization(format!("Transaction: {e}")))?;
        Ok(transaction.compute_txid().to_string())
    }
}
