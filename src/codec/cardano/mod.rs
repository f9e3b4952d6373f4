//! Cardano (Shelley) payment transactions.
//!
//! The signed hash covers only the transaction body, the first element of
//! the outer CBOR array. The body bytes are produced once and embedded
//! verbatim in the final transaction so the hash stays stable.

pub mod address;
pub mod cbor;

use std::collections::BTreeMap;

use blake2::{Blake2b, Digest, digest::consts::U32};
use serde_cbor::Value;

use super::{ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, TransactionIntent};
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;

pub use address::{create_enterprise_address, create_extended_key};
pub use cbor::extract_transaction_body;

/// Minimum lovelace for a change output.
pub const MIN_UTXO_VALUE: u64 = 1_000_000;

const CBOR_ARRAY_4: u8 = 0x84;
const CBOR_TRUE: u8 = 0xf5;
const CBOR_NULL: u8 = 0xf6;

fn blake2b256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2b::<U32>::digest(data));
    out
}

fn int(value: u64) -> Value {
    Value::Integer(i128::from(value))
}

fn output(address: Vec<u8>, amount: u64) -> Value {
    Value::Array(vec![Value::Bytes(address), int(amount)])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCardanoTx {
    /// Canonical CBOR of the transaction body map.
    pub body: Vec<u8>,
    pub fee: u64,
}

pub struct CardanoCodec;

impl ChainCodec for CardanoCodec {
    type Unsigned = UnsignedCardanoTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedCardanoTx> {
        let ChainSpecific::Cardano {
            byte_fee,
            send_max_amount,
            ttl,
            utxos,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("Cardano"));
        };

        if utxos.is_empty() {
            return Err(KeysignError::InvalidIntent(
                "No spendable inputs".to_string(),
            ));
        }
        if intent.memo().is_some() {
            tracing::warn!("Cardano transfers do not carry memos; memo dropped");
        }

        let sender = address::decode_address(&intent.coin.address)?;
        let destination = address::decode_address(&intent.to_address)?;

        let mut inputs = Vec::with_capacity(utxos.len());
        let mut total: u64 = 0;
        for utxo in utxos {
            let hash = hex::decode(&utxo.hash)
                .ok()
                .filter(|h| h.len() == 32)
                .ok_or_else(|| {
                    KeysignError::InvalidIntent(format!("UTXO hash {} is not 32 bytes", utxo.hash))
                })?;
            inputs.push(Value::Array(vec![
                Value::Bytes(hash),
                int(u64::from(utxo.index)),
            ]));
            total = total
                .checked_add(utxo.amount)
                .ok_or_else(|| KeysignError::InvalidIntent("Input total overflows".to_string()))?;
        }

        let mut fee = *byte_fee;
        let mut outputs = Vec::with_capacity(2);
        if *send_max_amount {
            let amount = total
                .checked_sub(fee)
                .filter(|amount| *amount >= MIN_UTXO_VALUE)
                .ok_or(KeysignError::InsufficientFunds {
                    needed: u128::from(fee) + u128::from(MIN_UTXO_VALUE),
                    available: u128::from(total),
                })?;
            outputs.push(output(destination, amount));
        } else {
            let amount = u64::try_from(intent.amount)
                .map_err(|_| KeysignError::InvalidIntent("Amount exceeds u64".to_string()))?;
            let needed = amount.saturating_add(fee);
            let change = total
                .checked_sub(needed)
                .ok_or(KeysignError::InsufficientFunds {
                    needed: u128::from(needed),
                    available: u128::from(total),
                })?;

            outputs.push(output(destination, amount));
            if change >= MIN_UTXO_VALUE {
                outputs.push(output(sender, change));
            } else {
                fee += change;
            }
        }

        let body: BTreeMap<Value, Value> = [
            (int(0), Value::Array(inputs)),
            (int(1), Value::Array(outputs)),
            (int(2), int(fee)),
            (int(3), int(*ttl)),
        ]
        .into_iter()
        .collect();
        let body = serde_cbor::to_vec(&Value::Map(body))
            .map_err(|e| KeysignError::Serialization(format!("Cardano body: {e}")))?;

        Ok(UnsignedCardanoTx { body, fee })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedCardanoTx) -> KeysignResult<Vec<PreSignHash>> {
        Ok(vec![PreSignHash::new(blake2b256(&unsigned.body).to_vec())])
    }

    fn finalize(
        &self,
        unsigned: &UnsignedCardanoTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hashes = self.pre_sign_hashes(unsigned)?;
        let signatures = super::collect_verified(&hashes, public_key, ledger)?;

        let vkey_witness = Value::Array(vec![
            Value::Bytes(public_key.to_vec()),
            Value::Bytes(signatures[0].compact()?.to_vec()),
        ]);
        let witness_set: BTreeMap<Value, Value> = [(int(0), Value::Array(vec![vkey_witness]))]
            .into_iter()
            .collect();
        let witness_set = serde_cbor::to_vec(&Value::Map(witness_set))
            .map_err(|e| KeysignError::Serialization(format!("Cardano witness: {e}")))?;

        let mut raw_bytes = Vec::with_capacity(1 + unsigned.body.len() + witness_set.len() + 2);
        raw_bytes.push(CBOR_ARRAY_4);
        raw_bytes.extend_from_slice(&unsigned.body);
        raw_bytes.extend_from_slice(&witness_set);
        raw_bytes.push(CBOR_TRUE);
        raw_bytes.push(CBOR_NULL);

        let tx_hash = self.tx_hash(&raw_bytes)?;
        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: None,
        })
    }

    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        let hash = match cbor::extract_transaction_body(final_bytes) {
            Ok(body) => blake2b256(body),
            Err(e) => {
                tracing::warn!(error = %e, "Could not extract Cardano body; hashing whole transaction");
                blake2b256(final_bytes)
            }
        };
        Ok(hex::encode(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::intent::{Chain, Coin, UtxoInfo};
    use crate::signature::test_keys::{eddsa_public, eddsa_sign};

    fn intent(amount: u128, send_max: bool) -> TransactionIntent {
        let sender = create_enterprise_address(&eddsa_public()).unwrap();
        let recipient = create_enterprise_address(&[0x33; 32]).unwrap();
        TransactionIntent {
            coin: Coin {
                chain: Chain::Cardano,
                ticker: "ADA".to_string(),
                address: sender,
                decimals: 6,
                contract_address: None,
                is_native_token: true,
                hex_public_key: hex::encode(eddsa_public()),
            },
            to_address: recipient,
            amount,
            memo: None,
            chain_specific: ChainSpecific::Cardano {
                byte_fee: 180_000,
                send_max_amount: send_max,
                ttl: 150_000_000,
                utxos: vec![
                    UtxoInfo {
                        hash: "ab".repeat(32),
                        amount: 5_000_000,
                        index: 0,
                    },
                    UtxoInfo {
                        hash: "cd".repeat(32),
                        amount: 3_000_000,
                        index: 1,
                    },
                ],
            },
        }
    }

    fn body_map(unsigned: &UnsignedCardanoTx) -> BTreeMap<Value, Value> {
        match serde_cbor::from_slice(&unsigned.body).unwrap() {
            Value::Map(map) => map,
            other => panic!("body is not a map: {other:?}"),
        }
    }

    #[test]
    fn test_change_output_above_minimum() {
        let unsigned = CardanoCodec
            .build_unsigned(&intent(2_000_000, false))
            .unwrap();
        let body = body_map(&unsigned);
        let Value::Array(outputs) = &body[&int(1)] else {
            panic!("outputs");
        };
        assert_eq!(outputs.len(), 2);
        assert_eq!(body[&int(2)], int(180_000));
        assert_eq!(body[&int(3)], int(150_000_000));
    }

    #[test]
    fn test_small_change_folds_into_fee() {
        let unsigned = CardanoCodec
            .build_unsigned(&intent(8_000_000 - 180_000 - 500_000, false))
            .unwrap();
        assert_eq!(unsigned.fee, 680_000);
        let body = body_map(&unsigned);
        let Value::Array(outputs) = &body[&int(1)] else {
            panic!("outputs");
        };
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_send_max_spends_everything_minus_fee() {
        let unsigned = CardanoCodec.build_unsigned(&intent(0, true)).unwrap();
        let body = body_map(&unsigned);
        let Value::Array(outputs) = &body[&int(1)] else {
            panic!("outputs");
        };
        assert_eq!(
            outputs[0],
            output(
                address::decode_address(&create_enterprise_address(&[0x33; 32]).unwrap()).unwrap(),
                8_000_000 - 180_000,
            )
        );
    }

    #[test]
    fn test_insufficient_funds() {
        assert!(matches!(
            CardanoCodec.build_unsigned(&intent(8_000_000, false)),
            Err(KeysignError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_tx_hash_covers_body_only() {
        let unsigned = CardanoCodec
            .build_unsigned(&intent(2_000_000, false))
            .unwrap();
        let hash = &CardanoCodec.pre_sign_hashes(&unsigned).unwrap()[0];
        let ledger = SignatureLedger::new();
        ledger.put(hash, eddsa_sign(hash.as_bytes())).unwrap();

        let signed = CardanoCodec
            .finalize(&unsigned, &eddsa_public(), &ledger)
            .unwrap();
        assert_eq!(
            extract_transaction_body(&signed.raw_bytes).unwrap(),
            unsigned.body.as_slice()
        );
        assert_eq!(signed.tx_hash, hash.to_hex());

        let decoded: Value = serde_cbor::from_slice(&signed.raw_bytes).unwrap();
        let Value::Array(items) = decoded else {
            panic!("transaction is not an array");
        };
        assert_eq!(items.len(), 4);
        assert_eq!(items[2], Value::Bool(true));
        assert_eq!(items[3], Value::Null);
    }

    #[test]
    fn test_tx_hash_falls_back_to_whole_bytes() {
        let garbage = [0x01, 0x02, 0x03];
        assert_eq!(
            CardanoCodec.tx_hash(&garbage).unwrap(),
            hex::encode(blake2b256(&garbage))
        );
    }
}
