//! Cosmos-SDK transactions signed in SIGN_MODE_DIRECT.
//!
//! THORChain and MayaChain use their own `types.MsgSend` with raw address
//! bytes, and additionally support `types.MsgDeposit` for memo-driven
//! protocol actions.

use bech32::FromBase32;
use prost::Message;
use prost_types::Any;
use sha2::{Digest, Sha256};

use super::{ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, TransactionIntent};
use crate::codec::intent::Chain;
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;

const SIGN_MODE_DIRECT: i32 = 1;
const THORCHAIN_GAS: u64 = 20_000_000;
const MAYACHAIN_GAS: u64 = 2_000_000_000;

// =============================================================================
// Protobuf messages
// =============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct ProtoCoin {
    #[prost(string, tag = "1")]
    pub denom: String,
    #[prost(string, tag = "2")]
    pub amount: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct BankMsgSend {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub to_address: String,
    #[prost(message, repeated, tag = "3")]
    pub amount: Vec<ProtoCoin>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NativeMsgSend {
    #[prost(bytes = "vec", tag = "1")]
    pub from_address: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub to_address: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub amount: Vec<ProtoCoin>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Asset {
    #[prost(string, tag = "1")]
    pub chain: String,
    #[prost(string, tag = "2")]
    pub symbol: String,
    #[prost(string, tag = "3")]
    pub ticker: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DepositCoin {
    #[prost(message, optional, tag = "1")]
    pub asset: Option<Asset>,
    #[prost(string, tag = "2")]
    pub amount: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct MsgDeposit {
    #[prost(message, repeated, tag = "1")]
    pub coins: Vec<DepositCoin>,
    #[prost(string, tag = "2")]
    pub memo: String,
    #[prost(bytes = "vec", tag = "3")]
    pub signer: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxBody {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Any>,
    #[prost(string, tag = "2")]
    pub memo: String,
    #[prost(uint64, tag = "3")]
    pub timeout_height: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Secp256k1PubKey {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModeInfoSingle {
    #[prost(int32, tag = "1")]
    pub mode: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModeInfo {
    #[prost(message, optional, tag = "1")]
    pub single: Option<ModeInfoSingle>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignerInfo {
    #[prost(message, optional, tag = "1")]
    pub public_key: Option<Any>,
    #[prost(message, optional, tag = "2")]
    pub mode_info: Option<ModeInfo>,
    #[prost(uint64, tag = "3")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Fee {
    #[prost(message, repeated, tag = "1")]
    pub amount: Vec<ProtoCoin>,
    #[prost(uint64, tag = "2")]
    pub gas_limit: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AuthInfo {
    #[prost(message, repeated, tag = "1")]
    pub signer_infos: Vec<SignerInfo>,
    #[prost(message, optional, tag = "2")]
    pub fee: Option<Fee>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignDoc {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(string, tag = "3")]
    pub chain_id: String,
    #[prost(uint64, tag = "4")]
    pub account_number: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxRaw {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub signatures: Vec<Vec<u8>>,
}

// =============================================================================
// Chain parameters
// =============================================================================

struct CosmosChain {
    chain_id: &'static str,
    denom: &'static str,
    hrp: &'static str,
    /// THORChain-style native module messages.
    native_types: bool,
}

fn params(chain: Chain) -> KeysignResult<CosmosChain> {
    let params = match chain {
        Chain::GaiaChain => CosmosChain {
            chain_id: "cosmoshub-4",
            denom: "uatom",
            hrp: "cosmos",
            native_types: false,
        },
        Chain::Kujira => CosmosChain {
            chain_id: "kaiyo-1",
            denom: "ukuji",
            hrp: "kujira",
            native_types: false,
        },
        Chain::Osmosis => CosmosChain {
            chain_id: "osmosis-1",
            denom: "uosmo",
            hrp: "osmo",
            native_types: false,
        },
        Chain::ThorChain => CosmosChain {
            chain_id: "thorchain-1",
            denom: "rune",
            hrp: "thor",
            native_types: true,
        },
        Chain::MayaChain => CosmosChain {
            chain_id: "mayachain-mainnet-v1",
            denom: "cacao",
            hrp: "maya",
            native_types: true,
        },
        other => {
            return Err(KeysignError::UnsupportedChain(format!(
                "{other} is not a Cosmos-SDK chain"
            )));
        }
    };
    Ok(params)
}

/// Decode a bech32 account address, requiring the chain's prefix.
pub fn decode_address(address: &str, expected_hrp: &str) -> KeysignResult<Vec<u8>> {
    let (hrp, data, _) = bech32::decode(address)
        .map_err(|e| KeysignError::InvalidAddress(format!("{address}: {e}")))?;
    if hrp != expected_hrp {
        return Err(KeysignError::InvalidAddress(format!(
            "{address}: expected prefix {expected_hrp}"
        )));
    }
    Vec::<u8>::from_base32(&data)
        .map_err(|e| KeysignError::InvalidAddress(format!("{address}: {e}")))
}

fn any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

fn send_message(intent: &TransactionIntent, params: &CosmosChain) -> KeysignResult<Any> {
    let denom = if intent.coin.is_native_token {
        params.denom.to_string()
    } else {
        intent
            .coin
            .contract_address
            .clone()
            .unwrap_or_else(|| intent.coin.ticker.to_lowercase())
    };
    let amount = vec![ProtoCoin {
        denom,
        amount: intent.amount.to_string(),
    }];

    if params.native_types {
        let message = NativeMsgSend {
            from_address: decode_address(&intent.coin.address, params.hrp)?,
            to_address: decode_address(&intent.to_address, params.hrp)?,
            amount,
        };
        Ok(any("/types.MsgSend", &message))
    } else {
        decode_address(&intent.to_address, params.hrp)?;
        let message = BankMsgSend {
            from_address: intent.coin.address.clone(),
            to_address: intent.to_address.clone(),
            amount,
        };
        Ok(any("/cosmos.bank.v1beta1.MsgSend", &message))
    }
}

fn deposit_message(intent: &TransactionIntent, params: &CosmosChain) -> KeysignResult<Any> {
    if !params.native_types {
        return Err(KeysignError::InvalidIntent(format!(
            "{} does not support deposits",
            intent.coin.chain
        )));
    }

    let chain = params.hrp.to_uppercase();
    let symbol = intent.coin.ticker.to_uppercase();
    let coins = if intent.amount > 0 {
        vec![DepositCoin {
            asset: Some(Asset {
                chain,
                symbol: symbol.clone(),
                ticker: symbol,
            }),
            amount: intent.amount.to_string(),
        }]
    } else {
        Vec::new()
    };

    let message = MsgDeposit {
        coins,
        memo: intent.memo().unwrap_or_default().to_string(),
        signer: decode_address(&intent.coin.address, params.hrp)?,
    };
    Ok(any("/types.MsgDeposit", &message))
}

// =============================================================================
// Codec
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCosmosTx {
    pub chain_id: String,
    pub account_number: u64,
    pub body_bytes: Vec<u8>,
    pub auth_info_bytes: Vec<u8>,
}

impl UnsignedCosmosTx {
    pub fn sign_doc(&self) -> SignDoc {
        SignDoc {
            body_bytes: self.body_bytes.clone(),
            auth_info_bytes: self.auth_info_bytes.clone(),
            chain_id: self.chain_id.clone(),
            account_number: self.account_number,
        }
    }
}

pub struct CosmosCodec;

impl ChainCodec for CosmosCodec {
    type Unsigned = UnsignedCosmosTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedCosmosTx> {
        let ChainSpecific::Cosmos {
            account_number,
            sequence,
            gas,
            fee,
            is_deposit,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("Cosmos"));
        };

        let params = params(intent.coin.chain)?;
        let message = if *is_deposit {
            deposit_message(intent, &params)?
        } else {
            send_message(intent, &params)?
        };

        // Deposits carry the memo inside the message.
        let memo = if *is_deposit {
            String::new()
        } else {
            intent.memo().unwrap_or_default().to_string()
        };
        let body = TxBody {
            messages: vec![message],
            memo,
            timeout_height: 0,
        };

        let public_key = hex::decode(&intent.coin.hex_public_key)?;
        let fee = match intent.coin.chain {
            Chain::ThorChain => Fee {
                amount: Vec::new(),
                gas_limit: THORCHAIN_GAS,
            },
            Chain::MayaChain => Fee {
                amount: Vec::new(),
                gas_limit: MAYACHAIN_GAS,
            },
            _ => Fee {
                amount: vec![ProtoCoin {
                    denom: params.denom.to_string(),
                    amount: fee.to_string(),
                }],
                gas_limit: *gas,
            },
        };
        let auth_info = AuthInfo {
            signer_infos: vec![SignerInfo {
                public_key: Some(any(
                    "/cosmos.crypto.secp256k1.PubKey",
                    &Secp256k1PubKey { key: public_key },
                )),
                mode_info: Some(ModeInfo {
                    single: Some(ModeInfoSingle {
                        mode: SIGN_MODE_DIRECT,
                    }),
                }),
                sequence: *sequence,
            }],
            fee: Some(fee),
        };

        Ok(UnsignedCosmosTx {
            chain_id: params.chain_id.to_string(),
            account_number: *account_number,
            body_bytes: body.encode_to_vec(),
            auth_info_bytes: auth_info.encode_to_vec(),
        })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedCosmosTx) -> KeysignResult<Vec<PreSignHash>> {
        let digest = Sha256::digest(unsigned.sign_doc().encode_to_vec());
        Ok(vec![PreSignHash::new(digest.to_vec())])
    }

    fn finalize(
        &self,
        unsigned: &UnsignedCosmosTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hashes = self.pre_sign_hashes(unsigned)?;
        let signatures = super::collect_verified(&hashes, public_key, ledger)?;
        let (sig, _) = signatures[0].normalized_ecdsa()?;

        let raw = TxRaw {
            body_bytes: unsigned.body_bytes.clone(),
            auth_info_bytes: unsigned.auth_info_bytes.clone(),
            signatures: vec![sig.serialize_compact().to_vec()],
        };
        let raw_bytes = raw.encode_to_vec();
        let tx_hash = self.tx_hash(&raw_bytes)?;

        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: None,
        })
    }

    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        Ok(hex::encode_upper(Sha256::digest(final_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use bech32::{ToBase32, Variant};

    use super::*;
    use crate::codec::intent::Coin;
    use crate::signature::test_keys::{ecdsa_public, ecdsa_sign};

    fn address(hrp: &str, byte: u8) -> String {
        bech32::encode(hrp, [byte; 20].to_base32(), Variant::Bech32).unwrap()
    }

    fn intent(chain: Chain, hrp: &str, is_deposit: bool) -> TransactionIntent {
        TransactionIntent {
            coin: Coin {
                chain,
                ticker: "RUNE".to_string(),
                address: address(hrp, 1),
                decimals: 8,
                contract_address: None,
                is_native_token: true,
                hex_public_key: hex::encode(ecdsa_public()),
            },
            to_address: address(hrp, 2),
            amount: 150_000_000,
            memo: Some("=:ETH.ETH:0x3535353535353535353535353535353535353535".to_string()),
            chain_specific: ChainSpecific::Cosmos {
                account_number: 42,
                sequence: 7,
                gas: 200_000,
                fee: 7_500,
                is_deposit,
            },
        }
    }

    #[test]
    fn test_gaia_send_uses_bank_module() {
        let unsigned = CosmosCodec
            .build_unsigned(&intent(Chain::GaiaChain, "cosmos", false))
            .unwrap();
        let body = TxBody::decode(unsigned.body_bytes.as_slice()).unwrap();
        assert_eq!(body.messages[0].type_url, "/cosmos.bank.v1beta1.MsgSend");
        assert!(body.memo.starts_with("=:ETH"));

        let auth = AuthInfo::decode(unsigned.auth_info_bytes.as_slice()).unwrap();
        let fee = auth.fee.unwrap();
        assert_eq!(fee.gas_limit, 200_000);
        assert_eq!(fee.amount[0].denom, "uatom");
        assert_eq!(auth.signer_infos[0].sequence, 7);
        assert_eq!(unsigned.chain_id, "cosmoshub-4");
    }

    #[test]
    fn test_thorchain_deposit() {
        let unsigned = CosmosCodec
            .build_unsigned(&intent(Chain::ThorChain, "thor", true))
            .unwrap();
        let body = TxBody::decode(unsigned.body_bytes.as_slice()).unwrap();
        assert_eq!(body.messages[0].type_url, "/types.MsgDeposit");
        assert!(body.memo.is_empty());

        let deposit = MsgDeposit::decode(body.messages[0].value.as_slice()).unwrap();
        assert_eq!(deposit.signer, vec![1u8; 20]);
        assert_eq!(deposit.coins[0].amount, "150000000");
        assert_eq!(deposit.coins[0].asset.as_ref().unwrap().chain, "THOR");

        let auth = AuthInfo::decode(unsigned.auth_info_bytes.as_slice()).unwrap();
        let fee = auth.fee.unwrap();
        assert_eq!(fee.gas_limit, THORCHAIN_GAS);
        assert!(fee.amount.is_empty());
    }

    #[test]
    fn test_deposit_without_amount_has_no_coins() {
        let mut intent = intent(Chain::MayaChain, "maya", true);
        intent.amount = 0;
        let unsigned = CosmosCodec.build_unsigned(&intent).unwrap();
        let body = TxBody::decode(unsigned.body_bytes.as_slice()).unwrap();
        let deposit = MsgDeposit::decode(body.messages[0].value.as_slice()).unwrap();
        assert!(deposit.coins.is_empty());
    }

    #[test]
    fn test_deposit_rejected_on_gaia() {
        let result = CosmosCodec.build_unsigned(&intent(Chain::GaiaChain, "cosmos", true));
        assert!(matches!(result, Err(KeysignError::InvalidIntent(_))));
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let mut intent = intent(Chain::Osmosis, "osmo", false);
        intent.to_address = address("cosmos", 2);
        assert!(matches!(
            CosmosCodec.build_unsigned(&intent),
            Err(KeysignError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_finalize_tx_hash_is_uppercase_sha256() {
        let unsigned = CosmosCodec
            .build_unsigned(&intent(Chain::ThorChain, "thor", false))
            .unwrap();
        let hashes = CosmosCodec.pre_sign_hashes(&unsigned).unwrap();
        let ledger = SignatureLedger::new();
        ledger
            .put(&hashes[0], ecdsa_sign(hashes[0].as_bytes()))
            .unwrap();

        let signed = CosmosCodec
            .finalize(&unsigned, &ecdsa_public(), &ledger)
            .unwrap();
        let raw = TxRaw::decode(signed.raw_bytes.as_slice()).unwrap();
        assert_eq!(raw.signatures[0].len(), 64);
        assert_eq!(
            signed.tx_hash,
            hex::encode_upper(Sha256::digest(&signed.raw_bytes))
        );
    }
}
