//! Transfer intents handed in by the wallet layer.
//!
//! Intents arrive already address- and amount-validated. The chain tag on
//! the coin selects the codec family.

use serde::{Deserialize, Serialize};

use crate::error::{KeysignError, KeysignResult};
use crate::signature::SignatureScheme;

/// Supported chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Chain {
    Bitcoin,
    BitcoinTestnet,
    Ethereum,
    Arbitrum,
    Base,
    Avalanche,
    BscChain,
    Polygon,
    Optimism,
    GaiaChain,
    Kujira,
    Osmosis,
    ThorChain,
    MayaChain,
    Sui,
    Ton,
    Cardano,
    Solana,
    Polkadot,
}

/// Transaction encoding family shared by a group of chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Utxo,
    Evm,
    Cosmos,
    Sui,
    Ton,
    Cardano,
    Solana,
    Polkadot,
}

impl Chain {
    pub fn family(self) -> ChainFamily {
        match self {
            Self::Bitcoin | Self::BitcoinTestnet => ChainFamily::Utxo,
            Self::Ethereum
            | Self::Arbitrum
            | Self::Base
            | Self::Avalanche
            | Self::BscChain
            | Self::Polygon
            | Self::Optimism => ChainFamily::Evm,
            Self::GaiaChain | Self::Kujira | Self::Osmosis | Self::ThorChain | Self::MayaChain => {
                ChainFamily::Cosmos
            }
            Self::Sui => ChainFamily::Sui,
            Self::Ton => ChainFamily::Ton,
            Self::Cardano => ChainFamily::Cardano,
            Self::Solana => ChainFamily::Solana,
            Self::Polkadot => ChainFamily::Polkadot,
        }
    }

    /// Which vault key signs for this chain.
    pub fn signature_scheme(self) -> SignatureScheme {
        match self.family() {
            ChainFamily::Utxo | ChainFamily::Evm | ChainFamily::Cosmos => SignatureScheme::Ecdsa,
            ChainFamily::Sui
            | ChainFamily::Ton
            | ChainFamily::Cardano
            | ChainFamily::Solana
            | ChainFamily::Polkadot => SignatureScheme::Eddsa,
        }
    }

    /// BIP32 path for ECDSA chains. EdDSA chains use the root key directly.
    pub fn derivation_path(self) -> Option<&'static str> {
        match self {
            Self::Bitcoin => Some("m/84'/0'/0'/0/0"),
            Self::BitcoinTestnet => Some("m/84'/1'/0'/0/0"),
            Self::Ethereum
            | Self::Arbitrum
            | Self::Base
            | Self::Avalanche
            | Self::BscChain
            | Self::Polygon
            | Self::Optimism => Some("m/44'/60'/0'/0/0"),
            Self::GaiaChain | Self::Kujira | Self::Osmosis => Some("m/44'/118'/0'/0/0"),
            Self::ThorChain | Self::MayaChain => Some("m/44'/931'/0'/0/0"),
            Self::Sui | Self::Ton | Self::Cardano | Self::Solana | Self::Polkadot => None,
        }
    }

    /// EIP-155 chain id for EVM chains.
    pub fn evm_chain_id(self) -> KeysignResult<u64> {
        match self {
            Self::Ethereum => Ok(1),
            Self::Optimism => Ok(10),
            Self::BscChain => Ok(56),
            Self::Polygon => Ok(137),
            Self::Base => Ok(8453),
            Self::Arbitrum => Ok(42161),
            Self::Avalanche => Ok(43114),
            other => Err(KeysignError::UnsupportedChain(format!(
                "{other} is not an EVM chain"
            ))),
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bitcoin => "Bitcoin",
            Self::BitcoinTestnet => "Bitcoin-Testnet",
            Self::Ethereum => "Ethereum",
            Self::Arbitrum => "Arbitrum",
            Self::Base => "Base",
            Self::Avalanche => "Avalanche",
            Self::BscChain => "BSC",
            Self::Polygon => "Polygon",
            Self::Optimism => "Optimism",
            Self::GaiaChain => "Cosmos",
            Self::Kujira => "Kujira",
            Self::Osmosis => "Osmosis",
            Self::ThorChain => "THORChain",
            Self::MayaChain => "MayaChain",
            Self::Sui => "Sui",
            Self::Ton => "Ton",
            Self::Cardano => "Cardano",
            Self::Solana => "Solana",
            Self::Polkadot => "Polkadot",
        };
        write!(f, "{name}")
    }
}

impl std::fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utxo => write!(f, "utxo"),
            Self::Evm => write!(f, "evm"),
            Self::Cosmos => write!(f, "cosmos"),
            Self::Sui => write!(f, "sui"),
            Self::Ton => write!(f, "ton"),
            Self::Cardano => write!(f, "cardano"),
            Self::Solana => write!(f, "solana"),
            Self::Polkadot => write!(f, "polkadot"),
        }
    }
}

/// The asset being moved and the sender's address on its chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub chain: Chain,
    pub ticker: String,
    /// Sender address on `chain`.
    pub address: String,
    pub decimals: u8,
    /// Token contract (EVM) or coin type (Sui); `None` for the native asset.
    pub contract_address: Option<String>,
    pub is_native_token: bool,
    /// Chain-specific public key of the sender, hex encoded.
    pub hex_public_key: String,
}

/// Unspent output owned by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInfo {
    /// Funding transaction id in display (big-endian) hex.
    pub hash: String,
    pub amount: u64,
    pub index: u32,
}

/// Sui coin object reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiCoin {
    pub coin_type: String,
    /// 32-byte object id, 0x-prefixed hex.
    pub object_id: String,
    pub version: u64,
    /// Object digest, base58.
    pub digest: String,
    pub balance: u64,
}

/// Chain-specific parameters gathered by the wallet layer before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainSpecific {
    Utxo {
        byte_fee: u64,
        send_max_amount: bool,
        utxos: Vec<UtxoInfo>,
    },
    Ethereum {
        max_fee_per_gas_wei: u128,
        priority_fee_wei: u128,
        nonce: u64,
        gas_limit: u64,
    },
    Cosmos {
        account_number: u64,
        sequence: u64,
        gas: u64,
        fee: u128,
        is_deposit: bool,
    },
    Sui {
        reference_gas_price: u64,
        gas_budget: u64,
        coins: Vec<SuiCoin>,
    },
    Ton {
        sequence_number: u64,
        expire_at: u64,
        bounceable: bool,
        send_max_amount: bool,
    },
    Cardano {
        byte_fee: u64,
        send_max_amount: bool,
        ttl: u64,
        utxos: Vec<UtxoInfo>,
    },
    Solana {
        recent_block_hash: String,
        priority_fee: u64,
    },
    Polkadot {
        recent_block_hash: String,
        nonce: u64,
        current_block_number: u64,
        spec_version: u32,
        transaction_version: u32,
        genesis_hash: String,
    },
}

/// A validated transfer the wallet wants signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIntent {
    pub coin: Coin,
    pub to_address: String,
    /// Amount in the asset's smallest unit.
    pub amount: u128,
    pub memo: Option<String>,
    pub chain_specific: ChainSpecific,
}

impl TransactionIntent {
    /// Memo with empty strings treated as absent.
    pub fn memo(&self) -> Option<&str> {
        self.memo.as_deref().filter(|m| !m.is_empty())
    }

    pub(crate) fn mismatch(&self, expected: &str) -> KeysignError {
        KeysignError::InvalidIntent(format!(
            "{} intent requires {expected} parameters",
            self.coin.chain
        ))
    }
}
