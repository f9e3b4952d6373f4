//! Sui programmable transactions in BCS.
//!
//! Native SUI transfers split the amount off the gas coin (PaySui). Token
//! transfers merge and split the token coins, paying gas with a separate
//! SUI coin (Pay).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use blake2::{Blake2b, Digest, digest::consts::U32};

use super::{
    ChainCodec, ChainSpecific, PreSignHash, SignedTransaction, SuiCoin, TransactionIntent,
};
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;

/// `TransactionData` intent: scope 0, version 0, app id 0.
const INTENT_PREFIX: [u8; 3] = [0, 0, 0];
const DIGEST_SALT: &[u8] = b"TransactionData::";
const ED25519_FLAG: u8 = 0x00;
const SUI_COIN_TYPE: &str = "0x2::sui::SUI";

type Blake2b256 = Blake2b<U32>;

fn blake2b256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn is_sui(coin_type: &str) -> bool {
    coin_type == SUI_COIN_TYPE || coin_type.ends_with("::sui::SUI")
}

/// Minimal BCS writer.
#[derive(Default)]
struct Bcs(Vec<u8>);

impl Bcs {
    fn uleb128(&mut self, mut value: u64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.0.push(byte);
                return self;
            }
            self.0.push(byte | 0x80);
        }
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.0.push(value);
        self
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.extend_from_slice(bytes);
        self
    }

    fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.uleb128(bytes.len() as u64).fixed(bytes)
    }
}

/// 32-byte address or object id from 0x hex, left-padded.
pub fn parse_id(value: &str) -> KeysignResult<[u8; 32]> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    if stripped.is_empty() || stripped.len() > 64 {
        return Err(KeysignError::InvalidAddress(format!("{value}: bad length")));
    }
    let padded = format!("{stripped:0>64}");
    let bytes =
        hex::decode(&padded).map_err(|e| KeysignError::InvalidAddress(format!("{value}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| KeysignError::InvalidAddress(value.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub object_id: [u8; 32],
    pub version: u64,
    pub digest: [u8; 32],
}

impl ObjectRef {
    fn from_coin(coin: &SuiCoin) -> KeysignResult<Self> {
        let digest = bs58::decode(&coin.digest)
            .into_vec()
            .map_err(|e| KeysignError::InvalidIntent(format!("Object digest: {e}")))?
            .try_into()
            .map_err(|_| {
                KeysignError::InvalidIntent("Object digest must be 32 bytes".to_string())
            })?;
        Ok(Self {
            object_id: parse_id(&coin.object_id)?,
            version: coin.version,
            digest,
        })
    }

    fn write(&self, bcs: &mut Bcs) {
        bcs.fixed(&self.object_id)
            .u64(self.version)
            .bytes(&self.digest);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Argument {
    GasCoin,
    Input(u16),
    NestedResult(u16, u16),
}

impl Argument {
    fn write(self, bcs: &mut Bcs) {
        match self {
            Self::GasCoin => {
                bcs.u8(0);
            }
            Self::Input(index) => {
                bcs.u8(1).u16(index);
            }
            Self::NestedResult(command, result) => {
                bcs.u8(3).u16(command).u16(result);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    TransferObjects(Vec<Argument>, Argument),
    SplitCoins(Argument, Vec<Argument>),
    MergeCoins(Argument, Vec<Argument>),
}

impl Command {
    fn write(&self, bcs: &mut Bcs) {
        let list = |bcs: &mut Bcs, args: &[Argument]| {
            bcs.uleb128(args.len() as u64);
            for arg in args {
                arg.write(bcs);
            }
        };
        match self {
            Self::TransferObjects(objects, recipient) => {
                bcs.u8(1);
                list(bcs, objects);
                recipient.write(bcs);
            }
            Self::SplitCoins(coin, amounts) => {
                bcs.u8(2);
                coin.write(bcs);
                list(bcs, amounts);
            }
            Self::MergeCoins(target, sources) => {
                bcs.u8(3);
                target.write(bcs);
                list(bcs, sources);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CallArg {
    Pure(Vec<u8>),
    Object(ObjectRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedSuiTx {
    sender: [u8; 32],
    inputs: Vec<CallArg>,
    commands: Vec<Command>,
    pub gas_payment: Vec<ObjectRef>,
    pub gas_price: u64,
    pub gas_budget: u64,
}

impl UnsignedSuiTx {
    /// BCS `TransactionData::V1`.
    pub fn to_bcs(&self) -> Vec<u8> {
        let mut bcs = Bcs::default();
        // V1, ProgrammableTransaction
        bcs.u8(0).u8(0);

        bcs.uleb128(self.inputs.len() as u64);
        for input in &self.inputs {
            match input {
                CallArg::Pure(bytes) => {
                    bcs.u8(0).bytes(bytes);
                }
                CallArg::Object(object) => {
                    // ImmOrOwnedObject
                    bcs.u8(1).u8(0);
                    object.write(&mut bcs);
                }
            }
        }
        bcs.uleb128(self.commands.len() as u64);
        for command in &self.commands {
            command.write(&mut bcs);
        }

        bcs.fixed(&self.sender);

        bcs.uleb128(self.gas_payment.len() as u64);
        for object in &self.gas_payment {
            object.write(&mut bcs);
        }
        bcs.fixed(&self.sender)
            .u64(self.gas_price)
            .u64(self.gas_budget);

        // TransactionExpiration::None
        bcs.u8(0);
        bcs.0
    }
}

/// Pick the SUI coin that pays gas for a token transfer.
///
/// The coin must hold more than both the gas budget and the reference gas
/// price and must not be one of the payment objects. The smallest such
/// coin wins.
pub fn select_gas_coin<'a>(
    coins: &'a [SuiCoin],
    payment_ids: &[&str],
    gas_budget: u64,
    reference_gas_price: u64,
) -> KeysignResult<&'a SuiCoin> {
    let floor = gas_budget.max(reference_gas_price);
    coins
        .iter()
        .filter(|coin| is_sui(&coin.coin_type))
        .filter(|coin| !payment_ids.contains(&coin.object_id.as_str()))
        .filter(|coin| coin.balance > floor)
        .min_by_key(|coin| coin.balance)
        .ok_or_else(|| {
            KeysignError::NoEligibleGasCoin(format!("no SUI coin holds more than {floor}"))
        })
}

fn pure_u64(value: u64) -> CallArg {
    CallArg::Pure(value.to_le_bytes().to_vec())
}

pub struct SuiCodec;

impl ChainCodec for SuiCodec {
    type Unsigned = UnsignedSuiTx;

    fn build_unsigned(&self, intent: &TransactionIntent) -> KeysignResult<UnsignedSuiTx> {
        let ChainSpecific::Sui {
            reference_gas_price,
            gas_budget,
            coins,
        } = &intent.chain_specific
        else {
            return Err(intent.mismatch("Sui"));
        };

        let sender = parse_id(&intent.coin.address)?;
        let recipient = parse_id(&intent.to_address)?;
        let amount = u64::try_from(intent.amount)
            .map_err(|_| KeysignError::InvalidIntent("Amount exceeds u64".to_string()))?;

        let (inputs, commands, gas_payment) = if intent.coin.is_native_token {
            let sui_coins: Vec<&SuiCoin> = coins.iter().filter(|c| is_sui(&c.coin_type)).collect();
            let available: u128 = sui_coins.iter().map(|c| u128::from(c.balance)).sum();
            let needed = u128::from(amount) + u128::from(*gas_budget);
            if sui_coins.is_empty() || available < needed {
                return Err(KeysignError::InsufficientFunds { needed, available });
            }

            let inputs = vec![pure_u64(amount), CallArg::Pure(recipient.to_vec())];
            let commands = vec![
                Command::SplitCoins(Argument::GasCoin, vec![Argument::Input(0)]),
                Command::TransferObjects(vec![Argument::NestedResult(0, 0)], Argument::Input(1)),
            ];
            let payment = sui_coins
                .into_iter()
                .map(ObjectRef::from_coin)
                .collect::<KeysignResult<Vec<_>>>()?;
            (inputs, commands, payment)
        } else {
            let coin_type = intent.coin.contract_address.as_deref().ok_or_else(|| {
                KeysignError::InvalidIntent("Token transfer without coin type".to_string())
            })?;
            let token_coins: Vec<&SuiCoin> =
                coins.iter().filter(|c| c.coin_type == coin_type).collect();
            let available: u128 = token_coins.iter().map(|c| u128::from(c.balance)).sum();
            if token_coins.is_empty() || available < u128::from(amount) {
                return Err(KeysignError::InsufficientFunds {
                    needed: u128::from(amount),
                    available,
                });
            }

            let payment_ids: Vec<&str> = token_coins.iter().map(|c| c.object_id.as_str()).collect();
            let gas_coin = select_gas_coin(coins, &payment_ids, *gas_budget, *reference_gas_price)?;

            let mut inputs = token_coins
                .iter()
                .map(|coin| ObjectRef::from_coin(coin).map(CallArg::Object))
                .collect::<KeysignResult<Vec<_>>>()?;
            let object_count = u16::try_from(inputs.len())
                .map_err(|_| KeysignError::InvalidIntent("Too many coin objects".to_string()))?;
            inputs.push(pure_u64(amount));
            inputs.push(CallArg::Pure(recipient.to_vec()));

            let mut commands = Vec::new();
            if object_count > 1 {
                commands.push(Command::MergeCoins(
                    Argument::Input(0),
                    (1..object_count).map(Argument::Input).collect(),
                ));
            }
            let split_index = u16::try_from(commands.len()).unwrap_or_default();
            commands.push(Command::SplitCoins(
                Argument::Input(0),
                vec![Argument::Input(object_count)],
            ));
            commands.push(Command::TransferObjects(
                vec![Argument::NestedResult(split_index, 0)],
                Argument::Input(object_count + 1),
            ));

            (inputs, commands, vec![ObjectRef::from_coin(gas_coin)?])
        };

        Ok(UnsignedSuiTx {
            sender,
            inputs,
            commands,
            gas_payment,
            gas_price: *reference_gas_price,
            gas_budget: *gas_budget,
        })
    }

    fn pre_sign_hashes(&self, unsigned: &UnsignedSuiTx) -> KeysignResult<Vec<PreSignHash>> {
        let digest = blake2b256(&[&INTENT_PREFIX, &unsigned.to_bcs()]);
        Ok(vec![PreSignHash::new(digest.to_vec())])
    }

    fn finalize(
        &self,
        unsigned: &UnsignedSuiTx,
        public_key: &[u8],
        ledger: &SignatureLedger,
    ) -> KeysignResult<SignedTransaction> {
        let hashes = self.pre_sign_hashes(unsigned)?;
        let signatures = super::collect_verified(&hashes, public_key, ledger)?;

        let mut serialized = Vec::with_capacity(1 + 64 + public_key.len());
        serialized.push(ED25519_FLAG);
        serialized.extend_from_slice(&signatures[0].compact()?);
        serialized.extend_from_slice(public_key);

        let raw_bytes = unsigned.to_bcs();
        let tx_hash = self.tx_hash(&raw_bytes)?;

        Ok(SignedTransaction {
            raw_bytes,
            tx_hash,
            signature: Some(BASE64.encode(serialized)),
        })
    }

    fn tx_hash(&self, final_bytes: &[u8]) -> KeysignResult<String> {
        Ok(bs58::encode(blake2b256(&[DIGEST_SALT, final_bytes])).into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::intent::{Chain, Coin};
    use crate::signature::test_keys::{eddsa_public, eddsa_sign};

    const USDC: &str =
        "0xdba34672e30cb065b1f93e3ab55318768fd6fef66c15942c9f7cb846e2f900e7::usdc::USDC";

    fn coin(coin_type: &str, id: u8, balance: u64) -> SuiCoin {
        SuiCoin {
            coin_type: coin_type.to_string(),
            object_id: format!("0x{}", hex::encode([id; 32])),
            version: u64::from(id),
            digest: bs58::encode([id; 32]).into_string(),
            balance,
        }
    }

    fn intent(native: bool, coins: Vec<SuiCoin>) -> TransactionIntent {
        TransactionIntent {
            coin: Coin {
                chain: Chain::Sui,
                ticker: if native { "SUI" } else { "USDC" }.to_string(),
                address: format!("0x{}", hex::encode([0xaa; 32])),
                decimals: 9,
                contract_address: (!native).then(|| USDC.to_string()),
                is_native_token: native,
                hex_public_key: hex::encode(eddsa_public()),
            },
            to_address: format!("0x{}", hex::encode([0xbb; 32])),
            amount: 1_000,
            memo: None,
            chain_specific: ChainSpecific::Sui {
                reference_gas_price: 750,
                gas_budget: 3_000_000,
                coins,
            },
        }
    }

    #[test]
    fn test_uleb128() {
        let mut bcs = Bcs::default();
        bcs.uleb128(0).uleb128(127).uleb128(128).uleb128(300);
        assert_eq!(bcs.0, vec![0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);
    }

    #[test]
    fn test_gas_coin_is_smallest_sufficient_non_payment() {
        let coins = vec![
            coin(SUI_COIN_TYPE, 1, 2_000_000),
            coin(SUI_COIN_TYPE, 2, 9_000_000),
            coin(SUI_COIN_TYPE, 3, 4_000_000),
            coin(USDC, 4, 5_000),
        ];
        let selected = select_gas_coin(&coins, &[], 3_000_000, 750).unwrap();
        assert_eq!(selected.balance, 4_000_000);

        let excluded = [coins[2].object_id.as_str()];
        let selected = select_gas_coin(&coins, &excluded, 3_000_000, 750).unwrap();
        assert_eq!(selected.balance, 9_000_000);
    }

    #[test]
    fn test_no_eligible_gas_coin() {
        let coins = vec![coin(SUI_COIN_TYPE, 1, 2_000_000), coin(USDC, 4, 5_000)];
        let result = SuiCodec.build_unsigned(&intent(false, coins));
        assert!(matches!(result, Err(KeysignError::NoEligibleGasCoin(_))));
    }

    #[test]
    fn test_token_transfer_pays_gas_with_sui_coin() {
        let coins = vec![
            coin(SUI_COIN_TYPE, 1, 10_000_000),
            coin(USDC, 4, 600),
            coin(USDC, 5, 600),
        ];
        let unsigned = SuiCodec.build_unsigned(&intent(false, coins)).unwrap();
        assert_eq!(unsigned.gas_payment.len(), 1);
        assert_eq!(unsigned.gas_payment[0].object_id, [1u8; 32]);
        assert_eq!(unsigned.commands.len(), 3);
    }

    #[test]
    fn test_native_transfer_splits_gas_coin() {
        let coins = vec![
            coin(SUI_COIN_TYPE, 1, 10_000_000),
            coin(SUI_COIN_TYPE, 2, 5),
        ];
        let unsigned = SuiCodec.build_unsigned(&intent(true, coins)).unwrap();
        assert_eq!(unsigned.gas_payment.len(), 2);
        assert_eq!(
            unsigned.commands[0],
            Command::SplitCoins(Argument::GasCoin, vec![Argument::Input(0)])
        );
        // V1 / ProgrammableTransaction
        assert_eq!(&unsigned.to_bcs()[..2], &[0, 0]);
    }

    #[test]
    fn test_finalize_signature_and_digest() {
        let coins = vec![coin(SUI_COIN_TYPE, 1, 10_000_000)];
        let unsigned = SuiCodec.build_unsigned(&intent(true, coins)).unwrap();
        let hash = &SuiCodec.pre_sign_hashes(&unsigned).unwrap()[0];
        let ledger = SignatureLedger::new();
        ledger.put(hash, eddsa_sign(hash.as_bytes())).unwrap();

        let signed = SuiCodec
            .finalize(&unsigned, &eddsa_public(), &ledger)
            .unwrap();
        let serialized = BASE64.decode(signed.signature.unwrap()).unwrap();
        assert_eq!(serialized.len(), 97);
        assert_eq!(serialized[0], ED25519_FLAG);
        assert_eq!(&serialized[65..], eddsa_public().as_slice());
        assert_eq!(
            signed.tx_hash,
            bs58::encode(blake2b256(&[DIGEST_SALT, &signed.raw_bytes])).into_string()
        );
    }
}
