// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., KeysignError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::missing_const_for_fn)] // Often debatable, runtime doesn't benefit

//! Keysign Core
//!
//! Coordinates threshold signing of wallet transactions across the devices
//! that share a vault, and turns the resulting signatures into
//! broadcast-ready transactions.
//!
//! ## Architecture
//!
//! - **Relay** ([`relay`]): one transport contract with two backends, the
//!   public relay and a mediator started on the local network.
//! - **Session** ([`session`]): discovery, quorum, and the start signal,
//!   driven as an explicit state machine.
//! - **Ceremony** ([`ceremony`]): pumps opaque rounds between the external
//!   threshold engine and the relay, one ceremony per pre-sign hash.
//! - **Codecs** ([`codec`]): per chain family, build the unsigned
//!   transaction, derive what must be signed, and assemble the result.
//!
//! ## Security Model
//!
//! - **t-of-n threshold**: `ceil(2n/3)` devices must take part
//! - **Sealed transport**: every relayed payload is AES-GCM sealed under a
//!   per-session key the relay never sees
//! - **Verify before assembly**: each signature is checked against the
//!   vault key; nothing partially signed is returned
//!
//! ## Chains
//!
//! UTXO (Bitcoin), EVM, Cosmos SDK, Sui, Ton, Cardano, Solana, Polkadot.

pub mod ceremony;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod derivation;
pub mod discovery;
pub mod error;
pub mod ledger;
pub mod relay;
pub mod session;
pub mod signature;
pub mod storage;
pub mod telemetry;
pub mod vault;

// Re-export commonly used types
pub use crate::codec::{PreSignHash, SignedTransaction, TransactionIntent};
pub use ceremony::{CeremonyFactory, KeyCeremonyEngine, RoundMessage, RoundOutput};
pub use config::{NetworkMode, Settings};
pub use error::{KeysignError, KeysignResult};
pub use ledger::SignatureLedger;
pub use relay::{MessageRelay, relay_for};
pub use session::{Session, SessionCoordinator, SessionState};
pub use signature::{SignaturePackage, SignatureScheme};
pub use vault::{Vault, VaultStore};
