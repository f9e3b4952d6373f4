//! Message pump around the opaque threshold-signing engine.
//!
//! The engine is a black box that consumes and produces round messages and
//! eventually yields a signature. [`CeremonyRunner`] moves those messages
//! through the relay, sealed under the session key, one ceremony per
//! pre-sign hash.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::PreSignHash;
use crate::crypto;
use crate::error::{KeysignError, KeysignResult};
use crate::relay::{MessageRelay, RelayMessage};
use crate::session::Session;
use crate::signature::{self, SignaturePackage, SignatureScheme};

/// Attempts per hash before the ceremony is declared failed.
pub const CEREMONY_ATTEMPTS: u32 = 3;

/// Opaque protocol message between parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMessage {
    pub from: String,
    /// Empty means every other committee member.
    pub to: Vec<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutput {
    Outgoing(Vec<RoundMessage>),
    Finished(SignaturePackage),
}

/// Threshold-signing engine for a single message.
///
/// Calls are CPU-bound and run on the blocking pool.
pub trait KeyCeremonyEngine: Send {
    fn advance_round(
        &mut self,
        session_id: &str,
        incoming: Option<RoundMessage>,
    ) -> KeysignResult<RoundOutput>;
}

/// Everything an engine needs to sign one hash.
#[derive(Debug, Clone)]
pub struct CeremonyRequest {
    pub session_id: String,
    pub local_party: String,
    pub committee: Vec<String>,
    pub scheme: SignatureScheme,
    /// Vault root public key for `scheme`, hex.
    pub public_key: String,
    pub chain_code: String,
    /// BIP32 path for ECDSA chains.
    pub derivation_path: Option<String>,
    /// Hex key the finished signature verifies under: the derived key for
    /// ECDSA chains, the root key otherwise.
    pub signing_key: String,
    pub key_share: String,
    pub message: PreSignHash,
}

/// Creates a fresh engine per message.
pub trait CeremonyFactory: Send + Sync {
    fn create(&self, request: &CeremonyRequest) -> KeysignResult<Box<dyn KeyCeremonyEngine>>;
}

/// Topic for one hash: hex SHA-256 of the hash hex.
pub fn message_id(hash: &PreSignHash) -> String {
    crypto::sha256_hex(hash.to_hex().as_bytes())
}

pub struct CeremonyRunner {
    relay: Arc<dyn MessageRelay>,
    factory: Arc<dyn CeremonyFactory>,
    session: Session,
    is_initiator: bool,
    timeout: Duration,
    poll_interval: Duration,
}

impl CeremonyRunner {
    pub fn new(
        relay: Arc<dyn MessageRelay>,
        factory: Arc<dyn CeremonyFactory>,
        session: Session,
        is_initiator: bool,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            relay,
            factory,
            session,
            is_initiator,
            timeout,
            poll_interval,
        }
    }

    /// Run the ceremony for `request.message` and return its signature.
    ///
    /// After a failed or timed-out attempt a signature already published by
    /// a peer for the same hash is accepted once it verifies.
    #[tracing::instrument(skip(self, request), fields(session_id = %self.session.id, hash = %request.message))]
    pub async fn run(&self, request: &CeremonyRequest) -> KeysignResult<SignaturePackage> {
        let message_id = message_id(&request.message);
        self.exchange_setup(&request.message, &message_id).await?;

        let mut last_error = String::new();
        for attempt in 1..=CEREMONY_ATTEMPTS {
            match tokio::time::timeout(self.timeout, self.pump(request, &message_id)).await {
                Ok(Ok(signature)) => {
                    tracing::info!(attempt, "Ceremony finished");
                    return Ok(signature);
                }
                Ok(Err(e)) if Self::retryable(&e) => {
                    tracing::warn!(attempt, error = %e, "Ceremony attempt failed");
                    if let Some(signature) = self.published_signature(request, &message_id).await {
                        return Ok(signature);
                    }
                    last_error = e.to_string();
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::error!(timeout = ?self.timeout, "Ceremony timed out");
                    if let Some(signature) = self.published_signature(request, &message_id).await {
                        return Ok(signature);
                    }
                    return Err(KeysignError::CeremonyFailed(format!(
                        "timed out after {:?}",
                        self.timeout
                    )));
                }
            }
        }

        Err(KeysignError::CeremonyFailed(format!(
            "{CEREMONY_ATTEMPTS} attempts failed, last error: {last_error}"
        )))
    }

    /// Signature a peer published for this hash, if it verifies.
    async fn published_signature(
        &self,
        request: &CeremonyRequest,
        message_id: &str,
    ) -> Option<SignaturePackage> {
        let published = match self
            .relay
            .fetch_signature(&self.session.id, message_id)
            .await
        {
            Ok(published) => published?,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to check for a published signature");
                return None;
            }
        };

        let verified = hex::decode(&request.signing_key)
            .map_err(|e| KeysignError::InvalidPublicKey(format!("signing key: {e}")))
            .and_then(|key| signature::verify(&request.message, &published, &key));
        match verified {
            Ok(()) => {
                tracing::info!("Using signature published by a peer");
                Some(published)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring published signature");
                None
            }
        }
    }

    fn retryable(error: &KeysignError) -> bool {
        matches!(error, KeysignError::CeremonyFailed(_)) || error.is_retryable()
    }

    /// Initiator publishes the hash; joiners refuse to sign anything else.
    async fn exchange_setup(&self, hash: &PreSignHash, message_id: &str) -> KeysignResult<()> {
        let expected = hash.to_hex();

        if self.is_initiator {
            let sealed = crypto::seal_to_base64(&self.session.encryption_key, expected.as_bytes())?;
            return self
                .relay
                .upload_setup_message(&self.session.id, Some(message_id), &sealed)
                .await;
        }

        let sealed = tokio::time::timeout(self.timeout, async {
            loop {
                if let Some(sealed) = self
                    .relay
                    .get_setup_message(&self.session.id, Some(message_id))
                    .await?
                {
                    return Ok::<_, KeysignError>(sealed);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
        .await
        .map_err(|_| KeysignError::CeremonyFailed("setup message never arrived".to_string()))??;

        let published = crypto::open_from_base64(&self.session.encryption_key, &sealed)?;
        if published != expected.as_bytes() {
            tracing::error!(expected = %expected, "Setup message does not match local hash");
            return Err(KeysignError::CeremonyFailed(
                "setup message does not match the locally derived hash".to_string(),
            ));
        }
        Ok(())
    }

    async fn pump(
        &self,
        request: &CeremonyRequest,
        message_id: &str,
    ) -> KeysignResult<SignaturePackage> {
        let mut engine = self.factory.create(request)?;
        let mut applied = HashSet::new();
        let mut sequence_no = 0u64;
        let mut incoming = None;

        loop {
            let (returned, output) = advance(engine, &self.session.id, incoming).await?;
            engine = returned;

            match output? {
                RoundOutput::Finished(signature) => return Ok(signature),
                RoundOutput::Outgoing(messages) => {
                    for message in messages {
                        self.send_round(message, message_id, &mut sequence_no)
                            .await?;
                    }
                }
            }

            incoming = Some(self.next_inbound(message_id, &mut applied).await?);
        }
    }

    async fn send_round(
        &self,
        message: RoundMessage,
        message_id: &str,
        sequence_no: &mut u64,
    ) -> KeysignResult<()> {
        let to = if message.to.is_empty() {
            self.session
                .committee
                .iter()
                .filter(|p| **p != self.session.local_party_id)
                .cloned()
                .collect()
        } else {
            message.to
        };

        let body = crypto::seal_to_base64(&self.session.encryption_key, &message.payload)?;
        let relay_message = RelayMessage {
            session_id: self.session.id.clone(),
            from: self.session.local_party_id.clone(),
            to,
            hash: crypto::sha256_hex(body.as_bytes()),
            body,
            sequence_no: *sequence_no,
        };
        *sequence_no += 1;

        tracing::trace!(hash = %relay_message.hash, seq = relay_message.sequence_no, "Sending round message");
        self.relay
            .send(&self.session.id, Some(message_id), &relay_message)
            .await
    }

    /// Lowest-sequence message not yet applied, acknowledged on receipt.
    async fn next_inbound(
        &self,
        message_id: &str,
        applied: &mut HashSet<String>,
    ) -> KeysignResult<RoundMessage> {
        let party = &self.session.local_party_id;
        loop {
            let mut inbox = self
                .relay
                .receive(&self.session.id, party, Some(message_id))
                .await?;
            inbox.sort_by_key(|m| m.sequence_no);

            for message in inbox {
                if applied.contains(&message.hash) {
                    continue;
                }
                self.relay
                    .acknowledge(&self.session.id, party, &message.hash, Some(message_id))
                    .await?;
                applied.insert(message.hash.clone());

                let payload =
                    crypto::open_from_base64(&self.session.encryption_key, &message.body)?;
                return Ok(RoundMessage {
                    from: message.from,
                    to: message.to,
                    payload,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Advance the engine on the blocking pool, handing it back afterwards.
async fn advance(
    mut engine: Box<dyn KeyCeremonyEngine>,
    session_id: &str,
    incoming: Option<RoundMessage>,
) -> KeysignResult<(Box<dyn KeyCeremonyEngine>, KeysignResult<RoundOutput>)> {
    let session_id = session_id.to_string();
    tokio::task::spawn_blocking(move || {
        let output = engine.advance_round(&session_id, incoming);
        (engine, output)
    })
    .await
    .map_err(|e| KeysignError::CeremonyFailed(format!("Engine task failed: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::NetworkMode;
    use crate::relay::memory::MemoryRelay;
    use crate::signature::test_keys::{ecdsa_public, ecdsa_sign, eddsa_sign};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Each party announces itself, waits for every other committee member,
    /// then signs with the shared test key.
    pub struct RollCallEngine {
        request: CeremonyRequest,
        heard: HashSet<String>,
        announced: bool,
    }

    impl KeyCeremonyEngine for RollCallEngine {
        fn advance_round(
            &mut self,
            _session_id: &str,
            incoming: Option<RoundMessage>,
        ) -> KeysignResult<RoundOutput> {
            if let Some(message) = incoming {
                self.heard.insert(message.from);
            }
            let others = self.request.committee.len() - 1;
            if !self.announced {
                self.announced = true;
                return Ok(RoundOutput::Outgoing(vec![RoundMessage {
                    from: self.request.local_party.clone(),
                    to: Vec::new(),
                    payload: b"present".to_vec(),
                }]));
            }
            if self.heard.len() < others {
                return Ok(RoundOutput::Outgoing(Vec::new()));
            }
            let bytes = self.request.message.as_bytes();
            Ok(RoundOutput::Finished(match self.request.scheme {
                SignatureScheme::Ecdsa => ecdsa_sign(bytes),
                SignatureScheme::Eddsa => eddsa_sign(bytes),
            }))
        }
    }

    /// Fails the first `failures` engines it creates.
    #[derive(Default)]
    pub struct RollCallFactory {
        pub failures: u32,
        pub created: AtomicU32,
    }

    struct FailingEngine;

    impl KeyCeremonyEngine for FailingEngine {
        fn advance_round(
            &mut self,
            _: &str,
            _: Option<RoundMessage>,
        ) -> KeysignResult<RoundOutput> {
            Err(KeysignError::CeremonyFailed("engine crashed".to_string()))
        }
    }

    impl CeremonyFactory for RollCallFactory {
        fn create(&self, request: &CeremonyRequest) -> KeysignResult<Box<dyn KeyCeremonyEngine>> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Ok(Box::new(FailingEngine));
            }
            Ok(Box::new(RollCallEngine {
                request: request.clone(),
                heard: HashSet::new(),
                announced: false,
            }))
        }
    }

    fn request(session: &Session, hash: &PreSignHash) -> CeremonyRequest {
        CeremonyRequest {
            session_id: session.id.clone(),
            local_party: session.local_party_id.clone(),
            committee: session.committee.clone(),
            scheme: SignatureScheme::Ecdsa,
            public_key: String::new(),
            chain_code: String::new(),
            derivation_path: None,
            signing_key: hex::encode(ecdsa_public()),
            key_share: String::new(),
            message: hash.clone(),
        }
    }

    fn runner(
        relay: Arc<MemoryRelay>,
        factory: Arc<RollCallFactory>,
        session: Session,
        is_initiator: bool,
    ) -> CeremonyRunner {
        CeremonyRunner::new(
            relay,
            factory,
            session,
            is_initiator,
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
    }

    fn sessions() -> (Session, Session) {
        let mut a = Session::new("a", "memory://", NetworkMode::Relay);
        a.committee = vec!["a".to_string(), "b".to_string()];
        let mut b = a.joined_by("b");
        b.committee = a.committee.clone();
        (a, b)
    }

    #[test]
    fn test_message_id_is_sha256_of_hash_hex() {
        let hash = PreSignHash::new(vec![0xab; 32]);
        assert_eq!(
            message_id(&hash),
            crypto::sha256_hex(hash.to_hex().as_bytes())
        );
        assert_eq!(message_id(&hash).len(), 64);
    }

    #[tokio::test]
    async fn test_two_parties_sign() {
        let relay_a = MemoryRelay::new(NetworkMode::Relay);
        let relay_b = MemoryRelay::sharing(relay_a.store.clone(), NetworkMode::Relay);
        let factory = Arc::new(RollCallFactory::default());
        let (session_a, session_b) = sessions();
        let hash = PreSignHash::new(vec![7u8; 32]);

        let a = runner(relay_a, factory.clone(), session_a.clone(), true);
        let b = runner(relay_b, factory.clone(), session_b.clone(), false);
        let (request_a, request_b) = (request(&session_a, &hash), request(&session_b, &hash));
        let (sig_a, sig_b) = tokio::join!(a.run(&request_a), b.run(&request_b));

        assert_eq!(sig_a.unwrap(), ecdsa_sign(hash.as_bytes()));
        assert_eq!(sig_b.unwrap(), ecdsa_sign(hash.as_bytes()));
    }

    #[tokio::test]
    async fn test_joiner_rejects_different_setup_hash() {
        let relay_a = MemoryRelay::new(NetworkMode::Relay);
        let relay_b = MemoryRelay::sharing(relay_a.store.clone(), NetworkMode::Relay);
        let factory = Arc::new(RollCallFactory::default());
        let (session_a, session_b) = sessions();
        let hash = PreSignHash::new(vec![7u8; 32]);

        // A setup payload published under the right topic but for another hash.
        let sealed = crypto::seal_to_base64(&session_a.encryption_key, b"0badc0de").unwrap();
        relay_a
            .upload_setup_message(&session_a.id, Some(&message_id(&hash)), &sealed)
            .await
            .unwrap();

        let b = runner(relay_b, factory, session_b.clone(), false);
        let err = b.run(&request(&session_b, &hash)).await.unwrap_err();
        assert!(matches!(err, KeysignError::CeremonyFailed(_)));
    }

    #[tokio::test]
    async fn test_engine_failures_are_retried() {
        let relay_a = MemoryRelay::new(NetworkMode::Relay);
        let relay_b = MemoryRelay::sharing(relay_a.store.clone(), NetworkMode::Relay);
        let failing = Arc::new(RollCallFactory {
            failures: 2,
            ..Default::default()
        });
        let healthy = Arc::new(RollCallFactory::default());
        let (session_a, session_b) = sessions();
        let hash = PreSignHash::new(vec![9u8; 32]);

        let a = runner(relay_a, failing.clone(), session_a.clone(), true);
        let b = runner(relay_b, healthy, session_b.clone(), false);
        let (request_a, request_b) = (request(&session_a, &hash), request(&session_b, &hash));
        let (sig_a, sig_b) = tokio::join!(a.run(&request_a), b.run(&request_b));

        assert!(sig_a.is_ok());
        assert!(sig_b.is_ok());
        assert_eq!(failing.created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_engine_failure_is_fatal() {
        let relay = MemoryRelay::new(NetworkMode::Relay);
        let factory = Arc::new(RollCallFactory {
            failures: u32::MAX,
            ..Default::default()
        });
        let (session_a, _) = sessions();
        let hash = PreSignHash::new(vec![1u8; 32]);

        let a = runner(relay, factory.clone(), session_a.clone(), true);
        let err = a.run(&request(&session_a, &hash)).await.unwrap_err();
        assert!(matches!(err, KeysignError::CeremonyFailed(_)));
        assert_eq!(factory.created.load(Ordering::SeqCst), CEREMONY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_missing_peer_times_out() {
        let relay = MemoryRelay::new(NetworkMode::Relay);
        let factory = Arc::new(RollCallFactory::default());
        let (session_a, _) = sessions();
        let hash = PreSignHash::new(vec![2u8; 32]);

        let a = CeremonyRunner::new(
            relay,
            factory,
            session_a.clone(),
            true,
            Duration::from_millis(100),
            Duration::from_millis(5),
        );
        let err = a.run(&request(&session_a, &hash)).await.unwrap_err();
        assert!(matches!(err, KeysignError::CeremonyFailed(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_published_peer_signature_ends_failing_ceremony() {
        let relay = MemoryRelay::new(NetworkMode::Relay);
        let factory = Arc::new(RollCallFactory {
            failures: u32::MAX,
            ..Default::default()
        });
        let (session_a, _) = sessions();
        let hash = PreSignHash::new(vec![3u8; 32]);

        let peer_signature = ecdsa_sign(hash.as_bytes());
        relay
            .publish_signature(&session_a.id, &message_id(&hash), &peer_signature)
            .await
            .unwrap();

        let a = runner(relay, factory.clone(), session_a.clone(), true);
        let signature = a.run(&request(&session_a, &hash)).await.unwrap();
        assert_eq!(signature, peer_signature);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_published_signature_for_other_hash_is_ignored() {
        let relay = MemoryRelay::new(NetworkMode::Relay);
        let factory = Arc::new(RollCallFactory {
            failures: u32::MAX,
            ..Default::default()
        });
        let (session_a, _) = sessions();
        let hash = PreSignHash::new(vec![4u8; 32]);

        relay
            .publish_signature(&session_a.id, &message_id(&hash), &ecdsa_sign(&[5u8; 32]))
            .await
            .unwrap();

        let a = runner(relay, factory.clone(), session_a.clone(), true);
        let err = a.run(&request(&session_a, &hash)).await.unwrap_err();
        assert!(matches!(err, KeysignError::CeremonyFailed(_)));
        assert_eq!(factory.created.load(Ordering::SeqCst), CEREMONY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_timed_out_ceremony_takes_published_signature() {
        let relay = MemoryRelay::new(NetworkMode::Relay);
        let factory = Arc::new(RollCallFactory::default());
        let (session_a, _) = sessions();
        let hash = PreSignHash::new(vec![6u8; 32]);

        let peer_signature = ecdsa_sign(hash.as_bytes());
        relay
            .publish_signature(&session_a.id, &message_id(&hash), &peer_signature)
            .await
            .unwrap();

        // Device b never shows up, so the pump can only time out.
        let a = CeremonyRunner::new(
            relay,
            factory,
            session_a.clone(),
            true,
            Duration::from_millis(100),
            Duration::from_millis(5),
        );
        assert_eq!(
            a.run(&request(&session_a, &hash)).await.unwrap(),
            peer_signature
        );
    }
}
