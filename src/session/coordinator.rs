//! Keysign session state machine.
//!
//! ```text
//! Idle -> Discovering -> AwaitingQuorum -> Started (initiator)       -> SigningInProgress -> Completed
//!                                       -> WaitingForStart (joiner) ->                      Failed
//! ```
//!
//! The initiator owns the committee: it registers, watches peers join,
//! and publishes the committee once quorum is reached. Joiners register
//! and wait for that start signal. Both then run one ceremony per
//! pre-sign hash and assemble the same signed transaction.

use std::sync::Arc;

use tokio_stream::StreamExt;

use super::types::{ParticipantSet, Session, SessionState};
use crate::ceremony::{self, CeremonyFactory, CeremonyRequest, CeremonyRunner};
use crate::codec::{self, PreSignHash, SignedTransaction, TransactionIntent, UnsignedTx};
use crate::config::{NetworkMode, Settings};
use crate::discovery::ParticipantDiscovery;
use crate::error::{KeysignError, KeysignResult};
use crate::ledger::SignatureLedger;
use crate::relay::{self, LocalMediator, MessageRelay};
use crate::vault::Vault;

const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the session and decides the committee.
    Initiator,
    /// Joins a session shared by the initiator.
    Joiner,
}

pub struct SessionCoordinator {
    role: Role,
    vault: Vault,
    settings: Settings,
    session: Session,
    relay: Arc<dyn MessageRelay>,
    factory: Arc<dyn CeremonyFactory>,
    state: SessionState,
    participants: ParticipantSet,
    discovery: Option<ParticipantDiscovery>,
    ledger: Arc<SignatureLedger>,
}

impl SessionCoordinator {
    /// Coordinator for a new session created by this device.
    pub fn initiate(
        vault: Vault,
        settings: Settings,
        relay: Arc<dyn MessageRelay>,
        factory: Arc<dyn CeremonyFactory>,
    ) -> KeysignResult<Self> {
        let mut session = Session::new(&vault.local_party_id, &relay.base_url(), relay.mode());
        session.service_name = relay
            .service_name()
            .unwrap_or_else(|| LocalMediator::service_name(settings.service_prefix()));
        Self::build(Role::Initiator, vault, settings, session, relay, factory)
    }

    /// Coordinator for a session shared by another device, reaching it
    /// through the backend the invite names.
    pub fn join_invite(
        vault: Vault,
        settings: Settings,
        invite: &Session,
        factory: Arc<dyn CeremonyFactory>,
    ) -> KeysignResult<Self> {
        let relay = relay::relay_for(
            invite.network_mode,
            Role::Joiner,
            &invite.service_name,
            &settings,
        )?;
        Self::join(vault, settings, invite, relay, factory)
    }

    /// Coordinator for a session shared by another device.
    pub fn join(
        vault: Vault,
        settings: Settings,
        invite: &Session,
        relay: Arc<dyn MessageRelay>,
        factory: Arc<dyn CeremonyFactory>,
    ) -> KeysignResult<Self> {
        let session = invite.joined_by(&vault.local_party_id);
        Self::build(Role::Joiner, vault, settings, session, relay, factory)
    }

    fn build(
        role: Role,
        vault: Vault,
        settings: Settings,
        session: Session,
        relay: Arc<dyn MessageRelay>,
        factory: Arc<dyn CeremonyFactory>,
    ) -> KeysignResult<Self> {
        let participants = ParticipantSet::new(&vault.local_party_id, &vault.signers)?;
        tracing::debug!(
            session_id = %session.id,
            party = %session.local_party_id,
            role = ?role,
            threshold = participants.threshold(),
            "Session created"
        );

        Ok(Self {
            role,
            vault,
            settings,
            session,
            relay,
            factory,
            state: SessionState::Idle,
            participants,
            discovery: None,
            ledger: Arc::new(SignatureLedger::new()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Session context; the initiator shares this with joiners.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.relay.mode()
    }

    pub fn participants(&self) -> &ParticipantSet {
        &self.participants
    }

    pub fn ledger(&self) -> Arc<SignatureLedger> {
        Arc::clone(&self.ledger)
    }

    fn transition(&mut self, to: SessionState) {
        tracing::info!(
            session_id = %self.session.id,
            from = %self.state,
            to = %to,
            "Session state changed"
        );
        self.state = to;
    }

    fn expect_state(&self, expected: &SessionState) -> KeysignResult<()> {
        if self.state == *expected {
            return Ok(());
        }
        Err(self.invalid_state(&expected.to_string()))
    }

    fn expect_role(&self, role: Role) -> KeysignResult<()> {
        if self.role == role {
            return Ok(());
        }
        Err(self.invalid_state(&format!("{role:?} role")))
    }

    fn invalid_state(&self, expected: &str) -> KeysignError {
        if self.state == SessionState::Failed(CANCELLED.to_string()) {
            return KeysignError::Cancelled;
        }
        KeysignError::InvalidSessionState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }

    fn stop_discovery(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.stop();
        }
    }

    /// Move to `Failed`, releasing whatever the backend holds.
    async fn fail(&mut self, reason: String) {
        self.stop_discovery();
        if let Err(e) = self.relay.release().await {
            tracing::warn!(session_id = %self.session.id, error = %e, "Failed to release relay");
        }
        tracing::error!(session_id = %self.session.id, reason = %reason, "Session failed");
        self.transition(SessionState::Failed(reason));
    }

    /// Run `result` through [`Self::fail`] when it is an error.
    async fn or_fail<T>(&mut self, result: KeysignResult<T>) -> KeysignResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.fail(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn register(&mut self) -> KeysignResult<()> {
        self.relay.prepare().await?;
        self.session.base_url = self.relay.base_url();
        self.session.network_mode = self.relay.mode();
        if self.role == Role::Initiator {
            if let Some(service_name) = self.relay.service_name() {
                self.session.service_name = service_name;
            }
        }
        self.relay
            .start_session(&self.session.id, &[self.session.local_party_id.clone()])
            .await
    }

    /// Register with the backend. The initiator then watches for peers;
    /// a joiner waits for the start signal.
    pub async fn begin_discovery(&mut self) -> KeysignResult<()> {
        self.expect_state(&SessionState::Idle)?;
        self.transition(SessionState::Discovering);

        let registered = self.register().await;
        self.or_fail(registered).await?;
        self.transition(SessionState::AwaitingQuorum);

        match self.role {
            Role::Initiator => {
                self.discovery = Some(ParticipantDiscovery::start(
                    Arc::clone(&self.relay),
                    &self.session.id,
                    &self.session.local_party_id,
                    self.settings.poll_interval(),
                ));
            }
            Role::Joiner => self.transition(SessionState::WaitingForStart),
        }
        Ok(())
    }

    /// Fold the latest discovery snapshot into the participant set.
    pub fn refresh_participants(&mut self) -> usize {
        match &self.discovery {
            Some(discovery) => self.participants.observe(&discovery.participants()),
            None => 0,
        }
    }

    /// Wait until the selected parties reach the quorum threshold.
    ///
    /// Never times out; drop the future to give up, then [`Self::abort`].
    pub async fn wait_for_quorum(&mut self) -> KeysignResult<()> {
        self.expect_role(Role::Initiator)?;
        self.expect_state(&SessionState::AwaitingQuorum)?;

        let mut updates = match &self.discovery {
            Some(discovery) => discovery.subscribe(),
            None => return Err(self.invalid_state("running discovery")),
        };
        while !self.participants.quorum_reached() {
            let Some(ids) = updates.next().await else {
                break;
            };
            if self.participants.observe(&ids) > 0 {
                tracing::debug!(
                    session_id = %self.session.id,
                    selected = self.participants.selected().len(),
                    threshold = self.participants.threshold(),
                    "Participants updated"
                );
            }
        }
        Ok(())
    }

    pub fn select(&mut self, party: &str) -> KeysignResult<()> {
        self.expect_state(&SessionState::AwaitingQuorum)?;
        self.refresh_participants();
        self.participants.select(party)
    }

    pub fn deselect(&mut self, party: &str) -> KeysignResult<()> {
        self.expect_state(&SessionState::AwaitingQuorum)?;
        self.participants.deselect(party)
    }

    /// Publish the selected committee and begin signing.
    ///
    /// Fails with [`KeysignError::QuorumNotReached`] and leaves the state
    /// untouched when too few parties are selected.
    pub async fn start(&mut self) -> KeysignResult<()> {
        self.expect_role(Role::Initiator)?;
        self.expect_state(&SessionState::AwaitingQuorum)?;

        self.refresh_participants();
        if !self.participants.quorum_reached() {
            return Err(KeysignError::QuorumNotReached {
                needed: self.participants.threshold(),
                have: self.participants.selected().len(),
            });
        }

        let committee = self.participants.selected().to_vec();
        let published = self
            .relay
            .start_with_committee(&self.session.id, &committee)
            .await;
        self.or_fail(published).await?;

        self.stop_discovery();
        self.session.committee = committee;
        self.transition(SessionState::Started);
        self.transition(SessionState::SigningInProgress);
        Ok(())
    }

    /// Poll for the initiator's committee. Fails with
    /// [`KeysignError::ParticipantDropped`] when this device was left out,
    /// and with [`KeysignError::SessionNotFound`] when the initiator ended
    /// the session.
    pub async fn wait_for_start(&mut self) -> KeysignResult<()> {
        self.expect_role(Role::Joiner)?;
        self.expect_state(&SessionState::WaitingForStart)?;

        loop {
            let polled = self.relay.check_committee(&self.session.id).await;
            match self.or_fail(polled).await? {
                Some(committee) if committee.contains(&self.session.local_party_id) => {
                    self.session.committee = committee;
                    self.transition(SessionState::SigningInProgress);
                    return Ok(());
                }
                Some(committee) => {
                    let err = KeysignError::ParticipantDropped(format!(
                        "{} is not in committee {committee:?}",
                        self.session.local_party_id
                    ));
                    self.fail(err.to_string()).await;
                    return Err(err);
                }
                None => {
                    let polled = self.relay.get_participants(&self.session.id).await;
                    let registered = self.or_fail(polled).await?;
                    if !registered.contains(&self.session.local_party_id) {
                        let err = KeysignError::SessionNotFound(self.session.id.clone());
                        self.fail(err.to_string()).await;
                        return Err(err);
                    }
                    tokio::time::sleep(self.settings.poll_interval()).await;
                }
            }
        }
    }

    /// Sign `intent` with the committee and return the finished transaction.
    pub async fn sign(&mut self, intent: &TransactionIntent) -> KeysignResult<SignedTransaction> {
        self.expect_state(&SessionState::SigningInProgress)?;

        let signed = self.run_signing(intent).await;
        let signed = self.or_fail(signed).await?;
        self.transition(SessionState::Completed);
        Ok(signed)
    }

    async fn run_signing(&self, intent: &TransactionIntent) -> KeysignResult<SignedTransaction> {
        let unsigned = codec::build_unsigned(intent)?;
        let hashes = codec::pre_sign_hashes(&unsigned)?;
        tracing::info!(
            session_id = %self.session.id,
            chain = %intent.coin.chain,
            hashes = hashes.len(),
            "Signing transaction"
        );

        let runner = CeremonyRunner::new(
            Arc::clone(&self.relay),
            Arc::clone(&self.factory),
            self.session.clone(),
            self.role == Role::Initiator,
            self.settings.ceremony_timeout(),
            self.settings.poll_interval(),
        );
        for hash in &hashes {
            if self.ledger.contains(hash) {
                continue;
            }
            let request = self.ceremony_request(intent, &unsigned, hash)?;
            let signature = runner.run(&request).await?;
            self.ledger.put(hash, signature)?;
        }

        let public_key = self.vault.chain_public_key(intent.coin.chain)?;
        let signed = codec::finalize(&unsigned, &public_key, &self.ledger)?;

        self.announce_completion(&hashes).await;
        Ok(signed)
    }

    /// Tell peers this device finished and share its signatures so a
    /// lagging peer can finish without another ceremony. Best-effort: the
    /// transaction is already signed.
    async fn announce_completion(&self, hashes: &[PreSignHash]) {
        if let Err(e) = self
            .relay
            .mark_complete(&self.session.id, &self.session.local_party_id)
            .await
        {
            tracing::warn!(session_id = %self.session.id, error = %e, "Failed to mark keysign complete");
        }

        for hash in hashes {
            let published = match self.ledger.get(hash) {
                Ok(signature) => {
                    self.relay
                        .publish_signature(
                            &self.session.id,
                            &ceremony::message_id(hash),
                            &signature,
                        )
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = published {
                tracing::warn!(
                    session_id = %self.session.id,
                    hash = %hash,
                    error = %e,
                    "Failed to publish signature"
                );
            }
        }
    }

    fn ceremony_request(
        &self,
        intent: &TransactionIntent,
        unsigned: &UnsignedTx,
        hash: &PreSignHash,
    ) -> KeysignResult<CeremonyRequest> {
        let scheme = unsigned.signature_scheme();
        Ok(CeremonyRequest {
            session_id: self.session.id.clone(),
            local_party: self.session.local_party_id.clone(),
            committee: self.session.committee.clone(),
            scheme,
            public_key: self.vault.public_key_for(scheme).to_string(),
            chain_code: self.vault.hex_chain_code.clone(),
            derivation_path: intent.coin.chain.derivation_path().map(str::to_string),
            signing_key: self.vault.chain_public_key(intent.coin.chain)?,
            key_share: self.vault.key_share(scheme)?.to_string(),
            message: hash.clone(),
        })
    }

    /// Switch between the public relay and a local mediator.
    pub async fn switch_network_mode(&mut self, mode: NetworkMode) -> KeysignResult<()> {
        if mode == self.relay.mode() {
            return Ok(());
        }
        let relay = relay::relay_for(mode, self.role, &self.session.service_name, &self.settings)?;
        self.switch_relay(relay).await
    }

    /// Swap the backend. Only legal before the committee is fixed; every
    /// discovered and selected peer is forgotten.
    pub async fn switch_relay(&mut self, relay: Arc<dyn MessageRelay>) -> KeysignResult<()> {
        if !self.state.is_before_start() {
            return Err(self.invalid_state("idle, discovering or awaiting_quorum"));
        }

        self.stop_discovery();
        if self.state != SessionState::Idle {
            if let Err(e) = self.relay.end_session(&self.session.id).await {
                tracing::warn!(session_id = %self.session.id, error = %e, "Failed to end session on previous relay");
            }
        }
        if let Err(e) = self.relay.release().await {
            tracing::warn!(session_id = %self.session.id, error = %e, "Failed to release previous relay");
        }

        tracing::info!(
            session_id = %self.session.id,
            from = %self.relay.mode(),
            to = %relay.mode(),
            "Switching network mode"
        );
        self.relay = relay;
        self.participants.reset();
        self.session.base_url = self.relay.base_url();
        self.session.network_mode = self.relay.mode();

        if self.state == SessionState::Idle {
            return Ok(());
        }

        let registered = self.register().await;
        self.or_fail(registered).await?;
        match &self.discovery {
            Some(discovery) => discovery.restart(Arc::clone(&self.relay)),
            None => {
                self.discovery = Some(ParticipantDiscovery::start(
                    Arc::clone(&self.relay),
                    &self.session.id,
                    &self.session.local_party_id,
                    self.settings.poll_interval(),
                ));
            }
        }
        Ok(())
    }

    /// Cancel the session and release the backend. Legal from any
    /// non-terminal state.
    pub async fn abort(&mut self) -> KeysignResult<()> {
        if self.state.is_terminal() {
            return Err(self.invalid_state("non-terminal state"));
        }

        self.stop_discovery();
        if self.state != SessionState::Idle {
            if let Err(e) = self.relay.end_session(&self.session.id).await {
                tracing::warn!(session_id = %self.session.id, error = %e, "Failed to end session");
            }
        }
        if let Err(e) = self.relay.release().await {
            tracing::warn!(session_id = %self.session.id, error = %e, "Failed to release relay");
        }
        self.transition(SessionState::Failed(CANCELLED.to_string()));
        Ok(())
    }

    /// Release the backend after a completed session. Stops a local
    /// mediator, so call it once every peer has finished.
    pub async fn close(&mut self) -> KeysignResult<()> {
        self.expect_state(&SessionState::Completed)?;
        self.relay.release().await
    }
}
