//! Session context, committee bookkeeping, and coordinator states.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NetworkMode;
use crate::crypto;
use crate::error::{KeysignError, KeysignResult};

/// Coordinator state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Discovering,
    AwaitingQuorum,
    /// Initiator published the committee.
    Started,
    /// Joiner registered and waits for the initiator's start signal.
    WaitingForStart,
    SigningInProgress,
    Completed,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Whether the committee has not been fixed yet.
    pub fn is_before_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Discovering | Self::AwaitingQuorum)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Discovering => write!(f, "discovering"),
            Self::AwaitingQuorum => write!(f, "awaiting_quorum"),
            Self::Started => write!(f, "started"),
            Self::WaitingForStart => write!(f, "waiting_for_start"),
            Self::SigningInProgress => write!(f, "signing_in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

/// Per-ceremony context shared with joiners out of band.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Relay or mediator base URL.
    pub base_url: String,
    pub local_party_id: String,
    /// Fixed once the initiator starts.
    #[serde(default)]
    pub committee: Vec<String>,
    /// 32-byte hex AES key sealing every relayed payload.
    pub encryption_key: String,
    pub network_mode: NetworkMode,
    /// Name the initiator's local mediator is announced under. Joiners in
    /// local mode resolve it to the initiator's LAN address.
    #[serde(default)]
    pub service_name: String,
}

impl Session {
    pub fn new(local_party_id: &str, base_url: &str, network_mode: NetworkMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            base_url: base_url.to_string(),
            local_party_id: local_party_id.to_string(),
            committee: Vec::new(),
            encryption_key: crypto::generate_session_key(),
            network_mode,
            service_name: String::new(),
        }
    }

    /// The same session as seen by another device.
    pub fn joined_by(&self, local_party_id: &str) -> Self {
        Self {
            local_party_id: local_party_id.to_string(),
            committee: Vec::new(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("local_party_id", &self.local_party_id)
            .field("committee", &self.committee)
            .field("encryption_key", &"<redacted>")
            .field("network_mode", &self.network_mode)
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// Minimum committee size for `n` vault signers: `ceil(2n/3)`.
pub fn quorum_threshold(signers: usize) -> usize {
    (2 * signers).div_ceil(3)
}

/// Discovered and selected parties for one session.
///
/// `selected` always contains the local party and is a subset of
/// `discovered` plus the local party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSet {
    local: String,
    signers: Vec<String>,
    discovered: Vec<String>,
    selected: Vec<String>,
    threshold: usize,
}

impl ParticipantSet {
    pub fn new(local: &str, signers: &[String]) -> KeysignResult<Self> {
        let threshold = quorum_threshold(signers.len());
        if threshold == 0 || threshold > signers.len() {
            return Err(KeysignError::InvalidThreshold {
                threshold,
                total: signers.len(),
            });
        }
        if !signers.iter().any(|s| s == local) {
            return Err(KeysignError::InvalidParticipant(format!(
                "{local} is not a signer of this vault"
            )));
        }

        Ok(Self {
            local: local.to_string(),
            signers: signers.to_vec(),
            discovered: Vec::new(),
            selected: vec![local.to_string()],
            threshold,
        })
    }

    /// Record newly discovered peers. Vault signers are selected as they
    /// appear. Returns how many ids were new.
    pub fn observe(&mut self, ids: &[String]) -> usize {
        let mut added = 0;
        for id in ids {
            if *id == self.local || self.discovered.contains(id) {
                continue;
            }
            self.discovered.push(id.clone());
            added += 1;
            if self.signers.contains(id) && !self.selected.contains(id) {
                self.selected.push(id.clone());
            }
        }
        added
    }

    pub fn select(&mut self, id: &str) -> KeysignResult<()> {
        if id != self.local && !self.discovered.iter().any(|d| d == id) {
            return Err(KeysignError::InvalidParticipant(format!(
                "{id} has not joined the session"
            )));
        }
        if !self.selected.iter().any(|s| s == id) {
            self.selected.push(id.to_string());
        }
        Ok(())
    }

    pub fn deselect(&mut self, id: &str) -> KeysignResult<()> {
        if id == self.local {
            return Err(KeysignError::InvalidParticipant(
                "The local party cannot be deselected".to_string(),
            ));
        }
        self.selected.retain(|s| s != id);
        Ok(())
    }

    /// Forget every peer; only the local party stays selected.
    pub fn reset(&mut self) {
        self.discovered.clear();
        self.selected = vec![self.local.clone()];
    }

    pub fn quorum_reached(&self) -> bool {
        self.selected.len() >= self.threshold
    }

    pub fn discovered(&self) -> &[String] {
        &self.discovered
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}
