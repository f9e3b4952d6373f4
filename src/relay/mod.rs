//! Message transport between ceremony participants.
//!
//! Two backends speak the same HTTP contract:
//!
//! - [`HttpRelay`]: the public relay reached over the internet.
//! - [`MediatorRelay`]: a [`LocalMediator`] advertised on the local
//!   network. The initiating device hosts it; joiners resolve its service
//!   name over mDNS and reach it through an [`HttpRelay`].
//!
//! Callers hold an `Arc<dyn MessageRelay>` from [`relay_for`] and never
//! branch on the active backend.

pub mod http;
pub mod lan;
pub mod mediator;
pub mod routes;

#[cfg(test)]
pub(crate) mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{NetworkMode, Settings};
use crate::error::KeysignResult;
use crate::session::Role;
use crate::signature::SignaturePackage;

pub use http::HttpRelay;
pub use lan::{MdnsAdvertiser, MdnsResolver};
pub use mediator::{
    LocalMediator, LogAdvertiser, MediatorRelay, MediatorResolver, ServiceAdvertiser,
};

/// Header carrying the per-hash topic.
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// One opaque ceremony message in a recipient's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub session_id: String,
    pub from: String,
    pub to: Vec<String>,
    /// Sealed payload, base64.
    pub body: String,
    /// Hex SHA-256 of `body`.
    pub hash: String,
    pub sequence_no: u64,
}

/// Transport contract shared by the public relay and the local mediator.
#[async_trait]
pub trait MessageRelay: Send + Sync {
    fn mode(&self) -> NetworkMode;

    /// Session base URL peers use to reach this backend.
    fn base_url(&self) -> String;

    /// Local-network service name, for backends announced over mDNS.
    fn service_name(&self) -> Option<String> {
        None
    }

    /// Bring the backend up. No-op for the public relay.
    async fn prepare(&self) -> KeysignResult<()> {
        Ok(())
    }

    /// Tear the backend down. No-op for the public relay.
    async fn release(&self) -> KeysignResult<()> {
        Ok(())
    }

    /// Register `parties` under `session_id`, merging with existing ones.
    async fn start_session(&self, session_id: &str, parties: &[String]) -> KeysignResult<()>;

    async fn get_participants(&self, session_id: &str) -> KeysignResult<Vec<String>>;

    async fn end_session(&self, session_id: &str) -> KeysignResult<()>;

    /// Initiator publishes the committee; this is the start signal.
    async fn start_with_committee(
        &self,
        session_id: &str,
        committee: &[String],
    ) -> KeysignResult<()>;

    /// Published committee, or `None` before the initiator starts.
    async fn check_committee(&self, session_id: &str) -> KeysignResult<Option<Vec<String>>>;

    async fn send(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        message: &RelayMessage,
    ) -> KeysignResult<()>;

    async fn receive(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Vec<RelayMessage>>;

    async fn acknowledge(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<()>;

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> KeysignResult<()>;

    async fn get_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Option<String>>;

    async fn mark_complete(&self, session_id: &str, party: &str) -> KeysignResult<()>;

    async fn completed_parties(&self, session_id: &str) -> KeysignResult<Vec<String>>;

    async fn publish_signature(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &SignaturePackage,
    ) -> KeysignResult<()>;

    async fn fetch_signature(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> KeysignResult<Option<SignaturePackage>>;
}

/// Pick the backend for `mode`.
///
/// In local mode the initiator hosts a mediator announced as
/// `service_name`; a joiner resolves that name to the initiator's address.
pub fn relay_for(
    mode: NetworkMode,
    role: Role,
    service_name: &str,
    settings: &Settings,
) -> KeysignResult<Arc<dyn MessageRelay>> {
    let relay: Arc<dyn MessageRelay> = match (mode, role) {
        (NetworkMode::Relay, _) => Arc::new(HttpRelay::new(settings.relay_url(), settings)?),
        (NetworkMode::Local, Role::Initiator) => Arc::new(MediatorRelay::host(
            settings,
            service_name,
            Arc::new(MdnsAdvertiser::default()),
        )?),
        (NetworkMode::Local, Role::Joiner) => Arc::new(MediatorRelay::remote(
            settings,
            service_name,
            Arc::new(MdnsResolver::new(settings.request_timeout())),
        )?),
    };
    tracing::debug!(mode = %mode, role = ?role, "Selected relay backend");
    Ok(relay)
}
