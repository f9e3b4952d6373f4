//! In-process relay over a [`MediatorStore`], for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::routes::MediatorStore;
use super::{MessageRelay, RelayMessage};
use crate::config::NetworkMode;
use crate::error::{KeysignError, KeysignResult};
use crate::signature::SignaturePackage;

pub struct MemoryRelay {
    pub store: Arc<MediatorStore>,
    mode: NetworkMode,
    pub offline: AtomicBool,
    pub prepared: AtomicUsize,
    pub released: AtomicUsize,
}

impl MemoryRelay {
    pub fn new(mode: NetworkMode) -> Arc<Self> {
        Self::sharing(Arc::new(MediatorStore::new()), mode)
    }

    /// A second client over the same store, as another device would see it.
    pub fn sharing(store: Arc<MediatorStore>, mode: NetworkMode) -> Arc<Self> {
        Arc::new(Self {
            store,
            mode,
            offline: AtomicBool::new(false),
            prepared: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    fn online(&self) -> KeysignResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KeysignError::RelayUnreachable("offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn topic(message_id: Option<&str>) -> &str {
    message_id.unwrap_or_default()
}

#[async_trait]
impl MessageRelay for MemoryRelay {
    fn mode(&self) -> NetworkMode {
        self.mode
    }

    fn base_url(&self) -> String {
        format!("memory://{}", self.mode)
    }

    async fn prepare(&self) -> KeysignResult<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> KeysignResult<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_session(&self, session_id: &str, parties: &[String]) -> KeysignResult<()> {
        self.online()?;
        self.store.register(session_id, parties.to_vec());
        Ok(())
    }

    async fn get_participants(&self, session_id: &str) -> KeysignResult<Vec<String>> {
        self.online()?;
        Ok(self.store.participants(session_id))
    }

    async fn end_session(&self, session_id: &str) -> KeysignResult<()> {
        self.online()?;
        self.store.end_session(session_id);
        Ok(())
    }

    async fn start_with_committee(
        &self,
        session_id: &str,
        committee: &[String],
    ) -> KeysignResult<()> {
        self.online()?;
        self.store.set_committee(session_id, committee.to_vec());
        Ok(())
    }

    async fn check_committee(&self, session_id: &str) -> KeysignResult<Option<Vec<String>>> {
        self.online()?;
        Ok(self.store.committee(session_id))
    }

    async fn send(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        message: &RelayMessage,
    ) -> KeysignResult<()> {
        self.online()?;
        self.store
            .push_message(session_id, topic(message_id), message.clone());
        Ok(())
    }

    async fn receive(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Vec<RelayMessage>> {
        self.online()?;
        Ok(self.store.messages(session_id, party, topic(message_id)))
    }

    async fn acknowledge(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<()> {
        self.online()?;
        self.store
            .acknowledge(session_id, party, topic(message_id), hash);
        Ok(())
    }

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> KeysignResult<()> {
        self.online()?;
        self.store
            .put_setup_message(session_id, topic(message_id), payload.to_string());
        Ok(())
    }

    async fn get_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Option<String>> {
        self.online()?;
        Ok(self.store.setup_message(session_id, topic(message_id)))
    }

    async fn mark_complete(&self, session_id: &str, party: &str) -> KeysignResult<()> {
        self.online()?;
        self.store
            .mark_complete(session_id, vec![party.to_string()]);
        Ok(())
    }

    async fn completed_parties(&self, session_id: &str) -> KeysignResult<Vec<String>> {
        self.online()?;
        Ok(self.store.completed(session_id).unwrap_or_default())
    }

    async fn publish_signature(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &SignaturePackage,
    ) -> KeysignResult<()> {
        self.online()?;
        self.store
            .put_signature(session_id, message_id, serde_json::to_string(signature)?);
        Ok(())
    }

    async fn fetch_signature(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> KeysignResult<Option<SignaturePackage>> {
        self.online()?;
        self.store
            .signature(session_id, message_id)
            .map(|body| serde_json::from_str(&body).map_err(Into::into))
            .transpose()
    }
}
