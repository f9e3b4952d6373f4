//! Participant discovery by polling the relay.
//!
//! A background task polls `get_participants` and publishes the growing set
//! of peers on a watch channel. The set only grows while a run lasts; a
//! restart clears it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::relay::MessageRelay;

struct PollTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ParticipantDiscovery {
    session_id: String,
    local_party: String,
    poll_interval: Duration,
    participants: Arc<watch::Sender<Vec<String>>>,
    task: Mutex<Option<PollTask>>,
}

impl ParticipantDiscovery {
    /// Start polling `relay` for peers joining `session_id`.
    pub fn start(
        relay: Arc<dyn MessageRelay>,
        session_id: &str,
        local_party: &str,
        poll_interval: Duration,
    ) -> Self {
        let (participants, _) = watch::channel(Vec::new());
        let discovery = Self {
            session_id: session_id.to_string(),
            local_party: local_party.to_string(),
            poll_interval,
            participants: Arc::new(participants),
            task: Mutex::new(None),
        };
        discovery.spawn(relay);
        discovery
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<PollTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, relay: Arc<dyn MessageRelay>) {
        let (cancel, cancelled) = watch::channel(false);
        let handle = tokio::spawn(poll(
            relay,
            self.session_id.clone(),
            self.local_party.clone(),
            self.poll_interval,
            Arc::clone(&self.participants),
            cancelled,
        ));
        *self.lock_task() = Some(PollTask { cancel, handle });
        tracing::debug!(session_id = %self.session_id, "Discovery started");
    }

    /// Lazy stream of participant sets, yielding the current set first.
    /// Ends only when the discovery is dropped.
    pub fn subscribe(&self) -> WatchStream<Vec<String>> {
        WatchStream::new(self.participants.subscribe())
    }

    /// Current snapshot, excluding the local party.
    pub fn participants(&self) -> Vec<String> {
        self.participants.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    /// Stop polling. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            let _ = task.cancel.send(true);
            task.handle.abort();
            tracing::debug!(session_id = %self.session_id, "Discovery stopped");
        }
    }

    /// Stop, forget every discovered id, and poll again, possibly against
    /// another backend.
    pub fn restart(&self, relay: Arc<dyn MessageRelay>) {
        self.stop();
        self.participants.send_replace(Vec::new());
        self.spawn(relay);
    }
}

impl Drop for ParticipantDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll(
    relay: Arc<dyn MessageRelay>,
    session_id: String,
    local_party: String,
    interval: Duration,
    participants: Arc<watch::Sender<Vec<String>>>,
    mut cancelled: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancelled.changed() => break,
            result = relay.get_participants(&session_id) => match result {
                Ok(ids) => {
                    participants.send_if_modified(|known| {
                        let mut grew = false;
                        for id in ids {
                            if id != local_party && !known.contains(&id) {
                                tracing::info!(session_id = %session_id, party = %id, "Participant joined");
                                known.push(id);
                                grew = true;
                            }
                        }
                        grew
                    });
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Participant poll failed");
                }
            },
        }

        tokio::select! {
            biased;
            _ = cancelled.changed() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
