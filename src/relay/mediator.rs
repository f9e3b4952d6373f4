//! In-process mediator for local-network ceremonies.
//!
//! The initiating device starts a [`LocalMediator`], announces it under a
//! random service name, and talks to it over HTTP like any other peer.
//! Joining devices resolve that name to the host's LAN address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer, middleware, web};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing_actix_web::TracingLogger;

use super::routes::{self, MediatorStore};
use super::{HttpRelay, MessageRelay, RelayMessage};
use crate::config::{NetworkMode, Settings};
use crate::error::{KeysignError, KeysignResult};
use crate::signature::SignaturePackage;

/// Local-network service announcement.
pub trait ServiceAdvertiser: Send + Sync {
    fn advertise(&self, service_name: &str, addr: SocketAddr) -> KeysignResult<()>;
    fn withdraw(&self, service_name: &str);
}

/// Finds the mediator another device announced under a service name.
#[async_trait]
pub trait MediatorResolver: Send + Sync {
    /// Base URL of the mediator announced as `service_name`.
    async fn resolve(&self, service_name: &str) -> KeysignResult<String>;
}

/// Advertiser that only records the announcement in the log. For hosts
/// where every peer runs on the same machine.
pub struct LogAdvertiser;

impl ServiceAdvertiser for LogAdvertiser {
    fn advertise(&self, service_name: &str, addr: SocketAddr) -> KeysignResult<()> {
        tracing::info!(service_name, addr = %addr, "Advertising mediator");
        Ok(())
    }

    fn withdraw(&self, service_name: &str) {
        tracing::info!(service_name, "Withdrew mediator advertisement");
    }
}

struct RunningServer {
    service_name: String,
    local_addr: SocketAddr,
    handle: ServerHandle,
    task: JoinHandle<std::io::Result<()>>,
}

pub struct LocalMediator {
    bind_addr: SocketAddr,
    store: web::Data<MediatorStore>,
    advertiser: Arc<dyn ServiceAdvertiser>,
    running: Mutex<Option<RunningServer>>,
}

impl LocalMediator {
    pub fn new(bind_addr: SocketAddr, advertiser: Arc<dyn ServiceAdvertiser>) -> Self {
        Self {
            bind_addr,
            store: web::Data::new(MediatorStore::new()),
            advertiser,
            running: Mutex::new(None),
        }
    }

    /// `"{prefix}-{5 random digits}"`.
    pub fn service_name(prefix: &str) -> String {
        let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
        format!("{prefix}-{suffix:05}")
    }

    /// Bind, serve, and advertise. Returns the bound address.
    ///
    /// Starting an already running mediator returns its address.
    pub async fn start(&self, service_name: &str) -> KeysignResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Ok(server.local_addr);
        }

        let store = self.store.clone();
        let (local_addr, server) = {
            let server = HttpServer::new(move || {
                App::new()
                    .wrap(TracingLogger::default())
                    .wrap(middleware::DefaultHeaders::new().add(("X-Service", "keysign-mediator")))
                    .app_data(store.clone())
                    .configure(routes::configure)
            })
            .workers(1)
            .disable_signals()
            .bind(self.bind_addr)
            .map_err(|e| {
                KeysignError::RelayUnreachable(format!(
                    "Failed to bind mediator on {}: {e}",
                    self.bind_addr
                ))
            })?;

            let local_addr =
                server.addrs().first().copied().ok_or_else(|| {
                    KeysignError::Internal("Mediator bound no addresses".to_string())
                })?;

            (local_addr, server.run())
        };
        let handle = server.handle();
        let task = tokio::spawn(server);

        if let Err(e) = self.advertiser.advertise(service_name, local_addr) {
            handle.stop(false).await;
            return Err(e);
        }

        tracing::info!(service_name, addr = %local_addr, "Local mediator started");
        *running = Some(RunningServer {
            service_name: service_name.to_string(),
            local_addr,
            handle,
            task,
        });
        Ok(local_addr)
    }

    /// Stop serving, drop all session state, and withdraw the announcement.
    /// Stopping a stopped mediator is a no-op.
    pub async fn stop(&self) {
        let Some(server) = self.running.lock().await.take() else {
            return;
        };

        server.handle.stop(true).await;
        match server.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Mediator server exited with error"),
            Err(e) => tracing::warn!(error = %e, "Mediator server task failed"),
        }

        self.store.clear();
        self.advertiser.withdraw(&server.service_name);
        tracing::info!(service_name = %server.service_name, "Local mediator stopped");
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|s| s.local_addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// URL this device uses to reach a mediator bound on `addr`.
fn loopback_url(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        addr.ip()
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}

enum Endpoint {
    /// This device serves the mediator.
    Host(LocalMediator),
    /// Another device serves it under the service name.
    Remote(Arc<dyn MediatorResolver>),
}

/// [`MessageRelay`] over a local-network mediator.
///
/// The hosting side starts and stops the mediator itself; the joining
/// side resolves the host's announcement on `prepare`.
pub struct MediatorRelay {
    endpoint: Endpoint,
    settings: Settings,
    service_name: String,
    client: RwLock<Option<HttpRelay>>,
}

impl MediatorRelay {
    /// Host a mediator under a freshly generated service name.
    pub fn new(settings: &Settings, advertiser: Arc<dyn ServiceAdvertiser>) -> KeysignResult<Self> {
        let service_name = LocalMediator::service_name(settings.service_prefix());
        Self::host(settings, &service_name, advertiser)
    }

    /// Host a mediator announced as `service_name`.
    pub fn host(
        settings: &Settings,
        service_name: &str,
        advertiser: Arc<dyn ServiceAdvertiser>,
    ) -> KeysignResult<Self> {
        Ok(Self::with_endpoint(
            settings,
            service_name,
            Endpoint::Host(LocalMediator::new(settings.mediator_addr(), advertiser)),
        ))
    }

    /// Use the mediator another device announced as `service_name`.
    pub fn remote(
        settings: &Settings,
        service_name: &str,
        resolver: Arc<dyn MediatorResolver>,
    ) -> KeysignResult<Self> {
        if service_name.is_empty() {
            return Err(KeysignError::SessionNotFound(
                "no local mediator service name to resolve".to_string(),
            ));
        }
        Ok(Self::with_endpoint(
            settings,
            service_name,
            Endpoint::Remote(resolver),
        ))
    }

    fn with_endpoint(settings: &Settings, service_name: &str, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            settings: settings.clone(),
            service_name: service_name.to_string(),
            client: RwLock::new(None),
        }
    }

    /// Whether this device serves the mediator.
    pub fn is_host(&self) -> bool {
        matches!(self.endpoint, Endpoint::Host(_))
    }

    fn client(&self) -> KeysignResult<HttpRelay> {
        self.client
            .read()
            .map_err(|_| KeysignError::Internal("Mediator client lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| KeysignError::RelayUnreachable("Local mediator not started".to_string()))
    }

    fn set_client(&self, client: Option<HttpRelay>) -> KeysignResult<()> {
        *self
            .client
            .write()
            .map_err(|_| KeysignError::Internal("Mediator client lock poisoned".to_string()))? =
            client;
        Ok(())
    }
}

#[async_trait]
impl MessageRelay for MediatorRelay {
    fn mode(&self) -> NetworkMode {
        NetworkMode::Local
    }

    /// Resolved mediator URL. Before `prepare`, the host's own loopback
    /// URL or, for a joiner, empty.
    fn base_url(&self) -> String {
        if let Ok(client) = self.client() {
            return client.base_url();
        }
        match &self.endpoint {
            Endpoint::Host(_) => loopback_url(self.settings.mediator_addr()),
            Endpoint::Remote(_) => String::new(),
        }
    }

    fn service_name(&self) -> Option<String> {
        Some(self.service_name.clone())
    }

    async fn prepare(&self) -> KeysignResult<()> {
        let url = match &self.endpoint {
            Endpoint::Host(mediator) => loopback_url(mediator.start(&self.service_name).await?),
            Endpoint::Remote(resolver) => resolver.resolve(&self.service_name).await?,
        };
        self.set_client(Some(HttpRelay::local(&url, &self.settings)?))
    }

    /// Stops a hosted mediator; a joiner only forgets the address.
    async fn release(&self) -> KeysignResult<()> {
        self.set_client(None)?;
        if let Endpoint::Host(mediator) = &self.endpoint {
            mediator.stop().await;
        }
        Ok(())
    }

    async fn start_session(&self, session_id: &str, parties: &[String]) -> KeysignResult<()> {
        self.client()?.start_session(session_id, parties).await
    }

    async fn get_participants(&self, session_id: &str) -> KeysignResult<Vec<String>> {
        self.client()?.get_participants(session_id).await
    }

    async fn end_session(&self, session_id: &str) -> KeysignResult<()> {
        self.client()?.end_session(session_id).await
    }

    async fn start_with_committee(
        &self,
        session_id: &str,
        committee: &[String],
    ) -> KeysignResult<()> {
        self.client()?
            .start_with_committee(session_id, committee)
            .await
    }

    async fn check_committee(&self, session_id: &str) -> KeysignResult<Option<Vec<String>>> {
        self.client()?.check_committee(session_id).await
    }

    async fn send(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        message: &RelayMessage,
    ) -> KeysignResult<()> {
        self.client()?.send(session_id, message_id, message).await
    }

    async fn receive(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Vec<RelayMessage>> {
        self.client()?.receive(session_id, party, message_id).await
    }

    async fn acknowledge(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<()> {
        self.client()?
            .acknowledge(session_id, party, hash, message_id)
            .await
    }

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> KeysignResult<()> {
        self.client()?
            .upload_setup_message(session_id, message_id, payload)
            .await
    }

    async fn get_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> KeysignResult<Option<String>> {
        self.client()?
            .get_setup_message(session_id, message_id)
            .await
    }

    async fn mark_complete(&self, session_id: &str, party: &str) -> KeysignResult<()> {
        self.client()?.mark_complete(session_id, party).await
    }

    async fn completed_parties(&self, session_id: &str) -> KeysignResult<Vec<String>> {
        self.client()?.completed_parties(session_id).await
    }

    async fn publish_signature(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &SignaturePackage,
    ) -> KeysignResult<()> {
        self.client()?
            .publish_signature(session_id, message_id, signature)
            .await
    }

    async fn fetch_signature(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> KeysignResult<Option<SignaturePackage>> {
        self.client()?.fetch_signature(session_id, message_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingAdvertiser {
        events: StdMutex<Vec<String>>,
    }

    impl ServiceAdvertiser for RecordingAdvertiser {
        fn advertise(&self, service_name: &str, _addr: SocketAddr) -> KeysignResult<()> {
            self.events.lock().unwrap().push(format!("+{service_name}"));
            Ok(())
        }

        fn withdraw(&self, service_name: &str) {
            self.events.lock().unwrap().push(format!("-{service_name}"));
        }
    }

    #[test]
    fn test_service_name_format() {
        let name = LocalMediator::service_name("vultisigApp");
        let (prefix, digits) = name.rsplit_once('-').unwrap();
        assert_eq!(prefix, "vultisigApp");
        assert_eq!(digits.len(), 5);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }

    /// Resolves every name to one fixed URL, recording what was asked.
    struct FixedResolver {
        url: String,
        asked: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MediatorResolver for FixedResolver {
        async fn resolve(&self, service_name: &str) -> KeysignResult<String> {
            self.asked.lock().unwrap().push(service_name.to_string());
            Ok(self.url.clone())
        }
    }

    #[test]
    fn test_loopback_url_replaces_unspecified_host() {
        let addr: SocketAddr = "0.0.0.0:18080".parse().unwrap();
        assert_eq!(loopback_url(addr), "http://127.0.0.1:18080");
    }

    #[actix_rt::test]
    async fn test_start_stop_is_idempotent() {
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let mediator = LocalMediator::new("127.0.0.1:0".parse().unwrap(), advertiser.clone());

        let addr = mediator.start("svc-00001").await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(mediator.start("svc-00001").await.unwrap(), addr);

        mediator.stop().await;
        mediator.stop().await;
        assert!(!mediator.is_running().await);
        assert_eq!(
            *advertiser.events.lock().unwrap(),
            vec!["+svc-00001".to_string(), "-svc-00001".to_string()]
        );
    }

    #[actix_rt::test]
    async fn test_mediator_relay_serves_contract() {
        let relay = MediatorRelay::new(&Settings::for_tests(), Arc::new(LogAdvertiser)).unwrap();
        assert!(relay.get_participants("s1").await.is_err());

        relay.prepare().await.unwrap();
        relay.start_session("s1", &["a".to_string()]).await.unwrap();
        relay.start_session("s1", &["b".to_string()]).await.unwrap();
        assert_eq!(relay.get_participants("s1").await.unwrap(), vec!["a", "b"]);
        assert!(relay.check_committee("s1").await.unwrap().is_none());

        relay
            .upload_setup_message("s1", Some("m1"), "setup-payload")
            .await
            .unwrap();
        assert_eq!(
            relay
                .get_setup_message("s1", Some("m1"))
                .await
                .unwrap()
                .as_deref(),
            Some("setup-payload")
        );
        assert!(relay.get_setup_message("s1", None).await.unwrap().is_none());

        relay.release().await.unwrap();
        relay.release().await.unwrap();
        assert!(relay.get_participants("s1").await.is_err());
    }

    #[actix_rt::test]
    async fn test_restart_clears_state() {
        let relay = MediatorRelay::new(&Settings::for_tests(), Arc::new(LogAdvertiser)).unwrap();
        relay.prepare().await.unwrap();
        relay.start_session("s1", &["a".to_string()]).await.unwrap();
        relay.release().await.unwrap();

        relay.prepare().await.unwrap();
        assert!(relay.get_participants("s1").await.unwrap().is_empty());
        relay.release().await.unwrap();
    }

    #[actix_rt::test]
    async fn test_remote_side_reaches_hosted_mediator() {
        let settings = Settings::for_tests();
        let host =
            MediatorRelay::host(&settings, "vultisigApp-42424", Arc::new(LogAdvertiser)).unwrap();
        host.prepare().await.unwrap();

        let resolver = Arc::new(FixedResolver {
            url: host.base_url(),
            asked: StdMutex::new(Vec::new()),
        });
        let joiner =
            MediatorRelay::remote(&settings, "vultisigApp-42424", resolver.clone()).unwrap();
        assert!(!joiner.is_host());
        assert_eq!(joiner.base_url(), "");

        joiner.prepare().await.unwrap();
        assert_eq!(*resolver.asked.lock().unwrap(), vec!["vultisigApp-42424"]);
        assert_eq!(joiner.base_url(), host.base_url());

        host.start_session("s1", &["a".to_string()]).await.unwrap();
        joiner
            .start_session("s1", &["b".to_string()])
            .await
            .unwrap();
        assert_eq!(host.get_participants("s1").await.unwrap(), vec!["a", "b"]);

        // Releasing the joiner leaves the host serving.
        joiner.release().await.unwrap();
        assert!(joiner.get_participants("s1").await.is_err());
        assert_eq!(host.get_participants("s1").await.unwrap().len(), 2);
        host.release().await.unwrap();
    }

    #[test]
    fn test_remote_side_needs_service_name() {
        let resolver = Arc::new(FixedResolver {
            url: String::new(),
            asked: StdMutex::new(Vec::new()),
        });
        let err = MediatorRelay::remote(&Settings::for_tests(), "", resolver)
            .err()
            .unwrap();
        assert!(matches!(err, KeysignError::SessionNotFound(_)));
    }
}
