//! Local-network service discovery over mDNS.
//!
//! The hosting device registers its mediator as an `_http._tcp` instance
//! named after the session's service name. Joining devices browse for that
//! instance and reach the mediator at the LAN address it resolves to.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use super::mediator::{MediatorResolver, ServiceAdvertiser};
use crate::error::{KeysignError, KeysignResult};

pub const SERVICE_TYPE: &str = "_http._tcp.local.";

fn mdns_error(e: mdns_sd::Error) -> KeysignError {
    KeysignError::RelayUnreachable(format!("mDNS: {e}"))
}

fn poisoned() -> KeysignError {
    KeysignError::Internal("mDNS lock poisoned".to_string())
}

/// Full DNS-SD instance name for `service_name`.
pub fn instance_fullname(service_name: &str) -> String {
    format!("{service_name}.{SERVICE_TYPE}")
}

/// Address peers should dial: IPv4 LAN addresses first, loopback last.
pub fn preferred_address(addresses: &HashSet<IpAddr>) -> Option<IpAddr> {
    addresses
        .iter()
        .copied()
        .min_by_key(|ip| (ip.is_loopback(), !ip.is_ipv4(), *ip))
}

/// Registers mediators on the local network.
///
/// The responder daemon starts on the first announcement.
#[derive(Default)]
pub struct MdnsAdvertiser {
    daemon: Mutex<Option<ServiceDaemon>>,
    registered: Mutex<HashMap<String, String>>,
}

impl MdnsAdvertiser {
    fn daemon(&self) -> KeysignResult<ServiceDaemon> {
        let mut daemon = self.daemon.lock().map_err(|_| poisoned())?;
        if let Some(daemon) = daemon.as_ref() {
            return Ok(daemon.clone());
        }
        let started = ServiceDaemon::new().map_err(mdns_error)?;
        *daemon = Some(started.clone());
        Ok(started)
    }
}

impl ServiceAdvertiser for MdnsAdvertiser {
    fn advertise(&self, service_name: &str, addr: SocketAddr) -> KeysignResult<()> {
        let host_name = format!("{service_name}.local.");
        let ip = if addr.ip().is_unspecified() {
            String::new()
        } else {
            addr.ip().to_string()
        };
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            service_name,
            &host_name,
            ip.as_str(),
            addr.port(),
            HashMap::<String, String>::new(),
        )
        .map_err(mdns_error)?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon()?.register(info).map_err(mdns_error)?;
        self.registered
            .lock()
            .map_err(|_| poisoned())?
            .insert(service_name.to_string(), fullname.clone());

        tracing::info!(service_name, fullname = %fullname, port = addr.port(), "Registered mDNS service");
        Ok(())
    }

    fn withdraw(&self, service_name: &str) {
        let fullname = match self.registered.lock() {
            Ok(mut registered) => registered.remove(service_name),
            Err(_) => None,
        };
        let Some(fullname) = fullname else {
            return;
        };
        let daemon = match self.daemon() {
            Ok(daemon) => daemon,
            Err(e) => {
                tracing::warn!(service_name, error = %e, "mDNS daemon unavailable");
                return;
            }
        };
        if let Err(e) = daemon.unregister(&fullname) {
            tracing::warn!(service_name, error = %e, "Failed to unregister mDNS service");
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Ok(daemon) = self.daemon.get_mut() {
            if let Some(daemon) = daemon.take() {
                let _ = daemon.shutdown();
            }
        }
    }
}

/// Finds a mediator announced by [`MdnsAdvertiser`] on another device.
pub struct MdnsResolver {
    timeout: Duration,
}

impl MdnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MediatorResolver for MdnsResolver {
    async fn resolve(&self, service_name: &str) -> KeysignResult<String> {
        let fullname = instance_fullname(service_name);
        let timeout = self.timeout;

        let addr = tokio::task::spawn_blocking(move || browse(&fullname, timeout))
            .await
            .map_err(|e| KeysignError::Internal(format!("mDNS browse task failed: {e}")))??;

        tracing::info!(service_name, addr = %addr, "Resolved local mediator");
        Ok(format!("http://{addr}"))
    }
}

fn browse(fullname: &str, timeout: Duration) -> KeysignResult<SocketAddr> {
    let daemon = ServiceDaemon::new().map_err(mdns_error)?;
    let events = daemon.browse(SERVICE_TYPE).map_err(mdns_error)?;
    let deadline = Instant::now() + timeout;

    let found = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break None;
        }
        match events.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) if info.get_fullname() == fullname => {
                if let Some(ip) = preferred_address(info.get_addresses()) {
                    break Some(SocketAddr::new(ip, info.get_port()));
                }
            }
            Ok(_) => {}
            Err(_) => break None,
        }
    };

    if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
        tracing::debug!(error = %e, "Failed to stop mDNS browse");
    }
    let _ = daemon.shutdown();

    found.ok_or_else(|| {
        KeysignError::RelayUnreachable(format!("No local mediator named {fullname}"))
    })
}
