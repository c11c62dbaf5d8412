//! mDNS advertisement feed for `_nvstream._tcp.local.`.
//!
//! Hosts announce themselves on the LAN with DNS-SD.  The feed browses for
//! the service type and forwards every resolved service as an
//! [`Advertisement`] on a Tokio channel.  It knows nothing about host
//! identity: the discovery coordinator probes each advertised address to
//! learn the host's `uniqueid`.
//!
//! The `mdns-sd` daemon delivers events on a blocking channel, so the
//! forwarding loop runs on a blocking thread and polls a running flag
//! between receives.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default DNS-SD service type advertised by GameStream hosts.
pub const DEFAULT_SERVICE_TYPE: &str = "_nvstream._tcp.local.";

const RECV_POLL: Duration = Duration::from_millis(250);
const FEED_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Mdns(String),

    #[error("advertisement feed already running")]
    AlreadyRunning,
}

/// One resolved service advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// DNS-SD instance name, e.g. `DESKTOP._nvstream._tcp.local.`.
    pub instance: String,
    /// Preferred address (IPv4 when the host advertises one).
    pub address: String,
    /// IPv6 address, if advertised.
    pub ipv6_address: Option<String>,
    /// Advertised service port (the plaintext control port).
    pub port: u16,
}

/// Source of service advertisements.
///
/// `start` hands back a receiver; `stop` tears the subscription down, after
/// which the receiver yields `None`.
pub trait AdvertisementFeed: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if the subscription cannot be opened.
    fn start(&self) -> Result<mpsc::Receiver<Advertisement>, DiscoveryError>;

    fn stop(&self);
}

/// [`AdvertisementFeed`] backed by an `mdns-sd` daemon.
pub struct MdnsFeed {
    daemon: ServiceDaemon,
    service_type: String,
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl MdnsFeed {
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Mdns`] if the daemon cannot be started.
    pub fn new(service_type: impl Into<String>) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        Ok(Self {
            daemon,
            service_type: service_type.into(),
            running: Mutex::new(None),
        })
    }
}

impl AdvertisementFeed for MdnsFeed {
    fn start(&self) -> Result<mpsc::Receiver<Advertisement>, DiscoveryError> {
        let mut slot = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let events = self
            .daemon
            .browse(&self.service_type)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        *slot = Some(Arc::clone(&running));

        info!(service = %self.service_type, "mDNS browse started");
        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::Relaxed) {
                let event = match events.recv_timeout(RECV_POLL) {
                    Ok(event) => event,
                    Err(_) if events.is_disconnected() => break,
                    Err(_) => continue,
                };
                if let Some(ad) = advertisement_from_event(event) {
                    debug!(instance = %ad.instance, address = %ad.address, "mDNS advertisement");
                    if tx.blocking_send(ad).is_err() {
                        break;
                    }
                }
            }
            debug!("mDNS forwarding loop exited");
        });

        Ok(rx)
    }

    fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(running) = running {
            running.store(false, Ordering::Relaxed);
            if let Err(e) = self.daemon.stop_browse(&self.service_type) {
                warn!("mDNS: failed to stop browse: {e}");
            }
            info!(service = %self.service_type, "mDNS browse stopped");
        }
    }
}

impl Drop for MdnsFeed {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS: daemon shutdown failed: {e}");
        }
    }
}

fn advertisement_from_event(event: ServiceEvent) -> Option<Advertisement> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let addresses: Vec<IpAddr> = info
                .get_addresses()
                .iter()
                .map(|a| IpAddr::from(*a))
                .collect();
            select_advertisement(info.get_fullname(), &addresses, info.get_port())
        }
        ServiceEvent::ServiceRemoved(_type, fullname) => {
            debug!("mDNS: service removed: {fullname}");
            None
        }
        _ => None,
    }
}

/// Picks the address to contact: IPv4 first, IPv6 kept alongside.
fn select_advertisement(instance: &str, addresses: &[IpAddr], port: u16) -> Option<Advertisement> {
    let v4 = addresses.iter().find(|a| a.is_ipv4());
    let v6 = addresses.iter().find(|a| a.is_ipv6());
    let address = v4.or(v6)?;
    Some(Advertisement {
        instance: instance.to_string(),
        address: address.to_string(),
        ipv6_address: v6.map(IpAddr::to_string),
        port,
    })
}
