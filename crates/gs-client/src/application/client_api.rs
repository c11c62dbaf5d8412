//! GameStreamClient: the one object a front end talks to.
//!
//! It owns the client identity, the certificates of paired hosts, the
//! discovery coordinator and the pairing registry.  Every host operation
//! opens a fresh [`ControlChannel`] bound to that host, pinned to the
//! certificate stored for it, and hands the channel to the pairing or
//! session logic.
//!
//! [`ControlChannel`]: crate::infrastructure::network::ControlChannel

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::info;

use gs_core::{
    AppDescriptor, ClientIdentity, ControlError, DiscoverySource, HostEndpoint, HostId, ServerInfo,
    SessionTicket, StreamConfig,
};

use crate::application::discover_hosts::{
    ChannelProber, DiscoveryCoordinator, DiscoverySettings, HostUpdateListener,
};
use crate::application::host_registry::HostSnapshot;
use crate::application::negotiate_session::{SessionError, SessionNegotiator};
use crate::application::pair_host::{
    PairingCredential, PairingFailure, PairingRegistry, PairingState, PairingStateMachine,
};
use crate::infrastructure::network::{
    AdvertisementFeed, ChannelFactory, ControlChannel, DiscoveryError, TlsSetupError,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("pairing failed: {0}")]
    Pairing(#[from] PairingFailure),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("could not set up the control channel: {0}")]
    Setup(#[from] TlsSetupError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

pub struct GameStreamClient {
    channels: Arc<dyn ChannelFactory>,
    identity: ClientIdentity,
    pairing: PairingRegistry,
    discovery: DiscoveryCoordinator,
    trusted: Mutex<HashMap<HostId, Vec<u8>>>,
}

impl GameStreamClient {
    /// Client whose discovery probes go through `channels` as well.
    pub fn new(
        channels: Arc<dyn ChannelFactory>,
        identity: ClientIdentity,
        feed: Option<Arc<dyn AdvertisementFeed>>,
        settings: DiscoverySettings,
    ) -> Self {
        let prober = Arc::new(ChannelProber::new(Arc::clone(&channels)));
        Self {
            discovery: DiscoveryCoordinator::new(prober, feed, settings),
            channels,
            identity,
            pairing: PairingRegistry::new(),
            trusted: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn discovery(&self) -> &DiscoveryCoordinator {
        &self.discovery
    }

    fn trusted(&self) -> MutexGuard<'_, HashMap<HostId, Vec<u8>>> {
        self.trusted.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Trust store ───────────────────────────────────────────────────────────

    /// Pins `server_cert_der` for `host`, e.g. from stored credentials.
    pub fn trust_host(&self, host: HostId, server_cert_der: Vec<u8>) {
        self.trusted().insert(host, server_cert_der);
    }

    pub fn trusted_certificate(&self, host: &HostId) -> Option<Vec<u8>> {
        self.trusted().get(host).cloned()
    }

    /// Tracks a configured or previously paired host in discovery.
    pub fn add_known_host(&self, endpoint: HostEndpoint) {
        let cert = self.trusted_certificate(&endpoint.id);
        self.discovery.add_known_host(endpoint, cert);
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`ClientError::Discovery`] if a search is already running or
    /// the advertisement feed cannot start.
    pub fn start_discovery(&self) -> Result<(), ClientError> {
        Ok(self.discovery.start_searching()?)
    }

    pub fn stop_discovery(&self) {
        self.discovery.stop_searching();
    }

    pub fn add_listener(&self, listener: Arc<dyn HostUpdateListener>) {
        self.discovery.add_listener(listener);
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<HostSnapshot>> {
        self.discovery.subscribe()
    }

    pub fn hosts(&self) -> Vec<HostSnapshot> {
        self.discovery.snapshots()
    }

    /// Clears discovery state.  Pinned certificates are kept.
    pub fn forget_hosts(&self) {
        self.discovery.forget_hosts();
    }

    // ── Host operations ───────────────────────────────────────────────────────

    fn channel(&self, endpoint: &HostEndpoint) -> Result<Arc<ControlChannel>, ClientError> {
        let cert = self.trusted_certificate(&endpoint.id);
        Ok(Arc::new(self.channels.open(endpoint.clone(), cert)?))
    }

    fn negotiator(&self, endpoint: &HostEndpoint) -> Result<SessionNegotiator, ClientError> {
        Ok(SessionNegotiator::new(self.channel(endpoint)?))
    }

    /// Identifies the host at `address` with a plaintext `/serverinfo` and
    /// returns an endpoint keyed by its real id.
    ///
    /// # Errors
    ///
    /// Returns the channel or probe error.
    pub async fn locate(
        &self,
        address: &str,
        http_port: u16,
        https_port: u16,
    ) -> Result<(HostEndpoint, ServerInfo), ClientError> {
        let provisional =
            HostEndpoint::new(HostId::new(address), address, DiscoverySource::ActivePoll)
                .with_ports(http_port, https_port);
        let channel = self.channels.open(provisional.clone(), None)?;
        let info = SessionNegotiator::new(Arc::new(channel))
            .get_server_info(false)
            .await?;

        let mut endpoint = provisional;
        endpoint.id = info.unique_id.clone();
        endpoint.refresh_from(&info);
        Ok((endpoint, info))
    }

    /// # Errors
    ///
    /// Returns the channel or probe error.
    pub async fn server_info(&self, endpoint: &HostEndpoint) -> Result<ServerInfo, ClientError> {
        Ok(self.negotiator(endpoint)?.get_server_info(false).await?)
    }

    /// Pairs with `endpoint` using `pin`.  On success the host's certificate
    /// is trusted for every later call; either way discovery records the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pairing`] with the reason the handshake failed.
    pub async fn pair(
        &self,
        endpoint: &HostEndpoint,
        pin: &str,
    ) -> Result<PairingCredential, ClientError> {
        self.pair_observed(endpoint, pin, None).await
    }

    /// [`pair`](Self::pair), reporting each handshake state on `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pairing`] with the reason the handshake failed.
    pub async fn pair_observed(
        &self,
        endpoint: &HostEndpoint,
        pin: &str,
        observer: Option<mpsc::UnboundedSender<PairingState>>,
    ) -> Result<PairingCredential, ClientError> {
        let mut machine = PairingStateMachine::new(
            self.channel(endpoint)?,
            self.identity.clone(),
            self.pairing.clone(),
        );
        if let Some(observer) = observer {
            machine = machine.with_observer(observer);
        }

        let outcome = machine.pair(pin).await;
        if let Ok(credential) = &outcome {
            self.trust_host(credential.host_id.clone(), credential.server_cert_der.clone());
        }
        self.discovery.record_pairing_outcome(&endpoint.id, &outcome);
        Ok(outcome?)
    }

    /// Unpairs and drops the pinned certificate for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns the `/unpair` request error.  The local certificate is
    /// dropped regardless.
    pub async fn unpair(&self, endpoint: &HostEndpoint) -> Result<(), ClientError> {
        let machine = PairingStateMachine::new(
            self.channel(endpoint)?,
            self.identity.clone(),
            self.pairing.clone(),
        );
        let result = machine.unpair().await;
        self.trusted().remove(&endpoint.id);
        self.discovery.record_unpaired(&endpoint.id);
        info!(host = %endpoint.id, "host certificate forgotten");
        Ok(result?)
    }

    /// # Errors
    ///
    /// See [`SessionNegotiator::list_apps`].
    pub async fn list_apps(
        &self,
        endpoint: &HostEndpoint,
    ) -> Result<Vec<AppDescriptor>, ClientError> {
        Ok(self.negotiator(endpoint)?.list_apps().await?)
    }

    /// # Errors
    ///
    /// See [`SessionNegotiator::launch_or_resume`].
    pub async fn launch(
        &self,
        endpoint: &HostEndpoint,
        app_id: &str,
        config: &StreamConfig,
    ) -> Result<SessionTicket, ClientError> {
        Ok(self.negotiator(endpoint)?.launch(app_id, config).await?)
    }

    /// # Errors
    ///
    /// See [`SessionNegotiator::launch_or_resume`].
    pub async fn resume(
        &self,
        endpoint: &HostEndpoint,
        config: &StreamConfig,
    ) -> Result<SessionTicket, ClientError> {
        Ok(self.negotiator(endpoint)?.resume(config).await?)
    }

    /// # Errors
    ///
    /// See [`SessionNegotiator::quit`].
    pub async fn quit(&self, endpoint: &HostEndpoint) -> Result<(), ClientError> {
        Ok(self.negotiator(endpoint)?.quit().await?)
    }

    /// Box art for `app_id`; empty when the host has none.
    ///
    /// # Errors
    ///
    /// See [`SessionNegotiator::retrieve_asset`].
    pub async fn app_asset(
        &self,
        endpoint: &HostEndpoint,
        app_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.negotiator(endpoint)?.retrieve_asset(app_id).await?)
    }
}
