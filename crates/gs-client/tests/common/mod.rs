//! Shared fixtures for the gs-client integration tests.
//!
//! # What is simulated here? (for beginners)
//!
//! Integration tests never touch the network.  Instead:
//!
//! - [`SimulatedHost`] is a `ControlTransport` that plays the host's side of
//!   the protocol in memory: it answers `/serverinfo`, runs the server half
//!   of the pairing handshake with the same key derivation and proofs as a
//!   real host, and keeps an app running or not.  A client counts as trusted
//!   once it completed pairing under its `uniqueid`.
//! - [`SimulatedTls`] stands in for the TLS handshake: an HTTPS request
//!   first checks the certificate the host presents against the channel's
//!   pinned one, exactly as the production verifier does.
//! - [`SimulatedNetwork`] is a `ChannelFactory` that routes each channel to
//!   the simulated host at the endpoint's address.
//! - [`ScriptedProber`] answers discovery probes from a table that a test
//!   can flip between cycles.
//! - [`FakeFeed`] is an advertisement feed a test pushes into by hand.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use gs_client::application::discover_hosts::{HostProber, HostUpdateListener};
use gs_client::application::host_registry::HostSnapshot;
use gs_client::infrastructure::network::{
    decode_reply, Advertisement, AdvertisementFeed, ChannelFactory, ControlChannel,
    ControlTransport, DiscoveryError, PinnedCertificate, Timeouts, TlsSetupError,
};
use gs_core::crypto::{
    compute_proof, decrypt_and_verify, derive_pairing_secret, encrypt_challenge, random_bytes,
    verify_proof, ProofRole, CHALLENGE_LEN, PAIRING_SECRET_LEN, PROOF_LEN, SALT_LEN,
};
use gs_core::{
    ClientIdentity, ClientIds, ControlError, ControlRequest, ControlResponse, HostEndpoint, HostId,
    Scheme, ServerInfo, SharedSecret,
};

pub const HOST_ID: &str = "F3A2C1D0-0000-4000-8000-00000000D35C";
pub const HOST_ADDRESS: &str = "192.168.1.20";
pub const CORRECT_PIN: &str = "4321";
pub const BOX_ART: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a];

pub fn client_ids(unique_id: &str) -> ClientIds {
    ClientIds {
        unique_id: unique_id.to_string(),
        device_name: "test-client".to_string(),
    }
}

pub fn endpoint(id: &str, address: &str) -> HostEndpoint {
    HostEndpoint::new(HostId::from(id), address, gs_core::DiscoverySource::ActivePoll)
}

// ── SimulatedHost ─────────────────────────────────────────────────────────────

/// Handshake state the host keeps between rounds.
#[derive(Default)]
struct PairingInProgress {
    client_unique_id: String,
    client_cert_pem: Vec<u8>,
    secret: Option<SharedSecret>,
    server_challenge: [u8; CHALLENGE_LEN],
    verified: bool,
}

#[derive(Default)]
struct HostSim {
    pairing: Option<PairingInProgress>,
    paired_clients: HashSet<String>,
    running_app: u32,
    /// Another device holds the host's pairing slot.
    other_device_pairing: bool,
    launch_busy: bool,
}

pub struct SimulatedHost {
    unique_id: String,
    hostname: String,
    identity: ClientIdentity,
    /// Certificate presented in TLS handshakes instead of `identity`'s.
    presented: Mutex<Option<Vec<u8>>>,
    pin: String,
    latency: Duration,
    state: Mutex<HostSim>,
    calls: AtomicUsize,
    paths: Mutex<Vec<String>>,
}

impl SimulatedHost {
    pub fn new(unique_id: &str, pin: &str) -> Arc<Self> {
        Self::with_latency(unique_id, pin, Duration::ZERO)
    }

    /// Every request sleeps `latency` before it is answered, so concurrent
    /// callers interleave.
    pub fn with_latency(unique_id: &str, pin: &str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            unique_id: unique_id.to_string(),
            hostname: "DESKTOP-SIM".to_string(),
            identity: ClientIdentity::generate().expect("host certificate"),
            presented: Mutex::new(None),
            pin: pin.to_string(),
            latency,
            state: Mutex::new(HostSim::default()),
            calls: AtomicUsize::new(0),
            paths: Mutex::new(Vec::new()),
        })
    }

    pub fn cert_der(&self) -> Vec<u8> {
        self.identity.cert_der().to_vec()
    }

    /// Certificate the host shows in a TLS handshake.
    pub fn presented_cert(&self) -> Vec<u8> {
        self.presented
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.cert_der())
    }

    /// From now on the host presents a freshly generated certificate, as a
    /// reinstalled or impersonating host would.
    pub fn present_foreign_certificate(&self) {
        let other = ClientIdentity::generate().expect("foreign certificate");
        *self.presented.lock().unwrap() = Some(other.cert_der().to_vec());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    pub fn is_paired_with(&self, client_unique_id: &str) -> bool {
        self.state.lock().unwrap().paired_clients.contains(client_unique_id)
    }

    pub fn set_running_app(&self, app_id: u32) {
        self.state.lock().unwrap().running_app = app_id;
    }

    pub fn running_app(&self) -> u32 {
        self.state.lock().unwrap().running_app
    }

    pub fn set_other_device_pairing(&self, busy: bool) {
        self.state.lock().unwrap().other_device_pairing = busy;
    }

    pub fn set_launch_busy(&self, busy: bool) {
        self.state.lock().unwrap().launch_busy = busy;
    }

    fn answer(&self, request: &ControlRequest) -> (u16, Vec<u8>) {
        let client = request.query_value("uniqueid").unwrap_or_default().to_string();
        let mut sim = self.state.lock().unwrap();
        let trusted = sim.paired_clients.contains(&client);

        if request.scheme == Scheme::Https && !trusted && request.path != "/pair" {
            return doc(401, "The client is not authorized. Certificate verification failed.", "");
        }

        match request.path {
            "/serverinfo" => {
                let paired = request.scheme == Scheme::Https && trusted;
                let body = format!(
                    "<hostname>{}</hostname><uniqueid>{}</uniqueid>\
                     <appversion>7.1.431.-1</appversion><HttpsPort>47984</HttpsPort>\
                     <PairStatus>{}</PairStatus><currentgame>{}</currentgame>\
                     <state>SUNSHINE_SERVER_{}</state><gputype>Simulated GPU</gputype>",
                    self.hostname,
                    self.unique_id,
                    u8::from(paired),
                    sim.running_app,
                    if sim.running_app != 0 { "BUSY" } else { "FREE" },
                );
                doc(200, "OK", &body)
            }
            "/pair" => self.pair_round(&mut sim, request, &client),
            "/unpair" => {
                sim.paired_clients.remove(&client);
                doc(200, "OK", "")
            }
            "/applist" => {
                let running = sim.running_app;
                let body = format!(
                    "<App><AppTitle>Desktop</AppTitle><ID>1</ID><IsRunning>{}</IsRunning></App>\
                     <App><AppTitle>Steam Big Picture</AppTitle><ID>2</ID>\
                     <IsHdrSupported>1</IsHdrSupported></App>",
                    u8::from(running == 1)
                );
                doc(200, "OK", &body)
            }
            "/launch" => {
                if sim.launch_busy {
                    return doc(503, "Host is busy", "");
                }
                if sim.running_app != 0 {
                    return doc(409, "An app is already running on this host", "");
                }
                let app_id: u32 = request
                    .query_value("appid")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default();
                sim.running_app = app_id;
                doc(
                    200,
                    "OK",
                    "<gamesession>1</gamesession>\
                     <sessionUrl0>rtsp://192.168.1.20:48010</sessionUrl0>",
                )
            }
            "/resume" => {
                let resumed = u8::from(sim.running_app != 0);
                doc(200, "OK", &format!("<resume>{resumed}</resume>"))
            }
            "/cancel" => {
                if sim.running_app == 0 {
                    return doc(599, "Invalid", "");
                }
                sim.running_app = 0;
                doc(200, "OK", "<cancel>1</cancel>")
            }
            "/appasset" => match request.query_value("appid") {
                Some("1") => (200, BOX_ART.to_vec()),
                _ => (404, Vec::new()),
            },
            other => doc(404, &format!("{other} not found"), ""),
        }
    }

    fn pair_round(
        &self,
        sim: &mut HostSim,
        request: &ControlRequest,
        client: &str,
    ) -> (u16, Vec<u8>) {
        let server_pem = self.identity.cert_pem().as_bytes();

        if request.query_value("phrase") == Some("getservercert") {
            if sim.other_device_pairing {
                return paired_doc(true, "<plaincert></plaincert>");
            }
            let salt = hex_query(request, "salt").and_then(|s| <[u8; SALT_LEN]>::try_from(s).ok());
            let salt = match salt {
                Some(salt) => salt,
                None => return paired_doc(false, ""),
            };
            let client_cert_pem = hex_query(request, "clientcert").unwrap_or_default();
            let secret = derive_pairing_secret(&self.pin, &salt, server_pem).expect("derive");
            sim.pairing = Some(PairingInProgress {
                client_unique_id: client.to_string(),
                client_cert_pem,
                secret: Some(secret),
                ..PairingInProgress::default()
            });
            return paired_doc(true, &format!("<plaincert>{}</plaincert>", hex::encode(server_pem)));
        }

        if request.query_value("phrase") == Some("pairchallenge") {
            let verified = sim
                .pairing
                .take()
                .map_or(false, |p| p.verified && p.client_unique_id == client);
            if verified {
                sim.paired_clients.insert(client.to_string());
            }
            return paired_doc(verified, "");
        }

        let Some(pairing) = sim.pairing.as_mut().filter(|p| p.client_unique_id == client) else {
            return paired_doc(false, "");
        };
        let Some(secret) = pairing.secret.clone() else {
            return paired_doc(false, "");
        };

        if let Some(sealed) = hex_query(request, "clientchallenge") {
            let Ok(client_challenge) = decrypt_and_verify(&secret, &sealed) else {
                // Wrong PIN: answer with noise the client cannot open.
                let noise: [u8; PROOF_LEN + CHALLENGE_LEN] = random_bytes();
                let sealed = encrypt_challenge(&secret, &noise).expect("seal");
                return paired_doc(true, &hex_tag("challengeresponse", &sealed));
            };
            let proof = compute_proof(
                &secret,
                ProofRole::ServerChallengeResponse,
                &[&client_challenge, server_pem],
            )
            .expect("proof");
            pairing.server_challenge = random_bytes();
            let mut reply = proof.to_vec();
            reply.extend_from_slice(&pairing.server_challenge);
            let sealed = encrypt_challenge(&secret, &reply).expect("seal");
            return paired_doc(true, &hex_tag("challengeresponse", &sealed));
        }

        if let Some(sealed) = hex_query(request, "serverchallengeresp") {
            let Ok(client_proof) = decrypt_and_verify(&secret, &sealed) else {
                return paired_doc(false, "");
            };
            let expected = compute_proof(
                &secret,
                ProofRole::ClientChallengeResponse,
                &[&pairing.server_challenge, &pairing.client_cert_pem],
            )
            .expect("proof");
            if !verify_proof(&expected, &client_proof) {
                return paired_doc(false, "");
            }
            let server_secret: [u8; PAIRING_SECRET_LEN] = random_bytes();
            let mac = compute_proof(&secret, ProofRole::ServerPairingSecret, &[&server_secret])
                .expect("mac");
            let mut signed = server_secret.to_vec();
            signed.extend_from_slice(&mac);
            return paired_doc(true, &hex_tag("pairingsecret", &signed));
        }

        if let Some(signed) = hex_query(request, "clientpairingsecret") {
            if signed.len() != PAIRING_SECRET_LEN + PROOF_LEN {
                return paired_doc(false, "");
            }
            let (client_secret, mac) = signed.split_at(PAIRING_SECRET_LEN);
            let expected = compute_proof(&secret, ProofRole::ClientPairingSecret, &[client_secret])
                .expect("mac");
            pairing.verified = verify_proof(&expected, mac);
            return paired_doc(pairing.verified, "");
        }

        paired_doc(false, "")
    }
}

#[async_trait]
impl ControlTransport for SimulatedHost {
    async fn execute(
        &self,
        request: &ControlRequest,
        _url: &Url,
        _timeout: Duration,
    ) -> Result<ControlResponse, ControlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(request.path.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let (status, body) = self.answer(request);
        decode_reply(request.response, status, body)
    }
}

fn doc(status: u16, message: &str, inner: &str) -> (u16, Vec<u8>) {
    let body = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<root status_code="{status}" status_message="{message}">{inner}</root>"#
    );
    (200, body.into_bytes())
}

fn paired_doc(paired: bool, inner: &str) -> (u16, Vec<u8>) {
    doc(200, "OK", &format!("<paired>{}</paired>{inner}", u8::from(paired)))
}

fn hex_tag(name: &str, bytes: &[u8]) -> String {
    format!("<{name}>{}</{name}>", hex::encode(bytes))
}

fn hex_query(request: &ControlRequest, key: &str) -> Option<Vec<u8>> {
    request.query_value(key).and_then(|v| hex::decode(v).ok())
}

/// TLS handshake in front of a [`SimulatedHost`].
pub struct SimulatedTls {
    host: Arc<SimulatedHost>,
    pinned: PinnedCertificate,
}

#[async_trait]
impl ControlTransport for SimulatedTls {
    async fn execute(
        &self,
        request: &ControlRequest,
        url: &Url,
        timeout: Duration,
    ) -> Result<ControlResponse, ControlError> {
        if request.scheme == Scheme::Https
            && !self.pinned.check_or_capture(&self.host.presented_cert())
        {
            return Err(ControlError::Unauthorized);
        }
        self.host.execute(request, url, timeout).await
    }
}

/// Transport for an address where nothing answers.
pub struct Unreachable;

#[async_trait]
impl ControlTransport for Unreachable {
    async fn execute(
        &self,
        _request: &ControlRequest,
        url: &Url,
        _timeout: Duration,
    ) -> Result<ControlResponse, ControlError> {
        Err(ControlError::Unreachable(format!("connection refused: {url}")))
    }
}

// ── SimulatedNetwork ──────────────────────────────────────────────────────────

/// Routes channels to simulated hosts by address.
pub struct SimulatedNetwork {
    ids: ClientIds,
    hosts: Mutex<HashMap<String, Arc<SimulatedHost>>>,
}

impl SimulatedNetwork {
    pub fn new(ids: ClientIds) -> Arc<Self> {
        Arc::new(Self {
            ids,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    pub fn attach(&self, address: &str, host: Arc<SimulatedHost>) {
        self.hosts.lock().unwrap().insert(address.to_string(), host);
    }
}

impl ChannelFactory for SimulatedNetwork {
    fn open(
        &self,
        endpoint: HostEndpoint,
        server_cert: Option<Vec<u8>>,
    ) -> Result<ControlChannel, TlsSetupError> {
        let pinned = server_cert
            .map(PinnedCertificate::with_der)
            .unwrap_or_default();
        let host = self.hosts.lock().unwrap().get(&endpoint.address).cloned();
        let transport: Arc<dyn ControlTransport> = match host {
            Some(host) => Arc::new(SimulatedTls {
                host,
                pinned: pinned.clone(),
            }),
            None => Arc::new(Unreachable),
        };
        Ok(ControlChannel::new(
            endpoint,
            self.ids.clone(),
            pinned,
            transport,
            Timeouts::default(),
        ))
    }
}

/// Host address where every connection is refused; counts the attempts.
#[derive(Default)]
pub struct RefusingHost {
    paths: Mutex<Vec<String>>,
}

impl RefusingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlTransport for RefusingHost {
    async fn execute(
        &self,
        request: &ControlRequest,
        _url: &Url,
        _timeout: Duration,
    ) -> Result<ControlResponse, ControlError> {
        self.paths.lock().unwrap().push(request.path.to_string());
        Err(ControlError::Unreachable("connection refused".to_string()))
    }
}

/// Channel to `host` with nothing pinned.
pub fn channel_to(host: Arc<dyn ControlTransport>, ids: ClientIds) -> Arc<ControlChannel> {
    Arc::new(ControlChannel::new(
        endpoint(HOST_ID, HOST_ADDRESS),
        ids,
        PinnedCertificate::empty(),
        host,
        Timeouts::default(),
    ))
}

// ── Discovery fixtures ────────────────────────────────────────────────────────

/// Prober answering from a per-address table of `(uniqueid, online)`.
/// Addresses marked hanging never answer.
pub struct ScriptedProber {
    table: Mutex<HashMap<String, (String, bool)>>,
    hanging: Mutex<HashSet<String>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(HashMap::new()),
            hanging: Mutex::new(HashSet::new()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, address: &str, unique_id: &str, online: bool) {
        self.table
            .lock()
            .unwrap()
            .insert(address.to_string(), (unique_id.to_string(), online));
    }

    pub fn set_hanging(&self, address: &str, hanging: bool) {
        let mut set = self.hanging.lock().unwrap();
        if hanging {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostProber for ScriptedProber {
    async fn probe(
        &self,
        endpoint: &HostEndpoint,
        _server_cert: Option<&[u8]>,
    ) -> Result<ServerInfo, ControlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hangs = self.hanging.lock().unwrap().contains(&endpoint.address);
        if hangs {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let entry = self.table.lock().unwrap().get(&endpoint.address).cloned();
        match entry {
            Some((id, true)) => {
                let body = format!(
                    r#"<root status_code="200"><hostname>{id}-PC</hostname>
                       <uniqueid>{id}</uniqueid><appversion>7.1.431.0</appversion></root>"#
                );
                ServerInfo::from_response(&ControlResponse::parse_document(&body)?)
            }
            _ => Err(ControlError::Unreachable(format!("no route to {}", endpoint.address))),
        }
    }
}

/// Listener recording every update it receives.
#[derive(Default)]
pub struct RecordingListener {
    updates: Mutex<Vec<HostSnapshot>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn updates(&self) -> Vec<HostSnapshot> {
        self.updates.lock().unwrap().clone()
    }
}

impl HostUpdateListener for RecordingListener {
    fn host_updated(&self, snapshot: &HostSnapshot) {
        self.updates.lock().unwrap().push(snapshot.clone());
    }
}

/// Advertisement feed driven by the test.
#[derive(Default)]
pub struct FakeFeed {
    sender: Mutex<Option<mpsc::Sender<Advertisement>>>,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn announce(&self, instance: &str, address: &str, port: u16) {
        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender
                .send(Advertisement {
                    instance: instance.to_string(),
                    address: address.to_string(),
                    ipv6_address: None,
                    port,
                })
                .await;
        }
    }
}

impl AdvertisementFeed for FakeFeed {
    fn start(&self) -> Result<mpsc::Receiver<Advertisement>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        self.sender.lock().unwrap().take();
    }
}
