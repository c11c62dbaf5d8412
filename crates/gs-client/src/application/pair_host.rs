//! PairHost: the PIN challenge/response handshake with one host.
//!
//! # Handshake overview (for beginners)
//!
//! Pairing teaches a host to trust this client's certificate.  The user
//! types the same PIN on both sides; each side turns the PIN into a key and
//! proves to the other that it holds the same key, without ever sending the
//! PIN itself.
//!
//! ```text
//! Idle ─► SaltSent ─► ClientCertSent ─► ChallengeSent ─► ChallengeRespSent ─► SecretSent ─► Paired
//!  │        │            │                 │                 │                   │
//!  └────────┴────────────┴─────────────────┴─────────────────┴───────────────────┴─► Failed
//! ```
//!
//! | Round | Client sends                         | Host answers                       |
//! |-------|--------------------------------------|------------------------------------|
//! | 1     | salt + client certificate            | host certificate (`plaincert`)     |
//! | 2     | sealed client challenge              | sealed proof + host challenge      |
//! | 3     | sealed proof of the host challenge   | host pairing secret + MAC          |
//! | 4     | client pairing secret + MAC          | acknowledgement                    |
//! | 5     | confirmation over TLS                | acknowledgement                    |
//!
//! A wrong PIN shows up in round 2: the host's reply does not open under the
//! client's key, and the attempt fails with [`PairingFailure::SecretMismatch`].
//!
//! Rounds run strictly one after another.  Once a round has started it runs
//! to completion or to its timeout; there is no mid-round cancellation.  A
//! failed attempt cannot be resumed: the next [`PairingStateMachine::pair`]
//! starts from `Idle` with a new salt.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gs_core::crypto::{
    certificate_der_from_pem, compute_proof, decrypt_and_verify, derive_pairing_secret,
    encrypt_challenge, fingerprint, generate_salt, random_bytes, verify_proof, ProofRole,
    CHALLENGE_LEN, PAIRING_SECRET_LEN, PROOF_LEN, SALT_LEN,
};
use gs_core::protocol::{classify, IntentKind, StatusMeaning};
use gs_core::{
    ClientIdentity, ControlError, ControlIntent, ControlResponse, CryptoError, HostId, PairRound,
    PairStatus, SharedSecret,
};

use crate::infrastructure::network::ControlChannel;

// ── Failure reasons ───────────────────────────────────────────────────────────

/// Why a pairing attempt ended in `Failed`.
///
/// `SecretMismatch` and `AlreadyPairing` are only ever produced by the
/// handshake logic itself, never from a transport error, so a front end can
/// safely re-prompt for the PIN on `SecretMismatch`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingFailure {
    /// Round 1 returned no certificate, or one that does not parse.
    #[error("host did not supply a usable certificate")]
    NoServerCert,

    /// The two sides derived different secrets (wrong PIN).
    #[error("PIN did not match")]
    SecretMismatch,

    /// Another pairing with this host is already in progress, here or on
    /// the host.
    #[error("a pairing attempt with this host is already in progress")]
    AlreadyPairing,

    /// The host answered a round with `paired=0`.
    #[error("host declined the pairing request")]
    Declined,

    #[error("pairing cryptography failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Control(ControlError),

    /// A round was attempted from the wrong handshake state.
    #[error("handshake step out of order: {0}")]
    OutOfOrder(String),
}

impl PairingFailure {
    /// Maps a control-channel error from a `/pair` round, folding the
    /// "pairing in progress" status into [`PairingFailure::AlreadyPairing`].
    pub fn from_control(err: ControlError) -> Self {
        match err.status_code().map(|code| classify(IntentKind::Pair, code)) {
            Some(StatusMeaning::PairingInProgress) => PairingFailure::AlreadyPairing,
            _ => PairingFailure::Control(err),
        }
    }

    /// Pairing status a tracked host should show after this failure.
    pub fn pair_status(&self) -> PairStatus {
        match self {
            PairingFailure::SecretMismatch => PairStatus::PinWrong,
            _ => PairStatus::Failed,
        }
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Handshake progress of one pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    SaltSent,
    ClientCertSent,
    ChallengeSent,
    ChallengeRespSent,
    SecretSent,
    Paired,
    Failed(PairingFailure),
}

/// Something that happened during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    SaltSent,
    ServerCertAccepted,
    ChallengeSent,
    ChallengeResponseSent,
    SecretSent,
    Confirmed,
    Fail(PairingFailure),
}

/// Returned when an event does not apply to the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply {event} in state {from}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: &'static str,
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Paired | PairingState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PairingState::Idle => "Idle",
            PairingState::SaltSent => "SaltSent",
            PairingState::ClientCertSent => "ClientCertSent",
            PairingState::ChallengeSent => "ChallengeSent",
            PairingState::ChallengeRespSent => "ChallengeRespSent",
            PairingState::SecretSent => "SecretSent",
            PairingState::Paired => "Paired",
            PairingState::Failed(_) => "Failed",
        }
    }

    /// Applies `event`, rejecting anything but the next step in order (or a
    /// failure from a non-terminal state).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves no partial state behind.
    pub fn transition(self, event: PairingEvent) -> Result<PairingState, InvalidTransition> {
        use PairingEvent as E;
        use PairingState as S;

        match (self, event) {
            (S::Idle, E::SaltSent) => Ok(S::SaltSent),
            (S::SaltSent, E::ServerCertAccepted) => Ok(S::ClientCertSent),
            (S::ClientCertSent, E::ChallengeSent) => Ok(S::ChallengeSent),
            (S::ChallengeSent, E::ChallengeResponseSent) => Ok(S::ChallengeRespSent),
            (S::ChallengeRespSent, E::SecretSent) => Ok(S::SecretSent),
            (S::SecretSent, E::Confirmed) => Ok(S::Paired),
            (from, E::Fail(reason)) if !from.is_terminal() => Ok(S::Failed(reason)),
            (from, event) => Err(InvalidTransition {
                from: from.name(),
                event: event.name(),
            }),
        }
    }
}

impl PairingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PairingEvent::SaltSent => "SaltSent",
            PairingEvent::ServerCertAccepted => "ServerCertAccepted",
            PairingEvent::ChallengeSent => "ChallengeSent",
            PairingEvent::ChallengeResponseSent => "ChallengeResponseSent",
            PairingEvent::SecretSent => "SecretSent",
            PairingEvent::Confirmed => "Confirmed",
            PairingEvent::Fail(_) => "Fail",
        }
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingState::Failed(reason) => write!(f, "Failed({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

// ── One-per-host guard ────────────────────────────────────────────────────────

/// Hosts with a pairing attempt in progress, shared by every state machine
/// of one client.
#[derive(Debug, Clone, Default)]
pub struct PairingRegistry {
    active: Arc<Mutex<HashSet<HostId>>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<HostId>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `host`, or returns `None` if an attempt is already running.
    /// The claim is released when the guard drops.
    pub fn try_begin(&self, host: &HostId) -> Option<PairingGuard> {
        if self.lock().insert(host.clone()) {
            Some(PairingGuard {
                registry: self.clone(),
                host: host.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_pairing(&self, host: &HostId) -> bool {
        self.lock().contains(host)
    }
}

/// Releases a [`PairingRegistry`] claim on drop.
#[derive(Debug)]
pub struct PairingGuard {
    registry: PairingRegistry,
    host: HostId,
}

impl Drop for PairingGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.host);
    }
}

// ── Result handed to the caller ───────────────────────────────────────────────

/// The durable result of a successful pairing.  The caller persists it keyed
/// by `host_id`; this crate never writes it anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCredential {
    pub host_id: HostId,
    /// Host certificate as received in round 1.
    pub server_cert_pem: String,
    /// DER form of the same certificate, pinned for later TLS calls.
    pub server_cert_der: Vec<u8>,
    /// The client certificate the host now trusts.
    pub client_cert_pem: String,
}

// ── Ephemeral session ─────────────────────────────────────────────────────────

/// Everything one `pair()` call knows.  Dropped when the call returns.
struct PairingSession {
    state: PairingState,
    salt: [u8; SALT_LEN],
    server_cert_pem: Vec<u8>,
    secret: Option<SharedSecret>,
    /// The host answered round 1, so it holds half-finished state for us.
    salt_accepted: bool,
}

impl PairingSession {
    fn new() -> Self {
        Self {
            state: PairingState::Idle,
            salt: generate_salt(),
            server_cert_pem: Vec::new(),
            secret: None,
            salt_accepted: false,
        }
    }

    fn secret(&self) -> Result<&SharedSecret, PairingFailure> {
        self.secret
            .as_ref()
            .ok_or_else(|| PairingFailure::OutOfOrder("no shared secret derived yet".to_string()))
    }
}

// ── PairingStateMachine ───────────────────────────────────────────────────────

/// Drives the handshake for the one host its channel is bound to.
pub struct PairingStateMachine {
    channel: Arc<ControlChannel>,
    identity: ClientIdentity,
    registry: PairingRegistry,
    observer: Option<mpsc::UnboundedSender<PairingState>>,
}

impl PairingStateMachine {
    pub fn new(
        channel: Arc<ControlChannel>,
        identity: ClientIdentity,
        registry: PairingRegistry,
    ) -> Self {
        Self {
            channel,
            identity,
            registry,
            observer: None,
        }
    }

    /// Reports every state the handshake enters on `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<PairingState>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn host_id(&self) -> &HostId {
        &self.channel.endpoint().id
    }

    /// Runs the full handshake with `pin`.
    ///
    /// On success the host's certificate stays pinned on the channel, so
    /// later HTTPS calls through it verify against that certificate.
    ///
    /// # Errors
    ///
    /// Returns the [`PairingFailure`] the attempt ended with.  A second call
    /// while one is running for the same host fails with
    /// [`PairingFailure::AlreadyPairing`] before any network traffic.
    pub async fn pair(&self, pin: &str) -> Result<PairingCredential, PairingFailure> {
        let host_id = self.host_id().clone();
        let Some(_guard) = self.registry.try_begin(&host_id) else {
            debug!(host = %host_id, "pairing rejected locally: attempt already running");
            return Err(PairingFailure::AlreadyPairing);
        };

        info!(host = %host_id, client = %self.identity.fingerprint(), "pairing started");
        let previous_pin = self.channel.pinned_certificate().der();
        let mut session = PairingSession::new();

        match self.run(&mut session, pin).await {
            Ok(credential) => {
                info!(
                    host = %host_id,
                    server = %fingerprint(&credential.server_cert_der),
                    "pairing complete"
                );
                Ok(credential)
            }
            Err(reason) => {
                self.channel.pinned_certificate().restore(previous_pin);
                // The failure itself is the outcome, so an invalid transition
                // here is ignored.
                let _ = self.advance(&mut session, PairingEvent::Fail(reason.clone()));
                warn!(host = %host_id, reason = %reason, "pairing failed");

                if session.salt_accepted && reason != PairingFailure::AlreadyPairing {
                    self.abandon_on_host().await;
                }
                Err(reason)
            }
        }
    }

    /// Asks the host to forget this client.  Idempotent on the host side.
    ///
    /// # Errors
    ///
    /// Returns the [`ControlError`] of the request.  Local credentials are
    /// caller-owned and unaffected either way.
    pub async fn unpair(&self) -> Result<(), ControlError> {
        self.channel.send(&ControlIntent::Unpair).await?;
        info!(host = %self.host_id(), "unpaired");
        Ok(())
    }

    async fn run(
        &self,
        s: &mut PairingSession,
        pin: &str,
    ) -> Result<PairingCredential, PairingFailure> {
        let server_cert_der = self.exchange_certificates(s).await?;
        self.send_client_challenge(s, pin).await?;
        self.send_secret(s).await?;
        self.confirm(s).await?;

        let server_cert_pem =
            String::from_utf8(s.server_cert_pem.clone()).map_err(|_| PairingFailure::NoServerCert)?;
        Ok(PairingCredential {
            host_id: self.host_id().clone(),
            server_cert_pem,
            server_cert_der,
            client_cert_pem: self.identity.cert_pem().to_string(),
        })
    }

    /// Round 1: salt and client certificate out, host certificate back.
    async fn exchange_certificates(
        &self,
        s: &mut PairingSession,
    ) -> Result<Vec<u8>, PairingFailure> {
        self.advance(s, PairingEvent::SaltSent)?;
        let resp = self
            .round(PairRound::GetServerCert {
                salt: s.salt,
                client_cert_pem: self.identity.cert_pem().to_string(),
            })
            .await?;
        s.salt_accepted = true;
        require_paired(&resp)?;

        s.server_cert_pem = server_certificate(&resp)?;
        let der = certificate_der_from_pem(&s.server_cert_pem)
            .map_err(|_| PairingFailure::NoServerCert)?;
        self.channel.pinned_certificate().pin(der.clone());
        self.advance(s, PairingEvent::ServerCertAccepted)?;
        Ok(der)
    }

    /// Rounds 2 and 3: prove possession of the PIN-derived secret both ways.
    async fn send_client_challenge(
        &self,
        s: &mut PairingSession,
        pin: &str,
    ) -> Result<(), PairingFailure> {
        s.secret = Some(derive_pairing_secret(pin, &s.salt, &s.server_cert_pem)?);
        let secret = s.secret()?.clone();

        let client_challenge: [u8; CHALLENGE_LEN] = random_bytes();
        let encrypted_challenge = encrypt_challenge(&secret, &client_challenge)?;
        self.advance(s, PairingEvent::ChallengeSent)?;
        let resp = self
            .round(PairRound::ClientChallenge { encrypted_challenge })
            .await?;
        require_paired(&resp)?;

        let sealed = hex_field(&resp, "challengeresponse")?;
        let opened =
            decrypt_and_verify(&secret, &sealed).map_err(|_| PairingFailure::SecretMismatch)?;
        if opened.len() != PROOF_LEN + CHALLENGE_LEN {
            return Err(malformed("challengeresponse has the wrong length"));
        }
        let (server_proof, server_challenge) = opened.split_at(PROOF_LEN);
        let expected = compute_proof(
            &secret,
            ProofRole::ServerChallengeResponse,
            &[&client_challenge, &s.server_cert_pem],
        )?;
        if !verify_proof(&expected, server_proof) {
            return Err(PairingFailure::SecretMismatch);
        }
        debug!(host = %self.host_id(), "host proved the shared secret");

        let client_proof = compute_proof(
            &secret,
            ProofRole::ClientChallengeResponse,
            &[server_challenge, self.identity.cert_pem().as_bytes()],
        )?;
        let encrypted_response = encrypt_challenge(&secret, &client_proof)?;
        self.advance(s, PairingEvent::ChallengeResponseSent)?;
        let resp = self
            .round(PairRound::ServerChallengeResponse { encrypted_response })
            .await?;
        require_paired(&resp)?;

        let signed = hex_field(&resp, "pairingsecret")?;
        if signed.len() != PAIRING_SECRET_LEN + PROOF_LEN {
            return Err(malformed("pairingsecret has the wrong length"));
        }
        let (server_secret, mac) = signed.split_at(PAIRING_SECRET_LEN);
        let expected = compute_proof(&secret, ProofRole::ServerPairingSecret, &[server_secret])?;
        if !verify_proof(&expected, mac) {
            return Err(PairingFailure::SecretMismatch);
        }
        Ok(())
    }

    /// Round 4: the client's own pairing secret, MACed.
    async fn send_secret(&self, s: &mut PairingSession) -> Result<(), PairingFailure> {
        let client_secret: [u8; PAIRING_SECRET_LEN] = random_bytes();
        let mac = compute_proof(s.secret()?, ProofRole::ClientPairingSecret, &[&client_secret])?;
        let mut signed_secret = Vec::with_capacity(PAIRING_SECRET_LEN + PROOF_LEN);
        signed_secret.extend_from_slice(&client_secret);
        signed_secret.extend_from_slice(&mac);

        self.advance(s, PairingEvent::SecretSent)?;
        let resp = self
            .round(PairRound::ClientPairingSecret { signed_secret })
            .await?;
        require_paired(&resp)
    }

    /// Round 5: confirmation over TLS, presenting the client certificate and
    /// verifying the host against the certificate pinned in round 1.
    async fn confirm(&self, s: &mut PairingSession) -> Result<(), PairingFailure> {
        let resp = self.round(PairRound::PairChallenge).await?;
        require_paired(&resp)?;
        self.advance(s, PairingEvent::Confirmed)
    }

    async fn round(&self, round: PairRound) -> Result<ControlResponse, PairingFailure> {
        self.channel
            .send(&ControlIntent::Pair(round))
            .await
            .map_err(PairingFailure::from_control)
    }

    fn advance(&self, s: &mut PairingSession, event: PairingEvent) -> Result<(), PairingFailure> {
        let current = std::mem::replace(&mut s.state, PairingState::Idle);
        match current.clone().transition(event) {
            Ok(next) => {
                debug!(host = %self.host_id(), state = %next, "pairing state");
                if let Some(observer) = &self.observer {
                    let _ = observer.send(next.clone());
                }
                s.state = next;
                Ok(())
            }
            Err(invalid) => {
                s.state = current;
                Err(PairingFailure::OutOfOrder(invalid.to_string()))
            }
        }
    }

    /// Best-effort `/unpair` so the host drops its half-finished state.
    async fn abandon_on_host(&self) {
        if let Err(e) = self.channel.send(&ControlIntent::Unpair).await {
            warn!(
                host = %self.host_id(),
                error = %e,
                "cleanup unpair after failed pairing did not succeed"
            );
        }
    }
}

// ── Reply helpers ─────────────────────────────────────────────────────────────

fn malformed(msg: &str) -> PairingFailure {
    PairingFailure::Control(ControlError::MalformedResponse(msg.to_string()))
}

/// Every `/pair` reply carries `paired`; `0` means the host said no.
fn require_paired(resp: &ControlResponse) -> Result<(), PairingFailure> {
    match resp.field("paired") {
        Some("1") => Ok(()),
        Some(_) => Err(PairingFailure::Declined),
        None => Err(malformed("missing <paired>")),
    }
}

/// PEM bytes of the host certificate from a round-1 reply.  An empty
/// `plaincert` means the host is mid-pairing with another device.
fn server_certificate(resp: &ControlResponse) -> Result<Vec<u8>, PairingFailure> {
    match resp.field("plaincert") {
        None => Err(PairingFailure::NoServerCert),
        Some("") => Err(PairingFailure::AlreadyPairing),
        Some(hex_pem) => hex::decode(hex_pem).map_err(|_| PairingFailure::NoServerCert),
    }
}

fn hex_field(resp: &ControlResponse, name: &str) -> Result<Vec<u8>, PairingFailure> {
    let value = resp
        .require_field(name)
        .map_err(PairingFailure::Control)?;
    hex::decode(value).map_err(|_| malformed(&format!("<{name}> is not hex")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
