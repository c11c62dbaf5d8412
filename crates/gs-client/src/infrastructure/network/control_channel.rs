//! The control channel: one host, one pinned certificate, one transport.
//!
//! # Responsibilities
//!
//! - Build requests for intents (pure, delegated to `gs_core`), stamping each
//!   with a fresh `uuid`.
//! - Pick the port for the request's scheme from the bound endpoint.
//! - Bound every call by the timeout of its class.  The transport also
//!   applies the timeout, but the outer bound holds whatever the transport
//!   does.
//! - Turn non-success statuses into [`ControlError`]s.
//!
//! Retries are never performed here.  One call, one network attempt.
//!
//! # The transport seam
//!
//! [`ControlTransport`] is the only place real I/O happens.  Production code
//! uses [`HttpTransport`] (reqwest + the pinned-certificate verifier); tests
//! substitute simulated hosts and call-counting stubs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use gs_core::protocol::{ResponseKind, Scheme, TimeoutClass};
use gs_core::{
    ClientIdentity, ClientIds, ControlError, ControlIntent, ControlRequest, ControlResponse,
    HostEndpoint,
};

use super::tls::{client_config, PinnedCertificate, TlsSetupError};

// ── Timeouts ──────────────────────────────────────────────────────────────────

/// Per-class call timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub fast_fail: Duration,
    pub interactive: Duration,
    pub pairing: Duration,
}

impl Timeouts {
    pub fn for_class(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::FastFail => self.fast_fail,
            TimeoutClass::Interactive => self.interactive,
            TimeoutClass::Pairing => self.pairing,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fast_fail: Duration::from_secs(2),
            interactive: Duration::from_secs(10),
            pairing: Duration::from_secs(60),
        }
    }
}

// ── Transport seam ────────────────────────────────────────────────────────────

/// Performs one network attempt for a fully built request.
///
/// Implementations must return the host's reply parsed into a
/// [`ControlResponse`] (any status), or a transport-level [`ControlError`].
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn execute(
        &self,
        request: &ControlRequest,
        url: &Url,
        timeout: Duration,
    ) -> Result<ControlResponse, ControlError>;
}

/// Turns an HTTP status plus body into a [`ControlResponse`].
///
/// Document replies carry their real status in the root attribute, so the
/// HTTP status is only consulted when the body is not a document.  A binary
/// request answered with 404 or an empty body yields
/// [`ControlResponse::missing_asset`].
///
/// # Errors
///
/// [`ControlError::MalformedResponse`] for a 200 reply that cannot be
/// parsed, or the HTTP status mapped through [`ControlError::from_status`]
/// for a non-200 reply that cannot be parsed.
pub fn decode_reply(
    kind: ResponseKind,
    http_status: u16,
    body: Vec<u8>,
) -> Result<ControlResponse, ControlError> {
    if kind == ResponseKind::Binary {
        if http_status == 200 && !body.is_empty() && !looks_like_document(&body) {
            return Ok(ControlResponse::binary(body));
        }
        if http_status == 404 || body.is_empty() {
            return Ok(ControlResponse::missing_asset());
        }
    }

    let parsed = std::str::from_utf8(&body)
        .map_err(|_| ControlError::MalformedResponse("reply is not UTF-8".to_string()))
        .and_then(ControlResponse::parse_document);

    match parsed {
        Ok(resp) => Ok(resp),
        Err(_) if http_status != 200 => Err(ControlError::from_status(
            u32::from(http_status),
            format!("HTTP {http_status}"),
        )),
        Err(e) => Err(e),
    }
}

fn looks_like_document(body: &[u8]) -> bool {
    let trimmed = body.iter().skip_while(|b| b.is_ascii_whitespace());
    matches!(trimmed.take(1).next(), Some(b'<'))
}

/// reqwest-backed transport sharing its [`PinnedCertificate`] with the TLS
/// verifier.
pub struct HttpTransport {
    client: reqwest::Client,
    pinned: PinnedCertificate,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`TlsSetupError`] if the TLS configuration or the HTTP client
    /// cannot be built.
    pub fn new(
        identity: Option<&ClientIdentity>,
        pinned: PinnedCertificate,
    ) -> Result<Self, TlsSetupError> {
        let tls = client_config(identity, pinned.clone())?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|e| TlsSetupError::HttpClient(e.to_string()))?;
        Ok(Self { client, pinned })
    }

    fn map_error(&self, err: &reqwest::Error, timeout: Duration) -> ControlError {
        if self.pinned.has_mismatch() || is_tls_rejection(err) {
            ControlError::Unauthorized
        } else if err.is_timeout() {
            ControlError::Timeout(timeout)
        } else {
            ControlError::Unreachable(err.to_string())
        }
    }
}

/// Walks the error chain looking for a TLS alert from the host, which is
/// how a host refuses a client certificate it does not know.
fn is_tls_rejection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let tls = e.downcast_ref::<rustls::Error>().or_else(|| {
            e.downcast_ref::<std::io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        });
        if matches!(
            tls,
            Some(rustls::Error::AlertReceived(_) | rustls::Error::InvalidCertificate(_))
        ) {
            return true;
        }
        current = e.source();
    }
    false
}

#[async_trait]
impl ControlTransport for HttpTransport {
    async fn execute(
        &self,
        request: &ControlRequest,
        url: &Url,
        timeout: Duration,
    ) -> Result<ControlResponse, ControlError> {
        let reply = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.map_error(&e, timeout))?;

        let status = reply.status().as_u16();
        let body = reply
            .bytes()
            .await
            .map_err(|e| self.map_error(&e, timeout))?;
        decode_reply(request.response, status, body.to_vec())
    }
}

// ── Control channel ───────────────────────────────────────────────────────────

/// Control channel bound to exactly one host for its whole lifetime.
pub struct ControlChannel {
    endpoint: HostEndpoint,
    ids: ClientIds,
    pinned: PinnedCertificate,
    transport: Arc<dyn ControlTransport>,
    timeouts: Timeouts,
}

impl ControlChannel {
    pub fn new(
        endpoint: HostEndpoint,
        ids: ClientIds,
        pinned: PinnedCertificate,
        transport: Arc<dyn ControlTransport>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            endpoint,
            ids,
            pinned,
            transport,
            timeouts,
        }
    }

    /// Channel over [`HttpTransport`], presenting `identity` for mutual TLS.
    ///
    /// `server_cert` is the DER certificate captured when the host was
    /// paired; `None` leaves the channel in trust-on-first-use mode.
    ///
    /// # Errors
    ///
    /// Returns [`TlsSetupError`] if the transport cannot be built.
    pub fn over_http(
        endpoint: HostEndpoint,
        ids: ClientIds,
        identity: Option<&ClientIdentity>,
        server_cert: Option<Vec<u8>>,
        timeouts: Timeouts,
    ) -> Result<Self, TlsSetupError> {
        let pinned = server_cert.map(PinnedCertificate::with_der).unwrap_or_default();
        let transport = HttpTransport::new(identity, pinned.clone())?;
        Ok(Self::new(endpoint, ids, pinned, Arc::new(transport), timeouts))
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    pub fn ids(&self) -> &ClientIds {
        &self.ids
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// The certificate slot shared with the TLS verifier.
    pub fn pinned_certificate(&self) -> &PinnedCertificate {
        &self.pinned
    }

    /// `true` once a server certificate has been captured or pinned.
    pub fn has_server_certificate(&self) -> bool {
        self.pinned.is_pinned()
    }

    /// `true` if the last request failed because the host presented a
    /// certificate other than the pinned one, as opposed to the host
    /// refusing this client's certificate.
    pub fn certificate_mismatch(&self) -> bool {
        self.pinned.has_mismatch()
    }

    /// Builds the request for `intent` with a fresh request id.
    pub fn build(&self, intent: &ControlIntent) -> ControlRequest {
        ControlRequest::build(intent, &self.ids, Uuid::new_v4())
    }

    /// Sends `request` once and returns the successful response.
    ///
    /// # Errors
    ///
    /// - [`ControlError::Unreachable`] / [`ControlError::Timeout`] when the
    ///   host could not be reached in time.
    /// - [`ControlError::Unauthorized`] on certificate mismatch or a 401;
    ///   [`ControlChannel::certificate_mismatch`] tells the two apart.
    /// - [`ControlError::ServerError`] for any other non-success status.
    /// - [`ControlError::MalformedResponse`] for an unparsable reply.
    pub async fn execute(&self, request: &ControlRequest) -> Result<ControlResponse, ControlError> {
        let port = match request.scheme {
            Scheme::Http => self.endpoint.http_port,
            Scheme::Https => self.endpoint.https_port,
        };
        let url = request.url(&self.endpoint.address, port)?;
        let timeout = self.timeouts.for_class(request.timeout);
        self.pinned.take_mismatch();

        debug!(
            host = %self.endpoint.id,
            path = request.path,
            scheme = request.scheme.as_str(),
            "control request"
        );

        let outcome = tokio::time::timeout(timeout, self.transport.execute(request, &url, timeout))
            .await
            .map_err(|_| ControlError::Timeout(timeout))
            .and_then(|r| r)
            .and_then(ControlResponse::ensure_success);

        match &outcome {
            Ok(resp) => debug!(
                host = %self.endpoint.id,
                path = request.path,
                status = resp.status_code,
                "control reply"
            ),
            Err(e) if e.is_transport() => debug!(
                host = %self.endpoint.id,
                path = request.path,
                error = %e,
                "control request failed"
            ),
            Err(e) => warn!(
                host = %self.endpoint.id,
                path = request.path,
                error = %e,
                "control request rejected"
            ),
        }
        outcome
    }

    /// Builds and executes `intent`.
    ///
    /// # Errors
    ///
    /// See [`ControlChannel::execute`].
    pub async fn send(&self, intent: &ControlIntent) -> Result<ControlResponse, ControlError> {
        let request = self.build(intent);
        self.execute(&request).await
    }
}

// ── Channel factory ───────────────────────────────────────────────────────────

/// Opens a [`ControlChannel`] for an endpoint.
///
/// Components that talk to many hosts (the client API and the discovery
/// prober) take a factory instead of a transport, so tests can hand every
/// channel the same simulated host.
pub trait ChannelFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TlsSetupError`] if the channel's transport cannot be built.
    fn open(
        &self,
        endpoint: HostEndpoint,
        server_cert: Option<Vec<u8>>,
    ) -> Result<ControlChannel, TlsSetupError>;
}

/// [`ChannelFactory`] producing [`HttpTransport`]-backed channels.
pub struct HttpChannelFactory {
    ids: ClientIds,
    identity: Option<ClientIdentity>,
    timeouts: Timeouts,
}

impl HttpChannelFactory {
    pub fn new(ids: ClientIds, identity: Option<ClientIdentity>, timeouts: Timeouts) -> Self {
        Self {
            ids,
            identity,
            timeouts,
        }
    }
}

impl ChannelFactory for HttpChannelFactory {
    fn open(
        &self,
        endpoint: HostEndpoint,
        server_cert: Option<Vec<u8>>,
    ) -> Result<ControlChannel, TlsSetupError> {
        ControlChannel::over_http(
            endpoint,
            self.ids.clone(),
            self.identity.as_ref(),
            server_cert,
            self.timeouts,
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
