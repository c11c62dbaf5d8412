//! TLS trust for the control channel's HTTPS port.
//!
//! Hosts present self-signed certificates, so the usual CA-based checks are
//! useless.  Instead each control channel owns one [`PinnedCertificate`]:
//!
//! - While nothing is pinned, the first certificate a host presents is
//!   captured and accepted (trust on first use).
//! - Once a certificate is pinned (captured, or set from the `plaincert` a
//!   host sent during pairing), every later handshake must present exactly
//!   the same DER bytes or it is rejected.
//!
//! # Why a custom verifier? (for beginners)
//!
//! `rustls` normally asks a [`ServerCertVerifier`] built from a root store
//! whether to trust the server.  [`PinnedCertVerifier`] replaces that check
//! with a byte comparison against the pinned certificate.  The handshake
//! signatures are still verified with the crypto provider's algorithms, so
//! a peer that merely replays the certificate without holding its private
//! key is still rejected.
//!
//! When verification fails, the verifier sets a flag on the
//! [`PinnedCertificate`].  The HTTP transport checks that flag after a
//! failed request so the caller gets `Unauthorized` rather than a generic
//! connection error.

use std::sync::{Arc, Mutex, MutexGuard};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tracing::{debug, warn};

use gs_core::crypto::fingerprint;
use gs_core::ClientIdentity;

/// Errors raised while building the TLS client configuration.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    /// The client certificate PEM held no certificate.
    #[error("client identity has no certificate")]
    MissingCertificate,

    /// The client key PEM held no usable private key.
    #[error("client identity has no usable private key")]
    MissingPrivateKey,

    /// PEM decoding failed.
    #[error("failed to read client identity PEM: {0}")]
    Pem(#[from] std::io::Error),

    /// rustls rejected the configuration.
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    /// The HTTP client refused the TLS configuration.
    #[error("HTTP client could not be built: {0}")]
    HttpClient(String),
}

#[derive(Debug, Default)]
struct PinState {
    der: Option<Vec<u8>>,
    mismatch: bool,
}

/// The one server certificate a control channel trusts.
///
/// Cloning shares the same slot, so the channel and its verifier always see
/// the same value.
#[derive(Debug, Clone, Default)]
pub struct PinnedCertificate {
    state: Arc<Mutex<PinState>>,
}

impl PinnedCertificate {
    /// Nothing pinned yet; the next presented certificate will be captured.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pins `der` from the start.
    pub fn with_der(der: Vec<u8>) -> Self {
        let pinned = Self::default();
        pinned.pin(der);
        pinned
    }

    fn lock(&self) -> MutexGuard<'_, PinState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_pinned(&self) -> bool {
        self.lock().der.is_some()
    }

    /// Copy of the pinned DER bytes, if any.
    pub fn der(&self) -> Option<Vec<u8>> {
        self.lock().der.clone()
    }

    /// Replaces the pinned certificate.
    pub fn pin(&self, der: Vec<u8>) {
        debug!(fingerprint = %fingerprint(&der), "pinning server certificate");
        let mut state = self.lock();
        state.der = Some(der);
        state.mismatch = false;
    }

    /// Restores a previous value returned by [`PinnedCertificate::der`].
    pub fn restore(&self, previous: Option<Vec<u8>>) {
        let mut state = self.lock();
        state.der = previous;
        state.mismatch = false;
    }

    /// Captures `presented` if nothing is pinned, otherwise compares it to
    /// the pinned bytes.  Returns `false` (and records a mismatch) when the
    /// certificate is not the pinned one.
    pub fn check_or_capture(&self, presented: &[u8]) -> bool {
        let mut state = self.lock();
        match &state.der {
            None => {
                debug!(
                    fingerprint = %fingerprint(presented),
                    "captured server certificate on first use"
                );
                state.der = Some(presented.to_vec());
                true
            }
            Some(pinned) if pinned.as_slice() == presented => true,
            Some(pinned) => {
                warn!(
                    pinned = %fingerprint(pinned),
                    presented = %fingerprint(presented),
                    "server certificate does not match the pinned certificate"
                );
                state.mismatch = true;
                false
            }
        }
    }

    /// `true` if a handshake since the flag was last cleared presented a
    /// certificate other than the pinned one.
    pub fn has_mismatch(&self) -> bool {
        self.lock().mismatch
    }

    /// Returns and clears the "last handshake was rejected" flag.
    pub fn take_mismatch(&self) -> bool {
        std::mem::take(&mut self.lock().mismatch)
    }
}

/// rustls verifier that trusts exactly the pinned certificate.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned: PinnedCertificate,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(pinned: PinnedCertificate) -> Self {
        Self {
            pinned,
            provider: Arc::new(ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.pinned.check_or_capture(end_entity.as_ref()) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds the rustls client configuration for one control channel.
///
/// With an identity the client presents its certificate (mutual TLS), which
/// is how a paired host recognises it.  Without one, authenticated requests
/// will be rejected by the host but server-info probes still work.
///
/// # Errors
///
/// Returns [`TlsSetupError`] if the identity PEM cannot be read or rustls
/// rejects the configuration.
pub fn client_config(
    identity: Option<&ClientIdentity>,
    pinned: PinnedCertificate,
) -> Result<ClientConfig, TlsSetupError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(pinned)));

    let config = match identity {
        Some(identity) => {
            let (chain, key) = identity_material(identity)?;
            builder.with_client_auth_cert(chain, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn identity_material(
    identity: &ClientIdentity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsSetupError> {
    let mut cert_reader = identity.cert_pem().as_bytes();
    let chain = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(TlsSetupError::MissingCertificate);
    }

    let mut key_reader = identity.key_pem().as_bytes();
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or(TlsSetupError::MissingPrivateKey)?;
    Ok((chain, key))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_der() -> Vec<u8> {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["host.local".to_string()]).unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn verify(
        verifier: &PinnedCertVerifier,
        der: &[u8],
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = CertificateDer::from(der.to_vec());
        let name = ServerName::try_from("host.local").unwrap();
        verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn test_first_certificate_is_captured() {
        // Arrange
        let pinned = PinnedCertificate::empty();
        let verifier = PinnedCertVerifier::new(pinned.clone());
        let der = self_signed_der();

        // Act
        let result = verify(&verifier, &der);

        // Assert
        assert!(result.is_ok());
        assert_eq!(pinned.der(), Some(der));
    }

    #[test]
    fn test_same_certificate_is_accepted_again() {
        let der = self_signed_der();
        let pinned = PinnedCertificate::with_der(der.clone());
        let verifier = PinnedCertVerifier::new(pinned.clone());

        assert!(verify(&verifier, &der).is_ok());
        assert!(verify(&verifier, &der).is_ok());
        assert!(!pinned.take_mismatch());
    }

    #[test]
    fn test_different_certificate_fails_closed_and_flags_mismatch() {
        // Arrange
        let pinned = PinnedCertificate::with_der(self_signed_der());
        let verifier = PinnedCertVerifier::new(pinned.clone());

        // Act
        let result = verify(&verifier, &self_signed_der());

        // Assert
        assert!(matches!(
            result,
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        ));
        assert!(pinned.take_mismatch());
        assert!(!pinned.take_mismatch(), "flag is cleared once taken");
    }

    #[test]
    fn test_restore_puts_back_previous_pin() {
        let original = self_signed_der();
        let pinned = PinnedCertificate::with_der(original.clone());
        let previous = pinned.der();

        pinned.pin(self_signed_der());
        pinned.restore(previous);

        assert_eq!(pinned.der(), Some(original));
    }

    #[test]
    fn test_client_config_builds_with_and_without_identity() {
        let identity = ClientIdentity::generate().unwrap();
        assert!(client_config(Some(&identity), PinnedCertificate::empty()).is_ok());
        assert!(client_config(None, PinnedCertificate::empty()).is_ok());
    }
}
