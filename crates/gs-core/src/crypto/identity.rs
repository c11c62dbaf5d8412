//! Client identity: a self-signed certificate plus its private key.
//!
//! The identity is the durable pairing credential.  A host that completed
//! the PIN handshake with a client remembers that client's certificate and
//! from then on accepts it for mutual TLS without a PIN.  Regenerating the
//! identity therefore silently unpairs the client from every host, which is
//! why callers generate it once and persist it.

use std::fmt;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};

use super::CryptoError;

/// Common name placed in the client certificate subject.
pub const CLIENT_CERT_COMMON_NAME: &str = "NVIDIA GameStream Client";

/// A client certificate and the private key that signs for it.
///
/// Both halves are kept as PEM text because that is what the control
/// protocol transmits (`clientcert`) and what TLS client authentication
/// consumes.  The DER form of the certificate is cached for hashing.
#[derive(Clone)]
pub struct ClientIdentity {
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
}

impl ClientIdentity {
    /// Generates a fresh self-signed certificate and key pair.
    ///
    /// Every call produces new key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CertificateGeneration`] if the key pair or the
    /// certificate cannot be created.
    pub fn generate() -> Result<Self, CryptoError> {
        let key_pair =
            KeyPair::generate().map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, CLIENT_CERT_COMMON_NAME);
        params.distinguished_name = subject;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: cert.der().to_vec(),
        })
    }

    /// Restores a previously generated identity from its PEM halves.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] or
    /// [`CryptoError::InvalidPrivateKey`] if either half does not parse.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CryptoError> {
        let cert_der = certificate_der_from_pem(cert_pem.as_bytes())?;

        let mut reader: &[u8] = key_pem.as_bytes();
        match rustls_pemfile::private_key(&mut reader) {
            Ok(Some(_)) => {}
            _ => return Err(CryptoError::InvalidPrivateKey),
        }

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Short hex fingerprint of the certificate, safe to log.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_der)
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("fingerprint", &self.fingerprint())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Extracts the first certificate from a PEM document as DER bytes.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidCertificate`] if the document contains no
/// parsable `CERTIFICATE` block.
pub fn certificate_der_from_pem(pem: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut reader: &[u8] = pem;
    let result = match rustls_pemfile::certs(&mut reader).next() {
        Some(Ok(der)) => Ok(der.as_ref().to_vec()),
        Some(Err(e)) => Err(CryptoError::InvalidCertificate(e.to_string())),
        None => Err(CryptoError::InvalidCertificate(
            "no CERTIFICATE block in PEM".to_string(),
        )),
    };
    result
}

/// First eight bytes of the SHA-256 digest of `der`, hex-encoded.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    hex::encode(&digest[..8])
}

// ── Tests ─────────────────────────────────────────────────────────────────────
