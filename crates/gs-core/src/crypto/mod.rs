//! Cryptographic primitives for the pairing handshake.
//!
//! Nothing in this module performs I/O or keeps state between calls; every
//! function takes its inputs explicitly and returns fresh values, so the
//! whole module is safe to call from any thread.
//!
//! # Sub-modules
//!
//! - **`identity`** – The client's self-signed certificate and private key.
//!   Generated once per installation and cached by the caller.
//!
//! - **`secret`** – PIN/salt/certificate key derivation, challenge
//!   encryption, and keyed proofs used in each handshake round.

pub mod identity;
pub mod secret;

use thiserror::Error;

pub use identity::{certificate_der_from_pem, fingerprint, ClientIdentity};
pub use secret::{
    compute_proof, decrypt_and_verify, derive_pairing_secret, encrypt_challenge, generate_pin,
    generate_salt, random_bytes, verify_proof, ProofRole, SharedSecret, CHALLENGE_LEN,
    PAIRING_SECRET_LEN, PROOF_LEN, SALT_LEN,
};

/// Errors produced by the crypto engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The key-derivation function rejected its parameters.
    #[error("key derivation failed")]
    KeyDerivation,

    /// The AEAD cipher refused to encrypt the plaintext.
    #[error("challenge encryption failed")]
    EncryptFailed,

    /// The ciphertext did not authenticate under the shared secret.
    ///
    /// During pairing this means the two sides derived different secrets,
    /// which in practice means the PIN was wrong.
    #[error("ciphertext failed authentication under the shared secret")]
    DecryptFailed,

    /// The client certificate could not be generated.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// A PEM or DER certificate could not be parsed.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A PEM private key could not be parsed.
    #[error("invalid private key")]
    InvalidPrivateKey,
}
