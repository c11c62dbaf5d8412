//! Pairing secret derivation and the symmetric operations built on it.
//!
//! # How the PIN turns into a key
//!
//! ```text
//! secret = HKDF-SHA256(salt = pairing salt,
//!                      ikm  = PIN bytes,
//!                      info = "gamestream-pairing-v1" || SHA-256(server certificate))
//! ```
//!
//! Binding the server certificate into `info` means a man in the middle who
//! swaps the certificate during round 1 ends up with a different secret than
//! the client, and the handshake fails at round 2 just like a wrong PIN.
//!
//! Challenges are sealed with ChaCha20-Poly1305 under that secret.  The
//! 96-bit nonce is random and travels in front of the ciphertext:
//!
//! ```text
//! [nonce:12][ciphertext:N][tag:16]
//! ```

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// Length of the client-generated pairing salt.
pub const SALT_LEN: usize = 16;
/// Length of the random challenges exchanged in rounds 2 and 3.
pub const CHALLENGE_LEN: usize = 16;
/// Length of the random pairing secrets exchanged in rounds 3 and 4.
pub const PAIRING_SECRET_LEN: usize = 16;
/// Length of an HMAC-SHA256 proof.
pub const PROOF_LEN: usize = 32;

const SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const DERIVATION_LABEL: &[u8] = b"gamestream-pairing-v1";

type HmacSha256 = Hmac<Sha256>;

/// Symmetric key shared by client and host for one pairing attempt.
///
/// Wiped from memory when dropped.  Equality is constant-time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SECRET_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq::constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Which party produced a proof, and for which round.
///
/// Each role uses its own HMAC label so a proof captured in one round can
/// never be replayed as the answer to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofRole {
    /// Host's answer to the client challenge (round 2).
    ServerChallengeResponse,
    /// Client's answer to the host challenge (round 3).
    ClientChallengeResponse,
    /// MAC over the host's pairing secret (round 3 reply).
    ServerPairingSecret,
    /// MAC over the client's pairing secret (round 4).
    ClientPairingSecret,
}

impl ProofRole {
    fn label(self) -> &'static [u8] {
        match self {
            ProofRole::ServerChallengeResponse => b"server-challenge-response",
            ProofRole::ClientChallengeResponse => b"client-challenge-response",
            ProofRole::ServerPairingSecret => b"server-pairing-secret",
            ProofRole::ClientPairingSecret => b"client-pairing-secret",
        }
    }
}

/// Derives the handshake key from the PIN, the salt, and the host certificate.
///
/// Deterministic: identical inputs always yield a byte-identical secret.  The
/// PIN only ever flows through HKDF-Extract, so the work done does not depend
/// on its contents and there is no comparison to exit early from.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF rejects the output length.
pub fn derive_pairing_secret(
    pin: &str,
    salt: &[u8; SALT_LEN],
    server_cert: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let cert_digest = Sha256::digest(server_cert);
    let mut info = Vec::with_capacity(DERIVATION_LABEL.len() + cert_digest.len());
    info.extend_from_slice(DERIVATION_LABEL);
    info.extend_from_slice(&cert_digest);

    let hkdf = Hkdf::<Sha256>::new(Some(salt), pin.as_bytes());
    let mut okm = [0u8; SECRET_LEN];
    hkdf.expand(&info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(SharedSecret(okm))
}

/// Seals `plaintext` under `secret`, prefixing a fresh random nonce.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptFailed`] if the cipher rejects the input.
pub fn encrypt_challenge(secret: &SharedSecret, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
    let nonce_bytes: [u8; NONCE_LEN] = random_bytes();
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Opens a ciphertext produced by [`encrypt_challenge`].
///
/// # Errors
///
/// Returns [`CryptoError::DecryptFailed`] if the input is truncated or does
/// not authenticate under `secret`.
pub fn decrypt_and_verify(
    secret: &SharedSecret,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptFailed);
    }
    let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Computes the keyed proof for `role` over the concatenation of `parts`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the MAC cannot be keyed.
pub fn compute_proof(
    secret: &SharedSecret,
    role: ProofRole,
    parts: &[&[u8]],
) -> Result<[u8; PROOF_LEN], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(role.label());
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();
    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(&digest);
    Ok(proof)
}

/// Constant-time comparison of an expected proof with a received one.
pub fn verify_proof(expected: &[u8], received: &[u8]) -> bool {
    constant_time_eq::constant_time_eq(expected, received)
}

/// Fills an `N`-byte array from the thread-local CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Generates the per-attempt pairing salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    random_bytes()
}

/// Generates a random 4-digit PIN for display to the user.
pub fn generate_pin() -> String {
    let n: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{n:04}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
