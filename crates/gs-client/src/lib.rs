//! gs-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does gs-client do? (for beginners)
//!
//! A GameStream *host* is a PC that streams games.  Before it streams
//! anything, a client has to:
//!
//! 1. Find it, either from the host's mDNS advertisement or by polling an
//!    address the user typed in.
//! 2. Pair with it once: the user enters a 4-digit PIN on the host, and
//!    both sides prove they know it.  Afterwards the host trusts the
//!    client's certificate and the client pins the host's.
//! 3. Negotiate a session over HTTPS: list apps, launch or resume one, quit
//!    it, fetch box art.
//!
//! The video/audio stream itself is out of scope: a successful launch
//! yields a `SessionTicket` with everything a streaming engine needs.

/// Application layer: discovery, pairing, and session use cases.
pub mod application;

/// Infrastructure layer: control channel, TLS, mDNS, and file storage.
pub mod infrastructure;
