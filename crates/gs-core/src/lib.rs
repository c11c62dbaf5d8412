//! # gs-core
//!
//! Shared library for the GameStream client containing the pairing
//! cryptography, the control-protocol request builder and response parser,
//! and the host/app/session domain types.
//!
//! This crate performs no network I/O and owns no async runtime.  Everything
//! here is a pure function or an immutable value, so it can be exercised
//! from unit tests without a host on the network.
//!
//! # Architecture overview
//!
//! A GameStream client talks to a streaming *host* over two HTTP ports: a
//! plaintext port used for discovery and the pairing handshake, and a TLS
//! port used for everything that requires an established pairing (app list,
//! launch, quit, box art).  This crate defines:
//!
//! - **`crypto`** – Key material and the symmetric operations of the PIN
//!   challenge/response handshake.
//!
//! - **`protocol`** – How an intent ("pair round 2", "launch app 42") becomes
//!   a concrete GET request with query parameters, and how the host's tagged
//!   key/value reply document is parsed back into typed fields.
//!
//! - **`domain`** – The records the rest of the system passes around: host
//!   endpoints, derived host state, server info, app descriptors, stream
//!   configuration and session tickets.

pub mod crypto;
pub mod domain;
pub mod protocol;

pub use crypto::{ClientIdentity, CryptoError, SharedSecret};
pub use domain::app::AppDescriptor;
pub use domain::host::{
    DiscoverySource, HostEndpoint, HostId, HostState, PairStatus, ProtocolVersion, Reachability,
    ServerInfo,
};
pub use domain::stream::{LaunchVerb, SessionTicket, StreamConfig};
pub use protocol::error::ControlError;
pub use protocol::request::{ClientIds, ControlIntent, ControlRequest, PairRound, Scheme};
pub use protocol::response::ControlResponse;
