//! Application layer use cases for the GameStream client.
//!
//! # What use cases does the client have? (for beginners)
//!
//! - **`discover_hosts`** – Finds hosts on the LAN from mDNS advertisements
//!   and keeps their state fresh with periodic fast-fail `/serverinfo`
//!   probes.  Probes run concurrently; stopping discovery cancels them.
//!
//! - **`host_registry`** – The table of tracked hosts behind discovery,
//!   keyed by the host's stable `uniqueid`.  Pure state, no I/O.
//!
//! - **`pair_host`** – The five-round PIN handshake that makes a host trust
//!   this client's certificate, as an explicit state machine.
//!
//! - **`negotiate_session`** – Everything after pairing: server info, app
//!   list, launch, resume, quit and box art.
//!
//! - **`client_api`** – `GameStreamClient`, the facade a front end uses.  It
//!   opens one control channel per host operation and remembers the
//!   certificates of paired hosts.

pub mod client_api;
pub mod discover_hosts;
pub mod host_registry;
pub mod negotiate_session;
pub mod pair_host;
