//! Storage infrastructure: configuration and credential files.
//!
//! - **`config`** – `config.toml`: client ids, ports, timeouts, discovery
//!   cadence, and statically known hosts.  Defaults apply when the file is
//!   missing (first run).
//! - **`credentials`** – `credentials.toml`: the client identity generated
//!   once per installation, plus the server certificate captured for every
//!   paired host.
//!
//! The discovery, pairing and session components never read these files.
//! The binary loads them and hands the values in, and writes back whatever
//! a pairing or unpairing produced.

pub mod config;
pub mod credentials;
