//! Infrastructure layer for the GameStream client.
//!
//! Contains the adapters that touch the outside world: the HTTP(S) control
//! channel and its TLS trust, the mDNS advertisement feed, and the TOML
//! files the command-line front end reads and writes.
//!
//! The application layer drives the network adapters through the
//! [`network::ControlTransport`] and [`network::AdvertisementFeed`] traits.
//! Only `main.rs` touches `storage`.

pub mod network;
pub mod storage;
