//! Records passed between discovery, pairing and session negotiation.

pub mod app;
pub mod host;
pub mod stream;
