//! Control protocol: request construction, response parsing, status codes.
//!
//! Everything here is pure.  Sending a [`ControlRequest`] and turning the
//! reply into a [`ControlResponse`] is the job of the control channel in the
//! client crate.

pub mod error;
pub mod request;
pub mod response;
pub mod status;

pub use error::ControlError;
pub use request::{
    authority, ClientIds, ControlIntent, ControlRequest, IntentKind, PairRound, ResponseKind,
    Scheme, TimeoutClass,
};
pub use response::{ControlResponse, ResponseRecord};
pub use status::{classify, StatusMeaning};

/// Default plaintext port for server info, pairing and unpairing.
pub const DEFAULT_HTTP_PORT: u16 = 47989;
/// Default TLS port for authenticated operations.
pub const DEFAULT_HTTPS_PORT: u16 = 47984;
