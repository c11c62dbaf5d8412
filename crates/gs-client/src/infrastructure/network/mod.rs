//! Network infrastructure for the client.
//!
//! # Sub-modules
//!
//! - **`tls`** – The pinned-certificate rustls verifier and the TLS client
//!   configuration carrying the client identity for mutual TLS.
//!
//! - **`control_channel`** – `ControlChannel`, bound to one host, and the
//!   `ControlTransport` seam with its reqwest implementation.  Every request
//!   the client makes goes through here.
//!
//! - **`discovery`** – mDNS browsing for `_nvstream._tcp.local.`, delivered
//!   to the discovery coordinator as a stream of advertisements.

pub mod control_channel;
pub mod discovery;
pub mod tls;

pub use control_channel::{
    decode_reply, ChannelFactory, ControlChannel, ControlTransport, HttpChannelFactory,
    HttpTransport, Timeouts,
};
pub use discovery::{Advertisement, AdvertisementFeed, DiscoveryError, MdnsFeed};
pub use tls::{PinnedCertificate, TlsSetupError};
