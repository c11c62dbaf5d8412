//! Host status codes and what they mean for each kind of request.
//!
//! The host reports failures through the `status_code` attribute of the
//! response root element.  The same number can mean different things on
//! different endpoints (503 on `/pair` means another device is mid-pairing,
//! on `/launch` it means the host is busy), so interpretation is always
//! keyed by [`IntentKind`].  Codes not listed here are passed through as
//! [`StatusMeaning::Other`] rather than guessed at.

use super::request::IntentKind;

pub const OK: u32 = 200;
pub const UNAUTHORIZED: u32 = 401;
pub const NOT_FOUND: u32 = 404;
pub const APP_ALREADY_RUNNING: u32 = 409;
pub const HOST_BUSY: u32 = 503;
pub const PAIRING_IN_PROGRESS: u32 = 503;
pub const APP_NOT_RUNNING: u32 = 599;

/// Interpretation of a status code in the context of one request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMeaning {
    Ok,
    Unauthorized,
    PairingInProgress,
    HostBusy,
    AppAlreadyRunning,
    AppNotRunning,
    AssetMissing,
    Other(u32),
}

/// Classifies `code` as returned by a request of kind `kind`.
pub fn classify(kind: IntentKind, code: u32) -> StatusMeaning {
    match (kind, code) {
        (_, OK) => StatusMeaning::Ok,
        (_, UNAUTHORIZED) => StatusMeaning::Unauthorized,
        (IntentKind::Pair, PAIRING_IN_PROGRESS) => StatusMeaning::PairingInProgress,
        (IntentKind::Launch | IntentKind::Resume, HOST_BUSY) => StatusMeaning::HostBusy,
        (IntentKind::Launch | IntentKind::Resume, APP_ALREADY_RUNNING) => {
            StatusMeaning::AppAlreadyRunning
        }
        (IntentKind::Quit, APP_NOT_RUNNING) => StatusMeaning::AppNotRunning,
        (IntentKind::AppAsset, NOT_FOUND) => StatusMeaning::AssetMissing,
        (_, other) => StatusMeaning::Other(other),
    }
}
