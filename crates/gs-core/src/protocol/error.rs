//! Error taxonomy for control-channel calls.

use std::time::Duration;

use thiserror::Error;

use super::status;

/// Why a single control-channel call failed.
///
/// Every layer above the channel receives one of these unmodified, so the
/// variants are chosen to keep "the network is down" apart from "the host
/// said no" apart from "the host said something we do not understand".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No transport: connection refused, no route, DNS failure.
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// The call did not complete within its timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// TLS trust failed: the host presented a certificate other than the
    /// pinned one, or the host rejected our client certificate.
    #[error("host is not trusted or does not trust this client")]
    Unauthorized,

    /// The host answered with an explicit failure status.
    #[error("host reported status {code}: {message}")]
    ServerError { code: u32, message: String },

    /// The host answered with success but the body could not be understood.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ControlError {
    /// Builds the error for a non-success status, folding the protocol's
    /// "unauthorized" status into [`ControlError::Unauthorized`].
    pub fn from_status(code: u32, message: impl Into<String>) -> Self {
        if code == status::UNAUTHORIZED {
            ControlError::Unauthorized
        } else {
            ControlError::ServerError {
                code,
                message: message.into(),
            }
        }
    }

    /// The host-reported status code, if this error carries one.
    pub fn status_code(&self) -> Option<u32> {
        match self {
            ControlError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// `true` for failures where the host was never heard from.
    pub fn is_transport(&self) -> bool {
        matches!(self, ControlError::Unreachable(_) | ControlError::Timeout(_))
    }
}
