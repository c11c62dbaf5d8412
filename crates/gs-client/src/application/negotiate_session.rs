//! NegotiateSession: server info, app list, launch/resume/quit, box art.
//!
//! Everything here is one request through the host's [`ControlChannel`]
//! plus interpretation of the reply.  Status codes are interpreted per
//! request kind (see `gs_core::protocol::status`), so a 503 means
//! `HostBusy` on launch but something else elsewhere.
//!
//! Version gating is left to the caller: [`ServerInfo::app_version`] is
//! surfaced unchanged and nothing in this module branches on it.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use gs_core::protocol::{classify, IntentKind, StatusMeaning};
use gs_core::{
    AppDescriptor, ControlError, ControlIntent, LaunchVerb, ServerInfo, SessionTicket, StreamConfig,
};

use crate::infrastructure::network::ControlChannel;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The channel holds no pinned host certificate, so the host has never
    /// been paired from here.
    #[error("host is not paired with this client")]
    NotPaired,

    #[error("host is busy with another session")]
    HostBusy,

    #[error("another app is already running on the host")]
    AppAlreadyRunning,

    #[error("launch requires an app id")]
    MissingAppId,

    /// The host answered with success status but refused the action.
    #[error("host refused the request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Control(#[from] ControlError),
}

impl SessionError {
    /// Maps a channel error from a request of `kind` onto the session
    /// conflicts it may signal.  Unrecognised codes stay `ServerError`.
    fn from_control(kind: IntentKind, err: ControlError) -> Self {
        match err.status_code().map(|code| classify(kind, code)) {
            Some(StatusMeaning::HostBusy) => SessionError::HostBusy,
            Some(StatusMeaning::AppAlreadyRunning) => SessionError::AppAlreadyRunning,
            _ => SessionError::Control(err),
        }
    }
}

/// Session-level requests against one host.
pub struct SessionNegotiator {
    channel: Arc<ControlChannel>,
}

impl SessionNegotiator {
    pub fn new(channel: Arc<ControlChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    /// Fetches `/serverinfo`.
    ///
    /// With a pinned certificate the request goes over HTTPS, where the
    /// host reports the real pairing status; if the host rejects the client
    /// certificate it falls back to plaintext.  Plaintext replies always
    /// read as unpaired.  A host presenting a certificate other than the
    /// pinned one fails closed with [`ControlError::Unauthorized`] and no
    /// plaintext retry.
    ///
    /// `fast_fail` selects the short discovery timeout.
    ///
    /// # Errors
    ///
    /// Returns the [`ControlError`] of the last attempt.
    pub async fn get_server_info(&self, fast_fail: bool) -> Result<ServerInfo, ControlError> {
        if self.channel.has_server_certificate() {
            match self.fetch_server_info(fast_fail, true).await {
                Ok(info) => return Ok(info),
                Err(ControlError::Unauthorized) if self.channel.certificate_mismatch() => {
                    warn!(
                        host = %self.channel.endpoint().id,
                        "host certificate changed since pairing, refusing to fall back"
                    );
                    return Err(ControlError::Unauthorized);
                }
                Err(ControlError::Unauthorized) => {
                    debug!(
                        host = %self.channel.endpoint().id,
                        "secure serverinfo refused, retrying in plaintext"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        let mut info = self.fetch_server_info(fast_fail, false).await?;
        info.paired = false;
        Ok(info)
    }

    async fn fetch_server_info(
        &self,
        fast_fail: bool,
        secure: bool,
    ) -> Result<ServerInfo, ControlError> {
        let resp = self
            .channel
            .send(&ControlIntent::ServerInfo { fast_fail, secure })
            .await?;
        ServerInfo::from_response(&resp)
    }

    /// Lists the host's apps, marking the one currently running.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotPaired`] without a pinned certificate, otherwise
    /// the channel error.
    pub async fn list_apps(&self) -> Result<Vec<AppDescriptor>, SessionError> {
        self.require_paired()?;
        let resp = self.channel.send(&ControlIntent::AppList).await?;

        let current_game = match self.get_server_info(false).await {
            Ok(info) => info.current_game,
            Err(e) => {
                debug!(error = %e, "could not read currentgame; running flags from app list only");
                0
            }
        };
        Ok(AppDescriptor::list_from_response(&resp, current_game)?)
    }

    /// Starts `app_id` cold (`Launch`) or rejoins the running session
    /// (`Resume`, which ignores `app_id`).
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotPaired`] without a pinned certificate.
    /// - [`SessionError::MissingAppId`] for a launch without an app.
    /// - [`SessionError::HostBusy`] / [`SessionError::AppAlreadyRunning`]
    ///   from the host's status.
    /// - [`SessionError::Rejected`] when the host answers `0` in the result
    ///   tag.
    pub async fn launch_or_resume(
        &self,
        verb: LaunchVerb,
        app_id: Option<&str>,
        config: &StreamConfig,
    ) -> Result<SessionTicket, SessionError> {
        self.require_paired()?;
        let intent = match verb {
            LaunchVerb::Launch => ControlIntent::Launch {
                app_id: app_id.ok_or(SessionError::MissingAppId)?.to_string(),
                config: config.clone(),
            },
            LaunchVerb::Resume => ControlIntent::Resume {
                config: config.clone(),
            },
        };

        let resp = self
            .channel
            .send(&intent)
            .await
            .map_err(|e| SessionError::from_control(intent.kind(), e))?;

        let session_id = resp.field(verb.result_tag()).unwrap_or_default();
        if session_id.is_empty() || session_id == "0" {
            return Err(SessionError::Rejected(format!(
                "<{}> was {session_id:?}",
                verb.result_tag()
            )));
        }

        info!(host = %self.channel.endpoint().id, ?verb, session = session_id, "session started");
        Ok(SessionTicket {
            verb,
            app_id: match verb {
                LaunchVerb::Launch => app_id.map(str::to_string),
                LaunchVerb::Resume => None,
            },
            session_id: session_id.to_string(),
            session_url: resp
                .field("sessionUrl0")
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            remote_input_key: config.remote_input_key,
            remote_input_key_id: config.remote_input_key_id,
        })
    }

    /// # Errors
    ///
    /// See [`SessionNegotiator::launch_or_resume`].
    pub async fn launch(
        &self,
        app_id: &str,
        config: &StreamConfig,
    ) -> Result<SessionTicket, SessionError> {
        self.launch_or_resume(LaunchVerb::Launch, Some(app_id), config).await
    }

    /// # Errors
    ///
    /// See [`SessionNegotiator::launch_or_resume`].
    pub async fn resume(&self, config: &StreamConfig) -> Result<SessionTicket, SessionError> {
        self.launch_or_resume(LaunchVerb::Resume, None, config).await
    }

    /// Quits the running app.  "Nothing is running" counts as success.
    ///
    /// # Errors
    ///
    /// [`SessionError::Rejected`] when the host refuses (another client's
    /// session), otherwise the channel error.
    pub async fn quit(&self) -> Result<(), SessionError> {
        self.require_paired()?;
        match self.channel.send(&ControlIntent::Quit).await {
            Ok(resp) if resp.field("cancel") == Some("0") => Err(SessionError::Rejected(
                "host refused to quit the running app".to_string(),
            )),
            Ok(_) => {
                info!(host = %self.channel.endpoint().id, "app quit");
                Ok(())
            }
            Err(e) if meaning(IntentKind::Quit, &e) == Some(StatusMeaning::AppNotRunning) => {
                debug!(host = %self.channel.endpoint().id, "quit: nothing was running");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Box art for `app_id`.  A missing asset is an empty vector.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotPaired`] without a pinned certificate, otherwise
    /// the channel error.
    pub async fn retrieve_asset(&self, app_id: &str) -> Result<Vec<u8>, SessionError> {
        self.require_paired()?;
        let intent = ControlIntent::AppAsset {
            app_id: app_id.to_string(),
        };
        match self.channel.send(&intent).await {
            Ok(resp) => Ok(resp.into_body()),
            Err(e) if meaning(IntentKind::AppAsset, &e) == Some(StatusMeaning::AssetMissing) => {
                debug!(app_id, "no asset for app");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn require_paired(&self) -> Result<(), SessionError> {
        if self.channel.has_server_certificate() {
            Ok(())
        } else {
            Err(SessionError::NotPaired)
        }
    }
}

fn meaning(kind: IntentKind, err: &ControlError) -> Option<StatusMeaning> {
    err.status_code().map(|code| classify(kind, code))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
