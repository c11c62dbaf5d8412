//! Pure request builder for the control protocol.
//!
//! Every intent the client can express maps to exactly one GET request:
//!
//! ```text
//! http[s]://<address>:<port>/<path>?uniqueid=<client id>&uuid=<request id>&<intent fields>
//! ```
//!
//! Building a request performs no I/O and touches no shared state; the only
//! varying input, the per-request `uuid`, is passed in by the caller.  Each
//! intent has its own builder function so parameters of one intent can never
//! leak into another.

use url::Url;
use uuid::Uuid;

use super::error::ControlError;
use crate::crypto::SALT_LEN;
use crate::domain::stream::{
    AudioConfig, LaunchVerb, StreamConfig, REMOTE_INPUT_KEY_LEN,
};

/// Identity fields the client attaches to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIds {
    /// Stable client identifier (`uniqueid`).  Hosts remember pairings by
    /// this value together with the client certificate.
    pub unique_id: String,
    /// Name shown in the host's list of paired devices (`devicename`).
    pub device_name: String,
}

impl Default for ClientIds {
    fn default() -> Self {
        Self {
            unique_id: "0123456789ABCDEF".to_string(),
            device_name: "roth".to_string(),
        }
    }
}

/// Plaintext info port or TLS port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Which configured timeout bounds a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Discovery probes, where most targets are expected to be unreachable.
    FastFail,
    /// User-initiated requests.
    Interactive,
    /// Pairing rounds, which may wait on the user at the host.
    Pairing,
}

/// How the response body is to be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Tagged key/value document with a root status attribute.
    Document,
    /// Opaque bytes (box art).
    Binary,
}

/// Coarse request category, used to interpret status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    ServerInfo,
    Pair,
    Unpair,
    AppList,
    Launch,
    Resume,
    Quit,
    AppAsset,
}

/// One round of the pairing handshake, with the data that round sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairRound {
    /// Round 1: salt and client certificate out, server certificate back.
    GetServerCert {
        salt: [u8; SALT_LEN],
        client_cert_pem: String,
    },
    /// Round 2: encrypted client challenge.
    ClientChallenge { encrypted_challenge: Vec<u8> },
    /// Round 3: encrypted answer to the host's challenge.
    ServerChallengeResponse { encrypted_response: Vec<u8> },
    /// Round 4: client pairing secret plus its MAC.
    ClientPairingSecret { signed_secret: Vec<u8> },
    /// Round 5: confirmation over TLS with the client certificate.
    PairChallenge,
}

/// Something the client wants the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlIntent {
    ServerInfo { fast_fail: bool, secure: bool },
    Pair(PairRound),
    Unpair,
    AppList,
    Launch { app_id: String, config: StreamConfig },
    Resume { config: StreamConfig },
    Quit,
    AppAsset { app_id: String },
}

impl ControlIntent {
    pub fn kind(&self) -> IntentKind {
        match self {
            ControlIntent::ServerInfo { .. } => IntentKind::ServerInfo,
            ControlIntent::Pair(_) => IntentKind::Pair,
            ControlIntent::Unpair => IntentKind::Unpair,
            ControlIntent::AppList => IntentKind::AppList,
            ControlIntent::Launch { .. } => IntentKind::Launch,
            ControlIntent::Resume { .. } => IntentKind::Resume,
            ControlIntent::Quit => IntentKind::Quit,
            ControlIntent::AppAsset { .. } => IntentKind::AppAsset,
        }
    }

    /// Reconstructs a launch or resume intent from a request path and its
    /// query pairs.
    ///
    /// Fields the verb does not transmit (everything but the input key and
    /// audio layout for a resume) take [`StreamConfig::default`] values.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedResponse`] for any other path or for
    /// a missing/unparsable parameter.
    pub fn parse_session_request(
        path: &str,
        query: &[(String, String)],
    ) -> Result<Self, ControlError> {
        let key_hex = required(query, "rikey")?;
        let key_bytes = hex::decode(key_hex)
            .map_err(|e| ControlError::MalformedResponse(format!("rikey: {e}")))?;
        let remote_input_key: [u8; REMOTE_INPUT_KEY_LEN] = key_bytes
            .try_into()
            .map_err(|_| ControlError::MalformedResponse("rikey has wrong length".to_string()))?;
        let remote_input_key_id: i32 = parse_number(query, "rikeyid")?;
        let audio =
            AudioConfig::from_surround_audio_info(parse_number(query, "surroundAudioInfo")?);

        let mut config = StreamConfig {
            remote_input_key,
            remote_input_key_id,
            audio,
            ..StreamConfig::default()
        };

        match path {
            "/launch" => {
                let app_id = required(query, "appid")?.to_string();
                let mode = required(query, "mode")?;
                let (width, height, fps) = StreamConfig::parse_mode(mode).ok_or_else(|| {
                    ControlError::MalformedResponse(format!("bad mode {mode:?}"))
                })?;
                config.width = width;
                config.height = height;
                config.fps = fps;
                config.optimize_game_settings = flag(query, "sops");
                config.play_audio_on_host = flag(query, "localAudioPlayMode");
                config.controllers_bitmap = parse_number(query, "remoteControllersBitmap")?;
                config.enable_hdr = flag(query, "hdrMode");
                Ok(ControlIntent::Launch { app_id, config })
            }
            "/resume" => Ok(ControlIntent::Resume { config }),
            other => Err(ControlError::MalformedResponse(format!(
                "{other} is not a session request"
            ))),
        }
    }

    /// Same as [`ControlIntent::parse_session_request`], starting from a URL.
    ///
    /// # Errors
    ///
    /// See [`ControlIntent::parse_session_request`].
    pub fn parse_session_url(url: &Url) -> Result<Self, ControlError> {
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self::parse_session_request(url.path(), &query)
    }
}

/// A fully formed, stateless request descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub kind: IntentKind,
    pub scheme: Scheme,
    pub path: &'static str,
    pub query: Vec<(String, String)>,
    pub timeout: TimeoutClass,
    pub response: ResponseKind,
}

impl ControlRequest {
    /// Builds the request for `intent`.
    pub fn build(intent: &ControlIntent, ids: &ClientIds, request_id: Uuid) -> Self {
        let query = base_query(ids, request_id);
        match intent {
            ControlIntent::ServerInfo { fast_fail, secure } => {
                build_server_info(query, *fast_fail, *secure)
            }
            ControlIntent::Pair(round) => build_pair(query, ids, round),
            ControlIntent::Unpair => build_unpair(query),
            ControlIntent::AppList => build_app_list(query),
            ControlIntent::Launch { app_id, config } => build_launch(query, app_id, config),
            ControlIntent::Resume { config } => build_resume(query, config),
            ControlIntent::Quit => build_quit(query),
            ControlIntent::AppAsset { app_id } => build_app_asset(query, app_id),
        }
    }

    /// First value of query parameter `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        lookup(&self.query, key)
    }

    /// Renders the request against `address:port`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Unreachable`] if the address does not form a
    /// valid URL.
    pub fn url(&self, address: &str, port: u16) -> Result<Url, ControlError> {
        let base = format!(
            "{}://{}{}",
            self.scheme.as_str(),
            authority(address, port),
            self.path
        );
        let mut url = Url::parse(&base).map_err(|e| {
            ControlError::Unreachable(format!("invalid host address {address:?}: {e}"))
        })?;
        url.query_pairs_mut()
            .extend_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Ok(url)
    }
}

/// `address:port`, bracketing bare IPv6 literals.
pub fn authority(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

// ── Per-intent builders ───────────────────────────────────────────────────────

fn base_query(ids: &ClientIds, request_id: Uuid) -> Vec<(String, String)> {
    vec![
        ("uniqueid".to_string(), ids.unique_id.clone()),
        ("uuid".to_string(), request_id.to_string()),
    ]
}

fn push(query: &mut Vec<(String, String)>, key: &str, value: impl ToString) {
    query.push((key.to_string(), value.to_string()));
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn document(
    kind: IntentKind,
    scheme: Scheme,
    path: &'static str,
    query: Vec<(String, String)>,
    timeout: TimeoutClass,
) -> ControlRequest {
    ControlRequest {
        kind,
        scheme,
        path,
        query,
        timeout,
        response: ResponseKind::Document,
    }
}

fn build_server_info(
    query: Vec<(String, String)>,
    fast_fail: bool,
    secure: bool,
) -> ControlRequest {
    let scheme = if secure { Scheme::Https } else { Scheme::Http };
    let timeout = if fast_fail {
        TimeoutClass::FastFail
    } else {
        TimeoutClass::Interactive
    };
    document(IntentKind::ServerInfo, scheme, "/serverinfo", query, timeout)
}

fn build_pair(
    mut query: Vec<(String, String)>,
    ids: &ClientIds,
    round: &PairRound,
) -> ControlRequest {
    push(&mut query, "devicename", &ids.device_name);
    push(&mut query, "updateState", 1);

    let scheme = match round {
        PairRound::GetServerCert {
            salt,
            client_cert_pem,
        } => {
            push(&mut query, "phrase", "getservercert");
            push(&mut query, "salt", hex::encode(salt));
            push(&mut query, "clientcert", hex::encode(client_cert_pem.as_bytes()));
            Scheme::Http
        }
        PairRound::ClientChallenge {
            encrypted_challenge,
        } => {
            push(&mut query, "clientchallenge", hex::encode(encrypted_challenge));
            Scheme::Http
        }
        PairRound::ServerChallengeResponse { encrypted_response } => {
            push(&mut query, "serverchallengeresp", hex::encode(encrypted_response));
            Scheme::Http
        }
        PairRound::ClientPairingSecret { signed_secret } => {
            push(&mut query, "clientpairingsecret", hex::encode(signed_secret));
            Scheme::Http
        }
        PairRound::PairChallenge => {
            push(&mut query, "phrase", "pairchallenge");
            Scheme::Https
        }
    };

    document(IntentKind::Pair, scheme, "/pair", query, TimeoutClass::Pairing)
}

fn build_unpair(query: Vec<(String, String)>) -> ControlRequest {
    document(
        IntentKind::Unpair,
        Scheme::Http,
        "/unpair",
        query,
        TimeoutClass::Interactive,
    )
}

fn build_app_list(query: Vec<(String, String)>) -> ControlRequest {
    document(
        IntentKind::AppList,
        Scheme::Https,
        "/applist",
        query,
        TimeoutClass::Interactive,
    )
}

fn build_launch(
    mut query: Vec<(String, String)>,
    app_id: &str,
    config: &StreamConfig,
) -> ControlRequest {
    push(&mut query, "appid", app_id);
    push(&mut query, "mode", config.mode_string());
    push(&mut query, "additionalStates", 1);
    push(&mut query, "sops", bool_param(config.optimize_game_settings));
    push(&mut query, "rikey", hex::encode(config.remote_input_key));
    push(&mut query, "rikeyid", config.remote_input_key_id);
    push(&mut query, "localAudioPlayMode", bool_param(config.play_audio_on_host));
    push(&mut query, "surroundAudioInfo", config.audio.surround_audio_info());
    push(&mut query, "remoteControllersBitmap", config.controllers_bitmap);
    push(&mut query, "gcmap", config.controllers_bitmap);
    if config.enable_hdr {
        push(&mut query, "hdrMode", 1);
    }
    document(
        IntentKind::Launch,
        Scheme::Https,
        LaunchVerb::Launch.path(),
        query,
        TimeoutClass::Interactive,
    )
}

fn build_resume(mut query: Vec<(String, String)>, config: &StreamConfig) -> ControlRequest {
    push(&mut query, "rikey", hex::encode(config.remote_input_key));
    push(&mut query, "rikeyid", config.remote_input_key_id);
    push(&mut query, "surroundAudioInfo", config.audio.surround_audio_info());
    document(
        IntentKind::Resume,
        Scheme::Https,
        LaunchVerb::Resume.path(),
        query,
        TimeoutClass::Interactive,
    )
}

fn build_quit(query: Vec<(String, String)>) -> ControlRequest {
    document(
        IntentKind::Quit,
        Scheme::Https,
        "/cancel",
        query,
        TimeoutClass::Interactive,
    )
}

fn build_app_asset(mut query: Vec<(String, String)>, app_id: &str) -> ControlRequest {
    push(&mut query, "appid", app_id);
    push(&mut query, "AssetType", 2);
    push(&mut query, "AssetIdx", 0);
    ControlRequest {
        kind: IntentKind::AppAsset,
        scheme: Scheme::Https,
        path: "/appasset",
        query,
        timeout: TimeoutClass::Interactive,
        response: ResponseKind::Binary,
    }
}

// ── Query parsing helpers ─────────────────────────────────────────────────────

fn lookup<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn required<'a>(query: &'a [(String, String)], key: &str) -> Result<&'a str, ControlError> {
    lookup(query, key)
        .ok_or_else(|| ControlError::MalformedResponse(format!("missing parameter {key}")))
}

fn parse_number<T: std::str::FromStr>(
    query: &[(String, String)],
    key: &str,
) -> Result<T, ControlError> {
    let raw = required(query, key)?;
    raw.parse()
        .map_err(|_| ControlError::MalformedResponse(format!("{key}={raw:?} is not a number")))
}

fn flag(query: &[(String, String)], key: &str) -> bool {
    lookup(query, key) == Some("1")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
