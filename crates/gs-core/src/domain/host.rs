//! Host identity, endpoints, derived state, and server-info parsing.

use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::{ControlError, ControlResponse, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};

/// Stable unique identifier a host reports as `uniqueid`.
///
/// Identity is always by this value; addresses change, the id does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a host endpoint first became known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// mDNS service advertisement.
    Broadcast,
    /// Configured or previously known host, found by polling.
    ActivePoll,
}

/// Where a host can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub id: HostId,
    pub name: String,
    /// Address used for requests; the last one a host was seen at.
    pub address: String,
    pub local_address: Option<String>,
    pub external_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub mac_address: Option<String>,
    pub http_port: u16,
    pub https_port: u16,
    pub source: DiscoverySource,
}

impl HostEndpoint {
    /// Endpoint at `address` with the default ports.
    pub fn new(id: HostId, address: impl Into<String>, source: DiscoverySource) -> Self {
        let address = address.into();
        Self {
            name: id.as_str().to_string(),
            id,
            address,
            local_address: None,
            external_address: None,
            ipv6_address: None,
            mac_address: None,
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            source,
        }
    }

    pub fn with_ports(mut self, http_port: u16, https_port: u16) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self
    }

    /// Applies the addressing details a successful server-info probe
    /// reported.  Fields the host left out keep their previous values.
    pub fn refresh_from(&mut self, info: &ServerInfo) {
        if !info.hostname.is_empty() {
            self.name = info.hostname.clone();
        }
        if let Some(port) = info.https_port {
            self.https_port = port;
        }
        if info.local_ip.is_some() {
            self.local_address = info.local_ip.clone();
        }
        if info.external_ip.is_some() {
            self.external_address = info.external_ip.clone();
        }
        if info.mac_address.is_some() {
            self.mac_address = info.mac_address.clone();
        }
    }

    /// Takes the addresses from a newer sighting of the same host.
    /// The last-seen address wins.
    pub fn merge_addresses(&mut self, newer: &HostEndpoint) {
        self.address = newer.address.clone();
        self.http_port = newer.http_port;
        if newer.local_address.is_some() {
            self.local_address = newer.local_address.clone();
        }
        if newer.external_address.is_some() {
            self.external_address = newer.external_address.clone();
        }
        if newer.ipv6_address.is_some() {
            self.ipv6_address = newer.ipv6_address.clone();
        }
        if self.name == self.id.as_str() && newer.name != newer.id.as_str() {
            self.name = newer.name.clone();
        }
    }
}

/// Whether a host answered its last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Pairing relationship between this client and a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    #[default]
    Unpaired,
    Paired,
    /// The last pairing attempt failed because of a wrong PIN.
    PinWrong,
    /// The last pairing attempt failed for another reason.
    Failed,
}

/// Host software version, e.g. `7.1.431.-1`.
///
/// Missing components compare as zero, so `7.1` equals `7.1.0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProtocolVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
    pub build: i32,
}

impl ProtocolVersion {
    pub const fn new(major: i32, minor: i32, patch: i32, build: i32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Parses a dotted version string.
    ///
    /// Returns `None` if any present component is not an integer or there
    /// are more than four components.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = [0i32; 4];
        let mut count = 0;
        for piece in text.trim().split('.') {
            if count == parts.len() {
                return None;
            }
            parts[count] = piece.trim().parse().ok()?;
            count += 1;
        }
        Some(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }

    fn as_tuple(&self) -> (i32, i32, i32, i32) {
        (self.major, self.minor, self.patch, self.build)
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_tuple().cmp(&other.as_tuple())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }
}

/// Fields of a `/serverinfo` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub hostname: String,
    pub unique_id: HostId,
    pub mac_address: Option<String>,
    pub https_port: Option<u16>,
    pub external_port: Option<u16>,
    pub app_version: ProtocolVersion,
    pub gfe_version: Option<String>,
    pub gpu_count: u32,
    pub gpu_type: Option<String>,
    /// `PairStatus` tag.  Only trustworthy when fetched over HTTPS.
    pub paired: bool,
    /// Id of the running app, `0` when none.
    pub current_game: u32,
    pub state: String,
    /// Bitmask of supported codec modes (`ServerCodecModeSupport`).
    pub codec_mode_support: u32,
    pub local_ip: Option<String>,
    pub external_ip: Option<String>,
}

impl ServerInfo {
    /// Extracts server info from a successful response.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedResponse`] if `uniqueid` or
    /// `appversion` is missing, or `appversion` does not parse.
    pub fn from_response(resp: &ControlResponse) -> Result<Self, ControlError> {
        let unique_id = HostId::new(resp.require_field("uniqueid")?);
        let raw_version = resp.require_field("appversion")?;
        let app_version = ProtocolVersion::parse(raw_version).ok_or_else(|| {
            ControlError::MalformedResponse(format!("unparsable appversion {raw_version:?}"))
        })?;

        Ok(Self {
            hostname: resp.field("hostname").unwrap_or("UNKNOWN").to_string(),
            unique_id,
            mac_address: non_empty(resp.field("mac")).filter(|m| m != "00:00:00:00:00:00"),
            https_port: resp.number("HttpsPort").filter(|p| *p != 0),
            external_port: resp.number("ExternalPort").filter(|p| *p != 0),
            app_version,
            gfe_version: non_empty(resp.field("GfeVersion")),
            gpu_count: resp.number("gpucount").unwrap_or(0),
            gpu_type: non_empty(resp.field("gputype")),
            paired: resp.number::<u32>("PairStatus") == Some(1),
            current_game: resp.number("currentgame").unwrap_or(0),
            state: resp.field("state").unwrap_or_default().to_string(),
            codec_mode_support: resp.number("ServerCodecModeSupport").unwrap_or(0),
            local_ip: non_empty(resp.field("LocalIP")),
            external_ip: non_empty(resp.field("ExternalIP")),
        })
    }

    /// Host reports it is busy streaming to someone.
    pub fn is_busy(&self) -> bool {
        self.state.ends_with("_SERVER_BUSY")
    }

    /// An app session is running on the host.
    pub fn has_active_session(&self) -> bool {
        self.current_game != 0
    }

    /// Host runs NVIDIA's own server software rather than a compatible one.
    pub fn is_nvidia_software(&self) -> bool {
        self.state.contains("MJOLNIR")
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Everything the client currently believes about a host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostState {
    pub reachability: Reachability,
    pub pair_status: PairStatus,
    pub session_active: bool,
    pub busy: bool,
    pub current_game: u32,
    pub server_version: Option<ProtocolVersion>,
    pub gfe_version: Option<String>,
    pub gpu_type: Option<String>,
    pub codec_mode_support: u32,
    /// When reachability was last established by a probe.
    pub observed_at: Option<Instant>,
}

impl HostState {
    /// State after a successful probe.
    pub fn online(info: &ServerInfo, now: Instant) -> Self {
        Self {
            reachability: Reachability::Online,
            pair_status: if info.paired {
                PairStatus::Paired
            } else {
                PairStatus::Unpaired
            },
            session_active: info.has_active_session(),
            busy: info.is_busy(),
            current_game: info.current_game,
            server_version: Some(info.app_version),
            gfe_version: info.gfe_version.clone(),
            gpu_type: info.gpu_type.clone(),
            codec_mode_support: info.codec_mode_support,
            observed_at: Some(now),
        }
    }

    /// Marks the host offline, keeping what was learned about it earlier.
    pub fn mark_offline(&mut self, now: Instant) {
        self.reachability = Reachability::Offline;
        self.session_active = false;
        self.busy = false;
        self.observed_at = Some(now);
    }

    /// Reachability as of `now`: anything older than `window` reads as
    /// [`Reachability::Unknown`].
    pub fn reachability_at(&self, now: Instant, window: Duration) -> Reachability {
        match self.observed_at {
            Some(at) if now.saturating_duration_since(at) <= window => self.reachability,
            _ => Reachability::Unknown,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
