//! HostRegistry: the tracked-host records owned by discovery.
//!
//! The registry is plain data with no locking of its own.  The discovery
//! coordinator keeps it behind its single mutex, so every mutation (an
//! advertisement, a probe result, a pairing outcome) passes through one
//! synchronisation point, and readers get cloned [`HostSnapshot`]s.
//!
//! # Identity
//!
//! Hosts are keyed by [`HostId`], the host's own `uniqueid`.  An
//! advertisement carries only an address, so a host first seen that way is
//! tracked under a provisional key equal to its address.  The first
//! successful probe reveals the real id and the record is re-keyed, merging
//! into an existing record for the same host if there is one.  A record
//! with a real id is never re-keyed: the id is authoritative over the
//! address.
//!
//! # Per-cycle bookkeeping
//!
//! Each record remembers the poll cycle it was last probed in and the cycle
//! its state was last updated in.  A host reached through both the
//! advertisement feed and the poll in the same cycle is probed once and
//! produces one update.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use gs_core::{
    ControlError, HostEndpoint, HostId, HostState, PairStatus, Reachability, ServerInfo,
};
use tracing::warn;

/// Where a tracked host is in the discovery state machine.
///
/// ```text
/// Unknown ──► Probing ──► Online
///                │   ▲        │
///                ▼   └────────┘   (re-enters Probing every cycle)
///             Offline
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryPhase {
    #[default]
    Unknown,
    Probing,
    Online,
    Offline,
}

/// Read-only copy of one tracked host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub endpoint: HostEndpoint,
    pub state: HostState,
    pub phase: DiscoveryPhase,
    /// Certificate pinned for this host, if paired.
    pub server_cert: Option<Vec<u8>>,
}

impl HostSnapshot {
    pub fn id(&self) -> &HostId {
        &self.endpoint.id
    }

    /// Reachability as of `now`, reading as `Unknown` once older than
    /// `window`.
    pub fn reachability(&self, now: Instant, window: Duration) -> Reachability {
        self.state.reachability_at(now, window)
    }
}

/// A probe the coordinator should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeJob {
    /// Registry key at the time the probe was scheduled.
    pub key: HostId,
    pub endpoint: HostEndpoint,
    pub server_cert: Option<Vec<u8>>,
    pub cycle: u64,
}

#[derive(Debug, Clone)]
struct TrackedHost {
    endpoint: HostEndpoint,
    state: HostState,
    phase: DiscoveryPhase,
    server_cert: Option<Vec<u8>>,
    provisional: bool,
    probe_cycle: Option<u64>,
    updated_cycle: Option<u64>,
}

impl TrackedHost {
    fn new(endpoint: HostEndpoint, server_cert: Option<Vec<u8>>, provisional: bool) -> Self {
        Self {
            endpoint,
            state: HostState::default(),
            phase: DiscoveryPhase::Unknown,
            server_cert,
            provisional,
            probe_cycle: None,
            updated_cycle: None,
        }
    }

    fn mark_online(&mut self, info: &ServerInfo, cycle: u64, now: Instant) -> HostSnapshot {
        self.endpoint.refresh_from(info);
        self.state = HostState::online(info, now);
        self.phase = DiscoveryPhase::Online;
        self.updated_cycle = Some(cycle);
        self.probe_cycle = Some(cycle);
        self.snapshot()
    }

    fn mark_offline(&mut self, cycle: u64, now: Instant) -> HostSnapshot {
        self.state.mark_offline(now);
        self.phase = DiscoveryPhase::Offline;
        self.updated_cycle = Some(cycle);
        self.snapshot()
    }

    fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            endpoint: self.endpoint.clone(),
            state: self.state.clone(),
            phase: self.phase,
            server_cert: self.server_cert.clone(),
        }
    }
}

/// Tracked hosts keyed by identity.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: HashMap<HostId, TrackedHost>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, id: &HostId) -> Option<HostSnapshot> {
        self.hosts.get(id).map(TrackedHost::snapshot)
    }

    /// All records, sorted by id for stable output.
    pub fn snapshots(&self) -> Vec<HostSnapshot> {
        let mut all: Vec<_> = self.hosts.values().map(TrackedHost::snapshot).collect();
        all.sort_by(|a, b| a.endpoint.id.cmp(&b.endpoint.id));
        all
    }

    /// Adds a host whose identity is already known (configured, or paired
    /// in an earlier session).  An existing record keeps its state and takes
    /// the new addresses and certificate.
    pub fn insert_known(&mut self, endpoint: HostEndpoint, server_cert: Option<Vec<u8>>) {
        match self.hosts.get_mut(&endpoint.id) {
            Some(host) => {
                host.endpoint.merge_addresses(&endpoint);
                if server_cert.is_some() {
                    host.server_cert = server_cert;
                }
            }
            None => {
                let id = endpoint.id.clone();
                self.hosts.insert(id, TrackedHost::new(endpoint, server_cert, false));
            }
        }
    }

    /// Merges an advertised endpoint (keyed by its address) and returns the
    /// key it is tracked under.  A host already tracked at that address
    /// keeps its key; the last-seen address wins.
    pub fn upsert_advertised(&mut self, endpoint: HostEndpoint) -> HostId {
        if let Some(host) = self.hosts.get_mut(&endpoint.id) {
            host.endpoint.merge_addresses(&endpoint);
            return endpoint.id;
        }
        let same_address = self
            .hosts
            .iter_mut()
            .filter(|(_, h)| h.endpoint.address == endpoint.address)
            .min_by_key(|(_, h)| h.phase == DiscoveryPhase::Offline);
        if let Some((key, host)) = same_address {
            host.endpoint.merge_addresses(&endpoint);
            return key.clone();
        }
        let key = endpoint.id.clone();
        self.hosts
            .insert(key.clone(), TrackedHost::new(endpoint, None, true));
        key
    }

    /// Marks `key` as probed in `cycle` and returns the job, or `None` if
    /// it was already probed this cycle (or is not tracked).
    pub fn begin_probe(&mut self, key: &HostId, cycle: u64) -> Option<ProbeJob> {
        let host = self.hosts.get_mut(key)?;
        if host.probe_cycle == Some(cycle) {
            return None;
        }
        host.probe_cycle = Some(cycle);
        host.phase = DiscoveryPhase::Probing;
        Some(ProbeJob {
            key: key.clone(),
            endpoint: host.endpoint.clone(),
            server_cert: host.server_cert.clone(),
            cycle,
        })
    }

    /// Schedules a probe for every tracked host not yet probed in `cycle`.
    pub fn begin_cycle(&mut self, cycle: u64) -> Vec<ProbeJob> {
        let mut keys: Vec<HostId> = self.hosts.keys().cloned().collect();
        keys.sort();
        keys.iter()
            .filter_map(|key| self.begin_probe(key, cycle))
            .collect()
    }

    /// Applies a probe result and returns the snapshots it changed: none
    /// when the record was forgotten meanwhile or already updated in this
    /// cycle.
    ///
    /// Only a provisional record is re-keyed by the id a probe reports.  A
    /// record with a real id whose address now answers for another host goes
    /// `Offline` under its own key and keeps its certificate; the other host
    /// is tracked as a separate record with no certificate.
    pub fn apply_probe(
        &mut self,
        job: &ProbeJob,
        result: Result<ServerInfo, ControlError>,
        now: Instant,
    ) -> Vec<HostSnapshot> {
        let provisional = match self.hosts.get(&job.key) {
            Some(host) if host.updated_cycle != Some(job.cycle) => host.provisional,
            _ => return Vec::new(),
        };

        match result {
            Ok(info) if info.unique_id != job.key && !provisional => {
                warn!(
                    host = %job.key,
                    answered = %info.unique_id,
                    address = %job.endpoint.address,
                    "address answers for a different host"
                );
                self.identity_mismatch(job, &info, now)
            }
            Ok(info) => {
                let Some(key) = self.rekey(&job.key, &info.unique_id) else {
                    return Vec::new();
                };
                self.hosts
                    .get_mut(&key)
                    .map(|host| host.mark_online(&info, job.cycle, now))
                    .into_iter()
                    .collect()
            }
            Err(_) => self
                .hosts
                .get_mut(&job.key)
                .map(|host| host.mark_offline(job.cycle, now))
                .into_iter()
                .collect(),
        }
    }

    fn identity_mismatch(
        &mut self,
        job: &ProbeJob,
        info: &ServerInfo,
        now: Instant,
    ) -> Vec<HostSnapshot> {
        let mut updates = Vec::with_capacity(2);
        if let Some(host) = self.hosts.get_mut(&job.key) {
            updates.push(host.mark_offline(job.cycle, now));
        }

        let mut endpoint = job.endpoint.clone();
        endpoint.id = info.unique_id.clone();
        endpoint.name = endpoint.id.as_str().to_string();
        let other = self
            .hosts
            .entry(info.unique_id.clone())
            .or_insert_with(|| TrackedHost::new(endpoint.clone(), None, false));
        if other.updated_cycle != Some(job.cycle) {
            other.endpoint.merge_addresses(&endpoint);
            updates.push(other.mark_online(info, job.cycle, now));
        }
        updates
    }

    /// Moves the provisional record at `from` under the host's real id.
    /// Returns the key now in use.
    fn rekey(&mut self, from: &HostId, real: &HostId) -> Option<HostId> {
        if from == real {
            return Some(from.clone());
        }
        let mut moved = self.hosts.remove(from)?;
        moved.endpoint.id = real.clone();
        moved.provisional = false;
        match self.hosts.get_mut(real) {
            Some(existing) => {
                existing.endpoint.merge_addresses(&moved.endpoint);
                if existing.updated_cycle.is_some()
                    && existing.updated_cycle == moved.probe_cycle
                {
                    return None;
                }
            }
            None => {
                self.hosts.insert(real.clone(), moved);
            }
        }
        Some(real.clone())
    }

    /// Records the outcome of a pairing attempt.  A success also stores the
    /// certificate so later probes go over HTTPS.
    pub fn record_pairing(
        &mut self,
        id: &HostId,
        status: PairStatus,
        server_cert: Option<Vec<u8>>,
    ) -> Option<HostSnapshot> {
        let host = self.hosts.get_mut(id)?;
        host.state.pair_status = status;
        match status {
            PairStatus::Paired => host.server_cert = server_cert,
            PairStatus::Unpaired => host.server_cert = None,
            PairStatus::PinWrong | PairStatus::Failed => {}
        }
        Some(host.snapshot())
    }

    /// `true` if the record at `key` has not yet been identified by a probe.
    pub fn is_provisional(&self, key: &HostId) -> bool {
        self.hosts.get(key).map_or(false, |h| h.provisional)
    }

    pub fn clear(&mut self) {
        self.hosts.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
