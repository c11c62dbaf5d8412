//! DiscoverHosts: concurrent, cancellable host discovery.
//!
//! # How discovery works (for beginners)
//!
//! Two sources feed the same set of tracked hosts:
//!
//! - **Passive**: an [`AdvertisementFeed`] (mDNS in production) announces
//!   hosts on the LAN.  Each advertisement is merged into the registry and
//!   probed if it was not probed already in the current cycle.
//! - **Active**: every `poll_interval` a poll cycle probes every tracked
//!   host with a fast-fail `/serverinfo`.  Probes run on a pool bounded by
//!   `max_concurrent_probes`, each with its own timeout, so one dead host
//!   never delays another.
//!
//! A probe result is a state transition: success means `Online`, any error
//! means `Offline`.  Probe errors are never returned to the caller.
//!
//! # Single writer
//!
//! All mutations go through one `std::sync::Mutex` around the registry.
//! Critical sections are short and never await.  Listeners are called while
//! that lock is held, right after the epoch check, which is what makes
//! `stop_searching` airtight: once it has bumped the epoch under the lock, no
//! further callback can happen.  Listeners must therefore not call back into
//! the coordinator.
//!
//! # Cancellation
//!
//! `stop_searching` bumps the epoch, stops the feed, aborts the search task,
//! and wakes any in-flight poll cycle so it aborts its probe tasks.  A probe
//! that finishes anyway finds a stale epoch and is discarded.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use gs_core::{ControlError, DiscoverySource, HostEndpoint, HostId, PairStatus, ServerInfo};

use crate::application::host_registry::{HostRegistry, HostSnapshot, ProbeJob};
use crate::application::negotiate_session::SessionNegotiator;
use crate::application::pair_host::{PairingCredential, PairingFailure};
use crate::infrastructure::network::{
    Advertisement, AdvertisementFeed, ChannelFactory, DiscoveryError,
};

// ── Seams ─────────────────────────────────────────────────────────────────────

/// Asks one host for its server info.
#[async_trait]
pub trait HostProber: Send + Sync {
    async fn probe(
        &self,
        endpoint: &HostEndpoint,
        server_cert: Option<&[u8]>,
    ) -> Result<ServerInfo, ControlError>;
}

/// Receives one call per host state update.
pub trait HostUpdateListener: Send + Sync {
    fn host_updated(&self, snapshot: &HostSnapshot);
}

/// Production prober: a fresh control channel per probe, fast-fail
/// `/serverinfo` through the session negotiator.
pub struct ChannelProber {
    channels: Arc<dyn ChannelFactory>,
}

impl ChannelProber {
    pub fn new(channels: Arc<dyn ChannelFactory>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl HostProber for ChannelProber {
    async fn probe(
        &self,
        endpoint: &HostEndpoint,
        server_cert: Option<&[u8]>,
    ) -> Result<ServerInfo, ControlError> {
        let channel = self
            .channels
            .open(endpoint.clone(), server_cert.map(<[u8]>::to_vec))
            .map_err(|e| ControlError::Unreachable(format!("channel setup failed: {e}")))?;
        SessionNegotiator::new(Arc::new(channel))
            .get_server_info(true)
            .await
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub poll_interval: Duration,
    pub max_concurrent_probes: usize,
    /// Reachability older than this reads as `Unknown`.
    pub staleness_window: Duration,
    /// Upper bound on a single probe, whatever the prober does.
    pub probe_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_concurrent_probes: 8,
            staleness_window: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct Inner {
    registry: HostRegistry,
    epoch: u64,
    cycle: u64,
}

struct Shared {
    prober: Arc<dyn HostProber>,
    settings: DiscoverySettings,
    permits: Semaphore,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn HostUpdateListener>>>,
    epoch_tx: watch::Sender<u64>,
    snapshots_tx: watch::Sender<Vec<HostSnapshot>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes `changed` to listeners and a fresh snapshot list to
    /// watchers.  Called with the registry lock held.
    fn publish(&self, inner: &Inner, changed: Option<&HostSnapshot>) {
        if let Some(snapshot) = changed {
            let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
            for listener in listeners.iter() {
                listener.host_updated(snapshot);
            }
        }
        self.snapshots_tx.send_replace(inner.registry.snapshots());
    }

    /// Applies a finished probe, unless discovery was stopped meanwhile.
    fn complete_probe(
        &self,
        job: &ProbeJob,
        result: Result<ServerInfo, ControlError>,
        epoch: u64,
    ) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            debug!(host = %job.key, "discarding probe result from a stopped search");
            return false;
        }
        match &result {
            Ok(info) => debug!(host = %job.key, id = %info.unique_id, "probe succeeded"),
            Err(e) => debug!(host = %job.key, error = %e, "probe failed"),
        }
        let updates = inner.registry.apply_probe(job, result, Instant::now());
        for snapshot in &updates {
            self.publish(&inner, Some(snapshot));
        }
        !updates.is_empty()
    }

    /// Merges an advertisement and returns the probe to run for it, if any.
    fn admit_advertisement(&self, ad: Advertisement, epoch: u64) -> Option<ProbeJob> {
        let mut endpoint = HostEndpoint::new(
            HostId::new(ad.address.clone()),
            ad.address,
            DiscoverySource::Broadcast,
        );
        endpoint.http_port = ad.port;
        endpoint.ipv6_address = ad.ipv6_address;
        if let Some(label) = ad.instance.split('.').next().filter(|l| !l.is_empty()) {
            endpoint.name = label.to_string();
        }

        let mut inner = self.lock();
        if inner.epoch != epoch {
            return None;
        }
        let key = inner.registry.upsert_advertised(endpoint);
        let cycle = inner.cycle;
        inner.registry.begin_probe(&key, cycle)
    }
}

async fn run_probe(shared: Arc<Shared>, job: ProbeJob, epoch: u64) -> bool {
    let Ok(_permit) = shared.permits.acquire().await else {
        return false;
    };
    let timeout = shared.settings.probe_timeout;
    let result = tokio::time::timeout(
        timeout,
        shared.prober.probe(&job.endpoint, job.server_cert.as_deref()),
    )
    .await
    .unwrap_or(Err(ControlError::Timeout(timeout)));
    shared.complete_probe(&job, result, epoch)
}

/// One poll cycle: probe every tracked host once, wait for all of them,
/// and return how many produced a state update.
async fn run_poll_cycle(shared: &Arc<Shared>, epoch: u64) -> usize {
    let mut epoch_rx = shared.epoch_tx.subscribe();
    let jobs = {
        let mut inner = shared.lock();
        if inner.epoch != epoch {
            return 0;
        }
        inner.cycle += 1;
        let cycle = inner.cycle;
        inner.registry.begin_cycle(cycle)
    };
    debug!(probes = jobs.len(), "poll cycle started");

    let mut probes = JoinSet::new();
    for job in jobs {
        probes.spawn(run_probe(Arc::clone(shared), job, epoch));
    }

    let mut updated = 0;
    loop {
        tokio::select! {
            joined = probes.join_next() => match joined {
                Some(Ok(true)) => updated += 1,
                Some(Ok(false)) => {}
                Some(Err(e)) if e.is_panic() => warn!("probe task panicked: {e}"),
                Some(Err(_)) => {}
                None => break,
            },
            _ = epoch_rx.changed() => {
                debug!("poll cycle cancelled");
                probes.abort_all();
                break;
            }
        }
    }
    updated
}

async fn next_advertisement(
    feed: &mut Option<mpsc::Receiver<Advertisement>>,
) -> Option<Advertisement> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn search_loop(
    shared: Arc<Shared>,
    epoch: u64,
    mut feed: Option<mpsc::Receiver<Advertisement>>,
) {
    let mut ticker = tokio::time::interval(shared.settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // At most one poll cycle in flight; it runs beside the advertisement
    // probes so neither source waits on the other.
    let mut cycles = JoinSet::new();
    let mut advertised = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cycles.is_empty() {
                    let shared = Arc::clone(&shared);
                    cycles.spawn(async move { run_poll_cycle(&shared, epoch).await });
                } else {
                    debug!("previous poll cycle still running, skipping tick");
                }
            }
            ad = next_advertisement(&mut feed) => match ad {
                Some(ad) => {
                    if let Some(job) = shared.admit_advertisement(ad, epoch) {
                        advertised.spawn(run_probe(Arc::clone(&shared), job, epoch));
                    }
                }
                None => {
                    debug!("advertisement feed closed");
                    feed = None;
                }
            },
            Some(_) = advertised.join_next(), if !advertised.is_empty() => {}
            Some(done) = cycles.join_next(), if !cycles.is_empty() => {
                if let Ok(updated) = done {
                    debug!(updated, "poll cycle finished");
                }
            }
        }
    }
}

// ── DiscoveryCoordinator ──────────────────────────────────────────────────────

/// Tracks hosts from advertisements and periodic probes.
pub struct DiscoveryCoordinator {
    shared: Arc<Shared>,
    feed: Option<Arc<dyn AdvertisementFeed>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        prober: Arc<dyn HostProber>,
        feed: Option<Arc<dyn AdvertisementFeed>>,
        settings: DiscoverySettings,
    ) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        let (snapshots_tx, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                prober,
                permits: Semaphore::new(settings.max_concurrent_probes.max(1)),
                settings,
                inner: Mutex::new(Inner {
                    registry: HostRegistry::new(),
                    epoch: 0,
                    cycle: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                epoch_tx,
                snapshots_tx,
            }),
            feed,
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.shared.settings
    }

    pub fn add_listener(&self, listener: Arc<dyn HostUpdateListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(listener);
    }

    /// Watch channel carrying the full snapshot list after every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<HostSnapshot>> {
        self.shared.snapshots_tx.subscribe()
    }

    /// Current snapshots, with reachability aged by the staleness window.
    pub fn snapshots(&self) -> Vec<HostSnapshot> {
        let now = Instant::now();
        let window = self.shared.settings.staleness_window;
        let mut all = self.shared.snapshots_tx.borrow().clone();
        for snapshot in &mut all {
            snapshot.state.reachability = snapshot.reachability(now, window);
        }
        all
    }

    pub fn host(&self, id: &HostId) -> Option<HostSnapshot> {
        self.snapshots().into_iter().find(|s| s.id() == id)
    }

    /// Tracks a host known from configuration or an earlier session.
    pub fn add_known_host(&self, endpoint: HostEndpoint, server_cert: Option<Vec<u8>>) {
        let mut inner = self.shared.lock();
        inner.registry.insert_known(endpoint, server_cert);
        self.shared.publish(&inner, None);
    }

    pub fn is_searching(&self) -> bool {
        self.task_slot().is_some()
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Starts the advertisement feed and the periodic poll.  Must be called
    /// inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::AlreadyRunning`] if a search is active, or the
    /// feed's error if it cannot start.
    pub fn start_searching(&self) -> Result<(), DiscoveryError> {
        let mut task = self.task_slot();
        if task.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let adverts = match &self.feed {
            Some(feed) => Some(feed.start()?),
            None => None,
        };
        let epoch = self.shared.lock().epoch;
        *task = Some(tokio::spawn(search_loop(Arc::clone(&self.shared), epoch, adverts)));
        info!("host discovery started");
        Ok(())
    }

    /// Stops searching.  When this returns, no further listener callback
    /// will be made for probes started before the call.
    pub fn stop_searching(&self) {
        {
            let mut inner = self.shared.lock();
            inner.epoch += 1;
            self.shared.epoch_tx.send_replace(inner.epoch);
        }
        if let Some(feed) = &self.feed {
            feed.stop();
        }
        if let Some(task) = self.task_slot().take() {
            task.abort();
            info!("host discovery stopped");
        }
    }

    /// Runs one poll cycle now and returns how many hosts were updated.
    pub async fn poll_cycle(&self) -> usize {
        let epoch = self.shared.lock().epoch;
        run_poll_cycle(&self.shared, epoch).await
    }

    /// Clears every tracked host.  Probes in flight for them are discarded
    /// when they finish.  Pairing attempts are unaffected.
    pub fn forget_hosts(&self) {
        let mut inner = self.shared.lock();
        inner.registry.clear();
        self.shared.publish(&inner, None);
        info!("tracked hosts forgotten");
    }

    /// Records a pairing attempt's outcome on the tracked host.
    pub fn record_pairing_outcome(
        &self,
        host: &HostId,
        outcome: &Result<PairingCredential, PairingFailure>,
    ) {
        let (status, cert) = match outcome {
            Ok(credential) => (PairStatus::Paired, Some(credential.server_cert_der.clone())),
            Err(reason) => (reason.pair_status(), None),
        };
        self.set_pair_status(host, status, cert);
    }

    /// Marks `host` unpaired and drops its pinned certificate.
    pub fn record_unpaired(&self, host: &HostId) {
        self.set_pair_status(host, PairStatus::Unpaired, None);
    }

    fn set_pair_status(&self, host: &HostId, status: PairStatus, cert: Option<Vec<u8>>) {
        let mut inner = self.shared.lock();
        if let Some(snapshot) = inner.registry.record_pairing(host, status, cert) {
            self.shared.publish(&inner, Some(&snapshot));
        }
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task_slot().take() {
            task.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gs_core::ControlResponse;

    struct ScriptedProber {
        online: HashMap<String, bool>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HostProber for ScriptedProber {
        async fn probe(
            &self,
            endpoint: &HostEndpoint,
            _server_cert: Option<&[u8]>,
        ) -> Result<ServerInfo, ControlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.online.get(&endpoint.address).copied().unwrap_or(false) {
                let doc = format!(
                    r#"<root status_code="200"><uniqueid>{}</uniqueid>
                       <appversion>7.1.0.0</appversion></root>"#,
                    endpoint.id
                );
                ServerInfo::from_response(&ControlResponse::parse_document(&doc)?)
            } else {
                Err(ControlError::Unreachable("no route".to_string()))
            }
        }
    }

    fn coordinator(online: &[(&str, bool)]) -> (DiscoveryCoordinator, Arc<ScriptedProber>) {
        let prober = Arc::new(ScriptedProber {
            online: online.iter().map(|(a, up)| (a.to_string(), *up)).collect(),
            calls: AtomicUsize::new(0),
        });
        let coordinator =
            DiscoveryCoordinator::new(prober.clone(), None, DiscoverySettings::default());
        (coordinator, prober)
    }

    fn known(id: &str, address: &str) -> HostEndpoint {
        HostEndpoint::new(HostId::from(id), address, DiscoverySource::ActivePoll)
    }

    #[tokio::test]
    async fn test_poll_cycle_probes_each_known_host_once() {
        // Arrange
        let (coordinator, prober) = coordinator(&[("10.0.0.1", true), ("10.0.0.2", false)]);
        coordinator.add_known_host(known("A", "10.0.0.1"), None);
        coordinator.add_known_host(known("B", "10.0.0.2"), None);

        // Act
        let updated = coordinator.poll_cycle().await;

        // Assert
        assert_eq!(updated, 2);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_add_known_host_wakes_subscribers() {
        // Arrange
        let (coordinator, _) = coordinator(&[]);
        let mut rx = coordinator.subscribe();
        let mut changed = tokio_test::task::spawn(rx.changed());
        tokio_test::assert_pending!(changed.poll());

        // Act
        coordinator.add_known_host(known("A", "10.0.0.1"), None);

        // Assert
        assert!(changed.is_woken());
        tokio_test::assert_ready_ok!(changed.poll());
        drop(changed);
        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_forget_hosts_clears_snapshots() {
        let (coordinator, _) = coordinator(&[("10.0.0.1", true)]);
        coordinator.add_known_host(known("A", "10.0.0.1"), None);
        coordinator.poll_cycle().await;

        coordinator.forget_hosts();

        assert!(coordinator.snapshots().is_empty());
        assert_eq!(coordinator.poll_cycle().await, 0);
    }

    #[tokio::test]
    async fn test_start_searching_twice_is_rejected() {
        let (coordinator, _) = coordinator(&[]);
        coordinator.start_searching().unwrap();

        assert!(matches!(
            coordinator.start_searching(),
            Err(DiscoveryError::AlreadyRunning)
        ));
        coordinator.stop_searching();
        assert!(!coordinator.is_searching());
    }

    #[tokio::test]
    async fn test_record_pairing_outcome_shows_pin_wrong() {
        // Arrange
        let (coordinator, _) = coordinator(&[]);
        coordinator.add_known_host(known("A", "10.0.0.1"), None);

        // Act
        coordinator
            .record_pairing_outcome(&HostId::from("A"), &Err(PairingFailure::SecretMismatch));

        // Assert
        let snap = coordinator.host(&HostId::from("A")).unwrap();
        assert_eq!(snap.state.pair_status, PairStatus::PinWrong);
    }
}
