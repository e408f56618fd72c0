use crate::{
    BlockDevice, DeviceChannel, DeviceGeometry, DeviceStats, DeviceStatsSnapshot, IoCapabilities,
    IoError, IoErrorKind, IoRequest, IoResult, SubmitReject,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Poll iterations [`OpenChannel::close`] spends waiting for in-flight
/// requests before giving up with `TeardownTimeout`.
pub const TEARDOWN_POLL_BUDGET: usize = 100_000;

/// Catalog change notifications delivered to subscribed listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(String),
    Unregistered(String),
    /// An unregister attempt was refused because a claim is held; the
    /// claimant is expected to tear down and release, then the caller retries.
    UnregisterRequested(String),
}

type Listener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

struct DeviceEntry {
    device: Arc<dyn BlockDevice>,
    open_channels: AtomicUsize,
    claimant: Mutex<Option<String>>,
    stats: DeviceStats,
}

/// Structured control-plane record describing one registered device.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub product_name: String,
    pub geometry: DeviceGeometry,
    pub capabilities: u32,
    pub claimed_by: Option<String>,
    pub open_channels: usize,
    pub stats: DeviceStatsSnapshot,
}

/// Process-wide catalog of live devices.
///
/// One owned instance, passed by reference to every component; registration
/// and unregistration are rare and take a coarse lock, while the hot path
/// works through pre-resolved [`DeviceHandle`]s.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<String, Arc<DeviceEntry>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `device` to the catalog; fails with `NameConflict` when taken.
    pub fn register(&self, device: Arc<dyn BlockDevice>) -> IoResult<()> {
        let name = device.name().to_string();
        if name.is_empty() {
            return Err(IoError::with_message(
                IoErrorKind::NameConflict,
                "device name must be non-empty",
            ));
        }
        {
            let mut devices = self.devices.lock();
            if devices.contains_key(&name) {
                return Err(IoError::with_message(
                    IoErrorKind::NameConflict,
                    format!("device {name} already registered"),
                ));
            }
            devices.insert(
                name.clone(),
                Arc::new(DeviceEntry {
                    device,
                    open_channels: AtomicUsize::new(0),
                    claimant: Mutex::new(None),
                    stats: DeviceStats::default(),
                }),
            );
        }
        info!(device = %name, "registered block device");
        self.emit(&RegistryEvent::Registered(name));
        Ok(())
    }

    /// Remove `name` from the catalog.
    ///
    /// Refuses with `Busy` while channels are open or a claim is held; a
    /// claim refusal also emits [`RegistryEvent::UnregisterRequested`] so the
    /// claimant can release and the caller can retry.
    pub fn unregister(&self, name: &str) -> IoResult<()> {
        let claimed = {
            let mut devices = self.devices.lock();
            let entry = devices
                .get(name)
                .cloned()
                .ok_or_else(|| IoError::new(IoErrorKind::NotFound))?;
            let claimant = entry.claimant.lock().clone();
            if let Some(claimant) = claimant {
                Some(claimant)
            } else {
                let open = entry.open_channels.load(Ordering::Acquire);
                if open > 0 {
                    return Err(IoError::with_message(
                        IoErrorKind::Busy,
                        format!("{open} channel(s) open on {name}"),
                    ));
                }
                devices.remove(name);
                None
            }
        };
        match claimed {
            Some(claimant) => {
                debug!(device = %name, %claimant, "unregister deferred to claimant");
                self.emit(&RegistryEvent::UnregisterRequested(name.to_string()));
                Err(IoError::with_message(
                    IoErrorKind::Busy,
                    format!("{name} is claimed by {claimant}"),
                ))
            }
            None => {
                info!(device = %name, "unregistered block device");
                self.emit(&RegistryEvent::Unregistered(name.to_string()));
                Ok(())
            }
        }
    }

    /// Resolve a live device to a handle for hot-path use.
    pub fn lookup(&self, name: &str) -> IoResult<DeviceHandle> {
        let devices = self.devices.lock();
        devices
            .get(name)
            .map(|entry| DeviceHandle {
                entry: entry.clone(),
            })
            .ok_or_else(|| IoError::new(IoErrorKind::NotFound))
    }

    /// Take the exclusive claim on `name` for `claimant`.
    pub fn claim(&self, name: &str, claimant: impl Into<String>) -> IoResult<ClaimGuard> {
        let claimant = claimant.into();
        let entry = {
            let devices = self.devices.lock();
            devices
                .get(name)
                .cloned()
                .ok_or_else(|| IoError::new(IoErrorKind::NotFound))?
        };
        {
            let mut slot = entry.claimant.lock();
            if let Some(holder) = slot.as_ref() {
                return Err(IoError::with_message(
                    IoErrorKind::AlreadyClaimed,
                    format!("{name} is claimed by {holder}"),
                ));
            }
            *slot = Some(claimant.clone());
        }
        debug!(device = %name, %claimant, "claimed block device");
        Ok(ClaimGuard { entry })
    }

    pub fn device_info(&self, name: &str) -> IoResult<DeviceInfo> {
        let devices = self.devices.lock();
        devices
            .get(name)
            .map(|entry| entry_info(entry))
            .ok_or_else(|| IoError::new(IoErrorKind::NotFound))
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.lock();
        devices.values().map(|entry| entry_info(entry)).collect()
    }

    /// Subscribe to catalog events; used by auto-attaching vbdevs.
    pub fn subscribe(&self, listener: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    fn emit(&self, event: &RegistryEvent) {
        // Snapshot outside the listener invocation so listeners may call
        // back into the registry.
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

fn entry_info(entry: &Arc<DeviceEntry>) -> DeviceInfo {
    DeviceInfo {
        name: entry.device.name().to_string(),
        product_name: entry.device.product_name().to_string(),
        geometry: entry.device.geometry(),
        capabilities: entry.device.capabilities().bits(),
        claimed_by: entry.claimant.lock().clone(),
        open_channels: entry.open_channels.load(Ordering::Acquire),
        stats: entry.stats.snapshot(),
    }
}

/// Pre-resolved reference to a registered device.
///
/// Cloneable and cheap; survives unregistration (the device object stays
/// alive until all handles drop), but new lookups after unregister fail.
#[derive(Clone)]
pub struct DeviceHandle {
    entry: Arc<DeviceEntry>,
}

impl DeviceHandle {
    pub fn name(&self) -> String {
        self.entry.device.name().to_string()
    }

    pub fn product_name(&self) -> String {
        self.entry.device.product_name().to_string()
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.entry.device.geometry()
    }

    pub fn capabilities(&self) -> IoCapabilities {
        self.entry.device.capabilities()
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.entry.stats.snapshot()
    }

    /// Open a channel for the calling execution context.
    ///
    /// The channel is tracked against the registration so `unregister`
    /// refuses with `Busy` until it is closed.
    pub fn open_channel(&self) -> IoResult<OpenChannel> {
        let inner = self.entry.device.open_channel()?;
        self.entry.open_channels.fetch_add(1, Ordering::AcqRel);
        debug!(device = %self.entry.device.name(), "opened channel");
        Ok(OpenChannel {
            inner: Some(inner),
            entry: self.entry.clone(),
        })
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.entry.device.name())
            .finish()
    }
}

/// Releases the exclusive claim on drop.
pub struct ClaimGuard {
    entry: Arc<DeviceEntry>,
}

impl std::fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("device", &self.entry.device.name())
            .field("claimant", &self.entry.claimant.lock().clone())
            .finish()
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut slot = self.entry.claimant.lock();
        debug!(device = %self.entry.device.name(), "released claim");
        *slot = None;
    }
}

/// A registry-tracked device channel.
///
/// Wraps the backend channel with open-count accounting and per-device
/// statistics. All requests complete (or fail) before the wrapper goes away:
/// [`OpenChannel::close`] drains via polling with a bounded budget.
pub struct OpenChannel {
    inner: Option<Box<dyn DeviceChannel>>,
    entry: Arc<DeviceEntry>,
}

impl OpenChannel {
    pub fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
        let entry = self.entry.clone();
        let io_type = request.io_type;
        let bytes = request.byte_len(entry.device.geometry().block_size);
        let started = Instant::now();
        let request = request.map_completion(move |completion| {
            entry
                .stats
                .observe(io_type, bytes, started.elapsed(), completion.status.is_ok());
            completion
        });
        self.channel().submit(request)
    }

    pub fn poll(&mut self) -> usize {
        self.channel().poll()
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .as_ref()
            .map(|ch| ch.in_flight())
            .unwrap_or(0)
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.entry.device.geometry()
    }

    /// Stop accepting submissions and poll until in-flight work drains.
    ///
    /// Bounded at [`TEARDOWN_POLL_BUDGET`] iterations; on exhaustion the
    /// channel is still torn down but `TeardownTimeout` is reported.
    pub fn close(mut self) -> IoResult<()> {
        let mut budget = TEARDOWN_POLL_BUDGET;
        while self.in_flight() > 0 {
            if budget == 0 {
                warn!(device = %self.entry.device.name(), "channel teardown timed out");
                return Err(IoError::with_message(
                    IoErrorKind::TeardownTimeout,
                    format!(
                        "{} request(s) still in flight after drain budget",
                        self.in_flight()
                    ),
                ));
            }
            budget -= 1;
            self.poll();
            std::hint::spin_loop();
        }
        Ok(())
    }

    fn channel(&mut self) -> &mut Box<dyn DeviceChannel> {
        self.inner.as_mut().expect("channel present until drop")
    }
}

impl Drop for OpenChannel {
    fn drop(&mut self) {
        // Best-effort drain so callbacks are not lost; close() is the
        // polite path with an error report.
        if let Some(mut inner) = self.inner.take() {
            let mut budget = TEARDOWN_POLL_BUDGET;
            while inner.in_flight() > 0 && budget > 0 {
                inner.poll();
                budget -= 1;
            }
            drop(inner);
        }
        self.entry.open_channels.fetch_sub(1, Ordering::AcqRel);
        debug!(device = %self.entry.device.name(), "closed channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IoCompletion, IoStatus};
    use std::sync::mpsc;

    struct StubChannel {
        pending: Vec<IoRequest>,
    }

    impl DeviceChannel for StubChannel {
        fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
            self.pending.push(request);
            Ok(())
        }

        fn poll(&mut self) -> usize {
            let fired = self.pending.len();
            for request in self.pending.drain(..) {
                request.complete_ok();
            }
            fired
        }

        fn in_flight(&self) -> usize {
            self.pending.len()
        }
    }

    struct StubDevice {
        name: String,
    }

    impl BlockDevice for StubDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn product_name(&self) -> &str {
            "Stub disk"
        }

        fn geometry(&self) -> DeviceGeometry {
            DeviceGeometry::new(512, 128)
        }

        fn capabilities(&self) -> IoCapabilities {
            IoCapabilities::READ | IoCapabilities::WRITE | IoCapabilities::FLUSH
        }

        fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
            Ok(Box::new(StubChannel {
                pending: Vec::new(),
            }))
        }
    }

    fn stub(name: &str) -> Arc<dyn BlockDevice> {
        Arc::new(StubDevice {
            name: name.to_string(),
        })
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        assert!(registry.lookup("disk0").is_ok());
        registry.unregister("disk0").unwrap();
        assert_eq!(
            registry.lookup("disk0").unwrap_err().kind(),
            IoErrorKind::NotFound
        );
    }

    #[test]
    fn duplicate_name_conflicts() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        let err = registry.register(stub("disk0")).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::NameConflict);
    }

    #[test]
    fn unregister_is_not_idempotent_success() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        registry.unregister("disk0").unwrap();
        assert_eq!(
            registry.unregister("disk0").unwrap_err().kind(),
            IoErrorKind::NotFound
        );
        assert_eq!(
            registry.unregister("disk0").unwrap_err().kind(),
            IoErrorKind::NotFound
        );
    }

    #[test]
    fn open_channel_blocks_unregister() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        let handle = registry.lookup("disk0").unwrap();
        let channel = handle.open_channel().unwrap();
        assert_eq!(
            registry.unregister("disk0").unwrap_err().kind(),
            IoErrorKind::Busy
        );
        channel.close().unwrap();
        registry.unregister("disk0").unwrap();
    }

    #[test]
    fn claim_is_exclusive_and_blocks_unregister() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        let guard = registry.claim("disk0", "parent0").unwrap();
        assert_eq!(
            registry.claim("disk0", "parent1").unwrap_err().kind(),
            IoErrorKind::AlreadyClaimed
        );
        assert_eq!(
            registry.unregister("disk0").unwrap_err().kind(),
            IoErrorKind::Busy
        );
        drop(guard);
        registry.unregister("disk0").unwrap();
    }

    #[test]
    fn events_reach_listeners() {
        let registry = DeviceRegistry::new();
        let (tx, rx) = mpsc::channel();
        registry.subscribe(move |event| {
            tx.send(event.clone()).unwrap();
        });
        registry.register(stub("disk0")).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::Registered("disk0".to_string())
        );
        let _guard = registry.claim("disk0", "parent0").unwrap();
        let _ = registry.unregister("disk0");
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::UnregisterRequested("disk0".to_string())
        );
    }

    #[test]
    fn stats_observed_through_channel() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        let handle = registry.lookup("disk0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        let (tx, rx) = mpsc::channel();
        let req = IoRequest::read(0, 1, crate::IoBuffer::alloc_zeroed(512), move |c| {
            tx.send(matches!(c.status, IoStatus::Ok)).unwrap();
        });
        channel.submit(req).unwrap();
        assert_eq!(channel.poll(), 1);
        assert!(rx.recv().unwrap());
        assert_eq!(handle.stats().read.count, 1);
        assert_eq!(handle.stats().read.bytes, 512);
    }

    #[test]
    fn device_info_serializes() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        let info = registry.device_info("disk0").unwrap();
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"name\":\"disk0\""));
        assert!(json.contains("\"block_size\":512"));
    }

    struct StuckChannel {
        pending: Vec<IoRequest>,
    }

    impl DeviceChannel for StuckChannel {
        fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
            self.pending.push(request);
            Ok(())
        }

        fn poll(&mut self) -> usize {
            0
        }

        fn in_flight(&self) -> usize {
            self.pending.len()
        }
    }

    struct StuckDevice;

    impl BlockDevice for StuckDevice {
        fn name(&self) -> &str {
            "stuck0"
        }

        fn product_name(&self) -> &str {
            "Stuck disk"
        }

        fn geometry(&self) -> DeviceGeometry {
            DeviceGeometry::new(512, 128)
        }

        fn capabilities(&self) -> IoCapabilities {
            IoCapabilities::FLUSH
        }

        fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
            Ok(Box::new(StuckChannel {
                pending: Vec::new(),
            }))
        }
    }

    #[test]
    fn close_reports_timeout_when_work_never_drains() {
        let registry = DeviceRegistry::new();
        registry.register(Arc::new(StuckDevice)).unwrap();
        let handle = registry.lookup("stuck0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        channel.submit(IoRequest::flush(|_| {})).unwrap();
        let err = channel.close().unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::TeardownTimeout);
        // The channel is torn down regardless, so the device can go away.
        registry.unregister("stuck0").unwrap();
    }

    // Completion must not fire from a different context; the stub completes
    // inline from poll, which is the contract every backend follows.
    #[test]
    fn completions_fire_from_poll_only() {
        let registry = DeviceRegistry::new();
        registry.register(stub("disk0")).unwrap();
        let handle = registry.lookup("disk0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        let (tx, rx) = mpsc::channel::<IoCompletion>();
        channel
            .submit(IoRequest::flush(move |c| tx.send(c).unwrap()))
            .unwrap();
        assert!(rx.try_recv().is_err());
        channel.poll();
        assert!(rx.try_recv().is_ok());
    }
}
