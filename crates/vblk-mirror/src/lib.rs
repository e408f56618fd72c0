//! Replicating vbdev.
//!
//! Mirrors one logical device across N same-sized children. Writes fan out
//! to every in-sync child and succeed while at least one replica takes the
//! data; a child that fails a request is marked out of sync and dropped
//! from the write set. Reads go to the first in-sync child and fail over
//! to the next replica when the child reports an error. A degraded child
//! rejoins after [`MirrorDevice::resync`] copies the current contents back
//! onto it.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vblk_core::{
    check_request, BlockDevice, ClaimGuard, DeviceChannel, DeviceGeometry, DeviceHandle,
    DeviceRegistry, IoBuffer, IoCapabilities, IoCompletion, IoError, IoErrorKind, IoRequest,
    IoResult, IoStatus, IoType, OpenChannel, SubmitReject, TEARDOWN_POLL_BUDGET,
};

/// Blocks moved per synchronous copy step during [`MirrorDevice::resync`].
const RESYNC_SEGMENT_BLOCKS: u64 = 128;

/// Poll iterations allowed for one synchronous resync I/O.
const RESYNC_POLL_BUDGET: usize = TEARDOWN_POLL_BUDGET;

/// Per-child replica state, shared between the device and its channels.
#[derive(Debug)]
struct MirrorHealth {
    device: String,
    in_sync: Vec<AtomicBool>,
}

impl MirrorHealth {
    fn new(device: String, children: usize) -> Arc<Self> {
        Arc::new(Self {
            device,
            in_sync: (0..children).map(|_| AtomicBool::new(true)).collect(),
        })
    }

    fn is_in_sync(&self, index: usize) -> bool {
        self.in_sync
            .get(index)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn mark_out_of_sync(&self, index: usize) {
        if let Some(flag) = self.in_sync.get(index) {
            if flag.swap(false, Ordering::AcqRel) {
                warn!(device = %self.device, child = index, "mirror child out of sync");
            }
        }
    }

    fn mark_in_sync(&self, index: usize) {
        if let Some(flag) = self.in_sync.get(index) {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Block device replicating across its children.
#[derive(Debug)]
pub struct MirrorDevice {
    name: String,
    children: Vec<DeviceHandle>,
    health: Arc<MirrorHealth>,
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    _claims: Vec<ClaimGuard>,
}

impl MirrorDevice {
    /// Mirror across `children` without touching the registry. The caller
    /// keeps responsibility for claims and registration.
    pub fn new(name: impl Into<String>, children: Vec<DeviceHandle>) -> IoResult<Self> {
        Self::build(name.into(), children, Vec::new())
    }

    /// Claim every child and register the mirror under `name`.
    ///
    /// Returns the device itself so the caller can run
    /// [`MirrorDevice::resync`] and inspect replica state; the registry
    /// holds its own reference for I/O.
    pub fn register(
        registry: &DeviceRegistry,
        name: impl Into<String>,
        child_names: &[&str],
    ) -> IoResult<Arc<MirrorDevice>> {
        let name = name.into();
        let mut children = Vec::with_capacity(child_names.len());
        let mut claims = Vec::with_capacity(child_names.len());
        for child_name in child_names {
            children.push(registry.lookup(child_name)?);
            claims.push(registry.claim(child_name, format!("mirror:{name}"))?);
        }
        debug!(device = %name, children = child_names.len(), "attaching mirror");
        let device = Arc::new(Self::build(name, children, claims)?);
        registry.register(device.clone())?;
        Ok(device)
    }

    fn build(
        name: String,
        children: Vec<DeviceHandle>,
        claims: Vec<ClaimGuard>,
    ) -> IoResult<Self> {
        if children.len() < 2 {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                "a mirror needs at least two children",
            ));
        }
        let block_size = children[0].geometry().block_size;
        if children
            .iter()
            .any(|child| child.geometry().block_size != block_size)
        {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                "mirror children must share a block size",
            ));
        }
        let block_count = children
            .iter()
            .map(|child| child.geometry().block_count)
            .min()
            .unwrap_or(0);
        let capabilities = children
            .iter()
            .fold(IoCapabilities::all(), |caps, child| {
                caps & child.capabilities()
            })
            & (IoCapabilities::READ
                | IoCapabilities::WRITE
                | IoCapabilities::UNMAP
                | IoCapabilities::WRITE_ZEROES
                | IoCapabilities::FLUSH
                | IoCapabilities::RESET);
        if !capabilities.contains(IoCapabilities::READ | IoCapabilities::WRITE) {
            return Err(IoError::with_message(
                IoErrorKind::Unsupported,
                "mirror children must support read and write",
            ));
        }
        let health = MirrorHealth::new(name.clone(), children.len());
        Ok(Self {
            name,
            geometry: DeviceGeometry::new(block_size, block_count),
            capabilities,
            children,
            health,
            _claims: claims,
        })
    }

    /// In-sync flag per child, in child order.
    pub fn child_states(&self) -> Vec<bool> {
        (0..self.children.len())
            .map(|index| self.health.is_in_sync(index))
            .collect()
    }

    /// Copy the mirror's contents from an in-sync replica onto child
    /// `index`, then mark it in sync.
    ///
    /// Runs synchronously on the calling context with a bounded poll budget
    /// per segment. Writes submitted through other channels while the copy
    /// runs are not replayed onto the target, so the caller quiesces I/O
    /// first.
    pub fn resync(&self, index: usize) -> IoResult<()> {
        if index >= self.children.len() {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                format!("mirror has {} children", self.children.len()),
            ));
        }
        if self.health.is_in_sync(index) {
            return Ok(());
        }
        let source = (0..self.children.len())
            .find(|&candidate| self.health.is_in_sync(candidate))
            .ok_or_else(|| {
                IoError::with_message(IoErrorKind::Io, "no in-sync replica to resync from")
            })?;
        let mut src = self.children[source].open_channel()?;
        let mut dst = self.children[index].open_channel()?;

        let block_size = self.geometry.block_size as u64;
        let mut copied = 0;
        while copied < self.geometry.block_count {
            let run = (self.geometry.block_count - copied).min(RESYNC_SEGMENT_BLOCKS);
            let buffer = run_sync(
                &mut src,
                IoType::Read,
                copied,
                run,
                Some(IoBuffer::alloc_zeroed((run * block_size) as usize)),
            )?
            .ok_or_else(|| {
                IoError::with_message(IoErrorKind::Io, "resync read returned no data")
            })?;
            run_sync(&mut dst, IoType::Write, copied, run, Some(buffer))?;
            copied += run;
        }
        if self.capabilities.contains(IoCapabilities::FLUSH) {
            run_sync(&mut dst, IoType::Flush, 0, 0, None)?;
        }
        self.health.mark_in_sync(index);
        info!(device = %self.name, child = index, "mirror child resynced");
        Ok(())
    }
}

impl BlockDevice for MirrorDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Mirror disk"
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> IoCapabilities {
        self.capabilities
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        let mut children = Vec::with_capacity(self.children.len());
        for child in &self.children {
            children.push(child.open_channel()?);
        }
        Ok(Box::new(MirrorChannel {
            geometry: self.geometry,
            capabilities: self.capabilities,
            children,
            health: self.health.clone(),
            pending: HashMap::new(),
            done: Arc::new(Mutex::new(VecDeque::new())),
            next_token: 0,
        }))
    }
}

struct Parent {
    request: IoRequest,
    remaining: usize,
    successes: usize,
    error: Option<IoError>,
    /// For reads: next child index to try on failover. Fan-out requests
    /// carry `None`.
    read_next: Option<usize>,
}

type DoneQueue = Arc<Mutex<VecDeque<(u64, usize, IoCompletion)>>>;

struct MirrorChannel {
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    /// Same indexing as the device's child list.
    children: Vec<OpenChannel>,
    health: Arc<MirrorHealth>,
    pending: HashMap<u64, Parent>,
    /// (token, child index, child completion).
    done: DoneQueue,
    next_token: u64,
}

impl MirrorChannel {
    fn child_request(
        &self,
        token: u64,
        child_index: usize,
        io_type: IoType,
        lba: u64,
        num_blocks: u64,
        buffer: Option<IoBuffer>,
        cancel: Option<&vblk_core::CancelToken>,
    ) -> IoRequest {
        let done = self.done.clone();
        let mut child = IoRequest::new(io_type, lba, num_blocks, buffer, move |completion| {
            done.lock().push_back((token, child_index, completion));
        });
        if let Some(cancel) = cancel {
            child = child.with_cancel(cancel.clone());
        }
        child
    }

    fn next_in_sync(&self, from: usize) -> Option<usize> {
        (from..self.children.len()).find(|&index| self.health.is_in_sync(index))
    }
}

impl DeviceChannel for MirrorChannel {
    fn submit(&mut self, mut request: IoRequest) -> Result<(), SubmitReject> {
        if let Err(err) = check_request(&self.geometry, self.capabilities, &request) {
            return Err(SubmitReject::new(request, err));
        }
        let token = self.next_token;
        self.next_token += 1;

        if request.io_type == IoType::Read {
            let Some(index) = self.next_in_sync(0) else {
                return Err(SubmitReject::new(
                    request,
                    IoError::with_message(IoErrorKind::Io, "no in-sync replica"),
                ));
            };
            let buffer = request.buffer.take();
            let child = self.child_request(
                token,
                index,
                IoType::Read,
                request.lba,
                request.num_blocks,
                buffer,
                request.cancel.as_ref(),
            );
            return match self.children[index].submit(child) {
                Ok(()) => {
                    self.pending.insert(
                        token,
                        Parent {
                            request,
                            remaining: 1,
                            successes: 0,
                            error: None,
                            read_next: Some(index + 1),
                        },
                    );
                    Ok(())
                }
                Err(mut reject) => {
                    request.buffer = reject.request.buffer.take();
                    Err(SubmitReject::new(request, reject.error))
                }
            };
        }

        // Everything else fans out to every in-sync replica; data-carrying
        // requests give each child its own copy so the caller's buffer
        // stays with the parent.
        let targets: Vec<usize> = (0..self.children.len())
            .filter(|&index| self.health.is_in_sync(index))
            .collect();
        if targets.is_empty() {
            return Err(SubmitReject::new(
                request,
                IoError::with_message(IoErrorKind::Io, "no in-sync replica"),
            ));
        }
        let mut submitted = 0;
        let mut first_error = None;
        for index in targets {
            let buffer = request
                .buffer
                .as_ref()
                .map(|buf| IoBuffer::from_vec(buf.to_vec()));
            let child = self.child_request(
                token,
                index,
                request.io_type,
                request.lba,
                request.num_blocks,
                buffer,
                request.cancel.as_ref(),
            );
            match self.children[index].submit(child) {
                Ok(()) => submitted += 1,
                Err(reject) => {
                    first_error.get_or_insert(reject.error);
                }
            }
        }
        if submitted == 0 {
            let error = first_error.unwrap_or_else(|| IoError::new(IoErrorKind::Io));
            return Err(SubmitReject::new(request, error));
        }
        self.pending.insert(
            token,
            Parent {
                request,
                remaining: submitted,
                successes: 0,
                error: first_error,
                read_next: None,
            },
        );
        Ok(())
    }

    fn poll(&mut self) -> usize {
        for child in &mut self.children {
            child.poll();
        }
        let mut fired = 0;

        loop {
            let item = self.done.lock().pop_front();
            let Some((token, child_index, completion)) = item else {
                break;
            };
            let is_read = self
                .pending
                .get(&token)
                .map(|parent| parent.read_next.is_some())
                .unwrap_or(false);

            if is_read {
                let Some(mut parent) = self.pending.remove(&token) else {
                    continue;
                };
                match completion.status {
                    IoStatus::Ok => {
                        parent.request.buffer = completion.buffer;
                        parent.request.complete(IoStatus::Ok);
                        fired += 1;
                    }
                    IoStatus::Err(err) => {
                        self.health.mark_out_of_sync(child_index);
                        let mut buffer = completion.buffer;
                        let mut from = parent.read_next.unwrap_or(child_index + 1);
                        loop {
                            let Some(retry) = self.next_in_sync(from) else {
                                parent.request.buffer = buffer;
                                parent.request.complete(IoStatus::Err(err));
                                fired += 1;
                                break;
                            };
                            let child = self.child_request(
                                token,
                                retry,
                                IoType::Read,
                                parent.request.lba,
                                parent.request.num_blocks,
                                buffer.take(),
                                parent.request.cancel.as_ref(),
                            );
                            match self.children[retry].submit(child) {
                                Ok(()) => {
                                    parent.read_next = Some(retry + 1);
                                    self.pending.insert(token, parent);
                                    break;
                                }
                                Err(mut reject) => {
                                    buffer = reject.request.buffer.take();
                                    from = retry + 1;
                                }
                            }
                        }
                    }
                }
                continue;
            }

            let finished = {
                let Some(parent) = self.pending.get_mut(&token) else {
                    continue;
                };
                match completion.status {
                    IoStatus::Ok => parent.successes += 1,
                    IoStatus::Err(err) => {
                        self.health.mark_out_of_sync(child_index);
                        parent.error.get_or_insert(err);
                    }
                }
                parent.remaining -= 1;
                parent.remaining == 0
            };
            if finished {
                let Some(parent) = self.pending.remove(&token) else {
                    continue;
                };
                let status = if parent.successes > 0 {
                    IoStatus::Ok
                } else {
                    IoStatus::Err(
                        parent
                            .error
                            .unwrap_or_else(|| IoError::new(IoErrorKind::Io)),
                    )
                };
                parent.request.complete(status);
                fired += 1;
            }
        }
        fired
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Submit one request on `channel` and poll until it completes.
fn run_sync(
    channel: &mut OpenChannel,
    io_type: IoType,
    lba: u64,
    num_blocks: u64,
    buffer: Option<IoBuffer>,
) -> IoResult<Option<IoBuffer>> {
    let slot: Arc<Mutex<Option<IoCompletion>>> = Arc::new(Mutex::new(None));
    let done = slot.clone();
    let request = IoRequest::new(io_type, lba, num_blocks, buffer, move |completion| {
        *done.lock() = Some(completion);
    });
    channel.submit(request).map_err(|reject| reject.error)?;

    let mut budget = RESYNC_POLL_BUDGET;
    loop {
        channel.poll();
        if let Some(completion) = slot.lock().take() {
            return match completion.status {
                IoStatus::Ok => Ok(completion.buffer),
                IoStatus::Err(err) => Err(err),
            };
        }
        if budget == 0 {
            warn!(?io_type, "resync i/o did not complete within poll budget");
            return Err(IoError::with_message(
                IoErrorKind::Io,
                "resync i/o did not complete",
            ));
        }
        budget -= 1;
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use vblk_backends::MallocDevice;
    use vblk_faulty::{FaultInjector, FaultPolicy, FaultyDevice};

    fn drain(channel: &mut OpenChannel) {
        let mut budget = 1_000_000;
        while channel.in_flight() > 0 && budget > 0 {
            channel.poll();
            budget -= 1;
        }
        assert_eq!(channel.in_flight(), 0);
    }

    fn write_bytes(channel: &mut OpenChannel, lba: u64, data: Vec<u8>) -> IoStatus {
        let blocks = (data.len() / 512) as u64;
        let (tx, rx) = mpsc::channel();
        channel
            .submit(IoRequest::write(
                lba,
                blocks,
                IoBuffer::from_vec(data),
                move |c| tx.send(c.status).unwrap(),
            ))
            .unwrap();
        drain(channel);
        rx.recv().unwrap()
    }

    fn read_bytes(channel: &mut OpenChannel, lba: u64, blocks: u64) -> Vec<u8> {
        let (tx, rx) = mpsc::channel();
        channel
            .submit(IoRequest::read(
                lba,
                blocks,
                IoBuffer::alloc_zeroed((blocks * 512) as usize),
                move |c| tx.send(c).unwrap(),
            ))
            .unwrap();
        drain(channel);
        let completion = rx.recv().unwrap();
        assert!(completion.status.is_ok());
        completion.buffer.unwrap().to_vec()
    }

    fn malloc(registry: &DeviceRegistry, name: &str, blocks: u64) {
        registry
            .register(Arc::new(MallocDevice::new(name, 512, blocks).unwrap()))
            .unwrap();
    }

    /// Mirror over one plain child and one fault-injected child.
    fn faulty_mirror(registry: &DeviceRegistry) -> (Arc<MirrorDevice>, FaultInjector) {
        malloc(registry, "m0", 256);
        malloc(registry, "m1", 256);
        let injector = FaultInjector::new();
        FaultyDevice::register(registry, "f1", "m1", injector.clone()).unwrap();
        let mirror = MirrorDevice::register(registry, "mirror0", &["m0", "f1"]).unwrap();
        (mirror, injector)
    }

    #[test]
    fn writes_land_on_every_child() {
        let registry = DeviceRegistry::new();
        malloc(&registry, "m0", 256);
        malloc(&registry, "m1", 256);
        let mirror = MirrorDevice::register(&registry, "mirror0", &["m0", "m1"]).unwrap();

        let payload: Vec<u8> = (0..2 * 512).map(|i| (i % 251) as u8).collect();
        let handle = registry.lookup("mirror0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        assert!(write_bytes(&mut channel, 4, payload.clone()).is_ok());
        assert_eq!(read_bytes(&mut channel, 4, 2), payload);
        drop(channel);

        // Both replicas hold the bytes, not just the read path.
        for child in ["m0", "m1"] {
            let mut raw = registry.lookup(child).unwrap().open_channel().unwrap();
            assert_eq!(read_bytes(&mut raw, 4, 2), payload);
        }
        assert_eq!(mirror.child_states(), vec![true, true]);
    }

    #[test]
    fn write_failure_degrades_child_but_succeeds() {
        let registry = DeviceRegistry::new();
        let (mirror, injector) = faulty_mirror(&registry);
        injector.set(IoType::Write, FaultPolicy::FailNext(1));

        let handle = registry.lookup("mirror0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        assert!(write_bytes(&mut channel, 0, vec![0xC3; 512]).is_ok());
        assert_eq!(mirror.child_states(), vec![true, false]);

        // The surviving replica serves reads.
        assert_eq!(read_bytes(&mut channel, 0, 1), vec![0xC3; 512]);
    }

    #[test]
    fn read_fails_over_to_next_replica() {
        let registry = DeviceRegistry::new();
        malloc(&registry, "m0", 256);
        malloc(&registry, "m1", 256);
        let injector = FaultInjector::new();
        FaultyDevice::register(&registry, "f0", "m0", injector.clone()).unwrap();
        let mirror = MirrorDevice::register(&registry, "mirror0", &["f0", "m1"]).unwrap();

        let handle = registry.lookup("mirror0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        assert!(write_bytes(&mut channel, 7, vec![0x5E; 512]).is_ok());

        injector.set(IoType::Read, FaultPolicy::FailNext(1));
        assert_eq!(read_bytes(&mut channel, 7, 1), vec![0x5E; 512]);
        assert_eq!(mirror.child_states(), vec![false, true]);
    }

    #[test]
    fn all_replicas_failing_fails_the_write() {
        let registry = DeviceRegistry::new();
        malloc(&registry, "m0", 256);
        malloc(&registry, "m1", 256);
        let injector = FaultInjector::new();
        FaultyDevice::register(&registry, "f0", "m0", injector.clone()).unwrap();
        FaultyDevice::register(&registry, "f1", "m1", injector.clone()).unwrap();
        let mirror = MirrorDevice::register(&registry, "mirror0", &["f0", "f1"]).unwrap();

        injector.set(IoType::Write, FaultPolicy::FailWith { probability: 1.0 });
        let handle = registry.lookup("mirror0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        assert!(!write_bytes(&mut channel, 0, vec![1u8; 512]).is_ok());
        assert_eq!(mirror.child_states(), vec![false, false]);

        // With no replica left, submissions are rejected outright.
        let reject = channel
            .submit(IoRequest::read(0, 1, IoBuffer::alloc_zeroed(512), |_| {}))
            .unwrap_err();
        assert_eq!(reject.error.kind(), IoErrorKind::Io);
    }

    #[test]
    fn resync_restores_redundancy() {
        let registry = DeviceRegistry::new();
        let (mirror, injector) = faulty_mirror(&registry);
        injector.set(IoType::Write, FaultPolicy::FailNext(1));

        let payload: Vec<u8> = (0..3 * 512).map(|i| (i % 229) as u8).collect();
        let handle = registry.lookup("mirror0").unwrap();
        let mut channel = handle.open_channel().unwrap();
        assert!(write_bytes(&mut channel, 9, payload.clone()).is_ok());
        assert_eq!(mirror.child_states(), vec![true, false]);
        drop(channel);

        injector.clear_all();
        mirror.resync(1).unwrap();
        assert_eq!(mirror.child_states(), vec![true, true]);

        // The rebuilt replica holds the data written while it was out.
        let mut raw = registry.lookup("m1").unwrap().open_channel().unwrap();
        assert_eq!(read_bytes(&mut raw, 9, 3), payload);
    }

    #[test]
    fn geometry_is_smallest_child() {
        let registry = DeviceRegistry::new();
        malloc(&registry, "m0", 100);
        malloc(&registry, "m1", 200);
        let mirror = MirrorDevice::register(&registry, "mirror0", &["m0", "m1"]).unwrap();
        assert_eq!(mirror.geometry().block_count, 100);
    }

    #[test]
    fn mismatched_block_size_rejected() {
        let registry = DeviceRegistry::new();
        registry
            .register(Arc::new(MallocDevice::new("m0", 512, 64).unwrap()))
            .unwrap();
        registry
            .register(Arc::new(MallocDevice::new("m1", 4096, 64).unwrap()))
            .unwrap();
        let err = MirrorDevice::register(&registry, "mirror0", &["m0", "m1"]).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::InvalidRange);
    }

    #[test]
    fn mirror_claims_children() {
        let registry = DeviceRegistry::new();
        malloc(&registry, "m0", 64);
        malloc(&registry, "m1", 64);
        let _mirror = MirrorDevice::register(&registry, "mirror0", &["m0", "m1"]).unwrap();
        assert_eq!(
            registry.unregister("m0").unwrap_err().kind(),
            IoErrorKind::Busy
        );
    }
}
