//! Network-initiator backend.
//!
//! The protocol collaborator (iSCSI or NVMe-oF initiator) sits behind the
//! narrow [`RemoteMedia`] seam: one block request maps to exactly one
//! protocol exchange, and the core never sees wire framing. Link loss
//! surfaces as a retriable `Disconnected` failure for every request in
//! flight on the affected channels; reconnection policy belongs to the
//! caller via [`RemoteBlockDevice::reconnect`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};
use vblk_core::{
    check_request, BlockDevice, CompletionQueue, DeviceChannel, DeviceGeometry, IoCapabilities,
    IoError, IoErrorKind, IoRequest, IoResult, IoStatus, IoType, SubmitReject,
};

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// One protocol exchange: operation, block span, and write payload.
#[derive(Debug)]
pub struct RemoteCommand {
    pub io_type: IoType,
    pub lba: u64,
    pub num_blocks: u64,
    pub payload: Option<Vec<u8>>,
}

/// Reply to a [`RemoteCommand`]; carries read data when applicable.
#[derive(Debug, Default)]
pub struct RemoteReply {
    pub data: Option<Vec<u8>>,
}

/// Seam to the protocol collaborator. Implementations are internally
/// synchronized; `exchange` may be called from multiple channel workers.
pub trait RemoteMedia: Send + Sync {
    fn geometry(&self) -> DeviceGeometry;

    fn capabilities(&self) -> IoCapabilities;

    /// Execute one exchange. Link loss returns `Disconnected`.
    fn exchange(&self, command: RemoteCommand) -> IoResult<RemoteReply>;

    /// Re-establish the link after `Disconnected`.
    fn reconnect(&self) -> IoResult<()> {
        Err(IoError::with_message(
            IoErrorKind::Unsupported,
            "media cannot reconnect",
        ))
    }
}

/// Block device driving a [`RemoteMedia`].
pub struct RemoteBlockDevice<M> {
    name: String,
    media: Arc<M>,
    disconnected: Arc<AtomicBool>,
    queue_depth: usize,
}

impl<M: RemoteMedia + 'static> RemoteBlockDevice<M> {
    pub fn new(name: impl Into<String>, media: M) -> Self {
        Self {
            name: name.into(),
            media: Arc::new(media),
            disconnected: Arc::new(AtomicBool::new(false)),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Ask the media to re-establish the link and resume submissions.
    pub fn reconnect(&self) -> IoResult<()> {
        self.media.reconnect()?;
        self.disconnected.store(false, Ordering::Release);
        debug!(device = %self.name, "remote link restored");
        Ok(())
    }
}

impl<M: RemoteMedia + 'static> BlockDevice for RemoteBlockDevice<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Remote disk"
    }

    fn geometry(&self) -> DeviceGeometry {
        self.media.geometry()
    }

    fn capabilities(&self) -> IoCapabilities {
        self.media.capabilities()
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        let (job_tx, job_rx) = async_channel::bounded::<IoRequest>(self.queue_depth);
        let completions = CompletionQueue::new(self.queue_depth);
        let media = self.media.clone();
        let disconnected = self.disconnected.clone();
        let worker_queue = completions.clone();
        let device_name = self.name.clone();
        let worker: JoinHandle<()> = std::thread::Builder::new()
            .name(format!("vblk-remote-{}", self.name))
            .spawn(move || {
                while let Ok(mut request) = job_rx.recv_blocking() {
                    let status = if disconnected.load(Ordering::Acquire) {
                        IoStatus::Err(IoError::new(IoErrorKind::Disconnected))
                    } else {
                        let status = run_exchange(media.as_ref(), &mut request);
                        if matches!(
                            status.err().map(IoError::kind),
                            Some(IoErrorKind::Disconnected)
                        ) {
                            warn!(device = %device_name, "remote link lost");
                            disconnected.store(true, Ordering::Release);
                        }
                        status
                    };
                    let mut item = Completed { request, status };
                    while let Err(back) = worker_queue.push(item) {
                        item = back;
                        std::thread::yield_now();
                    }
                }
            })
            .map_err(|err| {
                IoError::with_message(
                    IoErrorKind::ResourceExhausted,
                    format!("spawn channel worker: {err}"),
                )
            })?;

        Ok(Box::new(RemoteChannel {
            geometry: self.media.geometry(),
            capabilities: self.media.capabilities(),
            disconnected: self.disconnected.clone(),
            job_tx: Some(job_tx),
            completions,
            in_flight: 0,
            queue_depth: self.queue_depth,
            worker: Some(worker),
        }))
    }
}

struct Completed {
    request: IoRequest,
    status: IoStatus,
}

fn run_exchange<M: RemoteMedia>(media: &M, request: &mut IoRequest) -> IoStatus {
    if request.is_cancelled() {
        return IoStatus::Err(IoError::new(IoErrorKind::Aborted));
    }
    let payload = match request.io_type {
        IoType::Write | IoType::Compare => request.buffer.as_ref().map(|b| b.to_vec()),
        _ => None,
    };
    let command = RemoteCommand {
        io_type: request.io_type,
        lba: request.lba,
        num_blocks: request.num_blocks,
        payload,
    };
    match media.exchange(command) {
        Ok(reply) => {
            if request.io_type == IoType::Read {
                let Some(data) = reply.data else {
                    return IoStatus::Err(IoError::with_message(
                        IoErrorKind::Io,
                        "read exchange returned no data",
                    ));
                };
                let Some(buffer) = request.buffer.as_mut() else {
                    return IoStatus::Err(IoError::new(IoErrorKind::InvalidRange));
                };
                if let Err(err) = buffer.fill_from_slice(&data) {
                    return IoStatus::Err(err);
                }
            }
            IoStatus::Ok
        }
        Err(err) => IoStatus::Err(err),
    }
}

struct RemoteChannel {
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    disconnected: Arc<AtomicBool>,
    job_tx: Option<async_channel::Sender<IoRequest>>,
    completions: Arc<CompletionQueue<Completed>>,
    in_flight: usize,
    queue_depth: usize,
    worker: Option<JoinHandle<()>>,
}

impl DeviceChannel for RemoteChannel {
    fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
        if let Err(err) = check_request(&self.geometry, self.capabilities, &request) {
            return Err(SubmitReject::new(request, err));
        }
        if self.disconnected.load(Ordering::Acquire) {
            return Err(SubmitReject::new(
                request,
                IoError::with_message(IoErrorKind::Disconnected, "remote link is down"),
            ));
        }
        if self.in_flight >= self.queue_depth {
            return Err(SubmitReject::new(
                request,
                IoError::new(IoErrorKind::QueueFull),
            ));
        }
        let Some(job_tx) = self.job_tx.as_ref() else {
            return Err(SubmitReject::new(
                request,
                IoError::with_message(IoErrorKind::Io, "channel is shut down"),
            ));
        };
        match job_tx.try_send(request) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(())
            }
            Err(async_channel::TrySendError::Full(request)) => Err(SubmitReject::new(
                request,
                IoError::new(IoErrorKind::QueueFull),
            )),
            Err(async_channel::TrySendError::Closed(request)) => Err(SubmitReject::new(
                request,
                IoError::with_message(IoErrorKind::Io, "channel worker exited"),
            )),
        }
    }

    fn poll(&mut self) -> usize {
        let mut fired = 0;
        while let Some(done) = self.completions.pop() {
            self.in_flight -= 1;
            done.request.complete(done.status);
            fired += 1;
        }
        fired
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        self.job_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        while let Some(done) = self.completions.pop() {
            self.in_flight = self.in_flight.saturating_sub(1);
            done.request.complete(done.status);
        }
    }
}

/// In-memory media with a severable link, for exercising disconnect and
/// reconnect paths without a real initiator.
pub struct LoopbackMedia {
    geometry: DeviceGeometry,
    data: parking_lot::Mutex<Vec<u8>>,
    severed: AtomicBool,
}

impl LoopbackMedia {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            geometry: DeviceGeometry::new(block_size, block_count),
            data: parking_lot::Mutex::new(vec![0u8; (block_count * block_size as u64) as usize]),
            severed: AtomicBool::new(false),
        }
    }

    /// Simulate link loss; exchanges fail with `Disconnected` until
    /// [`RemoteMedia::reconnect`] is called.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::Release);
    }
}

impl RemoteMedia for LoopbackMedia {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> IoCapabilities {
        IoCapabilities::READ | IoCapabilities::WRITE | IoCapabilities::FLUSH | IoCapabilities::RESET
    }

    fn exchange(&self, command: RemoteCommand) -> IoResult<RemoteReply> {
        if self.severed.load(Ordering::Acquire) {
            return Err(IoError::with_message(
                IoErrorKind::Disconnected,
                "loopback link severed",
            ));
        }
        let block_size = self.geometry.block_size as u64;
        let offset = (command.lba * block_size) as usize;
        let len = (command.num_blocks * block_size) as usize;
        match command.io_type {
            IoType::Read => {
                let data = self.data.lock();
                Ok(RemoteReply {
                    data: Some(data[offset..offset + len].to_vec()),
                })
            }
            IoType::Write => {
                let payload = command.payload.ok_or_else(|| {
                    IoError::with_message(IoErrorKind::InvalidRange, "write without payload")
                })?;
                let mut data = self.data.lock();
                data[offset..offset + len].copy_from_slice(&payload);
                Ok(RemoteReply::default())
            }
            IoType::Flush | IoType::Reset => Ok(RemoteReply::default()),
            _ => Err(IoError::new(IoErrorKind::Unsupported)),
        }
    }

    fn reconnect(&self) -> IoResult<()> {
        self.severed.store(false, Ordering::Release);
        Ok(())
    }
}
