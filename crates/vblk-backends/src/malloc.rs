use anyhow::{Context, ensure, Result};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use vblk_core::{
    check_request, BlockDevice, DeviceChannel, DeviceGeometry, IoCapabilities, IoError,
    IoErrorKind, IoRequest, IoResult, IoStatus, SubmitReject,
};

pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Memory-backed block device.
///
/// Requests execute synchronously at submission but still complete through
/// the normal poll path, so upper layers see one uniform asynchronous
/// surface regardless of backend.
pub struct MallocDevice {
    name: String,
    geometry: DeviceGeometry,
    data: Arc<RwLock<Vec<u8>>>,
    queue_depth: usize,
}

impl MallocDevice {
    pub fn new(name: impl Into<String>, block_size: u32, block_count: u64) -> Result<Self> {
        ensure!(
            block_size > 0 && block_size.is_power_of_two(),
            "block size must be a non-zero power of two"
        );
        ensure!(block_count > 0, "block count must be non-zero");
        let bytes = block_count
            .checked_mul(block_size as u64)
            .and_then(|b| usize::try_from(b).ok())
            .context("device size overflows addressable memory")?;
        Ok(Self {
            name: name.into(),
            geometry: DeviceGeometry::new(block_size, block_count),
            data: Arc::new(RwLock::new(vec![0u8; bytes])),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        })
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

impl BlockDevice for MallocDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Malloc disk"
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> IoCapabilities {
        IoCapabilities::READ
            | IoCapabilities::WRITE
            | IoCapabilities::UNMAP
            | IoCapabilities::FLUSH
            | IoCapabilities::WRITE_ZEROES
            | IoCapabilities::RESET
            | IoCapabilities::COMPARE
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        Ok(Box::new(MallocChannel {
            data: self.data.clone(),
            geometry: self.geometry,
            capabilities: self.capabilities(),
            pending: VecDeque::new(),
            queue_depth: self.queue_depth,
        }))
    }
}

struct MallocChannel {
    data: Arc<RwLock<Vec<u8>>>,
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    pending: VecDeque<(IoRequest, IoStatus)>,
    queue_depth: usize,
}

impl MallocChannel {
    fn execute(&mut self, request: &mut IoRequest) -> IoStatus {
        if request.is_cancelled() {
            return IoStatus::Err(IoError::new(IoErrorKind::Aborted));
        }
        let block_size = self.geometry.block_size as u64;
        let offset = (request.lba * block_size) as usize;
        let len = (request.num_blocks * block_size) as usize;
        match request.io_type {
            vblk_core::IoType::Read => {
                let data = self.data.read();
                let Some(buffer) = request.buffer.as_mut() else {
                    return IoStatus::Err(IoError::new(IoErrorKind::InvalidRange));
                };
                match buffer.fill_from_slice(&data[offset..offset + len]) {
                    Ok(()) => IoStatus::Ok,
                    Err(err) => IoStatus::Err(err),
                }
            }
            vblk_core::IoType::Write => {
                let mut data = self.data.write();
                let Some(buffer) = request.buffer.as_ref() else {
                    return IoStatus::Err(IoError::new(IoErrorKind::InvalidRange));
                };
                let mut at = offset;
                for segment in buffer.segments() {
                    data[at..at + segment.len()].copy_from_slice(segment);
                    at += segment.len();
                }
                IoStatus::Ok
            }
            vblk_core::IoType::Compare => {
                let data = self.data.read();
                let Some(buffer) = request.buffer.as_ref() else {
                    return IoStatus::Err(IoError::new(IoErrorKind::InvalidRange));
                };
                let mut at = offset;
                for segment in buffer.segments() {
                    if &data[at..at + segment.len()] != segment.as_slice() {
                        return IoStatus::Err(IoError::with_message(
                            IoErrorKind::Io,
                            format!("miscompare in range starting at lba {}", request.lba),
                        ));
                    }
                    at += segment.len();
                }
                IoStatus::Ok
            }
            vblk_core::IoType::Unmap | vblk_core::IoType::WriteZeroes => {
                let mut data = self.data.write();
                data[offset..offset + len].fill(0);
                IoStatus::Ok
            }
            vblk_core::IoType::Flush | vblk_core::IoType::Reset => IoStatus::Ok,
        }
    }
}

impl DeviceChannel for MallocChannel {
    fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
        if let Err(err) = check_request(&self.geometry, self.capabilities, &request) {
            return Err(SubmitReject::new(request, err));
        }
        if self.pending.len() >= self.queue_depth {
            return Err(SubmitReject::new(
                request,
                IoError::new(IoErrorKind::QueueFull),
            ));
        }
        let mut request = request;
        let status = self.execute(&mut request);
        self.pending.push_back((request, status));
        Ok(())
    }

    fn poll(&mut self) -> usize {
        let fired = self.pending.len();
        for (request, status) in self.pending.drain(..) {
            request.complete(status);
        }
        fired
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
