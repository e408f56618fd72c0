use anyhow::{ensure, Result};
use std::collections::VecDeque;
use vblk_core::{
    check_request, BlockDevice, DeviceChannel, DeviceGeometry, IoCapabilities, IoError,
    IoErrorKind, IoRequest, IoResult, IoStatus, IoType, SubmitReject,
};

/// Block device with no backing store: writes are discarded and reads
/// return zeroes. Useful for measuring the dispatch path itself.
pub struct NullDevice {
    name: String,
    geometry: DeviceGeometry,
    queue_depth: usize,
}

impl NullDevice {
    pub fn new(name: impl Into<String>, block_size: u32, block_count: u64) -> Result<Self> {
        ensure!(
            block_size > 0 && block_size.is_power_of_two(),
            "block size must be a non-zero power of two"
        );
        ensure!(block_count > 0, "block count must be non-zero");
        Ok(Self {
            name: name.into(),
            geometry: DeviceGeometry::new(block_size, block_count),
            queue_depth: super::malloc::DEFAULT_QUEUE_DEPTH,
        })
    }
}

impl BlockDevice for NullDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Null disk"
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> IoCapabilities {
        IoCapabilities::READ | IoCapabilities::WRITE | IoCapabilities::FLUSH | IoCapabilities::RESET
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        Ok(Box::new(NullChannel {
            geometry: self.geometry,
            capabilities: self.capabilities(),
            pending: VecDeque::new(),
            queue_depth: self.queue_depth,
        }))
    }
}

struct NullChannel {
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    pending: VecDeque<(IoRequest, IoStatus)>,
    queue_depth: usize,
}

impl DeviceChannel for NullChannel {
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
        let status = if request.is_cancelled() {
            IoStatus::Err(IoError::new(IoErrorKind::Aborted))
        } else {
            if request.io_type == IoType::Read {
                if let Some(buffer) = request.buffer.as_mut() {
                    for segment in buffer.segments_mut() {
                        segment.fill(0);
                    }
                }
            }
            IoStatus::Ok
        };
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
