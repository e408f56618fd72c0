use crate::{IoError, IoErrorKind, IoRequest, IoResult, IoType};
use bitflags::bitflags;
use serde::Serialize;

/// Fixed media geometry; immutable for the lifetime of a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceGeometry {
    pub block_size: u32,
    pub block_count: u64,
    /// Preferred I/O split boundary in blocks; 0 means none.
    pub optimal_io_boundary: u32,
    pub write_cache: bool,
}

impl DeviceGeometry {
    pub const fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            optimal_io_boundary: 0,
            write_cache: false,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.block_count * self.block_size as u64
    }
}

bitflags! {
    /// Operation kinds a device supports.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IoCapabilities: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const UNMAP = 1 << 2;
        const FLUSH = 1 << 3;
        const WRITE_ZEROES = 1 << 4;
        const RESET = 1 << 5;
        const COMPARE = 1 << 6;
    }
}

impl IoCapabilities {
    pub fn supports(&self, io_type: IoType) -> bool {
        let needed = match io_type {
            IoType::Read => IoCapabilities::READ,
            IoType::Write => IoCapabilities::WRITE,
            IoType::Unmap => IoCapabilities::UNMAP,
            IoType::Flush => IoCapabilities::FLUSH,
            IoType::WriteZeroes => IoCapabilities::WRITE_ZEROES,
            IoType::Reset => IoCapabilities::RESET,
            IoType::Compare => IoCapabilities::COMPARE,
        };
        self.contains(needed)
    }
}

/// Returned when a submission is rejected synchronously; the request is
/// handed back untouched so the caller can retry or drop it.
pub struct SubmitReject {
    pub request: IoRequest,
    pub error: IoError,
}

impl SubmitReject {
    pub fn new(request: IoRequest, error: IoError) -> Self {
        Self { request, error }
    }
}

impl std::fmt::Debug for SubmitReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitReject")
            .field("request", &self.request)
            .field("error", &self.error)
            .finish()
    }
}

/// The polymorphic contract every backend and vbdev implements.
///
/// Geometry and capabilities are fixed at construction; all I/O flows through
/// per-context channels created by [`BlockDevice::open_channel`].
pub trait BlockDevice: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &str;

    /// Human-readable backend description (e.g. "Malloc disk").
    fn product_name(&self) -> &str;

    fn geometry(&self) -> DeviceGeometry;

    fn capabilities(&self) -> IoCapabilities;

    /// Create backend channel resources for the calling execution context.
    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>>;
}

/// Per-execution-context submission handle.
///
/// Exactly one context owns a channel; `poll` fires completion callbacks on
/// the calling context and never anywhere else. `submit` is non-blocking:
/// a full queue rejects with `QueueFull` and no side effects.
pub trait DeviceChannel: Send {
    fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject>;

    /// Drain ready completions, invoking callbacks; returns how many fired.
    fn poll(&mut self) -> usize;

    fn in_flight(&self) -> usize;
}

/// Shared request validation: capability membership, range bounds, and
/// payload sizing. `lba = 0, num_blocks = block_count` is a valid
/// full-device span.
pub fn check_request(
    geometry: &DeviceGeometry,
    capabilities: IoCapabilities,
    request: &IoRequest,
) -> IoResult<()> {
    if !capabilities.supports(request.io_type) {
        return Err(IoError::with_message(
            IoErrorKind::Unsupported,
            format!("{:?} not supported by device", request.io_type),
        ));
    }
    if matches!(request.io_type, IoType::Flush | IoType::Reset) {
        return Ok(());
    }
    let end = request
        .lba
        .checked_add(request.num_blocks)
        .ok_or_else(|| IoError::with_message(IoErrorKind::InvalidRange, "lba overflow"))?;
    if end > geometry.block_count {
        return Err(IoError::with_message(
            IoErrorKind::InvalidRange,
            format!(
                "lba {} + {} blocks exceeds device of {} blocks",
                request.lba, request.num_blocks, geometry.block_count
            ),
        ));
    }
    if request.io_type.carries_data() {
        let expected = request.byte_len(geometry.block_size);
        let actual = request.buffer.as_ref().map(|b| b.len()).unwrap_or(0);
        if actual != expected {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                format!("payload is {actual} bytes, request needs {expected}"),
            ));
        }
    }
    Ok(())
}
