//! Core contract of the vblk block-device virtualization layer: the device
//! and channel traits, the registry, request/completion plumbing, scatter
//! gather buffers, and the per-context poller.
//!
//! Backends live in `vblk-backends`/`vblk-remote`; stacked virtual devices
//! (crypto, fault injection, logical volumes) build on the same traits.

pub mod buffer;
pub mod device;
pub mod error;
pub mod poller;
pub mod registry;
pub mod request;
pub mod stats;

pub use buffer::{BufferPool, IoBuffer, VecBufferPool};
pub use device::{
    check_request, BlockDevice, DeviceChannel, DeviceGeometry, IoCapabilities, SubmitReject,
};
pub use error::{IoError, IoErrorKind, IoResult};
pub use poller::{CompletionQueue, IoPoller, PollerSlot};
pub use registry::{
    ClaimGuard, DeviceHandle, DeviceInfo, DeviceRegistry, OpenChannel, RegistryEvent,
    TEARDOWN_POLL_BUDGET,
};
pub use request::{CancelToken, IoCompletion, IoRequest, IoStatus, IoType};
pub use stats::{DeviceStats, DeviceStatsSnapshot, StatSnapshot};
