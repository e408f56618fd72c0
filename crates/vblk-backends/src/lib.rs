//! Base backends for the vblk block layer: memory-backed, null, and
//! file-backed devices. Network-attached media lives in `vblk-remote`.

pub mod file;
pub mod malloc;
pub mod null;

pub use file::FileDevice;
pub use malloc::MallocDevice;
pub use null::NullDevice;
