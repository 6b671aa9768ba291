#![forbid(unsafe_code)]
//! Device and chunk layer.
//!
//! Turns raw devices (files or block devices) into a structured substrate:
//! a drive endpoint for positional I/O, a first block per pdev, and a device
//! manager owning chunk and vdev metadata with atomic publication through
//! two alternating DM chunks.

pub mod chunk;
pub mod endpoint;
pub mod first_block;
pub mod layout;
pub mod manager;
pub mod vdev;

pub use chunk::{ChunkInfo, CHUNK_INFO_SIZE};
pub use endpoint::{AlignedBuf, DriveEndpoint, FileDrive};
pub use first_block::{DriveAttrs, FirstBlock};
pub use layout::PdevLayout;
pub use manager::{DevSpec, DeviceConfig, DeviceManager, VdevInfo, VdevParams, VDEV_INFO_SIZE};
pub use vdev::{VdevChunk, VirtualDev};

use om_error::OmError;

pub(crate) fn cx_err(dev: &str, msg: &str) -> OmError {
    OmError::device_io(dev, std::io::Error::other(msg.to_owned()))
}
