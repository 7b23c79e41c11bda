//! macOS backends: `diskutil` for device topology, `hdiutil` for image
//! attachment and the kernel mount table for path resolution.

pub mod attach;
pub mod diskutil;
pub mod mounts;

pub use attach::{decode_attach_output, AttachError, AttachOptions, ImageAttachService};
pub use diskutil::DiskutilDeviceSource;
pub use mounts::{read_mounts, MacosMountResolver, MountEntry};
