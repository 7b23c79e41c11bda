use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod config;
pub mod filesystem;

pub use config::{ConfigError, PipelineConfig};
pub use filesystem::{BootMode, FilesystemError, FilesystemSpec, PartitionScheme};

/// Snapshot of one block device as seen at a single point in time.
///
/// A fresh snapshot is built on every query; snapshots are never updated in
/// place. Two snapshots with the same `name` but different `appearance_time`
/// describe different physical attachments.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BlockDevice {
    pub name: String, // "disk4", "sdb", "sdb1"
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub bus_protocol: Option<String>,
    pub whole_disk: bool,
    pub removable: bool,
    pub ejectable: bool,
    pub internal: bool,
    pub writable: bool,
    pub encrypted: bool,
    pub size_bytes: u64,
    /// Seconds since the Unix epoch at which the OS published this device.
    pub appearance_time: Option<f64>,
    pub mount_path: Option<PathBuf>,
    pub filesystem_kind: Option<String>,
    pub volume_uuid: Option<String>,
}

impl BlockDevice {
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    pub fn same_attachment(&self, other: &BlockDevice) -> bool {
        self.name == other.name && self.appearance_time == other.appearance_time
    }

    pub fn friendly_name(&self) -> String {
        match (&self.vendor, &self.model) {
            (Some(vendor), Some(model)) => format!("{} {}", vendor, model),
            (None, Some(model)) => model.clone(),
            (Some(vendor), None) => vendor.clone(),
            (None, None) => self.name.clone(),
        }
    }
}

/// Result of attaching a disk image: exactly one mounted volume.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AttachedImage {
    pub mount_point: PathBuf,
    pub dev_entry: String,
    pub volume_kind: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeviceSourceError {
    #[error("device arbitration session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("device {0} not found")]
    NotFound(String),
    #[error("device {device} is missing required property {key}")]
    MissingProperty { device: String, key: &'static str },
    #[error("failed to describe device {device}: {message}")]
    Query { device: String, message: String },
    #[error("no mounted device backs {}", .0.display())]
    MountNotFound(PathBuf),
}

/// OS-specific access to the block device namespace.
///
/// `device_names` failing means the platform session itself is unusable;
/// `describe` failing only concerns that one device.
pub trait DeviceSource: Send + Sync + 'static {
    fn device_names(&self) -> impl Future<Output = Result<Vec<String>, DeviceSourceError>> + Send;

    fn describe(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<BlockDevice, DeviceSourceError>> + Send;
}

/// Maps between mounted paths and the whole disks that store them.
pub trait MountResolver: Send + Sync {
    fn whole_disk_for_path(&self, path: &Path) -> Result<String, DeviceSourceError>;

    /// Mount points of every volume currently mounted from `disk`.
    fn volumes_on_disk(&self, disk: &str) -> Result<Vec<PathBuf>, DeviceSourceError>;
}

/// Strip a partition suffix from a device name: `disk4s2` -> `disk4`,
/// `nvme0n1p3` -> `nvme0n1`, `sdb1` -> `sdb`.
pub fn whole_disk_name(name: &str) -> String {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    let name = name.strip_prefix('r').filter(|rest| rest.starts_with("disk")).unwrap_or(name);
    if let Some(rest) = name.strip_prefix("disk") {
        if let Some(idx) = rest.find('s') {
            return format!("disk{}", &rest[..idx]);
        }
        return name.to_string();
    }
    if (name.starts_with("nvme") || name.starts_with("mmcblk")) && name.contains('p') {
        if let Some(idx) = name.rfind('p') {
            if name[idx + 1..].chars().all(|c| c.is_ascii_digit()) && idx + 1 < name.len() {
                return name[..idx].to_string();
            }
        }
        return name.to_string();
    }
    if name.starts_with("nvme") || name.starts_with("mmcblk") || name.starts_with("loop") {
        return name.to_string();
    }
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.is_empty() {
        name.to_string()
    } else {
        trimmed.to_string()
    }
}
