use serde::Deserialize;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use winstick_core::{BlockDevice, DeviceSource, DeviceSourceError};
use winstick_tools::{ToolError, ToolGateway};

/// Block devices as reported by `diskutil list|info -plist`.
#[derive(Debug, Clone)]
pub struct DiskutilDeviceSource {
    gateway: ToolGateway,
    diskutil: PathBuf,
    dev_root: PathBuf,
}

impl DiskutilDeviceSource {
    pub fn new(diskutil: impl Into<PathBuf>) -> Self {
        Self {
            gateway: ToolGateway::new(),
            diskutil: diskutil.into(),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiskList {
    #[serde(rename = "AllDisks", default)]
    all_disks: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DiskInfo {
    #[serde(rename = "DeviceIdentifier")]
    device_identifier: Option<String>,
    #[serde(rename = "MediaName")]
    media_name: Option<String>,
    #[serde(rename = "IORegistryEntryName")]
    io_registry_entry_name: Option<String>,
    #[serde(rename = "BusProtocol")]
    bus_protocol: Option<String>,
    #[serde(rename = "WholeDisk")]
    whole_disk: Option<bool>,
    #[serde(rename = "Removable")]
    removable: Option<bool>,
    #[serde(rename = "RemovableMedia")]
    removable_media: Option<bool>,
    #[serde(rename = "Ejectable")]
    ejectable: Option<bool>,
    #[serde(rename = "Internal")]
    internal: Option<bool>,
    #[serde(rename = "WritableMedia")]
    writable_media: Option<bool>,
    #[serde(rename = "FileVault")]
    file_vault: Option<bool>,
    #[serde(rename = "Encryption")]
    encryption: Option<bool>,
    #[serde(rename = "TotalSize")]
    total_size: Option<u64>,
    #[serde(rename = "Size")]
    size: Option<u64>,
    #[serde(rename = "MountPoint")]
    mount_point: Option<String>,
    #[serde(rename = "FilesystemType")]
    filesystem_type: Option<String>,
    #[serde(rename = "VolumeUUID")]
    volume_uuid: Option<String>,
}

pub(crate) fn decode_disk_list(text: &str) -> Result<Vec<String>, DeviceSourceError> {
    let list: DiskList = plist::from_bytes(text.as_bytes()).map_err(|err| {
        DeviceSourceError::SessionUnavailable(format!("undecodable diskutil list output: {}", err))
    })?;
    Ok(list.all_disks)
}

pub(crate) fn decode_disk_info(
    name: &str,
    text: &str,
    appearance_time: Option<f64>,
) -> Result<BlockDevice, DeviceSourceError> {
    let info: DiskInfo =
        plist::from_bytes(text.as_bytes()).map_err(|err| DeviceSourceError::Query {
            device: name.to_string(),
            message: format!("undecodable diskutil info output: {}", err),
        })?;

    let identifier = info
        .device_identifier
        .clone()
        .ok_or_else(|| DeviceSourceError::MissingProperty {
            device: name.to_string(),
            key: "DeviceIdentifier",
        })?;
    let size_bytes =
        info.total_size
            .or(info.size)
            .ok_or_else(|| DeviceSourceError::MissingProperty {
                device: name.to_string(),
                key: "TotalSize",
            })?;

    let internal = info.internal.unwrap_or(false);
    Ok(BlockDevice {
        name: identifier,
        vendor: None,
        model: info
            .media_name
            .or(info.io_registry_entry_name)
            .filter(|value| !value.is_empty()),
        bus_protocol: info.bus_protocol.filter(|value| !value.is_empty()),
        whole_disk: info.whole_disk.unwrap_or(false),
        removable: info.removable.or(info.removable_media).unwrap_or(false),
        ejectable: info.ejectable.unwrap_or(false),
        internal,
        writable: info.writable_media.unwrap_or(true),
        encrypted: info.file_vault.or(info.encryption).unwrap_or(false),
        size_bytes,
        appearance_time,
        mount_path: info
            .mount_point
            .filter(|value| !value.is_empty())
            .map(PathBuf::from),
        filesystem_kind: info.filesystem_type.filter(|value| !value.is_empty()),
        volume_uuid: info.volume_uuid.filter(|value| !value.is_empty()),
    })
}

impl DeviceSource for DiskutilDeviceSource {
    async fn device_names(&self) -> Result<Vec<String>, DeviceSourceError> {
        let output = self
            .gateway
            .execute(&self.diskutil, ["list", "-plist"])
            .await
            .map_err(|err| DeviceSourceError::SessionUnavailable(err.to_string()))?;
        decode_disk_list(&output)
    }

    async fn describe(&self, name: &str) -> Result<BlockDevice, DeviceSourceError> {
        let output = self
            .gateway
            .execute(&self.diskutil, ["info", "-plist", name])
            .await
            .map_err(|err| match err {
                ToolError::Failure { ref stderr, .. } if stderr.contains("Could not find") => {
                    DeviceSourceError::NotFound(name.to_string())
                }
                other => DeviceSourceError::Query {
                    device: name.to_string(),
                    message: other.diagnostic(),
                },
            })?;
        let appearance = std::fs::metadata(self.dev_root.join(name))
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64());
        decode_disk_info(name, &output, appearance)
    }
}
