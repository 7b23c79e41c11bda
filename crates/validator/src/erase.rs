use std::path::PathBuf;
use thiserror::Error;
use winstick_core::{BootMode, FilesystemError, FilesystemSpec};
use winstick_safety::{DeviceLocks, LockError};
use winstick_tools::ToolGateway;

#[derive(Debug, Error)]
pub enum EraseError {
    #[error("{0} is not a block device name")]
    InvalidDevice(String),
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error("erase failed: {0}")]
    EraseFailed(String),
    #[error("an erase is already running on {0}")]
    EraseInProgress(String),
}

impl From<LockError> for EraseError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(disk) => EraseError::EraseInProgress(disk),
        }
    }
}

/// `diskN`, `rdiskN` or either under `/dev/`.
pub fn is_valid_device_name(device: &str) -> bool {
    let name = device.strip_prefix("/dev/").unwrap_or(device);
    let name = name.strip_prefix('r').unwrap_or(name);
    match name.strip_prefix("disk") {
        Some(number) => !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Reformats a whole disk with `diskutil eraseDisk`.
#[derive(Debug, Clone)]
pub struct Eraser {
    gateway: ToolGateway,
    diskutil: PathBuf,
    locks: DeviceLocks,
}

impl Eraser {
    pub fn new(diskutil: impl Into<PathBuf>, locks: DeviceLocks) -> Self {
        Self {
            gateway: ToolGateway::new(),
            diskutil: diskutil.into(),
            locks,
        }
    }

    /// Irreversible. All input is validated before the tool runs; the
    /// per-disk lock is held until the tool exits.
    pub async fn erase_disk(
        &self,
        device: &str,
        volume_name: &str,
        filesystem: FilesystemSpec,
        boot_mode: BootMode,
    ) -> Result<String, EraseError> {
        if !is_valid_device_name(device) {
            return Err(EraseError::InvalidDevice(device.to_string()));
        }
        filesystem.validate_name(volume_name)?;
        let scheme = boot_mode.partition_scheme();
        let _lock = self.locks.try_acquire(device)?;

        tracing::info!(
            device,
            volume = volume_name,
            filesystem = filesystem.canonical_name(),
            scheme = scheme.as_str(),
            "erasing disk"
        );
        let output = self
            .gateway
            .execute(
                &self.diskutil,
                [
                    "eraseDisk",
                    filesystem.canonical_name(),
                    volume_name,
                    scheme.as_str(),
                    device,
                ],
            )
            .await
            .map_err(|err| EraseError::EraseFailed(err.diagnostic()))?;
        tracing::info!(device, "erase finished");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names() {
        assert!(is_valid_device_name("disk4"));
        assert!(is_valid_device_name("/dev/disk12"));
        assert!(is_valid_device_name("/dev/rdisk4"));
        assert!(!is_valid_device_name("disk4s1"));
        assert!(!is_valid_device_name("/dev/disk"));
        assert!(!is_valid_device_name("sdb"));
        assert!(!is_valid_device_name("/tmp/disk4"));
        assert!(!is_valid_device_name(""));
    }

    #[tokio::test]
    async fn passes_scheme_for_boot_mode() {
        let eraser = Eraser::new("echo", DeviceLocks::new());
        let out = eraser
            .erase_disk("/dev/disk4", "WININSTALL", FilesystemSpec::Fat32, BootMode::Legacy)
            .await
            .unwrap();
        assert_eq!(out, "eraseDisk FAT32 WININSTALL MBR /dev/disk4");

        let out = eraser
            .erase_disk("disk4", "Windows 11", FilesystemSpec::ExFat, BootMode::Uefi)
            .await
            .unwrap();
        assert_eq!(out, "eraseDisk ExFAT Windows 11 GPT disk4");
    }

    #[tokio::test]
    async fn rejects_bad_input_before_running() {
        // "false" would fail; reaching it means validation was skipped.
        let eraser = Eraser::new("false", DeviceLocks::new());
        assert!(matches!(
            eraser
                .erase_disk("/dev/sda", "WIN", FilesystemSpec::Fat32, BootMode::Uefi)
                .await,
            Err(EraseError::InvalidDevice(_))
        ));
        assert!(matches!(
            eraser
                .erase_disk("disk4", "WIN ", FilesystemSpec::Fat32, BootMode::Uefi)
                .await,
            Err(EraseError::Filesystem(FilesystemError::IllegalSpacing { .. }))
        ));
        assert!(matches!(
            eraser
                .erase_disk("disk4", "", FilesystemSpec::ExFat, BootMode::Uefi)
                .await,
            Err(EraseError::Filesystem(FilesystemError::EmptyName))
        ));
    }

    #[tokio::test]
    async fn tool_failure_is_reported() {
        let eraser = Eraser::new("false", DeviceLocks::new());
        assert!(matches!(
            eraser
                .erase_disk("disk4", "WIN", FilesystemSpec::Fat32, BootMode::Uefi)
                .await,
            Err(EraseError::EraseFailed(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_erase_of_same_disk_is_refused() {
        let locks = DeviceLocks::new();
        let _held = locks.try_acquire("disk4").unwrap();
        let eraser = Eraser::new("echo", locks);
        assert!(matches!(
            eraser
                .erase_disk("/dev/rdisk4", "WIN", FilesystemSpec::Fat32, BootMode::Uefi)
                .await,
            Err(EraseError::EraseInProgress(disk)) if disk == "disk4"
        ));
    }
}
