//! Pre-flight checks that must all pass before a destination disk is erased,
//! plus the erase itself.
//!
//! The checks are independent and meant to run in order: image path, device
//! re-validation, collision, capacity. None of them retries; a failure means
//! the caller has to start over from a fresh device selection.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use winstick_core::{whole_disk_name, BlockDevice, DeviceSource, DeviceSourceError, MountResolver};

pub mod erase;

pub use erase::{is_valid_device_name, EraseError, Eraser};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no image path given")]
    EmptyImagePath,
    #[error("image {} does not exist", .0.display())]
    ImageNotFound(PathBuf),
    #[error("image {} is not a regular file", .0.display())]
    ImageNotFile(PathBuf),
    #[error("image {} is not readable: {source}", .path.display())]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("device {device} can no longer be queried: {source}")]
    DeviceInfoUnavailable {
        device: String,
        #[source]
        source: DeviceSourceError,
    },
    #[error("device {device} was replaced (appearance time {expected:?} is now {actual:?})")]
    AppearanceTimestampMismatch {
        device: String,
        expected: Option<f64>,
        actual: Option<f64>,
    },
    #[error("cannot determine which disk stores {}: {source}", .path.display())]
    ImageLocationUnknown {
        path: PathBuf,
        #[source]
        source: DeviceSourceError,
    },
    #[error("image {} is stored on the destination disk {device}", .path.display())]
    ImagePathCollision { path: PathBuf, device: String },
    #[error("destination too small: {required} bytes required, {available} available")]
    InsufficientCapacity { required: u64, available: u64 },
    #[error("cannot query free space of {}", .0.display())]
    FreeSpaceUnavailable(PathBuf),
}

/// Non-empty, existing, regular and openable for reading.
pub fn check_image_path(path: &Path) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::EmptyImagePath);
    }
    let metadata = std::fs::metadata(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => ValidationError::ImageNotFound(path.to_path_buf()),
        _ => ValidationError::ImageUnreadable {
            path: path.to_path_buf(),
            source: err,
        },
    })?;
    if !metadata.is_file() {
        return Err(ValidationError::ImageNotFile(path.to_path_buf()));
    }
    File::open(path).map_err(|source| ValidationError::ImageUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Re-query `selected` by name and make sure it is still the same physical
/// attachment. Returns the fresh snapshot.
pub async fn revalidate_device<S: DeviceSource>(
    source: &S,
    selected: &BlockDevice,
) -> Result<BlockDevice, ValidationError> {
    let current = source.describe(&selected.name).await.map_err(|source| {
        ValidationError::DeviceInfoUnavailable {
            device: selected.name.clone(),
            source,
        }
    })?;
    if current.appearance_time != selected.appearance_time {
        tracing::warn!(
            device = %selected.name,
            expected = ?selected.appearance_time,
            actual = ?current.appearance_time,
            "device appearance time changed"
        );
        return Err(ValidationError::AppearanceTimestampMismatch {
            device: selected.name.clone(),
            expected: selected.appearance_time,
            actual: current.appearance_time,
        });
    }
    Ok(current)
}

/// Refuse a destination that is the disk the image itself is stored on.
pub fn verify_input_for_collision<M: MountResolver + ?Sized>(
    resolver: &M,
    image: &Path,
    destination: &BlockDevice,
) -> Result<(), ValidationError> {
    let image_disk =
        resolver
            .whole_disk_for_path(image)
            .map_err(|source| ValidationError::ImageLocationUnknown {
                path: image.to_path_buf(),
                source,
            })?;
    let destination_disk = whole_disk_name(&destination.name);
    if image_disk == destination_disk {
        return Err(ValidationError::ImagePathCollision {
            path: image.to_path_buf(),
            device: destination_disk,
        });
    }
    Ok(())
}

/// Inclusive: `available == required` passes.
pub fn verify_capacity(required: u64, available: u64) -> Result<(), ValidationError> {
    if available < required {
        return Err(ValidationError::InsufficientCapacity {
            required,
            available,
        });
    }
    Ok(())
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn free_space_bytes(path: &Path) -> Result<u64, ValidationError> {
    let unavailable = || ValidationError::FreeSpaceUnavailable(path.to_path_buf());
    #[cfg(unix)]
    {
        use libc::statvfs;
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| unavailable())?;
        let mut stats = MaybeUninit::zeroed();
        let result = unsafe { statvfs(c_path.as_ptr(), stats.as_mut_ptr()) };
        if result != 0 {
            return Err(unavailable());
        }
        let stats: libc::statvfs = unsafe { stats.assume_init() };
        Ok((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
    }
    #[cfg(not(unix))]
    {
        Err(unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSource {
        device: Mutex<Option<BlockDevice>>,
    }

    impl DeviceSource for FakeSource {
        async fn device_names(&self) -> Result<Vec<String>, DeviceSourceError> {
            Ok(self
                .device
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.name.clone())
                .collect())
        }

        async fn describe(&self, name: &str) -> Result<BlockDevice, DeviceSourceError> {
            self.device
                .lock()
                .unwrap()
                .clone()
                .filter(|d| d.name == name)
                .ok_or_else(|| DeviceSourceError::NotFound(name.to_string()))
        }
    }

    struct FixedResolver(&'static str);

    impl MountResolver for FixedResolver {
        fn whole_disk_for_path(&self, _path: &Path) -> Result<String, DeviceSourceError> {
            Ok(self.0.to_string())
        }

        fn volumes_on_disk(&self, _disk: &str) -> Result<Vec<PathBuf>, DeviceSourceError> {
            Ok(Vec::new())
        }
    }

    struct NoResolver;

    impl MountResolver for NoResolver {
        fn whole_disk_for_path(&self, path: &Path) -> Result<String, DeviceSourceError> {
            Err(DeviceSourceError::MountNotFound(path.to_path_buf()))
        }

        fn volumes_on_disk(&self, _disk: &str) -> Result<Vec<PathBuf>, DeviceSourceError> {
            Ok(Vec::new())
        }
    }

    fn device(name: &str, appearance: f64) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            vendor: Some("SanDisk".to_string()),
            model: Some("Ultra".to_string()),
            bus_protocol: Some("USB".to_string()),
            whole_disk: true,
            removable: true,
            ejectable: true,
            internal: false,
            writable: true,
            encrypted: false,
            size_bytes: 32 << 30,
            appearance_time: Some(appearance),
            mount_path: None,
            filesystem_kind: None,
            volume_uuid: None,
        }
    }

    #[test]
    fn image_path_checks() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("win.iso");
        std::fs::write(&image, b"iso").unwrap();

        assert!(check_image_path(&image).is_ok());
        assert!(matches!(
            check_image_path(Path::new("")),
            Err(ValidationError::EmptyImagePath)
        ));
        assert!(matches!(
            check_image_path(&dir.path().join("missing.iso")),
            Err(ValidationError::ImageNotFound(_))
        ));
        assert!(matches!(
            check_image_path(dir.path()),
            Err(ValidationError::ImageNotFile(_))
        ));
    }

    #[tokio::test]
    async fn same_appearance_time_passes() {
        let source = FakeSource {
            device: Mutex::new(Some(device("disk4", 100.0))),
        };
        let fresh = revalidate_device(&source, &device("disk4", 100.0))
            .await
            .unwrap();
        assert_eq!(fresh.name, "disk4");
    }

    #[tokio::test]
    async fn swapped_hardware_is_rejected() {
        let source = FakeSource {
            device: Mutex::new(Some(device("disk4", 250.0))),
        };
        match revalidate_device(&source, &device("disk4", 100.0)).await {
            Err(ValidationError::AppearanceTimestampMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, Some(100.0));
                assert_eq!(actual, Some(250.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn vanished_device_is_unavailable() {
        let source = FakeSource {
            device: Mutex::new(None),
        };
        assert!(matches!(
            revalidate_device(&source, &device("disk4", 100.0)).await,
            Err(ValidationError::DeviceInfoUnavailable { .. })
        ));
    }

    #[test]
    fn collision_is_detected_on_whole_disk() {
        let image = Path::new("/Volumes/STICK/win.iso");
        assert!(matches!(
            verify_input_for_collision(&FixedResolver("disk4"), image, &device("disk4", 1.0)),
            Err(ValidationError::ImagePathCollision { .. })
        ));
        assert!(
            verify_input_for_collision(&FixedResolver("disk1"), image, &device("disk4", 1.0))
                .is_ok()
        );
        assert!(matches!(
            verify_input_for_collision(&NoResolver, image, &device("disk4", 1.0)),
            Err(ValidationError::ImageLocationUnknown { .. })
        ));
    }

    #[test]
    fn capacity_boundary_is_inclusive() {
        match verify_capacity(20, 10) {
            Err(ValidationError::InsufficientCapacity {
                required,
                available,
            }) => {
                assert_eq!(required, 20);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(verify_capacity(20, 20).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn free_space_of_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space_bytes(dir.path()).is_ok());
        assert!(matches!(
            free_space_bytes(&dir.path().join("nope")),
            Err(ValidationError::FreeSpaceUnavailable(_))
        ));
    }
}
