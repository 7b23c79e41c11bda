use std::path::{Path, PathBuf};
use winstick_core::{whole_disk_name, DeviceSourceError, MountResolver};

/// One row of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Resolves paths through the live mount table (`getfsstat`).
#[derive(Debug, Clone, Copy, Default)]
pub struct MacosMountResolver;

impl MountResolver for MacosMountResolver {
    fn whole_disk_for_path(&self, path: &Path) -> Result<String, DeviceSourceError> {
        let mounts = read_mounts()?;
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        backing_disk(&mounts, &canonical)
            .ok_or_else(|| DeviceSourceError::MountNotFound(path.to_path_buf()))
    }

    fn volumes_on_disk(&self, disk: &str) -> Result<Vec<PathBuf>, DeviceSourceError> {
        Ok(mounted_from(&read_mounts()?, disk))
    }
}

/// Whole disk behind the longest mount point containing `path`.
pub(crate) fn backing_disk(mounts: &[MountEntry], path: &Path) -> Option<String> {
    mounts
        .iter()
        .filter(|mount| mount.device.starts_with("/dev/"))
        .filter(|mount| path.starts_with(&mount.mount_point))
        .max_by_key(|mount| mount.mount_point.as_os_str().len())
        .map(|mount| whole_disk_name(&mount.device))
}

pub(crate) fn mounted_from(mounts: &[MountEntry], disk: &str) -> Vec<PathBuf> {
    let disk = whole_disk_name(disk);
    mounts
        .iter()
        .filter(|mount| mount.device.starts_with("/dev/"))
        .filter(|mount| whole_disk_name(&mount.device) == disk)
        .map(|mount| mount.mount_point.clone())
        .collect()
}

#[cfg(target_os = "macos")]
pub fn read_mounts() -> Result<Vec<MountEntry>, DeviceSourceError> {
    use libc::{getfsstat, statfs, MNT_NOWAIT};
    use std::ffi::CStr;
    use std::mem::size_of;
    use std::ptr;

    let count = unsafe { getfsstat(ptr::null_mut(), 0, MNT_NOWAIT) };
    if count < 0 {
        return Err(DeviceSourceError::SessionUnavailable(
            "getfsstat failed".to_string(),
        ));
    }
    let mut buf = vec![unsafe { std::mem::zeroed::<statfs>() }; count as usize];
    let res = unsafe {
        getfsstat(
            buf.as_mut_ptr(),
            (buf.len() * size_of::<statfs>()) as i32,
            MNT_NOWAIT,
        )
    };
    if res < 0 {
        return Err(DeviceSourceError::SessionUnavailable(
            "getfsstat returned error".to_string(),
        ));
    }

    let mut entries = Vec::new();
    for entry in buf.into_iter().take(res as usize) {
        let device = unsafe { CStr::from_ptr(entry.f_mntfromname.as_ptr()) }
            .to_string_lossy()
            .to_string();
        let mount_point = unsafe { CStr::from_ptr(entry.f_mntonname.as_ptr()) }
            .to_string_lossy()
            .to_string();
        let fs_type = unsafe { CStr::from_ptr(entry.f_fstypename.as_ptr()) }
            .to_string_lossy()
            .to_string();
        entries.push(MountEntry {
            device,
            mount_point: PathBuf::from(mount_point),
            fs_type,
        });
    }
    Ok(entries)
}

#[cfg(not(target_os = "macos"))]
pub fn read_mounts() -> Result<Vec<MountEntry>, DeviceSourceError> {
    Err(DeviceSourceError::SessionUnavailable(
        "mount table lookup requires macOS".to_string(),
    ))
}
