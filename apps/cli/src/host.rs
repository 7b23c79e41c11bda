use std::path::{Path, PathBuf};
use winstick_core::{BlockDevice, DeviceSource, DeviceSourceError, MountResolver, PipelineConfig};
use winstick_host_linux::{LinuxDeviceSource, LinuxMountResolver};
use winstick_host_macos::{DiskutilDeviceSource, MacosMountResolver};

/// Device source for the running OS.
pub enum HostDevices {
    Linux(LinuxDeviceSource),
    Macos(DiskutilDeviceSource),
}

impl HostDevices {
    pub fn detect(config: &PipelineConfig) -> Self {
        if cfg!(target_os = "macos") {
            HostDevices::Macos(DiskutilDeviceSource::new(&config.diskutil_path))
        } else {
            HostDevices::Linux(LinuxDeviceSource::default())
        }
    }
}

impl DeviceSource for HostDevices {
    async fn device_names(&self) -> Result<Vec<String>, DeviceSourceError> {
        match self {
            HostDevices::Linux(source) => source.device_names().await,
            HostDevices::Macos(source) => source.device_names().await,
        }
    }

    async fn describe(&self, name: &str) -> Result<BlockDevice, DeviceSourceError> {
        match self {
            HostDevices::Linux(source) => source.describe(name).await,
            HostDevices::Macos(source) => source.describe(name).await,
        }
    }
}

pub enum HostResolver {
    Linux(LinuxMountResolver),
    Macos(MacosMountResolver),
}

impl HostResolver {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            HostResolver::Macos(MacosMountResolver)
        } else {
            HostResolver::Linux(LinuxMountResolver::default())
        }
    }
}

impl MountResolver for HostResolver {
    fn whole_disk_for_path(&self, path: &Path) -> Result<String, DeviceSourceError> {
        match self {
            HostResolver::Linux(resolver) => resolver.whole_disk_for_path(path),
            HostResolver::Macos(resolver) => resolver.whole_disk_for_path(path),
        }
    }

    fn volumes_on_disk(&self, disk: &str) -> Result<Vec<PathBuf>, DeviceSourceError> {
        match self {
            HostResolver::Linux(resolver) => resolver.volumes_on_disk(disk),
            HostResolver::Macos(resolver) => resolver.volumes_on_disk(disk),
        }
    }
}
