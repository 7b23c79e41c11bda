use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use winstick_core::{whole_disk_name, BlockDevice, DeviceSource, DeviceSourceError, MountResolver};

/// Block devices as published under sysfs.
#[derive(Debug, Clone)]
pub struct LinuxDeviceSource {
    class_block: PathBuf,
    dev_root: PathBuf,
    mounts: PathBuf,
    uuid_dir: PathBuf,
}

impl Default for LinuxDeviceSource {
    fn default() -> Self {
        Self {
            class_block: PathBuf::from("/sys/class/block"),
            dev_root: PathBuf::from("/dev"),
            mounts: PathBuf::from("/proc/self/mounts"),
            uuid_dir: PathBuf::from("/dev/disk/by-uuid"),
        }
    }
}

impl LinuxDeviceSource {
    pub fn with_roots(
        class_block: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        mounts: impl Into<PathBuf>,
        uuid_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            class_block: class_block.into(),
            dev_root: dev_root.into(),
            mounts: mounts.into(),
            uuid_dir: uuid_dir.into(),
        }
    }

    fn list_names(&self) -> Result<Vec<String>, DeviceSourceError> {
        let entries = fs::read_dir(&self.class_block).map_err(|err| {
            DeviceSourceError::SessionUnavailable(format!(
                "read {}: {}",
                self.class_block.display(),
                err
            ))
        })?;
        let mut names: Vec<String> = entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| !is_ram_disk(name))
            .collect();
        names.sort();
        Ok(names)
    }

    fn describe_sync(&self, name: &str) -> Result<BlockDevice, DeviceSourceError> {
        let entry = self.class_block.join(name);
        if !entry.exists() {
            return Err(DeviceSourceError::NotFound(name.to_string()));
        }
        let size_bytes = read_u64(entry.join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .ok_or_else(|| DeviceSourceError::MissingProperty {
                device: name.to_string(),
                key: "size",
            })?;

        let whole_disk = !entry.join("partition").exists();
        let canonical = fs::canonicalize(&entry).unwrap_or_else(|_| entry.clone());
        let disk_dir = if whole_disk {
            canonical.clone()
        } else {
            canonical
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| canonical.clone())
        };

        let removable = read_u64(disk_dir.join("removable")).unwrap_or(0) == 1;
        let read_only = read_u64(entry.join("ro")).unwrap_or(0) == 1;
        let bus_protocol = bus_from_sysfs_path(&canonical);
        let is_usb = bus_protocol.as_deref() == Some("USB");

        let mounts = read_mount_table(&self.mounts);
        let mount = mounts.iter().find(|mount| mount.device == name);
        let uuids = read_uuids(&self.uuid_dir);

        Ok(BlockDevice {
            name: name.to_string(),
            vendor: read_string(disk_dir.join("device/vendor")).filter(|v| !v.is_empty()),
            model: read_string(disk_dir.join("device/model")).filter(|v| !v.is_empty()),
            bus_protocol,
            whole_disk,
            removable,
            ejectable: removable || is_usb,
            internal: !(removable || is_usb),
            writable: !read_only,
            encrypted: is_crypt_backed(&entry),
            size_bytes,
            appearance_time: appearance_time(&self.dev_root.join(name)),
            mount_path: mount.map(|m| PathBuf::from(&m.mount_point)),
            filesystem_kind: mount.map(|m| m.fs_type.clone()),
            volume_uuid: uuids.get(name).cloned(),
        })
    }
}

impl DeviceSource for LinuxDeviceSource {
    async fn device_names(&self) -> Result<Vec<String>, DeviceSourceError> {
        self.list_names()
    }

    async fn describe(&self, name: &str) -> Result<BlockDevice, DeviceSourceError> {
        self.describe_sync(name)
    }
}

/// Resolves paths through the mount table to their backing whole disk.
#[derive(Debug, Clone)]
pub struct LinuxMountResolver {
    class_block: PathBuf,
    mounts: PathBuf,
}

impl Default for LinuxMountResolver {
    fn default() -> Self {
        Self {
            class_block: PathBuf::from("/sys/class/block"),
            mounts: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl LinuxMountResolver {
    pub fn with_roots(class_block: impl Into<PathBuf>, mounts: impl Into<PathBuf>) -> Self {
        Self {
            class_block: class_block.into(),
            mounts: mounts.into(),
        }
    }

    /// Physical whole disk behind `name`. Device-mapper nodes (LUKS, LVM)
    /// are followed through `slaves/` down to the disk that stores them.
    fn parent_disk(&self, name: &str) -> String {
        self.parent_disk_at(name, 0)
    }

    fn parent_disk_at(&self, name: &str, depth: usize) -> String {
        let name = self.kernel_name(name);
        let entry = self.class_block.join(&name);
        if depth < MAX_STACK_DEPTH {
            if let Some(slave) = first_slave(&entry) {
                return self.parent_disk_at(&slave, depth + 1);
            }
        }
        if entry.join("partition").exists() {
            if let Some(parent) = fs::canonicalize(&entry)
                .ok()
                .and_then(|path| path.parent().and_then(|p| p.file_name()).map(|n| n.to_owned()))
            {
                return parent.to_string_lossy().to_string();
            }
        }
        if entry.exists() {
            return name;
        }
        whole_disk_name(&name)
    }

    /// `/dev/mapper/<name>` mounts appear under their mapper name; sysfs only
    /// knows the `dm-N` node, which records that name in `dm/name`.
    fn kernel_name(&self, name: &str) -> String {
        if self.class_block.join(name).exists() {
            return name.to_string();
        }
        let Ok(entries) = fs::read_dir(&self.class_block) else {
            return name.to_string();
        };
        entries
            .flatten()
            .find(|entry| read_string(entry.path().join("dm/name")).as_deref() == Some(name))
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string())
    }
}

const MAX_STACK_DEPTH: usize = 8;

fn first_slave(entry: &Path) -> Option<String> {
    let mut slaves: Vec<String> = fs::read_dir(entry.join("slaves"))
        .ok()?
        .flatten()
        .map(|slave| slave.file_name().to_string_lossy().to_string())
        .collect();
    slaves.sort();
    slaves.into_iter().next()
}

impl MountResolver for LinuxMountResolver {
    fn whole_disk_for_path(&self, path: &Path) -> Result<String, DeviceSourceError> {
        let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mounts = read_mount_table(&self.mounts);
        let best = mounts
            .iter()
            .filter(|mount| target.starts_with(&mount.mount_point))
            .max_by_key(|mount| mount.mount_point.len())
            .ok_or_else(|| DeviceSourceError::MountNotFound(path.to_path_buf()))?;
        Ok(self.parent_disk(&best.device))
    }

    fn volumes_on_disk(&self, disk: &str) -> Result<Vec<PathBuf>, DeviceSourceError> {
        let disk = self.parent_disk(disk.strip_prefix("/dev/").unwrap_or(disk));
        Ok(read_mount_table(&self.mounts)
            .into_iter()
            .filter(|mount| self.parent_disk(&mount.device) == disk)
            .map(|mount| PathBuf::from(mount.mount_point))
            .collect())
    }
}

#[derive(Debug, Clone)]
struct MountEntry {
    device: String,
    mount_point: String,
    fs_type: String,
}

fn read_mount_table(path: &Path) -> Vec<MountEntry> {
    let data = fs::read_to_string(path).unwrap_or_default();
    let mut mounts = Vec::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fs_type)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        let name = Path::new(device)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        mounts.push(MountEntry {
            device: name,
            mount_point: unescape_mount(mount_point),
            fs_type: fs_type.to_string(),
        });
    }
    mounts
}

fn read_uuids(dir: &Path) -> HashMap<String, String> {
    let mut uuids = HashMap::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                if let Some(name) = target.file_name().and_then(|v| v.to_str()) {
                    uuids.insert(
                        name.to_string(),
                        entry.file_name().to_string_lossy().to_string(),
                    );
                }
            }
        }
    }
    uuids
}

fn bus_from_sysfs_path(path: &Path) -> Option<String> {
    let value = path.to_string_lossy();
    let bus = if value.contains("/usb") {
        "USB"
    } else if value.contains("/nvme") {
        "NVMe"
    } else if value.contains("/mmc") {
        "SD"
    } else if value.contains("/ata") {
        "SATA"
    } else if value.contains("/virtio") {
        "Virtio"
    } else if value.contains("/virtual/") {
        "Virtual"
    } else {
        return None;
    };
    Some(bus.to_string())
}

fn is_crypt_backed(entry: &Path) -> bool {
    let Ok(holders) = fs::read_dir(entry.join("holders")) else {
        return false;
    };
    holders.flatten().any(|holder| {
        read_string(holder.path().join("dm/uuid"))
            .map(|uuid| uuid.starts_with("CRYPT-"))
            .unwrap_or(false)
    })
}

fn appearance_time(node: &Path) -> Option<f64> {
    let modified = fs::metadata(node).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

fn is_ram_disk(name: &str) -> bool {
    name.starts_with("ram") || name.starts_with("zram")
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if next.is_ascii_digit() {
                        octal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(byte as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&octal);
        } else {
            output.push(ch);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    struct FakeSys {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl FakeSys {
        fn class_block(&self) -> PathBuf {
            self.root.join("class/block")
        }

        fn source(&self) -> LinuxDeviceSource {
            LinuxDeviceSource::with_roots(
                self.class_block(),
                self.root.join("dev"),
                self.root.join("mounts"),
                self.root.join("by-uuid"),
            )
        }
    }

    fn write(path: PathBuf, value: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value).unwrap();
    }

    // usb stick sdb with one partition, plus an internal nvme disk
    fn fake_sys() -> FakeSys {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let usb = root.join("devices/pci0000:00/usb2/2-1/host6/block/sdb");
        write(usb.join("size"), "30031872\n");
        write(usb.join("removable"), "1\n");
        write(usb.join("ro"), "0\n");
        write(usb.join("device/vendor"), "SanDisk \n");
        write(usb.join("device/model"), "Ultra\n");
        write(usb.join("sdb1/size"), "30029824\n");
        write(usb.join("sdb1/partition"), "1\n");
        write(usb.join("sdb1/ro"), "0\n");

        let nvme = root.join("devices/pci0000:00/nvme/nvme0/nvme0n1");
        write(nvme.join("size"), "1000215216\n");
        write(nvme.join("removable"), "0\n");
        write(nvme.join("ro"), "0\n");
        write(nvme.join("device/model"), "Samsung SSD 980\n");
        write(nvme.join("nvme0n1p2/size"), "999000000\n");
        write(nvme.join("nvme0n1p2/partition"), "2\n");

        let class = root.join("class/block");
        fs::create_dir_all(&class).unwrap();
        symlink(&usb, class.join("sdb")).unwrap();
        symlink(usb.join("sdb1"), class.join("sdb1")).unwrap();
        symlink(&nvme, class.join("nvme0n1")).unwrap();
        symlink(nvme.join("nvme0n1p2"), class.join("nvme0n1p2")).unwrap();
        fs::create_dir_all(class.join("zram0")).unwrap();

        write(root.join("dev/sdb"), "");
        write(
            root.join("mounts"),
            "proc /proc proc rw 0 0\n\
             /dev/nvme0n1p2 / ext4 rw 0 0\n\
             /dev/sdb1 /media/user/CCCOMA\\040X64 vfat rw 0 0\n",
        );
        fs::create_dir_all(root.join("by-uuid")).unwrap();
        symlink("../../sdb1", root.join("by-uuid/1A2B-3C4D")).unwrap();

        FakeSys { _dir: dir, root }
    }

    #[tokio::test]
    async fn lists_devices_without_ram_disks() {
        let sys = fake_sys();
        let names = sys.source().device_names().await.unwrap();
        assert_eq!(names, vec!["nvme0n1", "nvme0n1p2", "sdb", "sdb1"]);
    }

    #[tokio::test]
    async fn describes_usb_whole_disk() {
        let sys = fake_sys();
        let disk = sys.source().describe("sdb").await.unwrap();
        assert!(disk.whole_disk);
        assert!(disk.removable);
        assert!(!disk.internal);
        assert!(disk.writable);
        assert_eq!(disk.size_bytes, 30031872 * 512);
        assert_eq!(disk.vendor.as_deref(), Some("SanDisk"));
        assert_eq!(disk.model.as_deref(), Some("Ultra"));
        assert_eq!(disk.bus_protocol.as_deref(), Some("USB"));
        assert!(disk.appearance_time.is_some());
    }

    #[tokio::test]
    async fn describes_partition_with_volume_fields() {
        let sys = fake_sys();
        let part = sys.source().describe("sdb1").await.unwrap();
        assert!(!part.whole_disk);
        assert!(part.removable);
        assert_eq!(part.mount_path, Some(PathBuf::from("/media/user/CCCOMA X64")));
        assert_eq!(part.filesystem_kind.as_deref(), Some("vfat"));
        assert_eq!(part.volume_uuid.as_deref(), Some("1A2B-3C4D"));
        assert_eq!(part.appearance_time, None);
    }

    #[tokio::test]
    async fn internal_disk_is_flagged() {
        let sys = fake_sys();
        let disk = sys.source().describe("nvme0n1").await.unwrap();
        assert!(disk.internal);
        assert_eq!(disk.bus_protocol.as_deref(), Some("NVMe"));
    }

    #[tokio::test]
    async fn missing_size_is_rejected() {
        let sys = fake_sys();
        fs::create_dir_all(sys.class_block().join("sdz")).unwrap();
        assert!(matches!(
            sys.source().describe("sdz").await,
            Err(DeviceSourceError::MissingProperty { key: "size", .. })
        ));
        assert!(matches!(
            sys.source().describe("sdq").await,
            Err(DeviceSourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unreadable_class_dir_is_fatal() {
        let source = LinuxDeviceSource::with_roots("/nonexistent/block", "/dev", "/x", "/y");
        assert!(matches!(
            source.device_names().await,
            Err(DeviceSourceError::SessionUnavailable(_))
        ));
    }

    #[test]
    fn resolves_path_to_whole_disk() {
        let sys = fake_sys();
        let resolver = LinuxMountResolver::with_roots(sys.class_block(), sys.root.join("mounts"));
        assert_eq!(
            resolver
                .whole_disk_for_path(Path::new("/media/user/CCCOMA X64/sources/install.wim"))
                .unwrap(),
            "sdb"
        );
        assert_eq!(
            resolver
                .whole_disk_for_path(Path::new("/home/user/Win11.iso"))
                .unwrap(),
            "nvme0n1"
        );
    }

    #[test]
    fn encrypted_volume_resolves_to_physical_disk() {
        let sys = fake_sys();
        let dm = sys.root.join("devices/virtual/block/dm-0");
        write(dm.join("size"), "30000000\n");
        write(dm.join("dm/name"), "luks-1a2b\n");
        fs::create_dir_all(dm.join("slaves")).unwrap();
        symlink(
            sys.class_block().join("sdb1"),
            dm.join("slaves/sdb1"),
        )
        .unwrap();
        symlink(&dm, sys.class_block().join("dm-0")).unwrap();
        write(
            sys.root.join("mounts"),
            "/dev/nvme0n1p2 / ext4 rw 0 0\n\
             /dev/mapper/luks-1a2b /mnt/secure ext4 rw 0 0\n",
        );

        let resolver = LinuxMountResolver::with_roots(sys.class_block(), sys.root.join("mounts"));
        assert_eq!(
            resolver
                .whole_disk_for_path(Path::new("/mnt/secure/images/Win11.iso"))
                .unwrap(),
            "sdb"
        );
        assert_eq!(
            resolver.volumes_on_disk("/dev/sdb").unwrap(),
            vec![PathBuf::from("/mnt/secure")]
        );
    }

    #[test]
    fn volumes_are_listed_per_disk() {
        let sys = fake_sys();
        let resolver = LinuxMountResolver::with_roots(sys.class_block(), sys.root.join("mounts"));
        assert_eq!(
            resolver.volumes_on_disk("sdb").unwrap(),
            vec![PathBuf::from("/media/user/CCCOMA X64")]
        );
        assert!(resolver.volumes_on_disk("sdz").unwrap().is_empty());
    }

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(unescape_mount("/mnt/a\\040b"), "/mnt/a b");
        assert_eq!(unescape_mount("/mnt/plain"), "/mnt/plain");
    }
}
