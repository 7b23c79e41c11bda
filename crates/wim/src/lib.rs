//! WIM archive access.
//!
//! Image count and properties come straight from the archive header and its
//! XML metadata. Property writes are staged in memory and committed by
//! [`WimArchive::apply_changes`]; committing, extraction and splitting go
//! through `wimlib-imagex`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use winstick_tools::{ToolError, ToolGateway};

pub mod header;
mod xml;

pub use header::WimHeader;

#[derive(Debug, Error)]
pub enum WimError {
    #[error("read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a WIM archive: {reason}", .path.display())]
    InvalidArchive { path: PathBuf, reason: String },
    #[error("image {index} out of range 1..={count}")]
    InvalidImageIndex { index: u32, count: u32 },
    #[error("destination {} is not a directory", .0.display())]
    InvalidDestination(PathBuf),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Outcome of a property write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyUpdate {
    Success,
    /// The image already carries the requested value; nothing was staged.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WimImageInfo {
    pub index: u32,
    pub name: Option<String>,
    pub description: Option<String>,
    pub total_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct WimArchive {
    path: PathBuf,
    wimlib: PathBuf,
    gateway: ToolGateway,
    header: WimHeader,
    xml: String,
    staged: BTreeMap<(u32, String), String>,
}

impl WimArchive {
    /// Open `path`, failing without a handle if the header or the XML
    /// metadata cannot be read.
    pub fn open(path: impl Into<PathBuf>, wimlib: impl Into<PathBuf>) -> Result<Self, WimError> {
        let path: PathBuf = path.into();
        let (header, xml) = header::read(&path)?;
        tracing::debug!(
            path = %path.display(),
            images = header.image_count,
            "opened wim"
        );
        Ok(Self {
            path,
            wimlib: wimlib.into(),
            gateway: ToolGateway::new(),
            header,
            xml,
            staged: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn image_count(&self) -> u32 {
        self.header.image_count
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.staged.is_empty()
    }

    /// `key` is a `/`-separated element path below `<IMAGE>`, e.g.
    /// `WINDOWS/INSTALLATIONTYPE`. Staged values win over the archive's.
    pub fn get_property(&self, key: &str, image: u32) -> Option<String> {
        if let Some(value) = self.staged.get(&(image, key.to_string())) {
            return Some(value.clone());
        }
        let content = xml::image(&self.xml, image)?;
        xml::lookup(content, key)
    }

    pub fn set_property(&mut self, key: &str, value: &str, image: u32) -> PropertyUpdate {
        if image == 0 || image > self.image_count() || key.trim_matches('/').is_empty() {
            tracing::warn!(path = %self.path.display(), image, key, "rejected property write");
            return PropertyUpdate::Failed;
        }
        if self.get_property(key, image).as_deref() == Some(value) {
            return PropertyUpdate::Skipped;
        }
        self.staged
            .insert((image, key.to_string()), value.to_string());
        tracing::debug!(path = %self.path.display(), image, key, value, "staged property");
        PropertyUpdate::Success
    }

    /// Apply to images `1..=image_count`. Stops at the first failure;
    /// `Success` only if some image actually changed.
    pub fn set_property_for_all_images(&mut self, key: &str, value: &str) -> PropertyUpdate {
        let mut changed = false;
        for image in 1..=self.image_count() {
            match self.set_property(key, value, image) {
                PropertyUpdate::Failed => return PropertyUpdate::Failed,
                PropertyUpdate::Success => changed = true,
                PropertyUpdate::Skipped => {}
            }
        }
        if changed {
            PropertyUpdate::Success
        } else {
            PropertyUpdate::Skipped
        }
    }

    pub fn images(&self) -> Vec<WimImageInfo> {
        (1..=self.image_count())
            .map(|index| WimImageInfo {
                index,
                name: self.get_property("NAME", index).filter(|v| !v.is_empty()),
                description: self
                    .get_property("DESCRIPTION", index)
                    .filter(|v| !v.is_empty()),
                total_bytes: self
                    .get_property("TOTALBYTES", index)
                    .and_then(|v| v.parse::<u64>().ok()),
            })
            .collect()
    }

    /// Write staged properties back to the archive, then reload its metadata.
    /// Staged values are kept if the commit fails.
    pub async fn apply_changes(&mut self) -> Result<(), WimError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let mut by_image: BTreeMap<u32, Vec<(&str, &str)>> = BTreeMap::new();
        for ((image, key), value) in &self.staged {
            by_image
                .entry(*image)
                .or_default()
                .push((key.as_str(), value.as_str()));
        }
        for (image, properties) in by_image {
            let mut args: Vec<OsString> = vec![
                "info".into(),
                self.path.clone().into_os_string(),
                image.to_string().into(),
            ];
            for (key, value) in properties {
                args.push("--image-property".into());
                args.push(format!("{}={}", key, value).into());
            }
            self.gateway.execute(&self.wimlib, &args).await?;
        }
        tracing::info!(
            path = %self.path.display(),
            properties = self.staged.len(),
            "committed wim properties"
        );
        self.staged.clear();
        let (header, xml) = header::read(&self.path)?;
        self.header = header;
        self.xml = xml;
        Ok(())
    }

    /// Extract archive paths from one image into `destination`, flattened.
    pub async fn extract_paths(
        &self,
        paths: &[String],
        destination: &Path,
        image: u32,
    ) -> Result<(), WimError> {
        self.check_index(image)?;
        if !destination.is_dir() {
            return Err(WimError::InvalidDestination(destination.to_path_buf()));
        }
        let mut args: Vec<OsString> = vec![
            "extract".into(),
            self.path.clone().into_os_string(),
            image.to_string().into(),
        ];
        args.extend(paths.iter().map(OsString::from));
        let mut dest_dir = OsString::from("--dest-dir=");
        dest_dir.push(destination.as_os_str());
        args.push(dest_dir);
        args.push("--no-preserve-dir-structure".into());

        self.gateway.execute(&self.wimlib, &args).await?;
        tracing::info!(
            path = %self.path.display(),
            image,
            count = paths.len(),
            destination = %destination.display(),
            "extracted wim paths"
        );
        Ok(())
    }

    /// Split into `.swm` parts of at most `part_bytes` (rounded down to MiB).
    pub async fn split(&self, destination: &Path, part_bytes: u64) -> Result<(), WimError> {
        let part_mib = (part_bytes / (1024 * 1024)).max(1);
        let args: Vec<OsString> = vec![
            "split".into(),
            self.path.clone().into_os_string(),
            destination.as_os_str().to_os_string(),
            part_mib.to_string().into(),
        ];
        self.gateway.execute(&self.wimlib, &args).await?;
        tracing::info!(
            path = %self.path.display(),
            destination = %destination.display(),
            part_mib,
            "split wim"
        );
        Ok(())
    }

    fn check_index(&self, image: u32) -> Result<(), WimError> {
        if image == 0 || image > self.image_count() {
            return Err(WimError::InvalidImageIndex {
                index: image,
                count: self.image_count(),
            });
        }
        Ok(())
    }
}

impl Drop for WimArchive {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            tracing::warn!(
                path = %self.path.display(),
                properties = self.staged.len(),
                "discarding uncommitted wim properties"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const XML: &str = r#"<WIM><TOTALBYTES>1024</TOTALBYTES><IMAGE INDEX="1"><NAME>Windows Setup Media</NAME><DESCRIPTION>Windows Setup</DESCRIPTION><TOTALBYTES>777</TOTALBYTES><WINDOWS><INSTALLATIONTYPE>WindowsPE</INSTALLATIONTYPE></WINDOWS></IMAGE><IMAGE INDEX="2"><NAME>Microsoft Windows Setup (amd64)</NAME><WINDOWS><INSTALLATIONTYPE>WindowsPE</INSTALLATIONTYPE></WINDOWS></IMAGE></WIM>"#;

    fn write_wim(dir: &Path, image_count: u32, xml: &str) -> PathBuf {
        let mut encoded = vec![0xff, 0xfe];
        for unit in xml.encode_utf16() {
            encoded.extend_from_slice(&unit.to_le_bytes());
        }
        let mut header = vec![0u8; header::HEADER_SIZE];
        header[..8].copy_from_slice(header::MAGIC);
        header[8..12].copy_from_slice(&(header::HEADER_SIZE as u32).to_le_bytes());
        header[40..42].copy_from_slice(&1u16.to_le_bytes());
        header[42..44].copy_from_slice(&1u16.to_le_bytes());
        header[44..48].copy_from_slice(&image_count.to_le_bytes());
        header[72..80].copy_from_slice(&(encoded.len() as u64).to_le_bytes());
        header[80..88].copy_from_slice(&(header::HEADER_SIZE as u64).to_le_bytes());
        header[88..96].copy_from_slice(&(encoded.len() as u64).to_le_bytes());

        let path = dir.join("boot.wim");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&header).unwrap();
        file.write_all(&encoded).unwrap();
        path
    }

    #[test]
    fn reads_count_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let wim = WimArchive::open(write_wim(dir.path(), 2, XML), "wimlib-imagex").unwrap();
        assert_eq!(wim.image_count(), 2);
        assert_eq!(
            wim.get_property("WINDOWS/INSTALLATIONTYPE", 2).as_deref(),
            Some("WindowsPE")
        );
        assert_eq!(wim.get_property("WINDOWS/INSTALLATIONTYPE", 3), None);

        let images = wim.images();
        assert_eq!(images[0].name.as_deref(), Some("Windows Setup Media"));
        assert_eq!(images[0].total_bytes, Some(777));
        assert_eq!(images[1].description, None);
    }

    #[test]
    fn bad_magic_gives_no_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.wim");
        std::fs::write(&path, vec![0u8; 512]).unwrap();
        assert!(matches!(
            WimArchive::open(&path, "wimlib-imagex"),
            Err(WimError::InvalidArchive { .. })
        ));
        assert!(matches!(
            WimArchive::open(dir.path().join("missing.wim"), "wimlib-imagex"),
            Err(WimError::Io { .. })
        ));
    }

    #[test]
    fn set_for_all_images_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut wim = WimArchive::open(write_wim(dir.path(), 2, XML), "true").unwrap();
        assert_eq!(
            wim.set_property_for_all_images("WINDOWS/INSTALLATIONTYPE", "Server"),
            PropertyUpdate::Success
        );
        assert_eq!(
            wim.set_property_for_all_images("WINDOWS/INSTALLATIONTYPE", "Server"),
            PropertyUpdate::Skipped
        );
        assert_eq!(
            wim.get_property("WINDOWS/INSTALLATIONTYPE", 1).as_deref(),
            Some("Server")
        );
    }

    #[test]
    fn single_image_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut wim = WimArchive::open(write_wim(dir.path(), 2, XML), "true").unwrap();
        assert_eq!(
            wim.set_property("WINDOWS/INSTALLATIONTYPE", "WindowsPE", 1),
            PropertyUpdate::Skipped
        );
        assert_eq!(
            wim.set_property("WINDOWS/INSTALLATIONTYPE", "Server", 3),
            PropertyUpdate::Failed
        );
        assert_eq!(wim.set_property("NAME", "Setup", 0), PropertyUpdate::Failed);
        assert!(!wim.has_pending_changes());
    }

    #[test]
    fn empty_archive_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut wim =
            WimArchive::open(write_wim(dir.path(), 0, "<WIM></WIM>"), "true").unwrap();
        assert_eq!(
            wim.set_property_for_all_images("WINDOWS/INSTALLATIONTYPE", "Server"),
            PropertyUpdate::Skipped
        );
    }

    #[tokio::test]
    async fn apply_changes_commits_through_tool() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wim(dir.path(), 2, XML);

        let mut failing = WimArchive::open(&path, "false").unwrap();
        failing.set_property("NAME", "Setup", 1);
        assert!(matches!(
            failing.apply_changes().await,
            Err(WimError::Tool(_))
        ));
        assert!(failing.has_pending_changes());

        let mut wim = WimArchive::open(&path, "true").unwrap();
        wim.set_property("NAME", "Setup", 1);
        wim.apply_changes().await.unwrap();
        assert!(!wim.has_pending_changes());
        assert!(wim.apply_changes().await.is_ok());
    }

    #[tokio::test]
    async fn extract_validates_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wim(dir.path(), 2, XML);
        let wim = WimArchive::open(&path, "echo").unwrap();
        let paths = vec!["Windows/Boot/PCAT/bootmgr".to_string()];

        assert!(wim.extract_paths(&paths, dir.path(), 1).await.is_ok());
        assert!(matches!(
            wim.extract_paths(&paths, dir.path(), 5).await,
            Err(WimError::InvalidImageIndex { index: 5, count: 2 })
        ));
        assert!(matches!(
            wim.extract_paths(&paths, &dir.path().join("nope"), 1).await,
            Err(WimError::InvalidDestination(_))
        ));
    }
}
