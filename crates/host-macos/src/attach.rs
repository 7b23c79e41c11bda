use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use winstick_core::{whole_disk_name, AttachedImage};
use winstick_tools::{ToolError, ToolGateway};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("image attach failed: {0}")]
    AttachFailed(String),
    #[error("image attach produced {0} mounted volumes, expected exactly one")]
    UnsupportedVolumeCount(usize),
    #[error("image detach failed: {0}")]
    DetachFailed(String),
}

/// Mount flags passed to `hdiutil attach` after `-plist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub read_only: bool,
    pub browse: bool,
    pub verify: bool,
    pub mount_root: Option<PathBuf>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            browse: false,
            verify: false,
            mount_root: None,
        }
    }
}

impl AttachOptions {
    fn to_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if !self.browse {
            args.push("-nobrowse".into());
        }
        if self.read_only {
            args.push("-readonly".into());
        }
        if !self.verify {
            args.push("-noverify".into());
        }
        if let Some(root) = &self.mount_root {
            args.push("-mountroot".into());
            args.push(root.as_os_str().to_os_string());
        }
        args
    }
}

#[derive(Debug, Deserialize)]
struct AttachOutput {
    #[serde(rename = "system-entities")]
    system_entities: Vec<SystemEntity>,
}

#[derive(Debug, Deserialize)]
struct SystemEntity {
    #[serde(rename = "dev-entry")]
    dev_entry: String,
    #[serde(rename = "mount-point")]
    mount_point: Option<String>,
    #[serde(rename = "volume-kind")]
    volume_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReportedEntities {
    #[serde(rename = "system-entities", default)]
    system_entities: Vec<ReportedEntity>,
}

#[derive(Debug, Deserialize)]
struct ReportedEntity {
    #[serde(rename = "dev-entry")]
    dev_entry: Option<String>,
}

/// Whole disks named anywhere in attach output, even output that
/// [`decode_attach_output`] rejects.
fn reported_disks(text: &str) -> Vec<String> {
    let Ok(reported) = plist::from_bytes::<ReportedEntities>(text.as_bytes()) else {
        return Vec::new();
    };
    let mut disks: Vec<String> = reported
        .system_entities
        .into_iter()
        .filter_map(|entity| entity.dev_entry)
        .filter(|entry| !entry.is_empty())
        .map(|entry| format!("/dev/{}", whole_disk_name(&entry)))
        .collect();
    disks.sort();
    disks.dedup();
    disks
}

/// Decode `hdiutil attach -plist` output into the single mounted volume.
///
/// Partition-map and whole-disk entities carry no mount point and are not
/// counted.
pub fn decode_attach_output(text: &str) -> Result<AttachedImage, AttachError> {
    let output: AttachOutput = plist::from_bytes(text.as_bytes())
        .map_err(|err| AttachError::AttachFailed(format!("undecodable attach output: {}", err)))?;

    let mut mounted: Vec<AttachedImage> = output
        .system_entities
        .into_iter()
        .filter_map(|entity| {
            let mount_point = entity.mount_point.filter(|value| !value.is_empty())?;
            Some(AttachedImage {
                mount_point: PathBuf::from(mount_point),
                dev_entry: entity.dev_entry,
                volume_kind: entity.volume_kind,
            })
        })
        .collect();

    match mounted.len() {
        1 => Ok(mounted.remove(0)),
        count => Err(AttachError::UnsupportedVolumeCount(count)),
    }
}

#[derive(Debug, Clone)]
pub struct ImageAttachService {
    gateway: ToolGateway,
    hdiutil: PathBuf,
}

impl ImageAttachService {
    pub fn new(hdiutil: impl Into<PathBuf>) -> Self {
        Self {
            gateway: ToolGateway::new(),
            hdiutil: hdiutil.into(),
        }
    }

    pub async fn attach(
        &self,
        image: &Path,
        options: &AttachOptions,
    ) -> Result<AttachedImage, AttachError> {
        let mut args: Vec<OsString> = vec![
            "attach".into(),
            image.as_os_str().to_os_string(),
            "-plist".into(),
        ];
        args.extend(options.to_args());

        let output = self
            .gateway
            .execute(&self.hdiutil, &args)
            .await
            .map_err(|err| AttachError::AttachFailed(err.diagnostic()))?;
        let attached = match decode_attach_output(&output) {
            Ok(attached) => attached,
            Err(err) => {
                self.release_rejected(&output).await;
                return Err(err);
            }
        };
        tracing::info!(
            image = %image.display(),
            dev = %attached.dev_entry,
            mount = %attached.mount_point.display(),
            "image attached"
        );
        Ok(attached)
    }

    // The tool attached something we will not hand out; force it off again.
    async fn release_rejected(&self, output: &str) {
        for disk in reported_disks(output) {
            if let Err(err) = self.detach(&disk, true).await {
                tracing::warn!(dev = %disk, error = %err, "could not detach rejected image");
            }
        }
    }

    pub async fn detach(&self, dev_entry: &str, force: bool) -> Result<(), AttachError> {
        let mut args = vec!["detach", dev_entry];
        if force {
            args.push("-force");
        }
        match self.gateway.execute(&self.hdiutil, args).await {
            Ok(_) => {
                tracing::info!(dev = dev_entry, force, "image detached");
                Ok(())
            }
            Err(err @ ToolError::InvalidInvocation(_)) => {
                Err(AttachError::DetachFailed(err.to_string()))
            }
            Err(err) => Err(AttachError::DetachFailed(err.diagnostic())),
        }
    }
}
