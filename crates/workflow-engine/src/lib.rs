use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use winstick_core::AttachedImage;
use winstick_host_macos::{AttachError, AttachOptions, ImageAttachService};
use winstick_iso::IsoError;
use winstick_plan::PlanError;
use winstick_validator::{EraseError, ValidationError};
use winstick_wim::WimError;

pub mod executor;
pub mod installer;

pub use executor::{CopyManifestEntry, ExecutionReport, PlanExecutor};
pub use installer::{
    locate_volume, WindowsInstallerUsbParams, WindowsInstallerUsbResult,
    WindowsInstallerUsbWorkflow,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Iso(#[from] IsoError),
    #[error("{0}")]
    Denied(String),
    #[error(transparent)]
    Erase(#[from] EraseError),
    #[error("volume {volume} did not appear on {disk} after erase")]
    VolumeNotFound { volume: String, disk: String },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("image {} contains no files", .0.display())]
    EmptyImage(PathBuf),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("verify failed for {} (expected {expected} bytes, got {actual})", .path.display())]
    VerifyFailed {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error(transparent)]
    Wim(#[from] WimError),
    #[error("could not set {key} on {}", .path.display())]
    PropertyPatch { path: PathBuf, key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    CheckImagePath,
    RevalidateDevice,
    CheckCollision,
    ReadIsoMetadata,
    AttachImage,
    CheckDeviceCapacity,
    SafetyGate,
    Erase,
    LocateVolume,
    CheckVolumeCapacity,
    BuildPlan,
    ExecutePlan,
    DetachImage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StepStarted { step: PipelineStep },
    StepFinished { step: PipelineStep },
    Progress {
        completed: usize,
        total: usize,
        bytes_done: u64,
        bytes_total: u64,
        path: PathBuf,
    },
    Log { message: String },
    Finished,
    Failed { message: String },
}

/// Optional event channel; a closed receiver is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink(Option<mpsc::Sender<PipelineEvent>>);

impl EventSink {
    pub(crate) fn new(sender: Option<mpsc::Sender<PipelineEvent>>) -> Self {
        Self(sender)
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<PipelineEvent>> {
        self.0.clone()
    }

    pub(crate) async fn emit(&self, event: PipelineEvent) {
        if let Some(sender) = &self.0 {
            let _ = sender.send(event).await;
        }
    }
}

/// Mounts a disk image and later releases it.
pub trait ImageAttacher: Send + Sync {
    fn attach(
        &self,
        image: &Path,
    ) -> impl Future<Output = Result<AttachedImage, AttachError>> + Send;

    fn detach(
        &self,
        dev_entry: &str,
        force: bool,
    ) -> impl Future<Output = Result<(), AttachError>> + Send;
}

impl ImageAttacher for ImageAttachService {
    async fn attach(&self, image: &Path) -> Result<AttachedImage, AttachError> {
        ImageAttachService::attach(self, image, &AttachOptions::default()).await
    }

    async fn detach(&self, dev_entry: &str, force: bool) -> Result<(), AttachError> {
        ImageAttachService::detach(self, dev_entry, force).await
    }
}
