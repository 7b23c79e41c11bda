use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use winstick_core::{
    whole_disk_name, AttachedImage, BlockDevice, BootMode, DeviceSource, FilesystemSpec,
    MountResolver, PipelineConfig,
};
use winstick_iso::IsoVolumeMetadata;
use winstick_plan::{build_plan, customize_plan, PlanOptions};
use winstick_safety::{can_erase_disk, SafetyContext, SafetyDecision};
use winstick_validator::{
    check_image_path, free_space_bytes, revalidate_device, verify_capacity,
    verify_input_for_collision, EraseError, Eraser,
};

use crate::executor::{ExecutionReport, PlanExecutor};
use crate::{EventSink, ImageAttacher, PipelineEvent, PipelineStep, WorkflowError};

#[derive(Debug, Clone)]
pub struct WindowsInstallerUsbParams {
    pub image_path: PathBuf,
    pub target: BlockDevice,
    pub volume_name: String,
    pub filesystem: FilesystemSpec,
    pub boot_mode: BootMode,
    pub patch_installer_requirements: bool,
    pub force: bool,
    pub confirmation_token: Option<String>,
    pub allow_internal: bool,
    pub hash_manifest: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowsInstallerUsbResult {
    pub iso: Option<IsoVolumeMetadata>,
    pub target_disk: String,
    pub target_volume: PathBuf,
    pub planned_operations: usize,
    pub execution: Option<ExecutionReport>,
    pub dry_run: bool,
}

pub struct WindowsInstallerUsbWorkflow<S, M, A> {
    params: WindowsInstallerUsbParams,
    devices: S,
    resolver: M,
    attacher: A,
    eraser: Eraser,
    config: PipelineConfig,
    events: EventSink,
}

impl<S, M, A> WindowsInstallerUsbWorkflow<S, M, A>
where
    S: DeviceSource,
    M: MountResolver,
    A: ImageAttacher,
{
    pub fn new(
        params: WindowsInstallerUsbParams,
        devices: S,
        resolver: M,
        attacher: A,
        eraser: Eraser,
        config: PipelineConfig,
    ) -> Self {
        Self {
            params,
            devices,
            resolver,
            attacher,
            eraser,
            config,
            events: EventSink::default(),
        }
    }

    pub fn with_events(mut self, sender: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = EventSink::new(Some(sender));
        self
    }

    pub async fn execute(&self) -> Result<WindowsInstallerUsbResult, WorkflowError> {
        let result = self.prepare_and_write().await;
        match &result {
            Ok(_) => self.events.emit(PipelineEvent::Finished).await,
            Err(err) => {
                tracing::error!(error = %err, "windows installer workflow failed");
                self.events
                    .emit(PipelineEvent::Failed {
                        message: err.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    async fn prepare_and_write(&self) -> Result<WindowsInstallerUsbResult, WorkflowError> {
        let params = &self.params;
        let image = params.image_path.as_path();

        self.begin(PipelineStep::CheckImagePath).await;
        check_image_path(image)?;
        self.end(PipelineStep::CheckImagePath).await;

        self.begin(PipelineStep::RevalidateDevice).await;
        let device = revalidate_device(&self.devices, &params.target).await?;
        self.end(PipelineStep::RevalidateDevice).await;

        self.begin(PipelineStep::CheckCollision).await;
        verify_input_for_collision(&self.resolver, image, &device)?;
        self.end(PipelineStep::CheckCollision).await;

        let iso = if is_iso(image) {
            self.begin(PipelineStep::ReadIsoMetadata).await;
            let metadata = winstick_iso::parse(image)?;
            self.log(format!("iso volume={}", metadata.volume_identifier))
                .await;
            self.end(PipelineStep::ReadIsoMetadata).await;
            Some(metadata)
        } else {
            None
        };
        let required = match &iso {
            Some(metadata) => metadata.capacity_bytes,
            None => std::fs::metadata(image)
                .map_err(|source| WorkflowError::Io {
                    action: "stat",
                    path: image.to_path_buf(),
                    source,
                })?
                .len(),
        };

        self.begin(PipelineStep::AttachImage).await;
        let attached = self.attacher.attach(image).await?;
        self.end(PipelineStep::AttachImage).await;

        let result = self.write_attached(&device, &attached, iso, required).await;

        self.begin(PipelineStep::DetachImage).await;
        let detached = self.attacher.detach(&attached.dev_entry, false).await;
        self.end(PipelineStep::DetachImage).await;
        match (result, detached) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(detach_err)) => {
                tracing::warn!(error = %detach_err, dev = %attached.dev_entry, "detach failed");
                Err(err)
            }
        }
    }

    async fn write_attached(
        &self,
        device: &BlockDevice,
        attached: &AttachedImage,
        iso: Option<IsoVolumeMetadata>,
        required: u64,
    ) -> Result<WindowsInstallerUsbResult, WorkflowError> {
        let params = &self.params;

        self.begin(PipelineStep::CheckDeviceCapacity).await;
        verify_capacity(required, device.size_bytes)?;
        self.end(PipelineStep::CheckDeviceCapacity).await;

        self.begin(PipelineStep::SafetyGate).await;
        let ctx = SafetyContext {
            force_mode: params.force,
            confirmation_token: params.confirmation_token.clone(),
            allow_internal: params.allow_internal,
        };
        if !params.dry_run {
            match can_erase_disk(&ctx, device.internal) {
                SafetyDecision::Allow => {}
                SafetyDecision::Deny(reason) => return Err(WorkflowError::Denied(reason)),
            }
        }
        self.end(PipelineStep::SafetyGate).await;

        let disk = whole_disk_name(&device.name);
        let planned_root = self.config.volume_root.join(&params.volume_name);
        let options = PlanOptions {
            filesystem: params.filesystem,
            split_part_bytes: self.config.fat32_split_part_bytes(),
            patch_installer_requirements: params.patch_installer_requirements,
            legacy_boot: params.boot_mode == BootMode::Legacy,
        };

        if params.dry_run {
            // Validate the volume name and plan against the future mount point.
            params
                .filesystem
                .validate_name(&params.volume_name)
                .map_err(EraseError::from)?;
            self.begin(PipelineStep::BuildPlan).await;
            let plan = self.plan(&attached.mount_point, &planned_root, &options)?;
            self.end(PipelineStep::BuildPlan).await;
            self.log("dry run: nothing written".to_string()).await;
            return Ok(WindowsInstallerUsbResult {
                iso,
                target_disk: disk,
                target_volume: planned_root,
                planned_operations: winstick_plan::operation_count(&plan),
                execution: None,
                dry_run: true,
            });
        }

        self.begin(PipelineStep::Erase).await;
        let output = self
            .eraser
            .erase_disk(
                &device.device_path(),
                &params.volume_name,
                params.filesystem,
                params.boot_mode,
            )
            .await?;
        self.log(output).await;
        self.end(PipelineStep::Erase).await;

        self.begin(PipelineStep::LocateVolume).await;
        let volume = self.wait_for_volume(&disk).await?;
        self.end(PipelineStep::LocateVolume).await;

        self.begin(PipelineStep::CheckVolumeCapacity).await;
        verify_capacity(required, free_space_bytes(&volume)?)?;
        self.end(PipelineStep::CheckVolumeCapacity).await;

        self.begin(PipelineStep::BuildPlan).await;
        let plan = self.plan(&attached.mount_point, &volume, &options)?;
        self.end(PipelineStep::BuildPlan).await;

        self.begin(PipelineStep::ExecutePlan).await;
        let mut executor = PlanExecutor::new(&self.config.wimlib_imagex_path)
            .hash_manifest(params.hash_manifest);
        if let Some(sender) = self.events.sender() {
            executor = executor.with_events(sender);
        }
        let report = executor.execute(&plan).await?;
        self.end(PipelineStep::ExecutePlan).await;

        Ok(WindowsInstallerUsbResult {
            iso,
            target_disk: disk,
            target_volume: volume,
            planned_operations: winstick_plan::operation_count(&plan),
            execution: Some(report),
            dry_run: false,
        })
    }

    /// The erased disk's volume may take a moment to mount.
    async fn wait_for_volume(&self, disk: &str) -> Result<PathBuf, WorkflowError> {
        let mut attempt = 1;
        loop {
            match locate_volume(&self.resolver, &self.params.volume_name, disk) {
                Err(WorkflowError::VolumeNotFound { .. }) if attempt < VOLUME_MOUNT_ATTEMPTS => {
                    tracing::debug!(disk, attempt, "volume not mounted yet");
                    attempt += 1;
                    tokio::time::sleep(self.config.monitor_interval()).await;
                }
                other => return other,
            }
        }
    }

    fn plan(
        &self,
        source: &Path,
        destination: &Path,
        options: &PlanOptions,
    ) -> Result<Vec<winstick_plan::WriteOperation>, WorkflowError> {
        let plan = build_plan(source, destination)?
            .ok_or_else(|| WorkflowError::EmptyImage(self.params.image_path.clone()))?;
        Ok(customize_plan(plan, destination, options)?)
    }

    async fn begin(&self, step: PipelineStep) {
        tracing::debug!(?step, "step started");
        self.events.emit(PipelineEvent::StepStarted { step }).await;
    }

    async fn end(&self, step: PipelineStep) {
        self.events.emit(PipelineEvent::StepFinished { step }).await;
    }

    async fn log(&self, message: String) {
        tracing::info!(%message);
        self.events.emit(PipelineEvent::Log { message }).await;
    }
}

const VOLUME_MOUNT_ATTEMPTS: u32 = 10;

/// Mount point of the freshly erased volume, looked up among the volumes
/// mounted from `disk`. A name clash with another mounted volume makes the
/// OS pick a suffixed mount point (`NAME 1`), so the directory name is only
/// used to choose between several volumes on the same disk.
pub fn locate_volume<M: MountResolver + ?Sized>(
    resolver: &M,
    volume_name: &str,
    disk: &str,
) -> Result<PathBuf, WorkflowError> {
    let not_found = || WorkflowError::VolumeNotFound {
        volume: volume_name.to_string(),
        disk: disk.to_string(),
    };
    let mut volumes = match resolver.volumes_on_disk(disk) {
        Ok(volumes) => volumes,
        Err(err) => {
            tracing::warn!(disk, error = %err, "cannot list volumes");
            return Err(not_found());
        }
    };
    volumes.retain(|volume| volume.is_dir());

    if let Some(exact) = volumes.iter().find(|v| mount_name(v) == Some(volume_name)) {
        return Ok(exact.clone());
    }
    let suffixed: Vec<&PathBuf> = volumes
        .iter()
        .filter(|v| mount_name(v).is_some_and(|name| is_suffixed(name, volume_name)))
        .collect();
    match (suffixed.as_slice(), volumes.as_slice()) {
        ([only], _) => Ok((*only).clone()),
        ([], [only]) => Ok(only.clone()),
        _ => {
            tracing::warn!(disk, volumes = ?volumes, "no unambiguous volume for {volume_name}");
            Err(not_found())
        }
    }
}

fn mount_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

// "NAME 1", "NAME 2", ...
fn is_suffixed(candidate: &str, volume_name: &str) -> bool {
    candidate
        .strip_prefix(volume_name)
        .and_then(|rest| rest.strip_prefix(' '))
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

fn is_iso(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"))
}
