use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use winstick_plan::{operation_count, total_bytes, PropertyPatch, WriteOperation};
use winstick_wim::{PropertyUpdate, WimArchive};

use crate::{EventSink, PipelineEvent, WorkflowError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyManifestEntry {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub operations: usize,
    pub directories: usize,
    pub copied_files: usize,
    pub copied_bytes: u64,
    pub split_images: usize,
    pub extracted_paths: usize,
    pub patched_properties: usize,
    pub manifest: Vec<CopyManifestEntry>,
}

/// Runs a write plan depth-first in plan order. The first failing step ends
/// the run; nothing already written is rolled back.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    wimlib: PathBuf,
    hash_manifest: bool,
    events: EventSink,
}

impl PlanExecutor {
    pub fn new(wimlib: impl Into<PathBuf>) -> Self {
        Self {
            wimlib: wimlib.into(),
            hash_manifest: false,
            events: EventSink::default(),
        }
    }

    pub fn hash_manifest(mut self, enabled: bool) -> Self {
        self.hash_manifest = enabled;
        self
    }

    pub fn with_events(mut self, sender: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = EventSink::new(Some(sender));
        self
    }

    pub async fn execute(&self, plan: &[WriteOperation]) -> Result<ExecutionReport, WorkflowError> {
        let total = operation_count(plan);
        let bytes_total = total_bytes(plan);
        let mut report = ExecutionReport::default();
        let mut bytes_done = 0u64;

        let mut stack = vec![plan.iter()];
        while let Some(level) = stack.last_mut() {
            let Some(op) = level.next() else {
                stack.pop();
                continue;
            };
            bytes_done = bytes_done.saturating_add(self.run(op, &mut report).await?);
            report.operations += 1;
            self.events
                .emit(PipelineEvent::Progress {
                    completed: report.operations,
                    total,
                    bytes_done,
                    bytes_total,
                    path: op.destination().to_path_buf(),
                })
                .await;
            if let WriteOperation::CreateDirectory { children, .. } = op {
                stack.push(children.iter());
            }
        }
        tracing::info!(
            operations = report.operations,
            files = report.copied_files,
            bytes = report.copied_bytes,
            "plan executed"
        );
        Ok(report)
    }

    /// Returns the number of source bytes consumed.
    async fn run(
        &self,
        op: &WriteOperation,
        report: &mut ExecutionReport,
    ) -> Result<u64, WorkflowError> {
        match op {
            WriteOperation::CreateDirectory { path, .. } => {
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(io("create dir", path))?;
                report.directories += 1;
                Ok(0)
            }
            WriteOperation::CopyFile {
                source,
                destination,
                size_bytes,
                patches,
            } => {
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(io("create dir", parent))?;
                }
                tokio::fs::copy(source, destination)
                    .await
                    .map_err(io("copy", source))?;
                verify_size(destination, *size_bytes).await?;
                report.copied_files += 1;
                report.copied_bytes = report.copied_bytes.saturating_add(*size_bytes);

                if !patches.is_empty() {
                    report.patched_properties += self.apply_patches(destination, patches).await?;
                }
                // Hash what ended up on the volume, patches included.
                if self.hash_manifest {
                    let written = tokio::fs::metadata(destination)
                        .await
                        .map_err(io("verify", destination))?
                        .len();
                    report.manifest.push(CopyManifestEntry {
                        path: destination.display().to_string(),
                        bytes: written,
                        sha256: hash_file(destination.clone()).await?,
                    });
                }
                Ok(*size_bytes)
            }
            WriteOperation::SplitImage {
                source,
                destination,
                size_bytes,
                part_bytes,
            } => {
                let archive = WimArchive::open(source, &self.wimlib)?;
                archive.split(destination, *part_bytes).await?;
                report.split_images += 1;
                Ok(*size_bytes)
            }
            WriteOperation::ExtractImagePaths {
                source,
                image_index,
                paths,
                destination,
            } => {
                let archive = WimArchive::open(source, &self.wimlib)?;
                archive
                    .extract_paths(paths, destination, *image_index)
                    .await?;
                report.extracted_paths += paths.len();
                Ok(0)
            }
        }
    }

    async fn apply_patches(
        &self,
        path: &Path,
        patches: &[PropertyPatch],
    ) -> Result<usize, WorkflowError> {
        let mut archive = WimArchive::open(path, &self.wimlib)?;
        let mut changed = 0;
        for patch in patches {
            match archive.set_property_for_all_images(&patch.key, &patch.value) {
                PropertyUpdate::Success => changed += 1,
                PropertyUpdate::Skipped => {}
                PropertyUpdate::Failed => {
                    return Err(WorkflowError::PropertyPatch {
                        path: path.to_path_buf(),
                        key: patch.key.clone(),
                    })
                }
            }
        }
        archive.apply_changes().await?;
        tracing::info!(path = %path.display(), changed, "patched image properties");
        Ok(changed)
    }
}

fn io(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> WorkflowError {
    let path = path.to_path_buf();
    move |source| WorkflowError::Io {
        action,
        path,
        source,
    }
}

async fn verify_size(path: &Path, expected: u64) -> Result<(), WorkflowError> {
    let actual = tokio::fs::metadata(path)
        .await
        .map_err(io("verify", path))?
        .len();
    if actual != expected {
        return Err(WorkflowError::VerifyFailed {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

async fn hash_file(path: PathBuf) -> Result<String, WorkflowError> {
    let task_path = path.clone();
    let hashed = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        use std::io::Read;
        let mut file = std::fs::File::open(&task_path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(to_hex(&hasher.finalize()))
    })
    .await
    .map_err(|err| WorkflowError::Io {
        action: "hash",
        path: path.clone(),
        source: std::io::Error::other(err),
    })?;
    hashed.map_err(io("hash", &path))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
