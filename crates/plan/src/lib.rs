//! Write plans: a tree of filesystem actions that reproduces a mounted
//! installer image on a freshly formatted volume.
//!
//! Building a plan only reads the source tree. Target-specific rewrites live
//! in [`customize`]; executing a plan is the workflow engine's job.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod customize;

pub use customize::{
    customize_plan, PlanOptions, INSTALLATION_TYPE_KEY, INSTALLATION_TYPE_SERVER,
    LEGACY_BOOT_FILES,
};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("read directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is {size} bytes, over the {max} byte limit of {filesystem}", .path.display())]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max: u64,
        filesystem: &'static str,
    },
    #[error("legacy boot needs sources/install.wim or sources/install.esd in the image")]
    MissingInstallImage,
}

/// WIM property write applied to every image of a copied archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyPatch {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOperation {
    CreateDirectory {
        path: PathBuf,
        children: Vec<WriteOperation>,
    },
    CopyFile {
        source: PathBuf,
        destination: PathBuf,
        size_bytes: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        patches: Vec<PropertyPatch>,
    },
    /// Split a WIM/ESD into `.swm` parts no larger than `part_bytes`.
    SplitImage {
        source: PathBuf,
        destination: PathBuf,
        size_bytes: u64,
        part_bytes: u64,
    },
    /// Pull files out of one image of an archive, flattened into `destination`.
    ExtractImagePaths {
        source: PathBuf,
        image_index: u32,
        paths: Vec<String>,
        destination: PathBuf,
    },
}

impl WriteOperation {
    pub fn destination(&self) -> &Path {
        match self {
            WriteOperation::CreateDirectory { path, .. } => path,
            WriteOperation::CopyFile { destination, .. }
            | WriteOperation::SplitImage { destination, .. }
            | WriteOperation::ExtractImagePaths { destination, .. } => destination,
        }
    }

    pub fn children(&self) -> &[WriteOperation] {
        match self {
            WriteOperation::CreateDirectory { children, .. } => children,
            _ => &[],
        }
    }
}

/// Mirror `source_root` under `destination_root`.
///
/// Directories become `CreateDirectory` nodes (possibly childless) and regular
/// files become `CopyFile` nodes. Symlinks and entries of unknown type are
/// skipped. `None` means the source has nothing to copy.
pub fn build_plan(
    source_root: &Path,
    destination_root: &Path,
) -> Result<Option<Vec<WriteOperation>>, PlanError> {
    let plan = plan_directory(source_root, destination_root)?;
    tracing::debug!(
        source = %source_root.display(),
        operations = operation_count(&plan),
        "plan built"
    );
    Ok((!plan.is_empty()).then_some(plan))
}

fn plan_directory(source: &Path, destination: &Path) -> Result<Vec<WriteOperation>, PlanError> {
    let read_dir = |source_err| PlanError::ReadDir {
        path: source.to_path_buf(),
        source: source_err,
    };
    let mut entries = std::fs::read_dir(source)
        .map_err(read_dir)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_dir)?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut operations = Vec::new();
    for entry in entries {
        let path = entry.path();
        let target = destination.join(entry.file_name());
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping entry");
                continue;
            }
        };
        if file_type.is_dir() {
            let children = plan_directory(&path, &target)?;
            operations.push(WriteOperation::CreateDirectory {
                path: target,
                children,
            });
        } else if file_type.is_file() {
            let size_bytes = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "skipping entry");
                    continue;
                }
            };
            operations.push(WriteOperation::CopyFile {
                source: path,
                destination: target,
                size_bytes,
                patches: Vec::new(),
            });
        }
    }
    Ok(operations)
}

/// Number of nodes in the tree, directories included.
pub fn operation_count(plan: &[WriteOperation]) -> usize {
    plan.iter()
        .map(|op| 1 + operation_count(op.children()))
        .sum()
}

/// Bytes the plan reads from the source; extracted files are not counted.
pub fn total_bytes(plan: &[WriteOperation]) -> u64 {
    plan.iter()
        .map(|op| match op {
            WriteOperation::CreateDirectory { children, .. } => total_bytes(children),
            WriteOperation::CopyFile { size_bytes, .. }
            | WriteOperation::SplitImage { size_bytes, .. } => *size_bytes,
            WriteOperation::ExtractImagePaths { .. } => 0,
        })
        .sum()
}
