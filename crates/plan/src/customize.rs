use crate::{PlanError, PropertyPatch, WriteOperation};
use std::path::{Path, PathBuf};
use winstick_core::FilesystemSpec;

/// Property read by Windows Setup to decide which hardware checks to run.
pub const INSTALLATION_TYPE_KEY: &str = "WINDOWS/INSTALLATIONTYPE";
pub const INSTALLATION_TYPE_SERVER: &str = "Server";

/// Boot manager files a BIOS boot sector chains into, taken from the
/// installed image.
pub const LEGACY_BOOT_FILES: [&str; 2] = ["Windows/Boot/PCAT/bootmgr", "Windows/Boot/PCAT/bootnxt"];

const BOOT_WIM: [&str; 2] = ["sources", "boot.wim"];
const INSTALL_IMAGES: [[&str; 2]; 2] = [["sources", "install.wim"], ["sources", "install.esd"]];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    pub filesystem: FilesystemSpec,
    pub split_part_bytes: u64,
    pub patch_installer_requirements: bool,
    pub legacy_boot: bool,
}

struct Rewrite<'a> {
    destination_root: &'a Path,
    options: &'a PlanOptions,
    install_image: Option<PathBuf>,
}

/// Adapt a built plan to the target volume: split archives that exceed the
/// filesystem's file size limit, patch the setup image and add legacy boot
/// files.
pub fn customize_plan(
    plan: Vec<WriteOperation>,
    destination_root: &Path,
    options: &PlanOptions,
) -> Result<Vec<WriteOperation>, PlanError> {
    let mut rewrite = Rewrite {
        destination_root,
        options,
        install_image: None,
    };
    let mut plan = rewrite.operations(plan)?;

    if options.legacy_boot {
        let source = rewrite.install_image.ok_or(PlanError::MissingInstallImage)?;
        plan.push(WriteOperation::ExtractImagePaths {
            source,
            image_index: 1,
            paths: LEGACY_BOOT_FILES.iter().map(|p| p.to_string()).collect(),
            destination: destination_root.to_path_buf(),
        });
    }
    Ok(plan)
}

impl Rewrite<'_> {
    fn operations(&mut self, plan: Vec<WriteOperation>) -> Result<Vec<WriteOperation>, PlanError> {
        plan.into_iter().map(|op| self.operation(op)).collect()
    }

    fn operation(&mut self, op: WriteOperation) -> Result<WriteOperation, PlanError> {
        match op {
            WriteOperation::CreateDirectory { path, children } => {
                Ok(WriteOperation::CreateDirectory {
                    path,
                    children: self.operations(children)?,
                })
            }
            WriteOperation::CopyFile {
                source,
                destination,
                size_bytes,
                mut patches,
            } => {
                if INSTALL_IMAGES
                    .iter()
                    .any(|rel| self.is_at(&destination, rel))
                    && self.install_image.is_none()
                {
                    self.install_image = Some(source.clone());
                }
                if let Some(max) = self.options.filesystem.max_file_size() {
                    if size_bytes > max {
                        if !is_split_archive(&source) {
                            return Err(PlanError::FileTooLarge {
                                path: source,
                                size: size_bytes,
                                max,
                                filesystem: self.options.filesystem.canonical_name(),
                            });
                        }
                        tracing::debug!(path = %source.display(), size_bytes, "splitting image");
                        return Ok(WriteOperation::SplitImage {
                            source,
                            destination: destination.with_extension("swm"),
                            size_bytes,
                            part_bytes: self.options.split_part_bytes.min(max),
                        });
                    }
                }
                if self.options.patch_installer_requirements && self.is_at(&destination, &BOOT_WIM)
                {
                    patches.push(PropertyPatch {
                        key: INSTALLATION_TYPE_KEY.to_string(),
                        value: INSTALLATION_TYPE_SERVER.to_string(),
                    });
                }
                Ok(WriteOperation::CopyFile {
                    source,
                    destination,
                    size_bytes,
                    patches,
                })
            }
            other => Ok(other),
        }
    }

    /// Case-insensitive match of `path` against `root/relative`.
    fn is_at(&self, path: &Path, relative: &[&str]) -> bool {
        let Ok(rest) = path.strip_prefix(self.destination_root) else {
            return false;
        };
        let components: Vec<_> = rest.components().collect();
        components.len() == relative.len()
            && components
                .iter()
                .zip(relative)
                .all(|(c, r)| c.as_os_str().to_string_lossy().eq_ignore_ascii_case(r))
    }
}

fn is_split_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wim") || ext.eq_ignore_ascii_case("esd"))
}
