use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FAT32_MAX_FILE: u64 = 4_294_967_295;

const FAT32_FORBIDDEN: &[char] = &[
    '"', '*', '/', ':', '<', '>', '?', '\\', '|', '+', ',', '.', ';', '=', '[', ']',
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilesystemError {
    #[error("volume name is empty")]
    EmptyName,
    #[error("volume name is {actual} characters long; {filesystem} allows at most {max}")]
    NameTooLong {
        filesystem: &'static str,
        max: usize,
        actual: usize,
    },
    #[error("volume name contains '{character}', which {filesystem} does not allow")]
    ForbiddenCharacter {
        filesystem: &'static str,
        character: char,
    },
    #[error("volume name must not start or end with whitespace on {filesystem}")]
    IllegalSpacing { filesystem: &'static str },
}

/// Target filesystem for the destination volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilesystemSpec {
    Fat32,
    ExFat,
}

struct NameRules {
    max_len: usize,
    forbidden: Option<&'static [char]>,
    reject_outer_whitespace: bool,
}

impl FilesystemSpec {
    pub const ALL: [FilesystemSpec; 2] = [FilesystemSpec::Fat32, FilesystemSpec::ExFat];

    /// Personality name understood by the erase tool.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            FilesystemSpec::Fat32 => "FAT32",
            FilesystemSpec::ExFat => "ExFAT",
        }
    }

    pub fn max_name_length(&self) -> usize {
        self.rules().max_len
    }

    pub fn forbidden_characters(&self) -> Option<&'static [char]> {
        self.rules().forbidden
    }

    /// Largest single file the filesystem can hold, if bounded.
    pub fn max_file_size(&self) -> Option<u64> {
        match self {
            FilesystemSpec::Fat32 => Some(FAT32_MAX_FILE),
            FilesystemSpec::ExFat => None,
        }
    }

    fn rules(&self) -> NameRules {
        match self {
            FilesystemSpec::Fat32 => NameRules {
                max_len: 11,
                forbidden: Some(FAT32_FORBIDDEN),
                reject_outer_whitespace: true,
            },
            FilesystemSpec::ExFat => NameRules {
                max_len: 15,
                forbidden: None,
                reject_outer_whitespace: false,
            },
        }
    }

    pub fn validate_name(&self, name: &str) -> Result<(), FilesystemError> {
        let rules = self.rules();
        let filesystem = self.canonical_name();
        if name.is_empty() {
            return Err(FilesystemError::EmptyName);
        }
        let actual = name.chars().count();
        if actual > rules.max_len {
            return Err(FilesystemError::NameTooLong {
                filesystem,
                max: rules.max_len,
                actual,
            });
        }
        if let Some(forbidden) = rules.forbidden {
            if let Some(character) = name.chars().find(|c| forbidden.contains(c)) {
                return Err(FilesystemError::ForbiddenCharacter {
                    filesystem,
                    character,
                });
            }
        }
        if rules.reject_outer_whitespace && name.trim() != name {
            return Err(FilesystemError::IllegalSpacing { filesystem });
        }
        Ok(())
    }

    pub fn parse(value: &str) -> Option<FilesystemSpec> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fat32" | "ms-dos" | "msdos" => Some(FilesystemSpec::Fat32),
            "exfat" => Some(FilesystemSpec::ExFat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootMode {
    Uefi,
    Legacy,
}

impl BootMode {
    pub fn partition_scheme(&self) -> PartitionScheme {
        match self {
            BootMode::Uefi => PartitionScheme::Gpt,
            BootMode::Legacy => PartitionScheme::Mbr,
        }
    }

    pub fn parse(value: &str) -> Option<BootMode> {
        match value.trim().to_ascii_lowercase().as_str() {
            "uefi" => Some(BootMode::Uefi),
            "legacy" | "bios" => Some(BootMode::Legacy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionScheme {
    Gpt,
    Mbr,
}

impl PartitionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionScheme::Gpt => "GPT",
            PartitionScheme::Mbr => "MBR",
        }
    }
}
