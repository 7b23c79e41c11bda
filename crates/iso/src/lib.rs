//! Primary Volume Descriptor reader for ISO 9660 images.
//!
//! Only the identity fields a user needs to recognise an installer image are
//! decoded. Offsets are fixed by ECMA-119 and relative to the start of the PVD
//! sector.

use serde::Serialize;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

pub const SECTOR_SIZE: u64 = 2048;
pub const PVD_SECTOR: u64 = 16;

const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";
const STANDARD_IDENTIFIER_RANGE: Range<usize> = 1..6;
const SYSTEM_IDENTIFIER: Range<usize> = 8..40;
const VOLUME_IDENTIFIER: Range<usize> = 40..72;
const VOLUME_SET_IDENTIFIER: Range<usize> = 190..318;
const PUBLISHER_IDENTIFIER: Range<usize> = 318..446;
const CREATION_DATE: Range<usize> = 813..830;

#[derive(Debug, Error)]
pub enum IsoError {
    #[error("{}: not an ISO 9660 image ({reason})", .path.display())]
    InvalidImage { path: PathBuf, reason: String },
    #[error("{}: {field} at bytes {range:?} is not a valid date", .path.display())]
    MetadataNotFound {
        path: PathBuf,
        field: &'static str,
        range: Range<usize>,
    },
    #[error("read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsoVolumeMetadata {
    pub volume_identifier: String,
    pub system_identifier: String,
    pub volume_set_identifier: String,
    pub publisher: String,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_date: OffsetDateTime,
    pub capacity_bytes: u64,
}

pub fn parse(path: impl AsRef<Path>) -> Result<IsoVolumeMetadata, IsoError> {
    let path = path.as_ref();
    let invalid = |reason: &str| IsoError::InvalidImage {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let metadata = std::fs::metadata(path).map_err(|_| invalid("file does not exist"))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file"));
    }
    let capacity_bytes = metadata.len();
    if capacity_bytes < PVD_SECTOR * SECTOR_SIZE {
        return Err(invalid("shorter than the 16-sector system area"));
    }

    let io = |source: std::io::Error| IsoError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io)?;
    file.seek(SeekFrom::Start(PVD_SECTOR * SECTOR_SIZE))
        .map_err(io)?;
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    if let Err(err) = file.read_exact(&mut sector) {
        return Err(if err.kind() == ErrorKind::UnexpectedEof {
            invalid("truncated primary volume descriptor")
        } else {
            io(err)
        });
    }

    parse_descriptor(path, &sector, capacity_bytes)
}

/// Decode an already-read PVD sector.
pub fn parse_descriptor(
    path: &Path,
    sector: &[u8],
    capacity_bytes: u64,
) -> Result<IsoVolumeMetadata, IsoError> {
    if sector.len() < SECTOR_SIZE as usize
        || &sector[STANDARD_IDENTIFIER_RANGE] != STANDARD_IDENTIFIER
    {
        return Err(IsoError::InvalidImage {
            path: path.to_path_buf(),
            reason: "missing CD001 standard identifier".to_string(),
        });
    }

    let creation_date =
        parse_timestamp(&sector[CREATION_DATE]).ok_or_else(|| IsoError::MetadataNotFound {
            path: path.to_path_buf(),
            field: "volume creation date",
            range: CREATION_DATE,
        })?;

    let metadata = IsoVolumeMetadata {
        volume_identifier: ascii_field(&sector[VOLUME_IDENTIFIER]),
        system_identifier: ascii_field(&sector[SYSTEM_IDENTIFIER]),
        volume_set_identifier: ascii_field(&sector[VOLUME_SET_IDENTIFIER]),
        publisher: ascii_field(&sector[PUBLISHER_IDENTIFIER]),
        creation_date,
        capacity_bytes,
    };
    tracing::debug!(
        path = %path.display(),
        volume = %metadata.volume_identifier,
        "parsed primary volume descriptor"
    );
    Ok(metadata)
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

/// `YYYYMMDDHHMMSScc` followed by a GMT offset byte, read as UTC.
fn parse_timestamp(bytes: &[u8]) -> Option<OffsetDateTime> {
    if bytes.len() != 17 {
        return None;
    }
    let digits = std::str::from_utf8(&bytes[..16]).ok()?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: Range<usize>| digits[range].parse::<u16>().ok();

    let year = field(0..4)? as i32;
    let month = Month::try_from(field(4..6)? as u8).ok()?;
    let day = field(6..8)? as u8;
    let hour = field(8..10)? as u8;
    let minute = field(10..12)? as u8;
    let second = field(12..14)? as u8;
    let centis = field(14..16)?;

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms_milli(hour, minute, second, centis * 10).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}
