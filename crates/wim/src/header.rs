//! Fixed 208-byte WIM header and the XML metadata resource it points at.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::WimError;

pub const MAGIC: &[u8; 8] = b"MSWIM\0\0\0";
pub const HEADER_SIZE: usize = 208;

const IMAGE_COUNT_OFFSET: usize = 44;
const XML_RESOURCE_OFFSET: usize = 72;
const PART_NUMBER_OFFSET: usize = 40;
const TOTAL_PARTS_OFFSET: usize = 42;
const RESOURCE_SIZE_MASK: u64 = 0x00ff_ffff_ffff_ffff;
/// XML larger than this is not a sane WIM.
const MAX_XML_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WimHeader {
    pub image_count: u32,
    pub part_number: u16,
    pub total_parts: u16,
    pub xml_offset: u64,
    pub xml_size: u64,
}

impl WimHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("header is {} bytes, expected {}", bytes.len(), HEADER_SIZE));
        }
        if &bytes[..8] != MAGIC {
            return Err("missing MSWIM signature".to_string());
        }
        let xml = &bytes[XML_RESOURCE_OFFSET..XML_RESOURCE_OFFSET + 24];
        Ok(Self {
            image_count: u32_at(bytes, IMAGE_COUNT_OFFSET),
            part_number: u16_at(bytes, PART_NUMBER_OFFSET),
            total_parts: u16_at(bytes, TOTAL_PARTS_OFFSET),
            xml_size: u64_at(xml, 0) & RESOURCE_SIZE_MASK,
            xml_offset: u64_at(xml, 8),
        })
    }
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Read the header and decode the UTF-16LE XML document.
pub fn read(path: &Path) -> Result<(WimHeader, String), WimError> {
    let io = |source: std::io::Error| WimError::Io {
        path: path.to_path_buf(),
        source,
    };
    let invalid = |reason: String| WimError::InvalidArchive {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = File::open(path).map_err(io)?;
    let mut bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut bytes)
        .map_err(|_| invalid("truncated header".to_string()))?;
    let header = WimHeader::parse(&bytes).map_err(invalid)?;

    if header.xml_size == 0 {
        return Ok((header, String::new()));
    }
    if header.xml_size > MAX_XML_BYTES || header.xml_size % 2 != 0 {
        return Err(invalid(format!("bad XML resource size {}", header.xml_size)));
    }
    file.seek(SeekFrom::Start(header.xml_offset)).map_err(io)?;
    let mut raw = vec![0u8; header.xml_size as usize];
    file.read_exact(&mut raw)
        .map_err(|_| invalid("truncated XML resource".to_string()))?;

    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let mut xml = String::from_utf16(&units)
        .map_err(|_| invalid("XML resource is not UTF-16".to_string()))?;
    if xml.starts_with('\u{feff}') {
        xml.remove(0);
    }
    Ok((header, xml))
}
