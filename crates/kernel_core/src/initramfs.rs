use alloc::string::{String, ToString};
use alloc::vec::Vec;

use hal::Errno;

use crate::vfs::MemoryVfs;

const MAGIC: &[u8; 8] = b"INITRDFS";
const VERSION: u16 = 2;
const HEADER_SIZE: usize = 8 + 2 + 2;
const ENTRY_HEADER_SIZE: usize = 2 + 4 + 4 + 8;

/// An initramfs entry: absolute path, permission bits, owner and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitramfsEntry {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub data: Vec<u8>,
}

/// Parses an initramfs image into entries.
pub fn parse_initramfs(bytes: &[u8]) -> Result<Vec<InitramfsEntry>, Errno> {
    if bytes.len() < HEADER_SIZE {
        return Err(Errno::InvalidArg);
    }
    if &bytes[..8] != MAGIC {
        return Err(Errno::InvalidArg);
    }
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    if version != VERSION {
        return Err(Errno::InvalidArg);
    }
    let file_count = u16::from_le_bytes([bytes[10], bytes[11]]) as usize;

    let mut offset = HEADER_SIZE;
    let mut entries = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        if offset + ENTRY_HEADER_SIZE > bytes.len() {
            return Err(Errno::InvalidArg);
        }
        let name_len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        let mode = read_u32(bytes, offset + 2);
        let uid = read_u32(bytes, offset + 6);
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[offset + 10..offset + 18]);
        let data_len = usize::try_from(u64::from_le_bytes(len)).map_err(|_| Errno::InvalidArg)?;
        offset += ENTRY_HEADER_SIZE;

        let entry_end = offset
            .checked_add(name_len)
            .and_then(|end| end.checked_add(data_len))
            .ok_or(Errno::InvalidArg)?;
        if entry_end > bytes.len() {
            return Err(Errno::InvalidArg);
        }
        let name_bytes = &bytes[offset..offset + name_len];
        let name = core::str::from_utf8(name_bytes).map_err(|_| Errno::InvalidArg)?;
        offset += name_len;

        let data = bytes[offset..offset + data_len].to_vec();
        offset += data_len;
        offset = align_up(offset, 8);

        entries.push(InitramfsEntry {
            name: name.to_string(),
            mode,
            uid,
            data,
        });
    }

    Ok(entries)
}

/// Builds an in-memory filesystem holding every entry of an image.
pub fn load_initramfs(bytes: &[u8]) -> Result<MemoryVfs, Errno> {
    let mut vfs = MemoryVfs::new();
    for entry in parse_initramfs(bytes)? {
        log::debug!(
            "initramfs: {} ({} bytes, mode {:o})",
            entry.name,
            entry.data.len(),
            entry.mode
        );
        vfs.insert(&entry.name, entry.data, entry.mode, entry.uid);
    }
    Ok(vfs)
}

/// Serializes initramfs entries into an initramfs image.
pub fn build_initramfs(entries: &[InitramfsEntry]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&(entries.len() as u16).to_le_bytes());

    for entry in entries {
        let name_bytes = entry.name.as_bytes();
        bytes.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&entry.mode.to_le_bytes());
        bytes.extend_from_slice(&entry.uid.to_le_bytes());
        bytes.extend_from_slice(&(entry.data.len() as u64).to_le_bytes());
        bytes.extend_from_slice(name_bytes);
        bytes.extend_from_slice(&entry.data);
        let padded_len = align_up(bytes.len(), 8);
        bytes.resize(padded_len, 0);
    }

    bytes
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn align_up(value: usize, align: usize) -> usize {
    if value % align == 0 {
        value
    } else {
        value + (align - (value % align))
    }
}
