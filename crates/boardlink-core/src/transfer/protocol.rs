//! File command framing for the BLE data characteristic
//!
//! Request/response frames exchanged over a single GATT characteristic.
//! Every frame starts with a command byte; responses use `command | 0x01`
//! and carry a status byte. All multi-byte integers are little-endian.
//!
//! Commands:
//!
//! | Command   | Request | Response |
//! |-----------|---------|----------|
//! | read      | `0x10`  | `0x11`   |
//! | write     | `0x20`  | `0x21`   |
//! | delete    | `0x30`  | `0x31`   |
//! | mkdir     | `0x40`  | `0x41`   |
//! | listdir   | `0x50`  | `0x51`   |
//!
//! Large reads are paced with `0x12` continuation frames, large writes with
//! `0x22` data frames. Directory listings stream one `0x51` frame per entry
//! and terminate with `entry_index == entry_count`.

use crate::transfer::{DirectoryEntry, FileTransferError};

pub const CMD_READ: u8 = 0x10;
pub const RESP_READ: u8 = 0x11;
pub const CMD_READ_PACING: u8 = 0x12;
pub const CMD_WRITE: u8 = 0x20;
pub const RESP_WRITE: u8 = 0x21;
pub const CMD_WRITE_DATA: u8 = 0x22;
pub const CMD_DELETE: u8 = 0x30;
pub const RESP_DELETE: u8 = 0x31;
pub const CMD_MKDIR: u8 = 0x40;
pub const RESP_MKDIR: u8 = 0x41;
pub const CMD_LISTDIR: u8 = 0x50;
pub const RESP_LISTDIR: u8 = 0x51;

pub const STATUS_OK: u8 = 0x01;
pub const STATUS_ERROR: u8 = 0x02;
pub const STATUS_ERROR_NO_FILE: u8 = 0x05;

/// Directory flag bit in a listdir entry's `flags` field.
pub const FLAG_DIRECTORY: u32 = 0x01;

/// Parsed `0x11` read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub status: u8,
    pub offset: u32,
    pub total_length: u32,
    pub data: Vec<u8>,
}

/// Parsed `0x21` write acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub status: u8,
    pub offset: u32,
    pub free_space: u32,
}

/// Parsed `0x51` listdir entry frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub status: u8,
    pub entry_index: u32,
    pub entry_count: u32,
    pub flags: u32,
    pub modified_ns: u64,
    pub file_size: u32,
    pub name: String,
}

impl ListEntry {
    /// The terminal frame carries no entry, only the total count.
    pub fn is_end_of_listing(&self) -> bool {
        self.entry_index >= self.entry_count
    }

    pub fn into_directory_entry(self) -> DirectoryEntry {
        DirectoryEntry {
            name: self.name,
            is_directory: self.flags & FLAG_DIRECTORY != 0,
            file_size: u64::from(self.file_size),
            modified_ns: self.modified_ns,
        }
    }
}

fn path_len(path: &str) -> Result<u16, FileTransferError> {
    u16::try_from(path.len())
        .map_err(|_| FileTransferError::Protocol(format!("path too long: {} bytes", path.len())))
}

/// `0x10`: read `chunk_size` bytes of `path` starting at `offset`.
pub fn encode_read_request(
    path: &str,
    offset: u32,
    chunk_size: u32,
) -> Result<Vec<u8>, FileTransferError> {
    let mut frame = Vec::with_capacity(12 + path.len());
    frame.push(CMD_READ);
    frame.push(0x00);
    frame.extend_from_slice(&path_len(path)?.to_le_bytes());
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&chunk_size.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

/// `0x12`: acknowledge the previous chunk and request the next one.
pub fn encode_read_pacing(offset: u32, chunk_size: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.push(CMD_READ_PACING);
    frame.push(STATUS_OK);
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&chunk_size.to_le_bytes());
    frame
}

pub fn parse_read_response(frame: &[u8]) -> Result<ReadChunk, FileTransferError> {
    expect_command(frame, RESP_READ, 16)?;
    let chunk_length = read_u32(frame, 12) as usize;
    if frame.len() < 16 + chunk_length {
        return Err(FileTransferError::Protocol(format!(
            "truncated read response: expected {} data bytes, got {}",
            chunk_length,
            frame.len() - 16
        )));
    }
    Ok(ReadChunk {
        status: frame[1],
        offset: read_u32(frame, 4),
        total_length: read_u32(frame, 8),
        data: frame[16..16 + chunk_length].to_vec(),
    })
}

/// `0x20`: open `path` for writing `total_size` bytes.
pub fn encode_write_request(
    path: &str,
    total_size: u32,
    modified_ns: u64,
) -> Result<Vec<u8>, FileTransferError> {
    let mut frame = Vec::with_capacity(20 + path.len());
    frame.push(CMD_WRITE);
    frame.push(0x00);
    frame.extend_from_slice(&path_len(path)?.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes()); // starting offset
    frame.extend_from_slice(&modified_ns.to_le_bytes());
    frame.extend_from_slice(&total_size.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

/// `0x22`: one chunk of file contents at `offset`.
pub fn encode_write_data(offset: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12 + data.len());
    frame.push(CMD_WRITE_DATA);
    frame.push(STATUS_OK);
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(data);
    frame
}

pub fn parse_write_response(frame: &[u8]) -> Result<WriteAck, FileTransferError> {
    expect_command(frame, RESP_WRITE, 20)?;
    Ok(WriteAck {
        status: frame[1],
        offset: read_u32(frame, 4),
        free_space: read_u32(frame, 16),
    })
}

/// `0x30`: delete a file or an empty directory.
pub fn encode_delete_request(path: &str) -> Result<Vec<u8>, FileTransferError> {
    let mut frame = Vec::with_capacity(4 + path.len());
    frame.push(CMD_DELETE);
    frame.push(0x00);
    frame.extend_from_slice(&path_len(path)?.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

/// `0x40`: create a directory.
pub fn encode_mkdir_request(path: &str, modified_ns: u64) -> Result<Vec<u8>, FileTransferError> {
    let mut frame = Vec::with_capacity(16 + path.len());
    frame.push(CMD_MKDIR);
    frame.push(0x00);
    frame.extend_from_slice(&path_len(path)?.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(&modified_ns.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

/// `0x50`: list a directory.
pub fn encode_listdir_request(path: &str) -> Result<Vec<u8>, FileTransferError> {
    let mut frame = Vec::with_capacity(4 + path.len());
    frame.push(CMD_LISTDIR);
    frame.push(0x00);
    frame.extend_from_slice(&path_len(path)?.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

/// Parse a `0x31`/`0x41` single-status response, returning the status byte.
pub fn parse_status_response(frame: &[u8], expected: u8) -> Result<u8, FileTransferError> {
    expect_command(frame, expected, 2)?;
    Ok(frame[1])
}

pub fn parse_listdir_entry(frame: &[u8]) -> Result<ListEntry, FileTransferError> {
    expect_command(frame, RESP_LISTDIR, 28)?;
    let name_length = read_u16(frame, 2) as usize;
    if frame.len() < 28 + name_length {
        return Err(FileTransferError::Protocol(
            "truncated listdir entry".to_string(),
        ));
    }
    let name = std::str::from_utf8(&frame[28..28 + name_length])
        .map_err(|_| FileTransferError::Protocol("listdir entry name is not UTF-8".to_string()))?
        .to_string();
    Ok(ListEntry {
        status: frame[1],
        entry_index: read_u32(frame, 4),
        entry_count: read_u32(frame, 8),
        flags: read_u32(frame, 12),
        modified_ns: read_u64(frame, 16),
        file_size: read_u32(frame, 24),
        name,
    })
}

/// Total frame length implied by a response header, once enough of the
/// header has arrived to tell. Used to reassemble frames that span multiple
/// notifications.
pub fn response_len(buf: &[u8]) -> Option<usize> {
    let cmd = *buf.first()?;
    match cmd {
        RESP_READ => {
            if buf.len() < 16 {
                return None;
            }
            Some(16 + read_u32(buf, 12) as usize)
        }
        RESP_WRITE => Some(20),
        RESP_DELETE | RESP_MKDIR => Some(2),
        RESP_LISTDIR => {
            if buf.len() < 28 {
                return None;
            }
            Some(28 + read_u16(buf, 2) as usize)
        }
        other => {
            // Unknown command byte, nothing sensible to wait for.
            tracing::warn!("unknown response command byte: 0x{other:02x}");
            Some(buf.len())
        }
    }
}

fn expect_command(frame: &[u8], expected: u8, min_len: usize) -> Result<(), FileTransferError> {
    if frame.len() < min_len {
        return Err(FileTransferError::Protocol(format!(
            "short frame: {} bytes, expected at least {min_len}",
            frame.len()
        )));
    }
    if frame[0] != expected {
        return Err(FileTransferError::Protocol(format!(
            "unexpected response command 0x{:02x}, expected 0x{expected:02x}",
            frame[0]
        )));
    }
    Ok(())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
