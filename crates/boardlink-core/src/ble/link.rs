//! Low-level BLE link boundary
//!
//! [`BleFileLink`] is the capability the session layer calls into for GATT
//! plumbing: connection state, service discovery and the raw file commands.
//! [`BtleplugLink`] implements it over btleplug using the framing in
//! [`crate::transfer::protocol`].

use crate::ble::{
    FILE_TRANSFER_SERVICE_UUID, MIN_TRANSFER_VERSION, TRANSFER_DATA_CHAR_UUID,
    TRANSFER_VERSION_CHAR_UUID,
};
use crate::transfer::protocol::{self, STATUS_ERROR, STATUS_ERROR_NO_FILE, STATUS_OK};
use crate::transfer::{DirectoryEntry, FileTransferError, PeripheralIdentity};
use btleplug::api::{Characteristic, Peripheral, ValueNotification, WriteType};
use btleplug::platform::Peripheral as PlatformPeripheral;
use futures_util::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Payload bytes carried per write-data frame. Conservative for a 512-byte
/// negotiated MTU.
const CHUNK_SIZE: u32 = 480;

/// Bound on a single command/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Platform GATT capability consumed by the BLE transport.
///
/// One instance represents one physical connection; `generation()` is bumped
/// by the central for every new connection so a stale holder can detect that
/// the link underneath it was re-established.
#[async_trait::async_trait]
pub trait BleFileLink: Send + Sync {
    fn identity(&self) -> PeripheralIdentity;

    fn display_name(&self) -> Option<String>;

    /// Connection generation this link was created against.
    fn generation(&self) -> u64;

    async fn is_connected(&self) -> bool;

    /// Discover GATT services, returning their UUIDs.
    async fn discover_services(&self) -> Result<Vec<Uuid>, FileTransferError>;

    /// Locate the transfer characteristics, check the protocol version and
    /// subscribe to responses.
    async fn enable_file_transfer(&self) -> Result<(), FileTransferError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileTransferError>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FileTransferError>;

    async fn delete_file(&self, path: &str) -> Result<bool, FileTransferError>;

    async fn make_directory(&self, path: &str) -> Result<bool, FileTransferError>;

    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, FileTransferError>;
}

/// btleplug-backed [`BleFileLink`].
pub struct BtleplugLink {
    peripheral: PlatformPeripheral,
    identity: PeripheralIdentity,
    name: Option<String>,
    generation: u64,
    data_char: Mutex<Option<Characteristic>>,
    // One command/response exchange in flight at a time.
    op_lock: Mutex<()>,
}

impl BtleplugLink {
    pub fn new(
        peripheral: PlatformPeripheral,
        identity: PeripheralIdentity,
        name: Option<String>,
        generation: u64,
    ) -> Self {
        Self {
            peripheral,
            identity,
            name,
            generation,
            data_char: Mutex::new(None),
            op_lock: Mutex::new(()),
        }
    }

    fn ble_err(e: btleplug::Error) -> FileTransferError {
        FileTransferError::Transport(e.to_string())
    }

    async fn data_char(&self) -> Result<Characteristic, FileTransferError> {
        self.data_char
            .lock()
            .await
            .clone()
            .ok_or_else(|| FileTransferError::Protocol("file transfer not enabled".to_string()))
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic, FileTransferError> {
        for service in self.peripheral.services() {
            if service.uuid == FILE_TRANSFER_SERVICE_UUID {
                for characteristic in service.characteristics {
                    if characteristic.uuid == uuid {
                        return Ok(characteristic);
                    }
                }
            }
        }
        Err(FileTransferError::DiscoveringServices(format!(
            "characteristic not found: {uuid}"
        )))
    }

    /// Send one request frame and reassemble exactly one response frame.
    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, FileTransferError> {
        let _guard = self.op_lock.lock().await;
        let data_char = self.data_char().await?;
        let mut frames = FrameReader::subscribe(&self.peripheral).await?;
        self.peripheral
            .write(&data_char, request, WriteType::WithResponse)
            .await
            .map_err(Self::ble_err)?;
        frames.next_frame().await
    }

    fn now_ns() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl BleFileLink for BtleplugLink {
    fn identity(&self) -> PeripheralIdentity {
        self.identity.clone()
    }

    fn display_name(&self) -> Option<String> {
        self.name.clone()
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>, FileTransferError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| FileTransferError::DiscoveringServices(e.to_string()))?;
        Ok(self.peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn enable_file_transfer(&self) -> Result<(), FileTransferError> {
        let version_char = self.find_characteristic(TRANSFER_VERSION_CHAR_UUID)?;
        let version_bytes = self
            .peripheral
            .read(&version_char)
            .await
            .map_err(Self::ble_err)?;
        let version = version_bytes
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| {
                FileTransferError::Protocol("short version characteristic".to_string())
            })?;
        if version < MIN_TRANSFER_VERSION {
            return Err(FileTransferError::Protocol(format!(
                "board speaks protocol version {version}, need at least {MIN_TRANSFER_VERSION}"
            )));
        }

        let data_char = self.find_characteristic(TRANSFER_DATA_CHAR_UUID)?;
        self.peripheral
            .subscribe(&data_char)
            .await
            .map_err(Self::ble_err)?;
        *self.data_char.lock().await = Some(data_char);

        tracing::info!(identity = %self.identity, version, "file transfer enabled");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileTransferError> {
        let _guard = self.op_lock.lock().await;
        let data_char = self.data_char().await?;
        let mut frames = FrameReader::subscribe(&self.peripheral).await?;

        let request = protocol::encode_read_request(path, 0, CHUNK_SIZE)?;
        self.peripheral
            .write(&data_char, &request, WriteType::WithResponse)
            .await
            .map_err(Self::ble_err)?;

        let mut contents = Vec::new();
        loop {
            let chunk = protocol::parse_read_response(&frames.next_frame().await?)?;
            match chunk.status {
                STATUS_OK => {}
                STATUS_ERROR_NO_FILE => {
                    return Err(FileTransferError::Transport(format!(
                        "{path}: no such file"
                    )));
                }
                status => {
                    return Err(FileTransferError::Transport(format!(
                        "read failed with status 0x{status:02x}"
                    )));
                }
            }
            contents.extend_from_slice(&chunk.data);
            if contents.len() as u64 >= u64::from(chunk.total_length) {
                return Ok(contents);
            }
            let pacing = protocol::encode_read_pacing(contents.len() as u32, CHUNK_SIZE);
            self.peripheral
                .write(&data_char, &pacing, WriteType::WithResponse)
                .await
                .map_err(Self::ble_err)?;
        }
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FileTransferError> {
        let _guard = self.op_lock.lock().await;
        let data_char = self.data_char().await?;
        let mut frames = FrameReader::subscribe(&self.peripheral).await?;

        let total = u32::try_from(data.len())
            .map_err(|_| FileTransferError::Protocol("file larger than 4 GiB".to_string()))?;
        let request = protocol::encode_write_request(path, total, Self::now_ns())?;
        self.peripheral
            .write(&data_char, &request, WriteType::WithResponse)
            .await
            .map_err(Self::ble_err)?;

        let mut offset: u32 = 0;
        loop {
            let ack = protocol::parse_write_response(&frames.next_frame().await?)?;
            if ack.status != STATUS_OK {
                return Err(FileTransferError::Transport(format!(
                    "write failed with status 0x{:02x}",
                    ack.status
                )));
            }
            if offset >= total {
                return Ok(());
            }
            let end = (offset + CHUNK_SIZE).min(total);
            let frame = protocol::encode_write_data(offset, &data[offset as usize..end as usize]);
            self.peripheral
                .write(&data_char, &frame, WriteType::WithResponse)
                .await
                .map_err(Self::ble_err)?;
            offset = end;
        }
    }

    async fn delete_file(&self, path: &str) -> Result<bool, FileTransferError> {
        let request = protocol::encode_delete_request(path)?;
        let response = self.exchange(&request).await?;
        match protocol::parse_status_response(&response, protocol::RESP_DELETE)? {
            STATUS_OK => Ok(true),
            STATUS_ERROR_NO_FILE => Ok(false),
            status => Err(FileTransferError::Transport(format!(
                "delete failed with status 0x{status:02x}"
            ))),
        }
    }

    async fn make_directory(&self, path: &str) -> Result<bool, FileTransferError> {
        let request = protocol::encode_mkdir_request(path, Self::now_ns())?;
        let response = self.exchange(&request).await?;
        match protocol::parse_status_response(&response, protocol::RESP_MKDIR)? {
            STATUS_OK => Ok(true),
            // Already exists.
            STATUS_ERROR => Ok(false),
            status => Err(FileTransferError::Transport(format!(
                "mkdir failed with status 0x{status:02x}"
            ))),
        }
    }

    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, FileTransferError> {
        let _guard = self.op_lock.lock().await;
        let data_char = self.data_char().await?;
        let mut frames = FrameReader::subscribe(&self.peripheral).await?;

        let request = protocol::encode_listdir_request(path)?;
        self.peripheral
            .write(&data_char, &request, WriteType::WithResponse)
            .await
            .map_err(Self::ble_err)?;

        let mut entries = Vec::new();
        loop {
            let entry = protocol::parse_listdir_entry(&frames.next_frame().await?)?;
            if entry.status == STATUS_ERROR_NO_FILE {
                return Ok(None);
            }
            if entry.status != STATUS_OK {
                return Err(FileTransferError::Transport(format!(
                    "listdir failed with status 0x{:02x}",
                    entry.status
                )));
            }
            if entry.is_end_of_listing() {
                return Ok(Some(entries));
            }
            entries.push(entry.into_directory_entry());
        }
    }
}

/// Reassembles response frames from the data characteristic's notification
/// stream. Frames may span several notifications; `response_len` tells us
/// when one is complete.
struct FrameReader {
    stream: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    buffer: Vec<u8>,
}

impl FrameReader {
    async fn subscribe(peripheral: &PlatformPeripheral) -> Result<Self, FileTransferError> {
        let stream = peripheral
            .notifications()
            .await
            .map_err(BtleplugLink::ble_err)?;
        Ok(Self {
            stream,
            buffer: Vec::new(),
        })
    }

    async fn next_frame(&mut self) -> Result<Vec<u8>, FileTransferError> {
        let deadline = tokio::time::sleep(EXCHANGE_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            if let Some(len) = protocol::response_len(&self.buffer) {
                if self.buffer.len() >= len {
                    let frame = self.buffer[..len].to_vec();
                    self.buffer.drain(..len);
                    return Ok(frame);
                }
            }
            tokio::select! {
                _ = &mut deadline => {
                    return Err(FileTransferError::Transport(
                        "timed out waiting for response".to_string(),
                    ));
                }
                notification = self.stream.next() => {
                    match notification {
                        Some(n) if n.uuid == TRANSFER_DATA_CHAR_UUID => {
                            self.buffer.extend_from_slice(&n.value);
                        }
                        Some(_) => {}
                        None => {
                            return Err(FileTransferError::Detached);
                        }
                    }
                }
            }
        }
    }
}
