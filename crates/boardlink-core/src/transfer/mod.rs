//! Transport-agnostic file transfer contract
//!
//! A connected board exposes the same five file operations no matter which
//! link is underneath. [`FileTransferClient`] is the capability contract both
//! transport variants implement:
//!
//! - **BLE**: GATT link, command framing in [`protocol`]
//! - **WiFi**: HTTP file API on the board's web workflow port

pub mod protocol;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier for a remote board, used as the reconnect/lookup key.
///
/// Immutable once created. The BLE variant carries the platform device UUID,
/// the WiFi variant the host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeripheralIdentity {
    Ble(Uuid),
    Wifi { host: String, port: u16 },
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralIdentity::Ble(id) => write!(f, "ble:{id}"),
            PeripheralIdentity::Wifi { host, port } => write!(f, "wifi:{host}:{port}"),
        }
    }
}

/// Services a board can offer over a transport.
///
/// Currently only file transfer; sessions negotiate each requested service
/// individually during construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardService {
    FileTransfer,
}

impl BoardService {
    /// All services a session requests by default.
    pub fn all() -> &'static [BoardService] {
        &[BoardService::FileTransfer]
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "directory")]
    pub is_directory: bool,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub modified_ns: u64,
}

/// File transfer error taxonomy.
///
/// Transport and discovery errors are surfaced verbatim; nothing in this
/// layer retries. Reconnection is the exclusive responsibility of
/// [`crate::ble::reconnect::AutoReconnect`] and applies only to the link
/// lifecycle, never to individual file operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileTransferError {
    #[error("board is not connected")]
    BoardNotConnected,

    #[error("service discovery failed: {0}")]
    DiscoveringServices(String),

    #[error("reconnect attempt timed out")]
    ReconnectTimeout,

    #[error("reconnected peripheral could not be resolved")]
    UnknownPeripheral,

    #[error("operation attempted on a detached transport")]
    Detached,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Common contract of both transport variants.
///
/// All operations are asynchronous and single-shot. An operation attempted on
/// a torn-down transport fails with [`FileTransferError::Detached`], it never
/// hangs and never silently no-ops.
#[async_trait::async_trait]
pub trait FileTransferClient: Send + Sync {
    /// Stable identity of the remote board.
    fn identity(&self) -> PeripheralIdentity;

    /// Friendly name when one is known, otherwise an address-derived fallback.
    fn display_name(&self) -> String;

    /// Run service discovery against the link.
    async fn discover(&self, filter: &[BoardService]) -> Result<(), FileTransferError>;

    /// Negotiate the file transfer service. Best-effort: failure leaves the
    /// capability disabled but is not fatal to the caller.
    async fn enable_file_transfer(&self) -> Result<(), FileTransferError>;

    fn is_file_transfer_enabled(&self) -> bool;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileTransferError>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FileTransferError>;

    /// Returns whether the file existed and was removed.
    async fn delete_file(&self, path: &str) -> Result<bool, FileTransferError>;

    /// Returns whether the directory was created (`false` if it already
    /// existed).
    async fn make_directory(&self, path: &str) -> Result<bool, FileTransferError>;

    /// Returns `None` when the path does not name a directory.
    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, FileTransferError>;

    /// Mark the transport as torn down. Subsequent operations fail with
    /// [`FileTransferError::Detached`].
    fn detach(&self);
}
