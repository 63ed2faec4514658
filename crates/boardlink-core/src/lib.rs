//! Boardlink Core Library
//!
//! Connects to CircuitPython-style development boards and exchanges files
//! with them, over BLE GATT or over the board's local-network HTTP API.
//!
//! # Modules
//!
//! - **ble**: scanner, link handles, and the auto-reconnect controller
//! - **wifi**: HTTP file API transport
//! - **transfer**: the transport contract and the BLE wire protocol
//! - **session**: capability-discovered session on one board
//! - **workflow**: connection orchestration and session lifecycle
//! - **config**: pairing and credential persistence
//!
//! # Usage
//!
//! ```ignore
//! use boardlink_core::{BoardScanner, BtleplugCentral, ConnectionManager};
//!
//! // 1. Scan for boards advertising the file transfer service
//! let scanner = BoardScanner::new().await?;
//! let boards = scanner.scan(Duration::from_secs(5), None).await?;
//!
//! // 2. Wire the orchestrator to the platform central
//! let central = Arc::new(BtleplugCentral::new().await?);
//! let (manager, mut events) = ConnectionManager::new(central.clone(), options, on_bonded, lookup);
//! let _guard = manager.attach_link_events(central.link_events().await?);
//!
//! // 3. Connect and move files
//! let session = manager.connect_ble(link).await?;
//! session.write_file("/code.py", &source).await?;
//! ```

pub mod ble;
pub mod config;
pub mod session;
pub mod transfer;
pub mod wifi;
pub mod workflow;

// BLE re-exports
pub use ble::{
    FILE_TRANSFER_SERVICE_UUID, LinkEvent, MIN_TRANSFER_VERSION, TRANSFER_DATA_CHAR_UUID,
    TRANSFER_VERSION_CHAR_UUID,
    central::{BleCentral, BtleplugCentral, CentralError},
    link::{BleFileLink, BtleplugLink},
    peripheral::BlePeripheral,
    reconnect::{AutoReconnect, ReconnectEvent, ReconnectHandler, ReconnectState, WatchGuard},
    scanner::{BoardScanner, DiscoveredBoard, ScanCallback},
};

// Transfer re-exports
pub use transfer::{
    BoardService, DirectoryEntry, FileTransferClient, FileTransferError, PeripheralIdentity,
};

// WiFi re-exports
pub use wifi::WifiPeripheral;

// Session and workflow re-exports
pub use session::BoardSession;
pub use workflow::{
    BondedCallback, ConnectionEvent, ConnectionManager, ConnectionManagerOptions, PasswordLookup,
};

// Persistence re-exports
pub use config::{BondedPeripheralRecord, PairingStore, WifiCredentialRecord};
