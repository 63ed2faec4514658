pub mod central;
pub mod link;
pub mod peripheral;
pub mod reconnect;
pub mod scanner;

use crate::transfer::PeripheralIdentity;
use uuid::Uuid;

/// 16-bit assigned service UUID advertised by boards that speak the file
/// transfer protocol.
pub const FILE_TRANSFER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000febb_0000_1000_8000_00805f9b34fb);

/// Protocol version characteristic (read-only u32).
pub const TRANSFER_VERSION_CHAR_UUID: Uuid =
    Uuid::from_u128(0xadaf0100_4669_6c65_5472_616e73666572);

/// Command/response characteristic carrying the frames defined in
/// [`crate::transfer::protocol`].
pub const TRANSFER_DATA_CHAR_UUID: Uuid =
    Uuid::from_u128(0xadaf0200_4669_6c65_5472_616e73666572);

/// Lowest protocol version this client can talk to.
pub const MIN_TRANSFER_VERSION: u32 = 4;

/// Connection lifecycle notifications delivered by the platform layer.
///
/// Processed in arrival order on a single coordination task so state
/// transitions never interleave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(PeripheralIdentity),
    Disconnected(PeripheralIdentity),
}
