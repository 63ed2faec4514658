//! BLE scanner - discover boards advertising the file transfer service
//!
//! Scans for peripherals advertising [`FILE_TRANSFER_SERVICE_UUID`] and
//! reports them, optionally live through a callback while the scan is still
//! running.

use crate::ble::FILE_TRANSFER_SERVICE_UUID;
use crate::ble::central::{BtleplugCentral, CentralError};
use crate::transfer::PeripheralIdentity;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DiscoveredBoard {
    pub identity: PeripheralIdentity,
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Live discovery callback, invoked once per newly seen board.
#[async_trait::async_trait]
pub trait ScanCallback: Send + Sync {
    async fn on_board_found(&self, board: DiscoveredBoard);
}

pub struct BoardScanner {
    adapter: Adapter,
}

impl BoardScanner {
    pub async fn new() -> Result<Self, CentralError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(CentralError::NoAdapter)?;
        Ok(Self { adapter })
    }

    pub async fn scan(
        &self,
        timeout: Duration,
        callback: Option<Arc<dyn ScanCallback>>,
    ) -> Result<Vec<DiscoveredBoard>, CentralError> {
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![FILE_TRANSFER_SERVICE_UUID],
            })
            .await?;

        tracing::info!("scanning for boards for {}s", timeout.as_secs());
        let mut discovered = HashMap::new();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => {
                    match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id)) => {
                            if discovered.contains_key(&id) {
                                continue;
                            }
                            if let Some(board) = self.inspect(&id).await {
                                tracing::debug!(
                                    "board found: {} ({})",
                                    board.name.as_deref().unwrap_or("<unknown>"),
                                    board.address
                                );
                                if let Some(ref cb) = callback {
                                    cb.on_board_found(board.clone()).await;
                                }
                                discovered.insert(id, board);
                            }
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }

        // Some platforms only replay cached peripherals, never re-advertise
        // them; sweep those up as well.
        for peripheral in self.adapter.peripherals().await? {
            let id = peripheral.id();
            if discovered.contains_key(&id) {
                continue;
            }
            if let Some(board) = self.inspect(&id).await {
                if let Some(ref cb) = callback {
                    cb.on_board_found(board.clone()).await;
                }
                discovered.insert(id, board);
            }
        }

        self.adapter.stop_scan().await?;
        tracing::info!("scan complete: {} board(s)", discovered.len());
        Ok(discovered.into_values().collect())
    }

    async fn inspect(&self, id: &btleplug::platform::PeripheralId) -> Option<DiscoveredBoard> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let props = peripheral.properties().await.ok().flatten()?;
        if !props.services.contains(&FILE_TRANSFER_SERVICE_UUID) {
            return None;
        }
        Some(DiscoveredBoard {
            identity: PeripheralIdentity::Ble(BtleplugCentral::identity_uuid(id)),
            name: props.local_name,
            address: props.address.to_string(),
            rssi: props.rssi,
        })
    }
}
