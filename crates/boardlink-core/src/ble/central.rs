//! Platform central boundary
//!
//! [`BleCentral`] is everything the reconnection controller and the
//! orchestrator need from the platform BLE layer: trigger a re-link attempt
//! against known peripherals filtered by service set, and resolve a live link
//! handle from an identity carried in a connection notification.

use crate::ble::LinkEvent;
use crate::ble::link::{BleFileLink, BtleplugLink};
use crate::transfer::PeripheralIdentity;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CentralError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),
}

/// Platform BLE capability consumed by [`crate::ble::reconnect::AutoReconnect`]
/// and [`crate::workflow::ConnectionManager`].
#[async_trait::async_trait]
pub trait BleCentral: Send + Sync + 'static {
    /// Ask the platform to re-link to any known peripheral advertising one of
    /// `services`, bounded by `timeout`. Returns whether an attempt was
    /// actually started, i.e. whether an eligible known peripheral exists.
    async fn reconnect_to_known(&self, services: &[Uuid], timeout: Duration) -> bool;

    /// Resolve a live link handle for a connected peripheral. `None` when the
    /// platform has no reachable handle for that identity.
    async fn resolve(&self, identity: &PeripheralIdentity) -> Option<Arc<dyn BleFileLink>>;

    /// Note a peripheral as bonded so later re-link attempts consider it.
    fn remember_bonded(&self, _identity: &PeripheralIdentity) {}
}

/// btleplug-backed [`BleCentral`].
pub struct BtleplugCentral {
    adapter: Adapter,
    known: Mutex<HashSet<Uuid>>,
    // Bumped for every observed connect so stale link handles can be told
    // apart from the connection currently underneath them.
    generation: Arc<AtomicU64>,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self, CentralError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(CentralError::NoAdapter)?;
        Ok(Self {
            adapter,
            known: Mutex::new(HashSet::new()),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Remember a peripheral as bonded so later re-link attempts consider it.
    pub fn register_known(&self, id: Uuid) {
        self.known.lock().unwrap().insert(id);
    }

    /// Stable UUID for a platform peripheral id. btleplug ids are opaque
    /// platform strings (a UUID on macOS, a MAC address on Linux), so derive
    /// a deterministic v5 UUID from the textual form.
    pub fn identity_uuid(id: &PeripheralId) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, id.to_string().as_bytes())
    }

    /// Forward adapter connect/disconnect events as [`LinkEvent`]s on a
    /// single-consumer channel, preserving arrival order.
    pub async fn link_events(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>, CentralError> {
        let mut events = self.adapter.events().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::clone(&self.generation);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceConnected(id) => {
                        generation.fetch_add(1, Ordering::SeqCst);
                        let identity = PeripheralIdentity::Ble(Self::identity_uuid(&id));
                        if tx.send(LinkEvent::Connected(identity)).is_err() {
                            break;
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let identity = PeripheralIdentity::Ble(Self::identity_uuid(&id));
                        if tx.send(LinkEvent::Disconnected(identity)).is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        });
        Ok(rx)
    }

    async fn find_candidates(&self, services: &[Uuid]) -> Vec<btleplug::platform::Peripheral> {
        let known = self.known.lock().unwrap().clone();
        let mut candidates = Vec::new();
        let peripherals = match self.adapter.peripherals().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("failed to enumerate peripherals: {e}");
                return candidates;
            }
        };
        for peripheral in peripherals {
            let id = Self::identity_uuid(&peripheral.id());
            if !known.contains(&id) {
                continue;
            }
            match peripheral.properties().await {
                Ok(Some(props)) => {
                    if services.is_empty() || props.services.iter().any(|s| services.contains(s)) {
                        candidates.push(peripheral);
                    }
                }
                Ok(None) => {
                    // Cached peripheral without properties still counts as
                    // known; let the connect attempt decide.
                    candidates.push(peripheral);
                }
                Err(e) => {
                    tracing::debug!("properties unavailable for {id}: {e}");
                }
            }
        }
        candidates
    }
}

#[async_trait::async_trait]
impl BleCentral for BtleplugCentral {
    async fn reconnect_to_known(&self, services: &[Uuid], timeout: Duration) -> bool {
        let candidates = self.find_candidates(services).await;
        if candidates.is_empty() {
            tracing::info!("no eligible known peripheral to reconnect to");
            return false;
        }

        tracing::info!(count = candidates.len(), "starting re-link attempt");
        for peripheral in candidates {
            let deadline = timeout;
            tokio::spawn(async move {
                let id = peripheral.id();
                match tokio::time::timeout(deadline, peripheral.connect()).await {
                    Ok(Ok(())) => {
                        // Success surfaces as a DeviceConnected event.
                    }
                    Ok(Err(e)) => tracing::debug!("re-link to {id} failed: {e}"),
                    Err(_) => tracing::debug!("re-link to {id} timed out"),
                }
            });
        }
        true
    }

    async fn resolve(&self, identity: &PeripheralIdentity) -> Option<Arc<dyn BleFileLink>> {
        let PeripheralIdentity::Ble(wanted) = identity else {
            return None;
        };
        let peripherals = self.adapter.peripherals().await.ok()?;
        for peripheral in peripherals {
            if Self::identity_uuid(&peripheral.id()) != *wanted {
                continue;
            }
            if !peripheral.is_connected().await.unwrap_or(false) {
                return None;
            }
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name);
            let generation = self.generation.load(Ordering::SeqCst);
            return Some(Arc::new(BtleplugLink::new(
                peripheral,
                identity.clone(),
                name,
                generation,
            )));
        }
        None
    }

    fn remember_bonded(&self, identity: &PeripheralIdentity) {
        if let PeripheralIdentity::Ble(id) = identity {
            self.register_known(*id);
        }
    }
}
