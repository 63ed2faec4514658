//! BLE transport capability
//!
//! Wraps a low-level [`BleFileLink`] as a [`FileTransferClient`]. The link is
//! captured together with its connection generation; if the platform tears
//! the connection down (or replaces it with a newer one), every operation
//! fails with [`FileTransferError::Detached`] instead of talking over a dead
//! or foreign link.

use crate::ble::FILE_TRANSFER_SERVICE_UUID;
use crate::ble::link::BleFileLink;
use crate::transfer::{
    BoardService, DirectoryEntry, FileTransferClient, FileTransferError, PeripheralIdentity,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct BlePeripheral {
    link: Arc<dyn BleFileLink>,
    generation: u64,
    enabled: AtomicBool,
    detached: AtomicBool,
}

impl BlePeripheral {
    pub fn new(link: Arc<dyn BleFileLink>) -> Self {
        let generation = link.generation();
        Self {
            link,
            generation,
            enabled: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    async fn guard(&self) -> Result<(), FileTransferError> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(FileTransferError::Detached);
        }
        // A newer generation means the link underneath was re-established;
        // this holder's view of it is stale.
        if self.link.generation() != self.generation || !self.link.is_connected().await {
            return Err(FileTransferError::Detached);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileTransferClient for BlePeripheral {
    fn identity(&self) -> PeripheralIdentity {
        self.link.identity()
    }

    fn display_name(&self) -> String {
        self.link
            .display_name()
            .unwrap_or_else(|| self.link.identity().to_string())
    }

    async fn discover(&self, filter: &[BoardService]) -> Result<(), FileTransferError> {
        self.guard().await?;
        let services = self.link.discover_services().await?;
        if filter.contains(&BoardService::FileTransfer)
            && !services.contains(&FILE_TRANSFER_SERVICE_UUID)
        {
            return Err(FileTransferError::DiscoveringServices(
                "file transfer service not advertised".to_string(),
            ));
        }
        Ok(())
    }

    async fn enable_file_transfer(&self) -> Result<(), FileTransferError> {
        self.guard().await?;
        self.link.enable_file_transfer().await?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_file_transfer_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.detached.load(Ordering::SeqCst)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileTransferError> {
        self.guard().await?;
        self.link.read_file(path).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FileTransferError> {
        self.guard().await?;
        self.link.write_file(path, data).await
    }

    async fn delete_file(&self, path: &str) -> Result<bool, FileTransferError> {
        self.guard().await?;
        self.link.delete_file(path).await
    }

    async fn make_directory(&self, path: &str) -> Result<bool, FileTransferError> {
        self.guard().await?;
        self.link.make_directory(path).await
    }

    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, FileTransferError> {
        self.guard().await?;
        self.link.list_directory(path).await
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use uuid::Uuid;

    struct FakeLink {
        identity: PeripheralIdentity,
        generation: AtomicU64,
        connected: AtomicBool,
        advertises_transfer: bool,
    }

    impl FakeLink {
        fn new(advertises_transfer: bool) -> Arc<Self> {
            Arc::new(Self {
                identity: PeripheralIdentity::Ble(Uuid::from_u128(0x42)),
                generation: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                advertises_transfer,
            })
        }
    }

    #[async_trait::async_trait]
    impl BleFileLink for FakeLink {
        fn identity(&self) -> PeripheralIdentity {
            self.identity.clone()
        }

        fn display_name(&self) -> Option<String> {
            None
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn discover_services(&self) -> Result<Vec<Uuid>, FileTransferError> {
            if self.advertises_transfer {
                Ok(vec![FILE_TRANSFER_SERVICE_UUID])
            } else {
                Ok(vec![Uuid::from_u128(0x180f)]) // battery service only
            }
        }

        async fn enable_file_transfer(&self) -> Result<(), FileTransferError> {
            Ok(())
        }

        async fn read_file(&self, _path: &str) -> Result<Vec<u8>, FileTransferError> {
            Ok(b"contents".to_vec())
        }

        async fn write_file(&self, _path: &str, _data: &[u8]) -> Result<(), FileTransferError> {
            Ok(())
        }

        async fn delete_file(&self, _path: &str) -> Result<bool, FileTransferError> {
            Ok(true)
        }

        async fn make_directory(&self, _path: &str) -> Result<bool, FileTransferError> {
            Ok(true)
        }

        async fn list_directory(
            &self,
            _path: &str,
        ) -> Result<Option<Vec<DirectoryEntry>>, FileTransferError> {
            Ok(Some(Vec::new()))
        }
    }

    #[tokio::test]
    async fn discovery_rejects_board_without_transfer_service() {
        let peripheral = BlePeripheral::new(FakeLink::new(false));
        let err = peripheral
            .discover(BoardService::all())
            .await
            .unwrap_err();
        assert!(matches!(err, FileTransferError::DiscoveringServices(_)));
    }

    #[tokio::test]
    async fn operations_fail_after_detach() {
        let link = FakeLink::new(true);
        let peripheral = BlePeripheral::new(link);
        peripheral.enable_file_transfer().await.unwrap();
        assert!(peripheral.is_file_transfer_enabled());

        peripheral.detach();
        assert!(!peripheral.is_file_transfer_enabled());
        assert_eq!(
            peripheral.read_file("/code.py").await.unwrap_err(),
            FileTransferError::Detached
        );
    }

    #[tokio::test]
    async fn operations_fail_when_link_drops() {
        let link = FakeLink::new(true);
        let peripheral = BlePeripheral::new(link.clone());
        peripheral.enable_file_transfer().await.unwrap();
        assert_eq!(peripheral.read_file("/code.py").await.unwrap(), b"contents");

        link.connected.store(false, Ordering::SeqCst);
        assert_eq!(
            peripheral.write_file("/code.py", b"x").await.unwrap_err(),
            FileTransferError::Detached
        );
    }

    #[tokio::test]
    async fn stale_generation_counts_as_detached() {
        let link = FakeLink::new(true);
        let peripheral = BlePeripheral::new(link.clone());
        peripheral.enable_file_transfer().await.unwrap();

        // The platform re-established the connection underneath us.
        link.generation.store(2, Ordering::SeqCst);
        assert_eq!(
            peripheral.read_file("/code.py").await.unwrap_err(),
            FileTransferError::Detached
        );
    }

    #[tokio::test]
    async fn display_name_falls_back_to_identity() {
        let peripheral = BlePeripheral::new(FakeLink::new(true));
        assert!(peripheral.display_name().starts_with("ble:"));
    }
}
