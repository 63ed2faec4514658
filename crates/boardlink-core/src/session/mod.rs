//! Device session
//!
//! A [`BoardSession`] represents an active, capability-discovered connection
//! to one board. Construction is asynchronous: it runs service discovery on
//! the attached transport and then enables every requested service
//! concurrently. Discovery failure fails construction outright; a
//! per-service enable failure only leaves that capability disabled.
//!
//! The session does not keep the underlying platform connection alive. When
//! the link goes away the transport reports itself detached and every
//! operation fails fast instead of hanging.

use crate::transfer::{
    BoardService, DirectoryEntry, FileTransferClient, FileTransferError, PeripheralIdentity,
};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct BoardSession {
    transport: Arc<dyn FileTransferClient>,
    enabled: HashSet<BoardService>,
    released: AtomicBool,
}

impl BoardSession {
    /// Build a session on a connected transport.
    ///
    /// `services` defaults to every supported service. No partial session is
    /// exposed on discovery failure.
    pub async fn new(
        transport: Arc<dyn FileTransferClient>,
        services: Option<&[BoardService]>,
    ) -> Result<Self, FileTransferError> {
        let requested = services.unwrap_or(BoardService::all());

        transport.discover(requested).await.map_err(|e| match e {
            FileTransferError::DiscoveringServices(_) => e,
            other => FileTransferError::DiscoveringServices(other.to_string()),
        })?;

        // Fan out: enable everything concurrently, fan in: construction only
        // completes once every service reported its own result.
        let attempts = requested.iter().map(|service| {
            let transport = Arc::clone(&transport);
            async move {
                let result = match service {
                    BoardService::FileTransfer => transport.enable_file_transfer().await,
                };
                (*service, result)
            }
        });

        let mut enabled = HashSet::new();
        for (service, result) in join_all(attempts).await {
            match result {
                Ok(()) => {
                    enabled.insert(service);
                }
                Err(e) => {
                    tracing::warn!(?service, "service enable failed, continuing without: {e}");
                }
            }
        }

        tracing::info!(
            board = %transport.display_name(),
            services = enabled.len(),
            "session established"
        );
        Ok(Self {
            transport,
            enabled,
            released: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> PeripheralIdentity {
        self.transport.identity()
    }

    pub fn display_name(&self) -> String {
        self.transport.display_name()
    }

    pub fn is_enabled(&self, service: BoardService) -> bool {
        self.enabled.contains(&service) && self.transport.is_file_transfer_enabled()
    }

    pub fn is_file_transfer_enabled(&self) -> bool {
        self.is_enabled(BoardService::FileTransfer)
    }

    /// Detach from the transport. Subsequent operations fail with
    /// [`FileTransferError::BoardNotConnected`].
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.transport.detach();
    }

    /// Whether this session talks to the same transport instance as `other`.
    pub fn is_same_board(&self, other: &BoardSession) -> bool {
        Arc::ptr_eq(&self.transport, &other.transport)
    }

    fn transport(&self) -> Result<&Arc<dyn FileTransferClient>, FileTransferError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(FileTransferError::BoardNotConnected);
        }
        Ok(&self.transport)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileTransferError> {
        self.transport()?.read_file(path).await
    }

    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FileTransferError> {
        self.transport()?.write_file(path, data).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<bool, FileTransferError> {
        self.transport()?.delete_file(path).await
    }

    pub async fn make_directory(&self, path: &str) -> Result<bool, FileTransferError> {
        self.transport()?.make_directory(path).await
    }

    pub async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, FileTransferError> {
        self.transport()?.list_directory(path).await
    }
}

impl fmt::Debug for BoardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardSession")
            .field("board", &self.transport.display_name())
            .field("identity", &self.transport.identity())
            .field("enabled", &self.enabled)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl PartialEq for BoardSession {
    /// Sessions are equal when they share the underlying transport instance,
    /// so callers can tell "this is the same device I was already talking
    /// to".
    fn eq(&self, other: &Self) -> bool {
        self.is_same_board(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct MockTransport {
        discover_fails: bool,
        enable_fails: bool,
        detached: AtomicBool,
        enabled: AtomicBool,
        writes: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MockTransport {
        fn working() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing_discovery() -> Arc<Self> {
            Arc::new(Self {
                discover_fails: true,
                ..Self::default()
            })
        }

        fn failing_enable() -> Arc<Self> {
            Arc::new(Self {
                enable_fails: true,
                ..Self::default()
            })
        }
    }

    #[async_trait::async_trait]
    impl FileTransferClient for MockTransport {
        fn identity(&self) -> PeripheralIdentity {
            PeripheralIdentity::Ble(Uuid::from_u128(0x99))
        }

        fn display_name(&self) -> String {
            "mock".to_string()
        }

        async fn discover(&self, _filter: &[BoardService]) -> Result<(), FileTransferError> {
            if self.discover_fails {
                Err(FileTransferError::DiscoveringServices(
                    "gatt timeout".to_string(),
                ))
            } else {
                Ok(())
            }
        }

        async fn enable_file_transfer(&self) -> Result<(), FileTransferError> {
            if self.enable_fails {
                Err(FileTransferError::Protocol("version too old".to_string()))
            } else {
                self.enabled.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        fn is_file_transfer_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst) && !self.detached.load(Ordering::SeqCst)
        }

        async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileTransferError> {
            if self.detached.load(Ordering::SeqCst) {
                return Err(FileTransferError::Detached);
            }
            Ok(path.as_bytes().to_vec())
        }

        async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FileTransferError> {
            if self.detached.load(Ordering::SeqCst) {
                return Err(FileTransferError::Detached);
            }
            self.writes
                .lock()
                .unwrap()
                .push((path.to_string(), data.to_vec()));
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

        fn detach(&self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn discovery_failure_exposes_no_session() {
        let err = BoardSession::new(MockTransport::failing_discovery(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FileTransferError::DiscoveringServices(_)));
    }

    #[tokio::test]
    async fn enable_failure_is_not_fatal_but_leaves_service_disabled() {
        let session = BoardSession::new(MockTransport::failing_enable(), None)
            .await
            .unwrap();
        assert!(!session.is_file_transfer_enabled());
    }

    #[tokio::test]
    async fn explicit_service_list_can_be_borrowed() {
        // The requested services need not outlive the call.
        let requested = vec![BoardService::FileTransfer];
        let session = BoardSession::new(MockTransport::working(), Some(&requested))
            .await
            .unwrap();
        assert!(session.is_file_transfer_enabled());
        assert!(format!("{session:?}").contains("mock"));
    }

    #[tokio::test]
    async fn operations_forward_to_the_transport() {
        let transport = MockTransport::working();
        let session = BoardSession::new(transport.clone(), None).await.unwrap();
        assert!(session.is_file_transfer_enabled());

        session.write_file("/code.py", b"print()").await.unwrap();
        let writes = transport.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "/code.py");
    }

    #[tokio::test]
    async fn released_session_fails_fast() {
        let session = BoardSession::new(MockTransport::working(), None)
            .await
            .unwrap();
        session.release();
        assert_eq!(
            session.read_file("/code.py").await.unwrap_err(),
            FileTransferError::BoardNotConnected
        );
        assert!(!session.is_file_transfer_enabled());
    }

    #[tokio::test]
    async fn detached_transport_errors_surface_verbatim() {
        let transport = MockTransport::working();
        let session = BoardSession::new(transport.clone(), None).await.unwrap();

        // The platform closed the link out from under the session.
        transport.detach();
        assert_eq!(
            session.read_file("/code.py").await.unwrap_err(),
            FileTransferError::Detached
        );
    }

    #[tokio::test]
    async fn equality_is_transport_identity() {
        let transport = MockTransport::working();
        let a = BoardSession::new(transport.clone(), None).await.unwrap();
        let b = BoardSession::new(transport, None).await.unwrap();
        let c = BoardSession::new(MockTransport::working(), None)
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
