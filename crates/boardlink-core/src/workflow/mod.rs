//! Connection orchestration
//!
//! [`ConnectionManager`] wires the pieces together: it routes platform
//! connect/disconnect notifications, owns at most one [`BoardSession`],
//! drives the [`AutoReconnect`] controller after an unexpected drop of the
//! bonded board, and rebuilds the session when recovery succeeds.
//!
//! Persistence stays outside: the manager reads WiFi passwords through an
//! injected lookup and reports fresh bonds through an injected callback.

use crate::ble::LinkEvent;
use crate::ble::central::BleCentral;
use crate::ble::link::BleFileLink;
use crate::ble::peripheral::BlePeripheral;
use crate::ble::reconnect::{
    AutoReconnect, DEFAULT_RECONNECT_TIMEOUT, ReconnectEvent, ReconnectHandler, WatchGuard,
};
use crate::session::BoardSession;
use crate::transfer::{FileTransferError, PeripheralIdentity};
use crate::wifi::WifiPeripheral;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Invoked when a board completes a connect/bond workflow: `(name, identity)`.
pub type BondedCallback = Arc<dyn Fn(&str, &PeripheralIdentity) + Send + Sync>;

/// Answers "what is the saved password for this host", if any.
pub type PasswordLookup = Arc<dyn Fn(&PeripheralIdentity, &str) -> Option<String> + Send + Sync>;

/// Events the orchestrator emits towards the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    WillReconnect(Option<PeripheralIdentity>),
    DidReconnect(Option<PeripheralIdentity>),
    DidFailToReconnect(Option<PeripheralIdentity>),
    SessionReady(PeripheralIdentity),
    SessionClosed(PeripheralIdentity),
}

pub struct ConnectionManagerOptions {
    /// Service filter for re-link attempts.
    pub services: Vec<Uuid>,
    pub reconnect_timeout: Duration,
}

impl Default for ConnectionManagerOptions {
    fn default() -> Self {
        Self {
            services: vec![crate::ble::FILE_TRANSFER_SERVICE_UUID],
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
        }
    }
}

pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    reconnect: Arc<AutoReconnect>,
}

struct ManagerInner {
    central: Arc<dyn BleCentral>,
    session: Mutex<Option<Arc<BoardSession>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    on_bonded: BondedCallback,
    password_lookup: PasswordLookup,
}

impl ConnectionManager {
    pub fn new(
        central: Arc<dyn BleCentral>,
        options: ConnectionManagerOptions,
        on_bonded: BondedCallback,
        password_lookup: PasswordLookup,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            central: Arc::clone(&central),
            session: Mutex::new(None),
            events: events_tx.clone(),
            on_bonded,
            password_lookup,
        });

        let handler: Arc<dyn ReconnectHandler> = Arc::clone(&inner) as Arc<dyn ReconnectHandler>;
        let (reconnect, reconnect_rx) = AutoReconnect::new(central, handler, options.services);
        let reconnect = Arc::new(reconnect.with_timeout(options.reconnect_timeout));

        Self::forward_reconnect_events(reconnect_rx, events_tx);

        (Self { inner, reconnect }, events_rx)
    }

    fn forward_reconnect_events(
        mut rx: mpsc::UnboundedReceiver<ReconnectEvent>,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mapped = match event {
                    ReconnectEvent::WillReconnect(id) => ConnectionEvent::WillReconnect(id),
                    ReconnectEvent::DidReconnect(id) => ConnectionEvent::DidReconnect(id),
                    ReconnectEvent::DidFailToReconnect(id) => {
                        ConnectionEvent::DidFailToReconnect(id)
                    }
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        });
    }

    /// Consume platform link events in arrival order on one task.
    ///
    /// A disconnect of the current board's peripheral closes the session and
    /// starts a recovery attempt; disconnects of other peripherals are only
    /// routed into the controller for observation.
    pub fn attach_link_events(&self, mut events: mpsc::UnboundedReceiver<LinkEvent>) -> WatchGuard {
        let inner = Arc::clone(&self.inner);
        let reconnect = Arc::clone(&self.reconnect);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Connected(identity) => {
                        reconnect.handle_connected(identity).await;
                    }
                    LinkEvent::Disconnected(identity) => {
                        let was_reconnecting = reconnect.is_reconnecting();
                        reconnect.handle_disconnected(&identity);
                        let was_ours = inner.close_session_if(&identity).await;
                        if was_ours && !was_reconnecting {
                            reconnect.reconnect().await;
                        }
                    }
                }
            }
        });
        WatchGuard::new(handle)
    }

    /// Build a session on an already-connected BLE link, typically right
    /// after a user-initiated connect.
    pub async fn connect_ble(
        &self,
        link: Arc<dyn BleFileLink>,
    ) -> Result<Arc<BoardSession>, FileTransferError> {
        self.inner.establish_ble(link).await
    }

    /// Build a session on a board reachable over the local network.
    pub async fn connect_wifi(
        &self,
        host: &str,
        port: u16,
        name: Option<String>,
    ) -> Result<Arc<BoardSession>, FileTransferError> {
        let identity = PeripheralIdentity::Wifi {
            host: host.to_string(),
            port,
        };
        let password = (self.inner.password_lookup)(&identity, host);
        let transport = Arc::new(
            WifiPeripheral::new(host, port)?
                .with_name(name)
                .with_password(password),
        );
        let session = Arc::new(BoardSession::new(transport, None).await?);
        self.inner.install_session(Arc::clone(&session)).await;
        Ok(session)
    }

    /// The currently active session, if any.
    pub async fn session(&self) -> Option<Arc<BoardSession>> {
        self.inner.session.lock().await.clone()
    }

    /// Manually trigger a recovery attempt.
    pub async fn reconnect(&self) -> bool {
        self.reconnect.reconnect().await
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.is_reconnecting()
    }
}

impl ManagerInner {
    async fn establish_ble(
        self: &Arc<Self>,
        link: Arc<dyn BleFileLink>,
    ) -> Result<Arc<BoardSession>, FileTransferError> {
        let transport = Arc::new(BlePeripheral::new(link));
        let session = Arc::new(BoardSession::new(transport, None).await?);
        self.central.remember_bonded(&session.identity());
        self.install_session(Arc::clone(&session)).await;
        Ok(session)
    }

    async fn install_session(&self, session: Arc<BoardSession>) {
        let identity = session.identity();
        let name = session.display_name();
        {
            let mut slot = self.session.lock().await;
            if let Some(previous) = slot.take() {
                // The transport is exclusively owned; never keep two sessions
                // on one live link.
                previous.release();
            }
            *slot = Some(session);
        }
        (self.on_bonded)(&name, &identity);
        let _ = self.events.send(ConnectionEvent::SessionReady(identity));
    }

    async fn close_session_if(&self, identity: &PeripheralIdentity) -> bool {
        let mut slot = self.session.lock().await;
        match slot.as_ref() {
            Some(session) if session.identity() == *identity => {
                session.release();
                *slot = None;
                let _ = self
                    .events
                    .send(ConnectionEvent::SessionClosed(identity.clone()));
                true
            }
            _ => false,
        }
    }
}

#[async_trait::async_trait]
impl ReconnectHandler for ManagerInner {
    async fn on_reconnected(&self, link: Arc<dyn BleFileLink>) -> Result<(), FileTransferError> {
        let transport = Arc::new(BlePeripheral::new(link));
        let session = Arc::new(BoardSession::new(transport, None).await?);
        self.install_session(session).await;
        Ok(())
    }
}
