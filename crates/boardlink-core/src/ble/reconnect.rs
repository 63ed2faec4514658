//! BLE auto-reconnect controller
//!
//! Re-establishes a session with a previously bonded board after an
//! unexpected disconnect. One controller drives at most one recovery attempt
//! at a time; the application talks to a single active board, so the state is
//! a single `Idle`/`Reconnecting` flag rather than a per-peripheral map.
//!
//! Observable signals per attempt that actually starts a link:
//! `WillReconnect` (success path only, before the handshake completes), then
//! exactly one of `DidReconnect` / `DidFailToReconnect`. Attempts are
//! generation-numbered; the first terminal signal wins and anything arriving
//! for a superseded attempt is dropped.

use crate::ble::LinkEvent;
use crate::ble::central::BleCentral;
use crate::ble::link::BleFileLink;
use crate::transfer::{FileTransferError, PeripheralIdentity};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default bound on a recovery attempt.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Externally observable reconnection signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// A candidate link was found; the session handshake is about to run.
    WillReconnect(Option<PeripheralIdentity>),
    /// Recovery finished successfully. Carries no identity when the platform
    /// reported a connect the controller could not resolve to a handle.
    DidReconnect(Option<PeripheralIdentity>),
    /// Recovery failed or timed out.
    DidFailToReconnect(Option<PeripheralIdentity>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Reconnecting,
}

/// Caller-supplied recovery handshake. Invoked with the reconnected link;
/// its result decides which terminal signal the controller forwards.
#[async_trait::async_trait]
pub trait ReconnectHandler: Send + Sync + 'static {
    async fn on_reconnected(&self, link: Arc<dyn BleFileLink>) -> Result<(), FileTransferError>;
}

/// Watches connection lifecycle events and drives bounded re-link attempts.
pub struct AutoReconnect {
    inner: Arc<Inner>,
}

struct Inner {
    central: Arc<dyn BleCentral>,
    handler: Arc<dyn ReconnectHandler>,
    services: Vec<Uuid>,
    events: mpsc::UnboundedSender<ReconnectEvent>,
    cell: Mutex<StateCell>,
}

struct StateCell {
    state: ReconnectState,
    attempt: u64,
    // Set once a candidate link was handed to the handler; from that point
    // the attempt settles through the handler's result, not the watchdog.
    handshake: bool,
    timeout: Duration,
}

/// Keeps the event watcher registered; dropping it unregisters, so the
/// registration is undone on every exit path.
pub struct WatchGuard {
    handle: JoinHandle<()>,
}

impl WatchGuard {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl AutoReconnect {
    pub fn new(
        central: Arc<dyn BleCentral>,
        handler: Arc<dyn ReconnectHandler>,
        services: Vec<Uuid>,
    ) -> (Self, mpsc::UnboundedReceiver<ReconnectEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            central,
            handler,
            services,
            events: tx,
            cell: Mutex::new(StateCell {
                state: ReconnectState::Idle,
                attempt: 0,
                handshake: false,
                timeout: DEFAULT_RECONNECT_TIMEOUT,
            }),
        });
        (Self { inner }, rx)
    }

    /// Override the attempt bound. Applies to attempts started afterwards.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.inner.cell.lock().unwrap().timeout = timeout;
        self
    }

    pub fn state(&self) -> ReconnectState {
        self.inner.cell.lock().unwrap().state
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state() == ReconnectState::Reconnecting
    }

    /// Consume platform connect/disconnect events on a single coordination
    /// task, in arrival order.
    pub fn watch(&self, mut events: mpsc::UnboundedReceiver<LinkEvent>) -> WatchGuard {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Connected(identity) => inner.handle_connected(identity).await,
                    LinkEvent::Disconnected(identity) => inner.handle_disconnected(&identity),
                }
            }
        });
        WatchGuard::new(handle)
    }

    /// Attempt to re-link to any known peripheral matching the configured
    /// service filter.
    ///
    /// Returns `false` without waiting when no eligible known peripheral
    /// exists; in that case the failed signal has already fired by the time
    /// this returns. Also returns `false` when an attempt is already in
    /// flight, without emitting anything.
    pub async fn reconnect(&self) -> bool {
        let (attempt, timeout) = {
            let mut cell = self.inner.cell.lock().unwrap();
            if cell.state == ReconnectState::Reconnecting {
                tracing::warn!("reconnect already in flight, ignoring");
                return false;
            }
            cell.state = ReconnectState::Reconnecting;
            cell.attempt += 1;
            cell.handshake = false;
            (cell.attempt, cell.timeout)
        };

        let started = self
            .inner
            .central
            .reconnect_to_known(&self.inner.services, timeout)
            .await;
        if !started {
            // Drive the failed outcome ourselves rather than waiting idle.
            self.inner
                .resolve(attempt, ReconnectEvent::DidFailToReconnect(None));
            return false;
        }

        // Watchdog for the candidate-wait phase only. Once a handshake is
        // running the attempt settles through the handler's result.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if inner.resolve_if_waiting(attempt) {
                tracing::info!(error = %FileTransferError::ReconnectTimeout, "recovery gave up");
            }
        });
        true
    }

    /// Route a platform connected notification into the state machine.
    pub async fn handle_connected(&self, identity: PeripheralIdentity) {
        self.inner.handle_connected(identity).await;
    }

    /// Route a platform disconnected notification into the state machine.
    pub fn handle_disconnected(&self, identity: &PeripheralIdentity) {
        self.inner.handle_disconnected(identity);
    }
}

impl Inner {
    /// Settle the attempt with a terminal signal. Returns whether this call
    /// won; losers (superseded attempt, already settled) are dropped.
    fn resolve(&self, attempt: u64, event: ReconnectEvent) -> bool {
        {
            let mut cell = self.cell.lock().unwrap();
            if cell.attempt != attempt || cell.state != ReconnectState::Reconnecting {
                return false;
            }
            cell.state = ReconnectState::Idle;
        }
        let _ = self.events.send(event);
        true
    }

    /// Watchdog settle: fails the attempt only while it is still waiting for
    /// a candidate. A handshake in flight outlives the bound and reports its
    /// own outcome.
    fn resolve_if_waiting(&self, attempt: u64) -> bool {
        {
            let mut cell = self.cell.lock().unwrap();
            if cell.attempt != attempt
                || cell.state != ReconnectState::Reconnecting
                || cell.handshake
            {
                return false;
            }
            cell.state = ReconnectState::Idle;
        }
        let _ = self.events.send(ReconnectEvent::DidFailToReconnect(None));
        true
    }

    async fn handle_connected(self: &Arc<Self>, identity: PeripheralIdentity) {
        let attempt = {
            let cell = self.cell.lock().unwrap();
            if cell.state != ReconnectState::Reconnecting {
                // A fresh user-initiated connect, not a recovery.
                tracing::debug!(%identity, "connect outside recovery, ignoring");
                return;
            }
            cell.attempt
        };

        let Some(link) = self.central.resolve(&identity).await else {
            // Platform reported a connect but no reachable handle exists.
            // Soft non-failure: an actual recovery must not be masked by a
            // spurious failure signal, so report success without detail.
            tracing::warn!(
                %identity,
                error = %FileTransferError::UnknownPeripheral,
                "reporting recovery without peripheral detail"
            );
            self.resolve(attempt, ReconnectEvent::DidReconnect(None));
            return;
        };

        {
            let mut cell = self.cell.lock().unwrap();
            if cell.attempt != attempt || cell.state != ReconnectState::Reconnecting {
                return;
            }
            cell.handshake = true;
            let _ = self
                .events
                .send(ReconnectEvent::WillReconnect(Some(identity.clone())));
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.handler.on_reconnected(link).await {
                Ok(()) => {
                    inner.resolve(attempt, ReconnectEvent::DidReconnect(Some(identity)));
                }
                Err(e) => {
                    tracing::warn!(%identity, "recovery handshake failed: {e}");
                    inner.resolve(attempt, ReconnectEvent::DidFailToReconnect(Some(identity)));
                }
            }
        });
    }

    fn handle_disconnected(&self, identity: &PeripheralIdentity) {
        let attempt = {
            let cell = self.cell.lock().unwrap();
            if cell.state != ReconnectState::Reconnecting {
                tracing::debug!(%identity, "disconnect outside recovery, observed only");
                return;
            }
            cell.attempt
        };
        if self.resolve(attempt, ReconnectEvent::DidFailToReconnect(None)) {
            tracing::info!(%identity, "peripheral dropped during recovery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(1);

    struct MockCentral {
        started: bool,
        links: Mutex<HashMap<PeripheralIdentity, Arc<MockLink>>>,
    }

    impl MockCentral {
        fn new(started: bool) -> Arc<Self> {
            Arc::new(Self {
                started,
                links: Mutex::new(HashMap::new()),
            })
        }

        fn add_link(&self, identity: PeripheralIdentity) {
            let link = Arc::new(MockLink {
                identity: identity.clone(),
            });
            self.links.lock().unwrap().insert(identity, link);
        }
    }

    #[async_trait::async_trait]
    impl BleCentral for MockCentral {
        async fn reconnect_to_known(&self, _services: &[Uuid], _timeout: Duration) -> bool {
            self.started
        }

        async fn resolve(&self, identity: &PeripheralIdentity) -> Option<Arc<dyn BleFileLink>> {
            self.links
                .lock()
                .unwrap()
                .get(identity)
                .cloned()
                .map(|l| l as Arc<dyn BleFileLink>)
        }
    }

    struct MockLink {
        identity: PeripheralIdentity,
    }

    #[async_trait::async_trait]
    impl BleFileLink for MockLink {
        fn identity(&self) -> PeripheralIdentity {
            self.identity.clone()
        }

        fn display_name(&self) -> Option<String> {
            None
        }

        fn generation(&self) -> u64 {
            1
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn discover_services(&self) -> Result<Vec<Uuid>, FileTransferError> {
            Ok(vec![crate::ble::FILE_TRANSFER_SERVICE_UUID])
        }

        async fn enable_file_transfer(&self) -> Result<(), FileTransferError> {
            Ok(())
        }

        async fn read_file(&self, _path: &str) -> Result<Vec<u8>, FileTransferError> {
            Ok(Vec::new())
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
        ) -> Result<Option<Vec<crate::transfer::DirectoryEntry>>, FileTransferError> {
            Ok(Some(Vec::new()))
        }
    }

    struct RecordingHandler {
        result: Result<(), FileTransferError>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl RecordingHandler {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                result: Ok(()),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: Err(FileTransferError::DiscoveringServices("boom".to_string())),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(()),
                delay: Some(delay),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ReconnectHandler for RecordingHandler {
        async fn on_reconnected(
            &self,
            _link: Arc<dyn BleFileLink>,
        ) -> Result<(), FileTransferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result.clone()
        }
    }

    fn identity() -> PeripheralIdentity {
        PeripheralIdentity::Ble(Uuid::from_u128(0xa1))
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ReconnectEvent>) -> ReconnectEvent {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn no_known_peripheral_fails_synchronously() {
        let central = MockCentral::new(false);
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler.clone(), vec![]);

        assert!(!controller.reconnect().await);
        // The failure signal is already in the channel when reconnect returns.
        assert_eq!(
            rx.try_recv().unwrap(),
            ReconnectEvent::DidFailToReconnect(None)
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(controller.state(), ReconnectState::Idle);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn successful_recovery_emits_will_then_did() {
        let central = MockCentral::new(true);
        let id = identity();
        central.add_link(id.clone());
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler.clone(), vec![]);

        assert!(controller.reconnect().await);
        controller.handle_connected(id.clone()).await;

        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::WillReconnect(Some(id.clone()))
        );
        assert_eq!(recv(&mut rx).await, ReconnectEvent::DidReconnect(Some(id)));
        assert_eq!(handler.calls(), 1);
        assert_eq!(controller.state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn handler_failure_emits_did_fail_with_identity() {
        let central = MockCentral::new(true);
        let id = identity();
        central.add_link(id.clone());
        let handler = RecordingHandler::failing();
        let (controller, mut rx) = AutoReconnect::new(central, handler.clone(), vec![]);

        assert!(controller.reconnect().await);
        controller.handle_connected(id.clone()).await;

        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::WillReconnect(Some(id.clone()))
        );
        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::DidFailToReconnect(Some(id))
        );
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn disconnect_during_recovery_fails_with_no_payload() {
        let central = MockCentral::new(true);
        let id = identity();
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler, vec![]);

        assert!(controller.reconnect().await);
        controller.handle_disconnected(&id);

        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::DidFailToReconnect(None)
        );
        assert_eq!(controller.state(), ReconnectState::Idle);
        // The controller is usable again for a fresh attempt.
        assert!(controller.reconnect().await);
    }

    #[tokio::test]
    async fn events_while_idle_are_ignored() {
        let central = MockCentral::new(true);
        let id = identity();
        central.add_link(id.clone());
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler.clone(), vec![]);

        controller.handle_disconnected(&id);
        controller.handle_connected(id).await;
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(handler.calls(), 0);
        assert_eq!(controller.state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn unresolvable_peripheral_reports_generic_reconnect() {
        // Platform says connected, but no handle resolves: soft non-failure.
        let central = MockCentral::new(true);
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler.clone(), vec![]);

        assert!(controller.reconnect().await);
        controller.handle_connected(identity()).await;

        assert_eq!(recv(&mut rx).await, ReconnectEvent::DidReconnect(None));
        assert_eq!(handler.calls(), 0);
        assert_eq!(controller.state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn first_signal_wins_over_late_handler_completion() {
        let central = MockCentral::new(true);
        let id = identity();
        central.add_link(id.clone());
        let handler = RecordingHandler::slow(Duration::from_millis(100));
        let (controller, mut rx) = AutoReconnect::new(central, handler, vec![]);

        assert!(controller.reconnect().await);
        controller.handle_connected(id.clone()).await;
        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::WillReconnect(Some(id.clone()))
        );

        // Disconnect races the still-running handshake and settles first.
        controller.handle_disconnected(&id);
        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::DidFailToReconnect(None)
        );

        // The handler's eventual success must not produce a second signal.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_reconnect_is_rejected() {
        let central = MockCentral::new(true);
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler, vec![]);

        assert!(controller.reconnect().await);
        assert!(!controller.reconnect().await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attempt_times_out_into_failure() {
        let central = MockCentral::new(true);
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler, vec![]);
        let controller = controller.with_timeout(Duration::from_millis(50));

        assert!(controller.reconnect().await);
        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::DidFailToReconnect(None)
        );
        assert_eq!(controller.state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn handshake_outliving_the_timeout_still_succeeds() {
        // A handshake that starts inside the bound may finish after it; the
        // watchdog must not preempt it with a spurious failure.
        let central = MockCentral::new(true);
        let id = identity();
        central.add_link(id.clone());
        let handler = RecordingHandler::slow(Duration::from_millis(150));
        let (controller, mut rx) = AutoReconnect::new(central, handler, vec![]);
        let controller = controller.with_timeout(Duration::from_millis(50));

        assert!(controller.reconnect().await);
        controller.handle_connected(id.clone()).await;

        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::WillReconnect(Some(id.clone()))
        );
        assert_eq!(recv(&mut rx).await, ReconnectEvent::DidReconnect(Some(id)));
        assert_eq!(controller.state(), ReconnectState::Idle);

        // The expired watchdog must not add a late failure signal.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn watch_routes_link_events() {
        let central = MockCentral::new(true);
        let id = identity();
        central.add_link(id.clone());
        let handler = RecordingHandler::ok();
        let (controller, mut rx) = AutoReconnect::new(central, handler, vec![]);

        let (tx, link_rx) = mpsc::unbounded_channel();
        let _guard = controller.watch(link_rx);

        assert!(controller.reconnect().await);
        tx.send(LinkEvent::Connected(id.clone())).unwrap();

        assert_eq!(
            recv(&mut rx).await,
            ReconnectEvent::WillReconnect(Some(id.clone()))
        );
        assert_eq!(recv(&mut rx).await, ReconnectEvent::DidReconnect(Some(id)));
    }
}
