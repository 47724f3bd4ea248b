//! Identity-based notification routing.
//!
//! The radio stack delivers every notification with the id of the device
//! it came from. The router hands it to the session registered for that
//! device; notifications for unknown devices or superseded sessions are
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use super::traits::{FlashChannel, TransportError};

/// Outgoing side of the link (the radio stack, or a simulated device).
pub trait PacketSink: Send + Sync {
    fn send(&self, device_id: &str, data: &[u8]) -> Result<(), TransportError>;

    fn is_connected(&self, device_id: &str) -> bool;

    /// Block until the device is back after a reboot.
    fn wait_for_reconnect(&self, device_id: &str, timeout: Duration) -> Result<(), TransportError>;
}

/// Session registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(u64);

struct Route {
    session: SessionKey,
    tx: Sender<Vec<u8>>,
}

#[derive(Default)]
pub struct NotificationRouter {
    routes: Mutex<HashMap<String, Route>>,
    next_session: AtomicU64,
}

impl NotificationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new session for `device_id`, replacing any older one.
    pub fn register(&self, device_id: &str) -> (SessionKey, Receiver<Vec<u8>>) {
        let session = SessionKey(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel();
        let previous = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), Route { session, tx });
        if previous.is_some() {
            debug!(device = device_id, "Replaced previous session route");
        }
        (session, rx)
    }

    /// Remove the route, but only if it still belongs to `session`.
    pub fn unregister(&self, device_id: &str, session: SessionKey) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.get(device_id).is_some_and(|r| r.session == session) {
            routes.remove(device_id);
        }
    }

    /// Deliver a notification. Returns false when nobody wants it.
    pub fn deliver(&self, device_id: &str, data: &[u8]) -> bool {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        match routes.get(device_id) {
            Some(route) => route.tx.send(data.to_vec()).is_ok(),
            None => {
                trace!(device = device_id, len = data.len(), "Dropping unrouted notification");
                false
            }
        }
    }

    pub fn active_session(&self, device_id: &str) -> Option<SessionKey> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .map(|r| r.session)
    }
}

/// Channel for one session; unregisters its route when dropped.
pub struct RoutedChannel {
    device_id: String,
    session: SessionKey,
    router: Arc<NotificationRouter>,
    sink: Arc<dyn PacketSink>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

impl RoutedChannel {
    pub fn open(
        router: Arc<NotificationRouter>,
        sink: Arc<dyn PacketSink>,
        device_id: impl Into<String>,
    ) -> Self {
        let device_id = device_id.into();
        let (session, rx) = router.register(&device_id);
        debug!(device = %device_id, session = session.0, "Opened routed channel");
        Self {
            device_id,
            session,
            router,
            sink,
            rx: Mutex::new(rx),
        }
    }

    pub fn session(&self) -> SessionKey {
        self.session
    }
}

impl FlashChannel for RoutedChannel {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.sink.send(&self.device_id, data)
    }

    fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => {
                if self.sink.is_connected(&self.device_id) {
                    Err(TransportError::timeout(timeout))
                } else {
                    Err(TransportError::Disconnected)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn is_connected(&self) -> bool {
        self.sink.is_connected(&self.device_id)
    }

    fn reconnect(&self, timeout: Duration) -> Result<(), TransportError> {
        self.sink.wait_for_reconnect(&self.device_id, timeout)
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for RoutedChannel {
    fn drop(&mut self) {
        self.router.unregister(&self.device_id, self.session);
    }
}
