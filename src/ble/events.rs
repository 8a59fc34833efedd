//! Peripheral event routing.
//!
//! Every device lifecycle event is published as a [`NamedMessage`]. Each
//! listener owns an unbounded queue and the router filters into it at
//! publish time, so events for other peripherals can never push a
//! listener's own events out. The filter is a pure function over the
//! message, and any number of listeners can watch the same pair
//! independently.
//!
//! Adapter state travels on a separate replaying channel: a new subscriber
//! sees the latest known state first, then every later transition.

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tracing::trace;

use crate::ble::native::AccessState;
use crate::peripheral::Peripheral;

/// Link-level connection established.
pub const ACL_CONNECTED: &str = "AclConnected";
/// Link-level connection dropped.
pub const ACL_DISCONNECTED: &str = "AclDisconnected";
/// The OS asked for pairing input.
pub const PAIRING_REQUEST: &str = "PairingRequest";
/// Bond state changed; the peripheral carries the new state.
pub const BOND_STATE_CHANGED: &str = "BondStateChanged";
/// A pairing request arrived with a registered PIN and the OS rejected it.
pub const BLE_PAIRING_FAILED: &str = "BlePairingFailed";

/// An event envelope: event name plus payload.
#[derive(Debug, Clone)]
pub struct NamedMessage<T> {
    /// Event name.
    pub name: String,
    /// Payload.
    pub arg: T,
}

impl<T> NamedMessage<T> {
    /// Create a new message.
    pub fn new(name: impl Into<String>, arg: T) -> Self {
        Self {
            name: name.into(),
            arg,
        }
    }
}

/// Stream of peripherals matching a listener's filter.
pub type EventStream = BoxStream<'static, Arc<Peripheral>>;

type PeripheralMessage = NamedMessage<Arc<Peripheral>>;

/// Check if `message` is the `event_name` event for the peripheral at `address`.
///
/// Names compare case-insensitively; addresses compare exactly.
pub fn is_match(message: &PeripheralMessage, event_name: &str, address: &str) -> bool {
    message.arg.address() == address
        && message.name.to_lowercase() == event_name.to_lowercase()
}

struct Listener {
    /// Event name and address; `None` receives everything.
    filter: Option<(String, String)>,
    tx: mpsc::UnboundedSender<PeripheralMessage>,
}

impl Listener {
    fn wants(&self, message: &PeripheralMessage) -> bool {
        match &self.filter {
            Some((name, address)) => is_match(message, name, address),
            None => true,
        }
    }
}

/// Delivery point for peripheral events and adapter state.
#[derive(Clone)]
pub struct EventRouter {
    listeners: Arc<Mutex<Vec<Listener>>>,
    status: Arc<watch::Sender<AccessState>>,
}

impl EventRouter {
    /// Create a router with no listeners and an unknown adapter state.
    pub fn new() -> Self {
        let (status, _) = watch::channel(AccessState::default());

        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(status),
        }
    }

    /// Publish an event for a peripheral.
    ///
    /// Listeners whose stream was dropped are pruned here.
    pub fn publish(&self, event_name: impl Into<String>, peripheral: Arc<Peripheral>) {
        let message = NamedMessage::new(event_name, peripheral);
        trace!("Publishing {} for {}", message.name, message.arg.address());

        self.listeners.lock().retain(|listener| {
            if listener.wants(&message) {
                listener.tx.send(message.clone()).is_ok()
            } else {
                !listener.tx.is_closed()
            }
        });
    }

    /// Number of live listeners, as of the last publish.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn register(&self, filter: Option<(String, String)>) -> mpsc::UnboundedReceiver<PeripheralMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener { filter, tx });
        rx
    }

    /// Every published message, in publish order.
    pub fn all_events(&self) -> BoxStream<'static, PeripheralMessage> {
        UnboundedReceiverStream::new(self.register(None)).boxed()
    }

    /// Listen for `event_name` events addressed to `target`.
    ///
    /// The subscription is taken immediately; events published after this
    /// call are delivered in publish order, none are dropped.
    pub fn listen_for(&self, event_name: &str, target: &Peripheral) -> EventStream {
        let filter = (event_name.to_owned(), target.address().to_owned());

        UnboundedReceiverStream::new(self.register(Some(filter)))
            .map(|message| message.arg)
            .boxed()
    }

    /// Last known adapter state.
    pub fn status(&self) -> AccessState {
        *self.status.borrow()
    }

    /// Record an adapter state. Returns `true` if it differs from the last one.
    pub fn publish_status(&self, state: AccessState) -> bool {
        self.status.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// Adapter state stream: the current state first, then each transition.
    pub fn status_changed(&self) -> BoxStream<'static, AccessState> {
        WatchStream::new(self.status.subscribe()).boxed()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("listeners", &self.listener_count())
            .field("status", &self.status())
            .finish()
    }
}
