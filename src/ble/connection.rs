//! BLE connection management.
//!
//! Tracks the GATT connection of one peripheral. State changes come from two
//! places: explicit `connect`/`disconnect` calls and link events the native
//! stack reports through the event router.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ble::native::NativeDeviceRef;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Connection state for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Hardware address of the peripheral.
    pub address: String,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Manages the connection of one peripheral.
pub struct ConnectionManager {
    /// The native device.
    device: NativeDeviceRef,
    /// Cached hardware address.
    address: String,
    /// Current connection state.
    state: Arc<RwLock<ConnectionState>>,
    /// Whether to maintain the connection (auto-reconnect).
    maintain_connection: Arc<RwLock<bool>>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Maximum reconnection attempts.
    max_reconnect_attempts: u32,
    /// Reconnection delay.
    reconnect_delay: Duration,
}

impl ConnectionManager {
    /// Create a new connection manager for a device.
    pub fn new(device: NativeDeviceRef, address: String, config: &ConnectionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            device,
            address,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            maintain_connection: Arc::new(RwLock::new(false)),
            event_tx,
            max_reconnect_attempts: config.max_reconnect_attempts.max(1),
            reconnect_delay: config.reconnect_delay,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Attempt to connect.
    ///
    /// # Arguments
    ///
    /// * `maintain` - Whether to maintain the connection (auto-reconnect on disconnect)
    pub async fn connect(&self, maintain: bool) -> Result<()> {
        let current_state = *self.state.read();

        if current_state.is_connected() {
            debug!("{} already connected", self.address);
            return Ok(());
        }

        if current_state.is_transitioning() {
            return Err(Error::ConnectionFailed {
                reason: "Connection already in progress".to_string(),
            });
        }

        *self.maintain_connection.write() = maintain;

        self.set_state(ConnectionState::Connecting);

        // The OS may already hold a link opened by another client.
        if self.device.is_connected().await.unwrap_or(false) {
            info!("{} already connected at BLE level", self.address);
            self.set_state(ConnectionState::Connected);
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = if maintain {
            self.max_reconnect_attempts
        } else {
            1
        };
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;

            debug!(
                "Connection attempt {} of {} to {}",
                attempts, max_attempts, self.address
            );

            match self.device.connect().await {
                Ok(_) => {
                    info!("Connected to {}", self.address);
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempts, e);
                    last_error = Some(e);

                    if attempts < max_attempts {
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(Error::ConnectionFailed {
            reason: match last_error {
                Some(e) => format!("Failed after {} attempts: {}", max_attempts, e),
                None => format!("Failed after {} attempts", max_attempts),
            },
        })
    }

    /// Disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        *self.maintain_connection.write() = false;

        let current_state = *self.state.read();

        if matches!(
            current_state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);

        match self.device.disconnect().await {
            Ok(_) => {
                info!("Disconnected from {}", self.address);
                self.set_state(ConnectionState::Disconnected);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", self.address, e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Check if we're maintaining the connection.
    pub fn is_maintaining_connection(&self) -> bool {
        *self.maintain_connection.read()
    }

    /// The native stack reported the link as up.
    pub(crate) fn handle_connected(&self) {
        if !self.state().is_connected() {
            self.set_state(ConnectionState::Connected);
        }
    }

    /// The native stack reported the link as down.
    ///
    /// Reconnects if the connection is being maintained.
    pub async fn handle_disconnection(&self) {
        if *self.state.read() == ConnectionState::Disconnecting {
            // disconnect() owns this transition.
            return;
        }

        self.set_state(ConnectionState::Disconnected);

        if !*self.maintain_connection.read() {
            return;
        }

        info!("Connection to {} lost, attempting to reconnect...", self.address);

        if let Err(e) = self.connect(true).await {
            error!("Reconnection to {} failed: {}", self.address, e);
        }
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!(
                "{} connection state changed: {} -> {}",
                self.address, old_state, new_state
            );

            let _ = self.event_tx.send(ConnectionEvent {
                address: self.address.clone(),
                state: new_state,
            });
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("maintain", &self.is_maintaining_connection())
            .finish()
    }
}
