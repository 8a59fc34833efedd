//! GATT characteristic handling.
//!
//! Provides functionality for reading, writing, and subscribing to
//! characteristics on a connected peripheral.

use futures::future;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::native::{GattCharacteristic, NativeDeviceRef};
use crate::ble::observer::{Observed, Registration};
use crate::ble::uuids::parse_uuid;
use crate::error::{Error, Result};
use crate::utils::hex_preview;

/// Notification event from a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub data: Vec<u8>,
}

/// Notifications from one characteristic. Dropping the stream releases the
/// subscription; the native one is disabled when the last stream goes away.
pub type NotificationStream = Observed<BoxStream<'static, NotificationEvent>>;

type CharacteristicKey = (Uuid, Uuid);

/// Handler for GATT characteristics on a peripheral.
pub struct CharacteristicHandler {
    /// The device to communicate with.
    device: NativeDeviceRef,
    /// Cached characteristics by (service, characteristic) UUID.
    characteristics: Arc<RwLock<HashMap<CharacteristicKey, GattCharacteristic>>>,
    /// Live notification streams per characteristic.
    subscriptions: Arc<Mutex<HashMap<CharacteristicKey, usize>>>,
    /// Held while a first subscriber enables notifications natively.
    subscribe_gate: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl CharacteristicHandler {
    /// Create a new characteristic handler for a device.
    pub fn new(device: NativeDeviceRef) -> Self {
        Self {
            device,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            subscribe_gate: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Discover and cache all characteristics.
    ///
    /// Requires a connection.
    pub async fn discover_characteristics(&self) -> Result<usize> {
        let services = self.device.discover_services().await?;

        let mut chars = self.characteristics.write();
        chars.clear();

        for service in services {
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid, service.uuid
                );
                chars.insert((service.uuid, characteristic.uuid), characteristic);
            }
        }

        debug!("Discovered {} characteristics", chars.len());

        Ok(chars.len())
    }

    /// Whether characteristics have been discovered.
    pub fn is_discovered(&self) -> bool {
        !self.characteristics.read().is_empty()
    }

    /// Look up a discovered characteristic.
    pub fn get_characteristic(&self, service: &Uuid, uuid: &Uuid) -> Option<GattCharacteristic> {
        self.characteristics.read().get(&(*service, *uuid)).cloned()
    }

    /// Resolve a characteristic from textual service and characteristic UUIDs.
    ///
    /// Short forms such as `"FFF0"` are expanded against the Bluetooth base
    /// UUID.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for malformed UUIDs, [`Error::ServiceNotFound`]
    /// if no discovered characteristic belongs to the service, and
    /// [`Error::CharacteristicNotFound`] otherwise.
    pub fn get_known_characteristic(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<GattCharacteristic> {
        let service = parse_uuid(service_uuid)?;
        let uuid = parse_uuid(characteristic_uuid)?;

        let chars = self.characteristics.read();
        if let Some(characteristic) = chars.get(&(service, uuid)) {
            return Ok(characteristic.clone());
        }

        if chars.keys().any(|(s, _)| *s == service) {
            Err(Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
        } else {
            Err(Error::ServiceNotFound {
                uuid: service.to_string(),
            })
        }
    }

    /// Read a characteristic value.
    pub async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        let data = self.device.read(characteristic).await?;

        trace!(
            "Read {} bytes from characteristic {}: {}",
            data.len(),
            characteristic.uuid,
            hex_preview(&data, 20)
        );

        Ok(data)
    }

    /// Write to a characteristic.
    pub async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.device.write(characteristic, data, with_response).await?;

        trace!(
            "Wrote {} bytes to characteristic {}",
            data.len(),
            characteristic.uuid
        );

        Ok(())
    }

    /// Read a string value from a characteristic.
    pub async fn read_string(&self, characteristic: &GattCharacteristic) -> Result<String> {
        let data = self.read(characteristic).await?;
        String::from_utf8(data).map_err(|_| Error::InvalidData {
            context: format!("Invalid UTF-8 in characteristic {}", characteristic.uuid),
        })
    }

    /// Subscribe to notifications from a characteristic.
    ///
    /// Several streams may watch the same characteristic; the native
    /// subscription is enabled by the first and disabled after the last one
    /// is dropped. A caller arriving while the native subscribe is in flight
    /// waits for its outcome.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] if the characteristic can neither notify nor
    /// indicate, or any error from the native stack.
    pub async fn notify(&self, characteristic: &GattCharacteristic) -> Result<NotificationStream> {
        if !characteristic.properties.can_notify() {
            return Err(Error::NotSupported {
                operation: format!("notify on {}", characteristic.uuid),
            });
        }

        let key = (characteristic.service_uuid, characteristic.uuid);
        let notifications = self.device.notifications().await?;

        let _gate = self.subscribe_gate.lock().await;
        let first = {
            let mut subscriptions = self.subscriptions.lock();
            let count = subscriptions.entry(key).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            debug!("Enabling notifications for {}", characteristic.uuid);
            if let Err(e) = self.device.subscribe(characteristic).await {
                debug!("Failed to subscribe to {}: {}", characteristic.uuid, e);
                release_subscription(&self.subscriptions, &key);
                return Err(e);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registration = {
            let device = self.device.clone();
            let subscriptions = self.subscriptions.clone();
            let characteristic = characteristic.clone();
            Registration::new(id, move || {
                if release_subscription(&subscriptions, &key) {
                    disable_notifications(device, characteristic);
                }
            })
        };

        let uuid = characteristic.uuid;
        let stream = notifications
            .filter_map(move |notification| {
                let event = (notification.uuid == uuid).then(|| {
                    trace!(
                        "Notification from {}: {}",
                        uuid,
                        hex_preview(&notification.value, 20)
                    );
                    NotificationEvent {
                        characteristic_uuid: notification.uuid,
                        data: notification.value,
                    }
                });
                future::ready(event)
            })
            .boxed();

        Ok(Observed::new(stream, registration))
    }

    /// Number of live notification streams for a characteristic.
    pub fn subscriber_count(&self, characteristic: &GattCharacteristic) -> usize {
        self.subscriptions
            .lock()
            .get(&(characteristic.service_uuid, characteristic.uuid))
            .copied()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for CharacteristicHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacteristicHandler")
            .field("characteristics", &self.characteristics.read().len())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

/// Drop one subscriber. Returns `true` if it was the last one.
fn release_subscription(
    subscriptions: &Mutex<HashMap<CharacteristicKey, usize>>,
    key: &CharacteristicKey,
) -> bool {
    let mut subscriptions = subscriptions.lock();
    match subscriptions.get_mut(key) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            subscriptions.remove(key);
            true
        }
        None => false,
    }
}

fn disable_notifications(device: NativeDeviceRef, characteristic: GattCharacteristic) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match device.unsubscribe(&characteristic).await {
                    Ok(()) => debug!("Unsubscribed from notifications from {}", characteristic.uuid),
                    Err(e) => warn!("Failed to unsubscribe from {}: {}", characteristic.uuid, e),
                }
            });
        }
        Err(_) => warn!(
            "No runtime to unsubscribe from {}, leaving notifications enabled",
            characteristic.uuid
        ),
    }
}
