//! Peripheral struct and methods.
//!
//! Represents one physical BLE device. Instances are created and owned by the
//! [`PeripheralCache`](crate::ble::cache::PeripheralCache); there is exactly
//! one per hardware address, so holding an `Arc<Peripheral>` across scans and
//! reconnects keeps pointing at the same device.

use futures::future;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::advertising::AdvertisementData;
use crate::ble::characteristics::{CharacteristicHandler, NotificationStream};
use crate::ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::ble::events::{
    EventRouter, EventStream, ACL_CONNECTED, ACL_DISCONNECTED, BLE_PAIRING_FAILED,
    BOND_STATE_CHANGED,
};
use crate::ble::native::{BondState, GattCharacteristic, NativeDeviceRef};
use crate::ble::observer::first_or_cancelled;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::utils::normalize_address;

/// Mutable, advertisement-derived state.
#[derive(Debug, Default)]
struct PeripheralState {
    /// Last advertised local name.
    name: Option<String>,
    /// Last seen signal strength.
    rssi: Option<i16>,
    /// Last advertisement.
    advertisement: Option<AdvertisementData>,
    /// Time of the last advertisement.
    last_seen: Option<Instant>,
    /// Last reported bond state.
    bond_state: BondState,
}

/// Represents a single BLE peripheral.
pub struct Peripheral {
    /// Normalized hardware address.
    address: String,
    /// Native device handle, owned by this peripheral.
    native: NativeDeviceRef,
    /// Router the peripheral listens on.
    router: EventRouter,
    /// Advertisement and bond state.
    state: RwLock<PeripheralState>,
    /// PIN to inject into the next pairing request.
    pairing_pin: Mutex<Option<String>>,
    /// Connection manager.
    connection: Arc<ConnectionManager>,
    /// Characteristic handler.
    characteristics: CharacteristicHandler,
}

impl Peripheral {
    /// Create a peripheral for a native device.
    ///
    /// Applications get peripherals from the central context; constructing
    /// one directly bypasses the identity cache.
    pub fn new(native: NativeDeviceRef, router: EventRouter, connection: ConnectionConfig) -> Self {
        let address = normalize_address(&native.address());

        Self {
            connection: Arc::new(ConnectionManager::new(
                native.clone(),
                address.clone(),
                &connection,
            )),
            characteristics: CharacteristicHandler::new(native.clone()),
            address,
            native,
            router,
            state: RwLock::new(PeripheralState::default()),
            pairing_pin: Mutex::new(None),
        }
    }

    // === Identification ===

    /// Get the hardware address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the native device handle.
    pub fn native(&self) -> &NativeDeviceRef {
        &self.native
    }

    /// Last advertised local name.
    pub fn name(&self) -> Option<String> {
        self.state.read().name.clone()
    }

    /// Last seen signal strength.
    pub fn rssi(&self) -> Option<i16> {
        self.state.read().rssi
    }

    /// Last received advertisement.
    pub fn advertisement(&self) -> Option<AdvertisementData> {
        self.state.read().advertisement.clone()
    }

    /// Time since the last advertisement, if one was seen.
    pub fn last_seen(&self) -> Option<std::time::Duration> {
        self.state.read().last_seen.map(|t| t.elapsed())
    }

    /// Update from a scan result.
    pub(crate) fn update_from_advertisement(&self, advertisement: &AdvertisementData, rssi: i16) {
        let mut state = self.state.write();
        // Scan responses often omit the name; keep the last one seen.
        if advertisement.local_name.is_some() {
            state.name = advertisement.local_name.clone();
        }
        state.rssi = Some(rssi);
        state.advertisement = Some(advertisement.clone());
        state.last_seen = Some(Instant::now());
    }

    // === Pairing ===

    /// Register a PIN for the next pairing request from this peripheral.
    ///
    /// The PIN is injected automatically and consumed by the first request.
    pub fn set_pairing_pin(&self, pin: impl Into<String>) {
        *self.pairing_pin.lock() = Some(pin.into());
    }

    /// Whether a PIN is waiting for a pairing request.
    pub fn has_pairing_pin(&self) -> bool {
        self.pairing_pin.lock().is_some()
    }

    /// Read and clear the pending PIN.
    pub(crate) fn take_pairing_pin(&self) -> Option<String> {
        self.pairing_pin.lock().take()
    }

    /// Last reported bond state.
    pub fn bond_state(&self) -> BondState {
        self.state.read().bond_state
    }

    pub(crate) fn set_bond_state(&self, bond_state: BondState) {
        let mut state = self.state.write();
        if state.bond_state != bond_state {
            debug!("{} bond state: {:?} -> {:?}", self.address, state.bond_state, bond_state);
            state.bond_state = bond_state;
        }
    }

    /// Start bonding and wait for the outcome.
    ///
    /// `pin`, if given, is registered before bonding starts and injected when
    /// the OS asks for it. Returns `Ok(None)` if the platform does not expose
    /// pairing, `Ok(Some(true))` once bonded, and `Ok(Some(false))` if the
    /// bond was refused or the PIN was rejected.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if `token` fires first, or the native error if
    /// bonding could not be started.
    pub async fn try_pairing_request(
        &self,
        pin: Option<String>,
        token: &CancellationToken,
    ) -> Result<Option<bool>> {
        if !self.native.supports_pairing() {
            debug!("Pairing not supported for {}", self.address);
            return Ok(None);
        }

        if self.bond_state() == BondState::Bonded {
            return Ok(Some(true));
        }

        if let Some(pin) = pin {
            self.set_pairing_pin(pin);
        }

        // Listen before bonding starts so a fast outcome is not missed.
        let bonded = self
            .listen_for(BOND_STATE_CHANGED)
            .filter_map(|peripheral| {
                future::ready(match peripheral.bond_state() {
                    BondState::Bonded => Some(true),
                    BondState::None => Some(false),
                    BondState::Bonding => None,
                })
            });
        let failed = self.listen_for(BLE_PAIRING_FAILED).map(|_| false);
        let outcome = stream::select(bonded, failed);

        info!("Requesting bond with {}", self.address);
        if let Err(e) = self.native.create_bond().await {
            self.take_pairing_pin();
            return Err(e);
        }

        match first_or_cancelled(outcome, token).await {
            Ok(bonded) => {
                info!("Pairing with {} finished, bonded: {}", self.address, bonded);
                Ok(Some(bonded))
            }
            Err(e) => {
                self.take_pairing_pin();
                Err(e)
            }
        }
    }

    // === Events ===

    /// Listen for router events addressed to this peripheral.
    pub fn listen_for(&self, event_name: &str) -> EventStream {
        self.router.listen_for(event_name, self)
    }

    /// Stream of link-level connections reported by the OS.
    pub fn when_connected(&self) -> EventStream {
        self.listen_for(ACL_CONNECTED)
    }

    /// Stream of link-level disconnections reported by the OS.
    pub fn when_disconnected(&self) -> EventStream {
        self.listen_for(ACL_DISCONNECTED)
    }

    // === Connection ===

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Subscribe to connection state changes.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Connect once.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect(false).await
    }

    /// Connect with retries and reconnect automatically after link loss.
    pub async fn connect_and_maintain(&self) -> Result<()> {
        self.connection.connect(true).await
    }

    /// Disconnect and stop maintaining the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Check if we're maintaining a connection.
    pub fn is_maintaining_connection(&self) -> bool {
        self.connection.is_maintaining_connection()
    }

    pub(crate) fn handle_connected(&self) {
        self.connection.handle_connected();
    }

    pub(crate) async fn handle_disconnection(&self) {
        self.connection.handle_disconnection().await;
    }

    // === GATT ===

    /// Discover services and cache their characteristics.
    pub async fn discover_characteristics(&self) -> Result<usize> {
        self.ensure_connected()?;
        self.characteristics.discover_characteristics().await
    }

    /// Look up a characteristic by service and characteristic UUID.
    ///
    /// Discovers characteristics first if that has not happened yet.
    pub async fn get_known_characteristic(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<GattCharacteristic> {
        if !self.characteristics.is_discovered() {
            self.discover_characteristics().await?;
        }
        self.characteristics
            .get_known_characteristic(service_uuid, characteristic_uuid)
    }

    /// Read a characteristic value.
    pub async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        self.characteristics.read(characteristic).await
    }

    /// Write a characteristic value.
    pub async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.characteristics
            .write(characteristic, data, with_response)
            .await
    }

    /// Read a UTF-8 characteristic value.
    pub async fn read_string(&self, characteristic: &GattCharacteristic) -> Result<String> {
        self.ensure_connected()?;
        self.characteristics.read_string(characteristic).await
    }

    /// Stream notifications from a characteristic until the stream is dropped.
    pub async fn notify(&self, characteristic: &GattCharacteristic) -> Result<NotificationStream> {
        self.ensure_connected()?;
        self.characteristics.notify(characteristic).await
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            warn!("GATT operation on {} while {}", self.address, self.connection_state());
            Err(Error::NotConnected)
        }
    }
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("address", &self.address)
            .field("name", &self.name())
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::FakeDevice;
    use crate::ble::native::{CharacteristicProperties, GattService};
    use crate::ble::uuids::from_short;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn obd_device() -> Arc<FakeDevice> {
        FakeDevice::new("aa:bb:cc:dd:ee:01").with_service(GattService {
            uuid: from_short(0xFFF0),
            primary: true,
            characteristics: vec![GattCharacteristic {
                service_uuid: from_short(0xFFF0),
                uuid: from_short(0xFFF1),
                properties: CharacteristicProperties {
                    read: true,
                    write: true,
                    notify: true,
                    ..Default::default()
                },
            }],
        })
    }

    fn peripheral(device: &Arc<FakeDevice>, router: &EventRouter) -> Arc<Peripheral> {
        Arc::new(Peripheral::new(
            device.clone(),
            router.clone(),
            ConnectionConfig::default(),
        ))
    }

    async fn wait_for_bond_call(device: &FakeDevice) {
        for _ in 0..50 {
            if device.bond_calls() > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("create_bond was never called");
    }

    #[test]
    fn test_address_is_normalized() {
        let router = EventRouter::default();
        let peripheral = peripheral(&obd_device(), &router);
        assert_eq!(peripheral.address(), "AA:BB:CC:DD:EE:01");
    }

    #[test]
    fn test_advertisement_updates_keep_last_name() {
        let router = EventRouter::default();
        let peripheral = peripheral(&obd_device(), &router);

        let named = AdvertisementData {
            local_name: Some("OBDII".into()),
            ..Default::default()
        };
        peripheral.update_from_advertisement(&named, -60);
        peripheral.update_from_advertisement(&AdvertisementData::default(), -72);

        assert_eq!(peripheral.name().as_deref(), Some("OBDII"));
        assert_eq!(peripheral.rssi(), Some(-72));
        assert!(peripheral.last_seen().is_some());
    }

    #[tokio::test]
    async fn test_gatt_requires_connection() {
        let router = EventRouter::default();
        let peripheral = peripheral(&obd_device(), &router);

        assert!(matches!(
            peripheral.discover_characteristics().await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_write_and_notify() {
        let device = obd_device();
        let router = EventRouter::default();
        let peripheral = peripheral(&device, &router);

        peripheral.connect().await.unwrap();
        assert_eq!(peripheral.connection_state(), ConnectionState::Connected);

        let characteristic = peripheral
            .get_known_characteristic("FFF0", "FFF1")
            .await
            .unwrap();
        peripheral.write(&characteristic, b"010C\r", false).await.unwrap();
        assert_eq!(
            device.writes(),
            vec![(characteristic.uuid, b"010C\r".to_vec(), false)]
        );

        let mut notifications = peripheral.notify(&characteristic).await.unwrap();
        device.notify(characteristic.uuid, b"41 0C");
        let event = notifications.next().await.unwrap();
        assert_eq!(event.data, b"41 0C".to_vec());
    }

    #[tokio::test]
    async fn test_pairing_not_supported_returns_none() {
        let device = obd_device();
        device.disable_pairing();
        let router = EventRouter::default();
        let peripheral = peripheral(&device, &router);

        let result = peripheral
            .try_pairing_request(Some("1234".into()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, None);
        assert_eq!(device.bond_calls(), 0);
        assert!(!peripheral.has_pairing_pin());
    }

    #[tokio::test]
    async fn test_pairing_completes_on_bond() {
        let device = obd_device();
        let router = EventRouter::default();
        let peripheral = peripheral(&device, &router);

        let task = {
            let peripheral = peripheral.clone();
            tokio::spawn(async move {
                peripheral
                    .try_pairing_request(Some("1234".into()), &CancellationToken::new())
                    .await
            })
        };

        wait_for_bond_call(&device).await;
        assert!(peripheral.has_pairing_pin());

        peripheral.set_bond_state(BondState::Bonding);
        router.publish(BOND_STATE_CHANGED, peripheral.clone());
        peripheral.set_bond_state(BondState::Bonded);
        router.publish(BOND_STATE_CHANGED, peripheral.clone());

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, Some(true));
    }

    #[tokio::test]
    async fn test_pairing_failure_event_returns_false() {
        let device = obd_device();
        let router = EventRouter::default();
        let peripheral = peripheral(&device, &router);

        let task = {
            let peripheral = peripheral.clone();
            tokio::spawn(async move {
                peripheral
                    .try_pairing_request(None, &CancellationToken::new())
                    .await
            })
        };

        wait_for_bond_call(&device).await;
        router.publish(BLE_PAIRING_FAILED, peripheral.clone());

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, Some(false));
    }

    #[tokio::test]
    async fn test_pairing_cancellation_clears_pin() {
        let device = obd_device();
        let router = EventRouter::default();
        let peripheral = peripheral(&device, &router);
        let token = CancellationToken::new();

        let task = {
            let peripheral = peripheral.clone();
            let token = token.clone();
            tokio::spawn(async move {
                peripheral
                    .try_pairing_request(Some("0000".into()), &token)
                    .await
            })
        };

        wait_for_bond_call(&device).await;
        token.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!peripheral.has_pairing_pin());
    }
}
