//! Native backend over btleplug.
//!
//! btleplug has no pairing API, so devices report `supports_pairing() ==
//! false` and PIN injection always fails. Scan mode and report delay have no
//! btleplug equivalent and are only logged.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::AdvertisementData;
use crate::ble::native::*;
use crate::error::{Error, Result};

const ZERO_ADDRESS: &str = "00:00:00:00:00:00";

/// A btleplug peripheral.
#[derive(Debug, Clone)]
pub struct BtleplugDevice {
    peripheral: Peripheral,
    address: String,
}

impl BtleplugDevice {
    /// Wrap a btleplug peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        // CoreBluetooth hides hardware addresses; fall back to the stable id.
        let address = match peripheral.address().to_string() {
            address if address == ZERO_ADDRESS => peripheral.id().to_string(),
            address => address,
        };
        Self {
            peripheral,
            address,
        }
    }

    /// The underlying btleplug peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn characteristic(&self, characteristic: &GattCharacteristic) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            })
    }
}

fn to_properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn to_access_state(state: CentralState) -> AccessState {
    match state {
        CentralState::PoweredOn => AccessState::Available,
        CentralState::PoweredOff => AccessState::Disabled,
        _ => AccessState::Unknown,
    }
}

fn to_advertisement(properties: PeripheralProperties) -> AdvertisementData {
    AdvertisementData {
        local_name: properties.local_name,
        service_uuids: properties.services,
        manufacturer_data: properties
            .manufacturer_data
            .into_iter()
            .map(|(id, data)| (id, Bytes::from(data)))
            .collect(),
        service_data: properties
            .service_data
            .into_iter()
            .map(|(uuid, data)| (uuid, Bytes::from(data)))
            .collect(),
        tx_power: properties.tx_power_level,
        connectable: None,
        flags: None,
    }
}

#[async_trait]
impl NativeDevice for BtleplugDevice {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.peripheral.is_connected().await?)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;

        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        service_uuid: c.service_uuid,
                        uuid: c.uuid,
                        properties: to_properties(c.properties),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, data, write_type)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, GattNotification>> {
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .map(|n| GattNotification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    fn supports_pairing(&self) -> bool {
        false
    }

    async fn create_bond(&self) -> Result<()> {
        Err(Error::NotSupported {
            operation: "create_bond".to_string(),
        })
    }

    fn set_pin(&self, _pin: &[u8]) -> bool {
        warn!("PIN injection is not available for {}", self.address);
        false
    }
}

/// A native scan stop running in the background.
///
/// `stop_scan` is synchronous, so the stop itself is spawned. The next scan
/// start waits for it; otherwise a late stop would end the new scan.
#[derive(Default)]
struct PendingStop {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PendingStop {
    /// Spawn `stop` after any stop already pending.
    fn defer<F>(&self, stop: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No runtime to stop the native scan");
                return;
            }
        };

        let mut task = self.task.lock();
        let previous = task.take();
        *task = Some(runtime.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            stop.await;
        }));
    }

    /// Wait for the pending stop, if any.
    async fn wait(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Native scan stop task failed: {}", e);
            }
        }
    }
}

/// A btleplug adapter.
pub struct BtleplugAdapter {
    adapter: Adapter,
    /// Scan callback id and its event task.
    scan_task: Arc<Mutex<Option<(u64, JoinHandle<()>)>>>,
    pending_stop: PendingStop,
}

impl BtleplugAdapter {
    /// Use the first adapter the system reports.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Wrap a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            scan_task: Arc::new(Mutex::new(None)),
            pending_stop: PendingStop::default(),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn device(adapter: &Adapter, id: &PeripheralId) -> Option<NativeDeviceRef> {
        match adapter.peripheral(id).await {
            Ok(peripheral) => Some(Arc::new(BtleplugDevice::new(peripheral))),
            Err(e) => {
                trace!("Failed to get peripheral {:?}: {}", id, e);
                None
            }
        }
    }

    async fn scan_record(
        adapter: &Adapter,
        id: &PeripheralId,
        services: &[Uuid],
    ) -> Option<NativeScanRecord> {
        let peripheral = adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;

        let Some(rssi) = properties.rssi else {
            trace!("No RSSI yet for {:?}", id);
            return None;
        };

        let advertisement = to_advertisement(properties);
        // Not every platform applies the scan filter.
        if !advertisement.matches_any(services) {
            return None;
        }

        Some(NativeScanRecord {
            device: Arc::new(BtleplugDevice::new(peripheral)),
            rssi,
            payload: AdvertisementPayload::Parsed(advertisement),
            connectable: None,
        })
    }
}

#[async_trait]
impl NativeAdapter for BtleplugAdapter {
    async fn access_state(&self) -> AccessState {
        match self.adapter.adapter_state().await {
            Ok(state) => to_access_state(state),
            Err(btleplug::Error::NotSupported(_)) => AccessState::Unsupported,
            Err(e) => {
                warn!("Failed to read adapter state: {}", e);
                AccessState::Unknown
            }
        }
    }

    fn supports_offloaded_batching(&self) -> bool {
        false
    }

    async fn connected_devices(&self) -> Result<Vec<NativeDeviceRef>> {
        let mut connected: Vec<NativeDeviceRef> = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.is_connected().await.unwrap_or(false) {
                connected.push(Arc::new(BtleplugDevice::new(peripheral)));
            }
        }
        Ok(connected)
    }

    async fn start_scan(&self, request: NativeScanRequest, callback: Arc<ScanCallback>) -> Result<()> {
        let services = request.service_uuids();
        debug!(
            "Scan mode {:?} and report delay {:?} are not configurable with btleplug",
            request.settings.mode, request.settings.report_delay
        );

        self.pending_stop.wait().await;

        // Subscribe before starting so the first advertisements are not lost.
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: services.clone(),
            })
            .await
            .map_err(|e| Error::native("scan start", e))?;

        let adapter = self.adapter.clone();
        let id = callback.id();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let peripheral_id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };

                if let Some(record) = Self::scan_record(&adapter, &peripheral_id, &services).await {
                    callback.deliver(record);
                }
            }
            debug!("Scan event loop ended");
        });

        let previous = self.scan_task.lock().replace((id, handle));
        if let Some((_, previous)) = previous {
            previous.abort();
        }

        Ok(())
    }

    fn stop_scan(&self, callback: &ScanCallback) {
        let task = {
            let mut slot = self.scan_task.lock();
            match slot.as_ref() {
                Some((id, _)) if *id == callback.id() => slot.take(),
                _ => None,
            }
        };

        let Some((_, handle)) = task else {
            return;
        };
        handle.abort();

        let adapter = self.adapter.clone();
        self.pending_stop.defer(async move {
            if let Err(e) = adapter.stop_scan().await {
                error!("Failed to stop scan: {}", e);
            }
        });
    }

    async fn events(&self) -> Result<BoxStream<'static, NativeEvent>> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();

        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    let (id, kind) = match event {
                        CentralEvent::DeviceConnected(id) => (id, DeviceEventKind::AclConnected),
                        CentralEvent::DeviceDisconnected(id) => {
                            (id, DeviceEventKind::AclDisconnected)
                        }
                        CentralEvent::StateUpdate(state) => {
                            return Some(NativeEvent::AdapterState(to_access_state(state)))
                        }
                        _ => return None,
                    };

                    Self::device(&adapter, &id)
                        .await
                        .map(|device| NativeEvent::Device(NativeDeviceEvent { device, kind }))
                }
            })
            .boxed())
    }
}

impl std::fmt::Debug for BtleplugAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugAdapter")
            .field("scanning", &self.scan_task.lock().is_some())
            .finish()
    }
}
