//! Native BLE stack abstraction.
//!
//! The orchestration layer never talks to a platform API directly. It drives
//! a [`NativeAdapter`] (discovery, connection-state table, adapter events) and
//! per-device [`NativeDevice`] handles (GATT and pairing). The btleplug
//! backend in [`crate::ble::platform`] is the production implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::advertising::AdvertisementData;
use crate::error::Result;

/// Shared handle to a native device.
pub type NativeDeviceRef = Arc<dyn NativeDevice>;

/// Adapter availability and permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessState {
    /// The state has not been determined yet.
    #[default]
    Unknown,
    /// The adapter is powered on and usable.
    Available,
    /// The adapter is present but switched off.
    Disabled,
    /// The application lacks permission to use Bluetooth.
    Unauthorized,
    /// The host has no BLE capable adapter.
    Unsupported,
}

impl fmt::Display for AccessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Available => write!(f, "Available"),
            Self::Disabled => write!(f, "Disabled"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::Unsupported => write!(f, "Unsupported"),
        }
    }
}

/// Bond (pairing) state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BondState {
    /// Not bonded.
    #[default]
    None,
    /// Bonding is in progress.
    Bonding,
    /// Bonded.
    Bonded,
}

/// Native scan power/latency mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeScanMode {
    /// Lowest duty cycle.
    LowPower,
    /// Balanced duty cycle.
    Balanced,
    /// Continuous scanning.
    LowLatency,
}

/// A native scan filter. One filter is built per requested service UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeScanFilter {
    /// Service UUID the advertisement must carry.
    pub service_uuid: Uuid,
}

/// Native scan settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeScanSettings {
    /// Power/latency mode.
    pub mode: NativeScanMode,
    /// Batched report delay; `None` delivers results immediately.
    pub report_delay: Option<Duration>,
}

/// Everything the native stack needs to start discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeScanRequest {
    /// Filters; empty means match-all.
    pub filters: Vec<NativeScanFilter>,
    /// Scan settings.
    pub settings: NativeScanSettings,
}

impl NativeScanRequest {
    /// The service UUIDs the filters select on.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.filters.iter().map(|f| f.service_uuid).collect()
    }
}

/// Advertisement payload as delivered by a backend.
#[derive(Debug, Clone)]
pub enum AdvertisementPayload {
    /// Raw AD structures, parsed by the orchestration layer.
    Raw(Bytes),
    /// Already decoded by the platform.
    Parsed(AdvertisementData),
}

/// One discovery callback from the native stack.
#[derive(Debug, Clone)]
pub struct NativeScanRecord {
    /// The discovered device.
    pub device: NativeDeviceRef,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Advertisement payload.
    pub payload: AdvertisementPayload,
    /// Connectable flag, if the platform reports it.
    pub connectable: Option<bool>,
}

/// Native scan callback registration.
///
/// The adapter keeps the callback alive while discovery runs and releases it
/// on [`NativeAdapter::stop_scan`]. Identity is the `id`.
pub struct ScanCallback {
    id: u64,
    sink: Box<dyn Fn(NativeScanRecord) + Send + Sync>,
}

impl ScanCallback {
    /// Wrap a discovery sink.
    pub fn new(id: u64, sink: impl Fn(NativeScanRecord) + Send + Sync + 'static) -> Self {
        Self {
            id,
            sink: Box::new(sink),
        }
    }

    /// Registration id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver a discovery record.
    pub fn deliver(&self, record: NativeScanRecord) {
        (self.sink)(record)
    }
}

impl fmt::Debug for ScanCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCallback").field("id", &self.id).finish()
    }
}

/// Kind of a device lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    /// Link-level connection established.
    AclConnected,
    /// Link-level connection dropped.
    AclDisconnected,
    /// The OS asks for pairing input.
    PairingRequest,
    /// Bond state transition.
    BondStateChanged(BondState),
}

impl DeviceEventKind {
    /// Event name published on the router for this kind.
    pub fn name(&self) -> &'static str {
        use crate::ble::events;
        match self {
            Self::AclConnected => events::ACL_CONNECTED,
            Self::AclDisconnected => events::ACL_DISCONNECTED,
            Self::PairingRequest => events::PAIRING_REQUEST,
            Self::BondStateChanged(_) => events::BOND_STATE_CHANGED,
        }
    }
}

/// A device lifecycle event from the native stack.
#[derive(Debug, Clone)]
pub struct NativeDeviceEvent {
    /// The device the event is about.
    pub device: NativeDeviceRef,
    /// What happened.
    pub kind: DeviceEventKind,
}

/// Events delivered by [`NativeAdapter::events`].
#[derive(Debug, Clone)]
pub enum NativeEvent {
    /// Device lifecycle event.
    Device(NativeDeviceEvent),
    /// Adapter state transition.
    AdapterState(AccessState),
}

/// Characteristic capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties {
    /// Readable.
    pub read: bool,
    /// Writable with response.
    pub write: bool,
    /// Writable without response.
    pub write_without_response: bool,
    /// Supports notifications.
    pub notify: bool,
    /// Supports indications.
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Whether notifications or indications can be subscribed to.
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A GATT characteristic descriptor as reported by the native stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattCharacteristic {
    /// Owning service UUID.
    pub service_uuid: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Capabilities.
    pub properties: CharacteristicProperties,
}

/// A GATT service with its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    /// Characteristics of the service.
    pub characteristics: Vec<GattCharacteristic>,
}

/// A characteristic value notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattNotification {
    /// Characteristic that notified.
    pub uuid: Uuid,
    /// Notified value.
    pub value: Vec<u8>,
}

/// A native device handle.
#[async_trait]
pub trait NativeDevice: Send + Sync + fmt::Debug {
    /// Hardware address. Stable for the lifetime of the device.
    fn address(&self) -> String;

    /// Open a GATT connection.
    async fn connect(&self) -> Result<()>;

    /// Close the GATT connection.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the GATT connection is up.
    async fn is_connected(&self) -> Result<bool>;

    /// Discover services and characteristics.
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>>;

    /// Write a characteristic value.
    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enable notifications for a characteristic.
    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()>;

    /// Disable notifications for a characteristic.
    async fn unsubscribe(&self, characteristic: &GattCharacteristic) -> Result<()>;

    /// Stream of notifications from every subscribed characteristic.
    async fn notifications(&self) -> Result<BoxStream<'static, GattNotification>>;

    /// Whether the platform exposes bonding to applications.
    fn supports_pairing(&self) -> bool;

    /// Start bonding with the device.
    async fn create_bond(&self) -> Result<()>;

    /// Inject a PIN into a pending pairing request. Returns `false` if the
    /// OS rejected it.
    fn set_pin(&self, pin: &[u8]) -> bool;
}

/// A native BLE adapter.
#[async_trait]
pub trait NativeAdapter: Send + Sync {
    /// Current adapter availability.
    async fn access_state(&self) -> AccessState;

    /// Whether the controller can batch scan results in hardware.
    fn supports_offloaded_batching(&self) -> bool;

    /// Devices the OS reports as GATT connected or connecting.
    async fn connected_devices(&self) -> Result<Vec<NativeDeviceRef>>;

    /// Start discovery, delivering results to `callback` until
    /// [`stop_scan`](Self::stop_scan) is called with the same callback.
    async fn start_scan(&self, request: NativeScanRequest, callback: Arc<ScanCallback>)
        -> Result<()>;

    /// Stop discovery for `callback` and release it.
    fn stop_scan(&self, callback: &ScanCallback);

    /// Device lifecycle and adapter state events.
    async fn events(&self) -> Result<BoxStream<'static, NativeEvent>>;
}
