//! In-memory native stack used by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::ble::native::*;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct FakeDevice {
    address: String,
    link_up: AtomicBool,
    connect_calls: AtomicUsize,
    failing_connects: AtomicUsize,
    accept_pin: AtomicBool,
    pairing_supported: AtomicBool,
    pins: Mutex<Vec<Vec<u8>>>,
    bond_calls: AtomicUsize,
    services: Mutex<Vec<GattService>>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>, bool)>>,
    subscribed: Mutex<HashSet<Uuid>>,
    subscribe_calls: AtomicUsize,
    failing_subscribes: AtomicUsize,
    hold_subscribes: AtomicBool,
    subscribe_released: Notify,
    unsubscribe_calls: AtomicUsize,
    notify_tx: broadcast::Sender<GattNotification>,
}

impl FakeDevice {
    pub fn new(address: &str) -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            address: address.to_string(),
            link_up: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            accept_pin: AtomicBool::new(true),
            pairing_supported: AtomicBool::new(true),
            pins: Mutex::new(Vec::new()),
            bond_calls: AtomicUsize::new(0),
            services: Mutex::new(Vec::new()),
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            subscribed: Mutex::new(HashSet::new()),
            subscribe_calls: AtomicUsize::new(0),
            failing_subscribes: AtomicUsize::new(0),
            hold_subscribes: AtomicBool::new(false),
            subscribe_released: Notify::new(),
            unsubscribe_calls: AtomicUsize::new(0),
            notify_tx,
        })
    }

    pub fn with_service(self: Arc<Self>, service: GattService) -> Arc<Self> {
        self.services.lock().push(service);
        self
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn drop_link(&self) {
        self.link_up.store(false, Ordering::SeqCst);
    }

    pub fn reject_pins(&self) {
        self.accept_pin.store(false, Ordering::SeqCst);
    }

    pub fn disable_pairing(&self) {
        self.pairing_supported.store(false, Ordering::SeqCst);
    }

    pub fn pins(&self) -> Vec<Vec<u8>> {
        self.pins.lock().clone()
    }

    pub fn bond_calls(&self) -> usize {
        self.bond_calls.load(Ordering::SeqCst)
    }

    pub fn set_value(&self, uuid: Uuid, value: &[u8]) {
        self.values.lock().insert(uuid, value.to_vec());
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>, bool)> {
        self.writes.lock().clone()
    }

    pub fn is_subscribed(&self, uuid: &Uuid) -> bool {
        self.subscribed.lock().contains(uuid)
    }

    /// Make each native subscribe wait for [`FakeDevice::release_subscribe`].
    pub fn hold_subscribes(&self) {
        self.hold_subscribes.store(true, Ordering::SeqCst);
    }

    pub fn release_subscribe(&self) {
        self.subscribe_released.notify_one();
    }

    pub fn fail_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub fn notify(&self, uuid: Uuid, value: &[u8]) {
        let _ = self.notify_tx.send(GattNotification {
            uuid,
            value: value.to_vec(),
        });
    }
}

#[async_trait]
impl NativeDevice for FakeDevice {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::native("connect", "gatt error 133"));
        }
        self.link_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.link_up.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.link_up.load(Ordering::SeqCst))
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        Ok(self.services.lock().clone())
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        self.values
            .lock()
            .get(&characteristic.uuid)
            .cloned()
            .ok_or_else(|| Error::native("read", "no value"))
    }

    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.writes
            .lock()
            .push((characteristic.uuid, data.to_vec(), with_response));
        Ok(())
    }

    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_subscribes.load(Ordering::SeqCst) {
            self.subscribe_released.notified().await;
        }
        let failing = self.failing_subscribes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_subscribes.store(failing - 1, Ordering::SeqCst);
            return Err(Error::native("subscribe", "GATT_ERROR"));
        }
        self.subscribed.lock().insert(characteristic.uuid);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.subscribed.lock().remove(&characteristic.uuid);
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, GattNotification>> {
        Ok(BroadcastStream::new(self.notify_tx.subscribe())
            .filter_map(|n| future::ready(n.ok()))
            .boxed())
    }

    fn supports_pairing(&self) -> bool {
        self.pairing_supported.load(Ordering::SeqCst)
    }

    async fn create_bond(&self) -> Result<()> {
        self.bond_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_pin(&self, pin: &[u8]) -> bool {
        self.pins.lock().push(pin.to_vec());
        self.accept_pin.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeAdapter {
    state: Mutex<AccessState>,
    batching: AtomicBool,
    fail_start: AtomicBool,
    fail_connected_query: AtomicBool,
    connected: Mutex<Vec<Arc<FakeDevice>>>,
    callback: Mutex<Option<Arc<ScanCallback>>>,
    requests: Mutex<Vec<NativeScanRequest>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    events_tx: Mutex<Option<broadcast::Sender<NativeEvent>>>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        let adapter = Self::default();
        *adapter.state.lock() = AccessState::Available;
        Arc::new(adapter)
    }

    pub fn set_state(&self, state: AccessState) {
        *self.state.lock() = state;
    }

    pub fn enable_batching(&self) {
        self.batching.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_connected_query(&self) {
        self.fail_connected_query.store(true, Ordering::SeqCst);
    }

    pub fn set_connected(&self, devices: Vec<Arc<FakeDevice>>) {
        *self.connected.lock() = devices;
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<NativeScanRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn is_scanning(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Deliver a discovery record to the active scan callback.
    pub fn discover(&self, device: &Arc<FakeDevice>, rssi: i16, raw: &[u8]) -> bool {
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback.deliver(NativeScanRecord {
                    device: device.clone(),
                    rssi,
                    payload: AdvertisementPayload::Raw(Bytes::copy_from_slice(raw)),
                    connectable: Some(true),
                });
                true
            }
            None => false,
        }
    }

    pub fn emit(&self, event: NativeEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl NativeAdapter for FakeAdapter {
    async fn access_state(&self) -> AccessState {
        *self.state.lock()
    }

    fn supports_offloaded_batching(&self) -> bool {
        self.batching.load(Ordering::SeqCst)
    }

    async fn connected_devices(&self) -> Result<Vec<NativeDeviceRef>> {
        if self.fail_connected_query.swap(false, Ordering::SeqCst) {
            return Err(Error::native("connected devices", "GATT service unavailable"));
        }
        Ok(self
            .connected
            .lock()
            .iter()
            .map(|d| d.clone() as NativeDeviceRef)
            .collect())
    }

    async fn start_scan(
        &self,
        request: NativeScanRequest,
        callback: Arc<ScanCallback>,
    ) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(Error::native("scan start", "SCAN_FAILED_APPLICATION_REGISTRATION_FAILED"));
        }
        self.requests.lock().push(request);
        *self.callback.lock() = Some(callback);
        Ok(())
    }

    fn stop_scan(&self, callback: &ScanCallback) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut active = self.callback.lock();
        if active.as_ref().map(|c| c.id()) == Some(callback.id()) {
            *active = None;
        }
    }

    async fn events(&self) -> Result<BoxStream<'static, NativeEvent>> {
        let rx = {
            let mut tx = self.events_tx.lock();
            tx.get_or_insert_with(|| broadcast::channel(32).0).subscribe()
        };
        Ok(BroadcastStream::new(rx)
            .filter_map(|e| future::ready(e.ok()))
            .boxed())
    }
}
