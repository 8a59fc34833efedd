//! Central context for discovering and managing BLE peripherals.
//!
//! [`CentralContext`] owns the identity cache, the event router and the
//! scanner, and pumps native device events into the router. Create one per
//! adapter and share it behind an `Arc`.

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::cache::PeripheralCache;
use crate::ble::events::{EventRouter, EventStream, NamedMessage};
use crate::ble::native::{
    AccessState, DeviceEventKind, NativeAdapter, NativeDeviceEvent, NativeDeviceRef, NativeEvent,
};
use crate::ble::pairing::PairingInterceptor;
use crate::ble::scanner::{ScanConfig, ScanStream, Scanner, UniquePeripherals};
use crate::config::BleConfiguration;
use crate::delegate::DelegateRegistry;
use crate::error::Result;
use crate::peripheral::Peripheral;

/// Normalizes native device and adapter events into the router.
pub struct DeviceEventHandler {
    cache: Arc<PeripheralCache>,
    router: EventRouter,
    delegates: DelegateRegistry,
    interceptor: PairingInterceptor,
}

impl DeviceEventHandler {
    /// Create a handler publishing on `router`.
    pub fn new(cache: Arc<PeripheralCache>, router: EventRouter, delegates: DelegateRegistry) -> Self {
        Self {
            cache,
            router,
            delegates,
            interceptor: PairingInterceptor::new(),
        }
    }

    /// Handle one native event.
    pub async fn handle(&self, event: NativeEvent) {
        match event {
            NativeEvent::Device(event) => {
                self.handle_device_event(event).await;
            }
            NativeEvent::AdapterState(state) => self.handle_adapter_state(state).await,
        }
    }

    /// Handle a device lifecycle event and publish it.
    ///
    /// Returns the peripheral and the name the event was published under.
    pub async fn handle_device_event(&self, event: NativeDeviceEvent) -> (Arc<Peripheral>, &'static str) {
        let peripheral = self.cache.get_or_create(event.device);
        let mut name = event.kind.name();

        debug!("Device event {} for {}", name, peripheral.address());

        match event.kind {
            DeviceEventKind::AclConnected => {
                peripheral.handle_connected();
                self.delegates.notify_connected(&peripheral).await;
            }
            DeviceEventKind::AclDisconnected => {
                if peripheral.is_maintaining_connection() {
                    // Reconnect attempts must not stall the event pump.
                    let peripheral = peripheral.clone();
                    tokio::spawn(async move { peripheral.handle_disconnection().await });
                } else {
                    peripheral.handle_disconnection().await;
                }
            }
            DeviceEventKind::PairingRequest => {
                name = self.interceptor.intercept(&peripheral).event_name(name);
            }
            DeviceEventKind::BondStateChanged(bond_state) => {
                peripheral.set_bond_state(bond_state);
            }
        }

        self.router.publish(name, peripheral.clone());
        (peripheral, name)
    }

    /// Record an adapter state; delegates run only on transitions.
    pub async fn handle_adapter_state(&self, state: AccessState) {
        if self.router.publish_status(state) {
            info!("Bluetooth adapter state: {}", state);
            self.delegates.notify_adapter_state(state).await;
        }
    }
}

impl std::fmt::Debug for DeviceEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEventHandler")
            .field("delegates", &self.delegates)
            .finish()
    }
}

/// Central manager for scanning, identity and device events.
pub struct CentralContext {
    adapter: Arc<dyn NativeAdapter>,
    config: BleConfiguration,
    router: EventRouter,
    cache: Arc<PeripheralCache>,
    scanner: Scanner,
    handler: Arc<DeviceEventHandler>,
    /// Background event pump.
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CentralContext {
    /// Create a context over a native adapter.
    pub fn new(
        adapter: Arc<dyn NativeAdapter>,
        config: BleConfiguration,
        delegates: DelegateRegistry,
    ) -> Self {
        let router = EventRouter::new();
        let cache = Arc::new(PeripheralCache::new(router.clone(), config.connection.clone()));
        let scanner = Scanner::new(adapter.clone(), cache.clone(), config.batch_report_delay);
        let handler = Arc::new(DeviceEventHandler::new(
            cache.clone(),
            router.clone(),
            delegates,
        ));

        Self {
            adapter,
            config,
            router,
            cache,
            scanner,
            handler,
            pump: Mutex::new(None),
        }
    }

    /// Create a context over the first system adapter, using btleplug.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_default_adapter(
        config: BleConfiguration,
        delegates: DelegateRegistry,
    ) -> Result<Self> {
        let adapter = crate::ble::platform::BtleplugAdapter::new().await?;
        Ok(Self::new(Arc::new(adapter), config, delegates))
    }

    /// Snapshot the adapter state and start pumping native events.
    ///
    /// Calling this again while the pump runs is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.pump.lock().is_some() {
            debug!("Central context already started");
            return Ok(());
        }

        let state = self.adapter.access_state().await;
        self.router.publish_status(state);
        info!("Starting central context, adapter {}", state);

        let mut events = self.adapter.events().await?;
        let handler = self.handler.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                handler.handle(event).await;
            }
            debug!("Native event stream ended");
        });

        let previous = self.pump.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        Ok(())
    }

    /// Stop scanning, stop the event pump and disconnect every peripheral.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down central context");

        self.stop_scan();

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }

        for peripheral in self.cache.peripherals() {
            if peripheral.connection_state().is_connected() {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Error disconnecting {}: {}", peripheral.address(), e);
                }
            }
        }

        Ok(())
    }

    /// Configuration the context was created with.
    pub fn configuration(&self) -> &BleConfiguration {
        &self.config
    }

    /// Event handler, for backends that deliver events by direct call.
    pub fn event_handler(&self) -> &Arc<DeviceEventHandler> {
        &self.handler
    }

    // === Adapter state ===

    /// Last known adapter state.
    pub fn status(&self) -> AccessState {
        self.router.status()
    }

    /// Adapter state: the current value first, then every transition.
    pub fn status_changed(&self) -> BoxStream<'static, AccessState> {
        self.router.status_changed()
    }

    // === Events ===

    /// Every published peripheral event.
    pub fn peripheral_events(&self) -> BoxStream<'static, NamedMessage<Arc<Peripheral>>> {
        self.router.all_events()
    }

    /// Listen for `event_name` events addressed to `peripheral`.
    pub fn listen_for(&self, event_name: &str, peripheral: &Peripheral) -> EventStream {
        self.router.listen_for(event_name, peripheral)
    }

    // === Identity ===

    /// Resolve a native device to its peripheral, creating it on first sight.
    pub fn get_device(&self, device: NativeDeviceRef) -> Arc<Peripheral> {
        self.cache.get_or_create(device)
    }

    /// Look up a known peripheral by address.
    pub fn get_peripheral(&self, address: &str) -> Option<Arc<Peripheral>> {
        self.cache.get(address)
    }

    /// Every cached peripheral.
    pub fn peripherals(&self) -> Vec<Arc<Peripheral>> {
        self.cache.peripherals()
    }

    /// Peripherals the OS reports as connected or connecting.
    pub async fn get_connected_devices(&self) -> Result<Vec<Arc<Peripheral>>> {
        self.cache.connected_devices(self.adapter.as_ref()).await
    }

    /// Drop cached peripherals that are not connected.
    pub async fn clear(&self) {
        self.cache.clear(self.adapter.as_ref()).await;
    }

    /// Read and clear the pending pairing PIN for a device.
    pub fn get_pairing_pin_request_for_device(&self, device: NativeDeviceRef) -> Option<String> {
        self.cache.get_or_create(device).take_pairing_pin()
    }

    // === Scanning ===

    /// Scan for peripherals. See [`Scanner::scan`].
    pub fn scan(&self, config: &ScanConfig) -> Result<ScanStream> {
        self.scanner.scan(config)
    }

    /// Scan, yielding each peripheral once.
    pub fn scan_for_unique_peripherals(&self, config: &ScanConfig) -> Result<UniquePeripherals> {
        Ok(self.scanner.scan(config)?.unique_peripherals())
    }

    /// Stop the active scan, if any.
    pub fn stop_scan(&self) -> bool {
        self.scanner.stop_scan()
    }

    /// Check if a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }
}

impl Drop for CentralContext {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for CentralContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralContext")
            .field("status", &self.status())
            .field("cache", &self.cache)
            .field("scanner", &self.scanner)
            .finish()
    }
}
