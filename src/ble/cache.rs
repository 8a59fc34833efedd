//! Peripheral identity cache.
//!
//! Maps hardware addresses to the one [`Peripheral`] instance that represents
//! the device for the lifetime of the cache. Lookups and first-sight inserts
//! go through the map's entry API, so concurrent callbacks for a new address
//! still produce a single instance.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ble::events::EventRouter;
use crate::ble::native::{NativeAdapter, NativeDeviceRef};
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::peripheral::Peripheral;
use crate::utils::normalize_address;

/// Address-keyed cache of peripherals.
pub struct PeripheralCache {
    peripherals: DashMap<String, Arc<Peripheral>>,
    router: EventRouter,
    connection: ConnectionConfig,
}

impl PeripheralCache {
    /// Create an empty cache. New peripherals publish through `router`.
    pub fn new(router: EventRouter, connection: ConnectionConfig) -> Self {
        Self {
            peripherals: DashMap::new(),
            router,
            connection,
        }
    }

    /// Return the peripheral for `device`, creating it on first sight.
    pub fn get_or_create(&self, device: NativeDeviceRef) -> Arc<Peripheral> {
        let key = normalize_address(&device.address());

        if let Some(existing) = self.peripherals.get(&key) {
            return existing.clone();
        }

        self.peripherals
            .entry(key)
            .or_insert_with(|| {
                debug!("Caching new peripheral {}", device.address());
                Arc::new(Peripheral::new(
                    device,
                    self.router.clone(),
                    self.connection.clone(),
                ))
            })
            .clone()
    }

    /// Look up a peripheral by address.
    pub fn get(&self, address: &str) -> Option<Arc<Peripheral>> {
        self.peripherals
            .get(&normalize_address(address))
            .map(|p| p.clone())
    }

    /// Number of cached peripherals.
    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    /// Snapshot of every cached peripheral.
    pub fn peripherals(&self) -> Vec<Arc<Peripheral>> {
        self.peripherals.iter().map(|p| p.value().clone()).collect()
    }

    /// Peripherals the OS reports as connected or connecting.
    ///
    /// Queries the native stack on every call and resolves each device
    /// through the cache, so already known devices keep their instance.
    pub async fn connected_devices(&self, adapter: &dyn NativeAdapter) -> Result<Vec<Arc<Peripheral>>> {
        let devices = adapter.connected_devices().await?;
        Ok(devices
            .into_iter()
            .map(|device| self.get_or_create(device))
            .collect())
    }

    /// Drop every peripheral the OS does not report as connected.
    ///
    /// Connected peripherals stay in the cache with their existing instance,
    /// so sessions in flight are not orphaned. If the OS cannot be queried the
    /// cache is left as it is.
    pub async fn clear(&self, adapter: &dyn NativeAdapter) {
        match self.connected_devices(adapter).await {
            Ok(connected) => {
                let keep: HashSet<&str> = connected.iter().map(|p| p.address()).collect();
                self.peripherals.retain(|address, _| keep.contains(address.as_str()));
                for peripheral in &connected {
                    self.peripherals
                        .entry(peripheral.address().to_owned())
                        .or_insert_with(|| peripheral.clone());
                }
                debug!("Peripheral cache cleared, {} connected kept", self.len());
            }
            Err(e) => {
                warn!("Failed to query connected devices, keeping cache: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for PeripheralCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralCache")
            .field("peripherals", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{FakeAdapter, FakeDevice};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn cache() -> PeripheralCache {
        PeripheralCache::new(EventRouter::default(), ConnectionConfig::default())
    }

    #[test]
    fn test_same_address_same_instance() {
        let cache = cache();
        let first = cache.get_or_create(FakeDevice::new("AA:BB:CC:DD:EE:01"));
        // A fresh native handle for the same device, as after a rescan.
        let second = cache.get_or_create(FakeDevice::new("aa:bb:cc:dd:ee:01"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&cache.get("AA:BB:CC:DD:EE:01").unwrap(), &first));
    }

    #[test]
    fn test_concurrent_first_sight_creates_one_instance() {
        let cache = Arc::new(cache());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_or_create(FakeDevice::new("AA:BB:CC:DD:EE:02")))
            })
            .collect();

        let peripherals: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(peripherals.iter().all(|p| Arc::ptr_eq(p, &peripherals[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_connected_instances() {
        let cache = cache();
        let adapter = FakeAdapter::new();

        let connected_device = FakeDevice::new("AA:BB:CC:DD:EE:01");
        let connected = cache.get_or_create(connected_device.clone());
        cache.get_or_create(FakeDevice::new("AA:BB:CC:DD:EE:02"));
        cache.get_or_create(FakeDevice::new("AA:BB:CC:DD:EE:03"));
        adapter.set_connected(vec![connected_device]);

        cache.clear(adapter.as_ref()).await;

        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&cache.get("AA:BB:CC:DD:EE:01").unwrap(), &connected));
        assert!(cache.get("AA:BB:CC:DD:EE:02").is_none());
    }

    #[tokio::test]
    async fn test_clear_seeds_connected_devices_not_yet_cached() {
        let cache = cache();
        let adapter = FakeAdapter::new();
        adapter.set_connected(vec![FakeDevice::new("AA:BB:CC:DD:EE:09")]);

        cache.clear(adapter.as_ref()).await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get("AA:BB:CC:DD:EE:09").is_some());
    }

    #[tokio::test]
    async fn test_clear_keeps_everything_when_query_fails() {
        let cache = cache();
        let adapter = FakeAdapter::new();

        let connected_device = FakeDevice::new("AA:BB:CC:DD:EE:01");
        let connected = cache.get_or_create(connected_device.clone());
        cache.get_or_create(FakeDevice::new("AA:BB:CC:DD:EE:02"));
        adapter.set_connected(vec![connected_device]);
        adapter.fail_connected_query();

        cache.clear(adapter.as_ref()).await;

        assert_eq!(cache.len(), 2);
        assert!(Arc::ptr_eq(&cache.get("AA:BB:CC:DD:EE:01").unwrap(), &connected));

        // The next clear succeeds again.
        cache.clear(adapter.as_ref()).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_connected_devices_requeries_each_call() {
        let cache = cache();
        let adapter = FakeAdapter::new();

        assert!(cache.connected_devices(adapter.as_ref()).await.unwrap().is_empty());
        adapter.set_connected(vec![FakeDevice::new("AA:BB:CC:DD:EE:05")]);
        let connected = cache.connected_devices(adapter.as_ref()).await.unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].address(), "AA:BB:CC:DD:EE:05");
    }

    proptest! {
        #[test]
        fn prop_identity_is_stable(indices in proptest::collection::vec(0u8..6, 1..40)) {
            let cache = cache();
            let mut first_seen: std::collections::HashMap<u8, Arc<Peripheral>> = Default::default();

            for i in indices {
                let address = format!("00:11:22:33:44:{:02X}", i);
                let peripheral = cache.get_or_create(FakeDevice::new(&address));
                let expected = first_seen.entry(i).or_insert_with(|| peripheral.clone());
                prop_assert!(Arc::ptr_eq(expected, &peripheral));
            }

            prop_assert_eq!(cache.len(), first_seen.len());
        }
    }
}
