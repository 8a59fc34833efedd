//! BLE scanning functionality.
//!
//! [`Scanner::scan`] validates the configuration up front and returns a lazy
//! [`ScanStream`]. Discovery starts on the first poll: the identity cache is
//! cleared (connected peripherals survive), the native scan is started with
//! one filter per service UUID, and every native discovery callback becomes a
//! [`ScanResult`]. Dropping the stream stops native discovery.

use futures::future::BoxFuture;
use futures::stream::Stream;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::ble::advertising::AdvertisementData;
use crate::ble::cache::PeripheralCache;
use crate::ble::native::{
    AdvertisementPayload, NativeAdapter, NativeScanFilter, NativeScanMode, NativeScanRecord,
    NativeScanRequest, NativeScanSettings, ScanCallback,
};
use crate::ble::observer::Registration;
use crate::ble::uuids::parse_uuid;
use crate::error::{Error, Result};
use crate::peripheral::Peripheral;

/// Scan power/latency trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(i32)]
pub enum ScanType {
    /// Lowest power, highest latency.
    LowPowered = 0,
    /// Balanced.
    #[default]
    Balanced = 1,
    /// Lowest latency, highest power.
    LowLatency = 2,
}

impl ScanType {
    /// Create from a raw settings value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for values outside the enum.
    pub fn from_raw(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::LowPowered),
            1 => Ok(Self::Balanced),
            2 => Ok(Self::LowLatency),
            other => Err(Error::configuration("scan_type", other.to_string())),
        }
    }
}

impl FromStr for ScanType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lowpowered" | "low_powered" | "lowpower" => Ok(Self::LowPowered),
            "balanced" => Ok(Self::Balanced),
            "lowlatency" | "low_latency" => Ok(Self::LowLatency),
            _ => Err(Error::configuration("scan_type", s)),
        }
    }
}

impl From<ScanType> for NativeScanMode {
    fn from(scan_type: ScanType) -> Self {
        match scan_type {
            ScanType::LowPowered => NativeScanMode::LowPower,
            ScanType::Balanced => NativeScanMode::Balanced,
            ScanType::LowLatency => NativeScanMode::LowLatency,
        }
    }
}

/// Scan configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanConfig {
    /// Only report devices advertising at least one of these services.
    /// Empty means match-all.
    pub service_uuids: Vec<String>,
    /// Power/latency mode.
    pub scan_type: ScanType,
    /// Buffer results in the controller when the hardware supports it.
    pub android_use_scan_batching: bool,
}

impl ScanConfig {
    /// Scan for devices advertising any of `uuids`.
    pub fn with_service_uuids<I, S>(uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service_uuids: uuids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Build the native request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a service UUID is malformed.
    pub fn to_native_request(
        &self,
        batching_supported: bool,
        batch_delay: Duration,
    ) -> Result<NativeScanRequest> {
        let filters = self
            .service_uuids
            .iter()
            .map(|uuid| parse_uuid(uuid).map(|service_uuid| NativeScanFilter { service_uuid }))
            .collect::<Result<Vec<_>>>()?;

        let report_delay = if self.android_use_scan_batching && batching_supported {
            Some(batch_delay)
        } else {
            None
        };

        Ok(NativeScanRequest {
            filters,
            settings: NativeScanSettings {
                mode: self.scan_type.into(),
                report_delay,
            },
        })
    }
}

/// One discovery event.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// The discovered peripheral, owned by the identity cache.
    pub peripheral: Arc<Peripheral>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Parsed advertisement.
    pub advertisement: AdvertisementData,
}

type ActiveSlot = Arc<Mutex<Option<Arc<ScanCallback>>>>;

/// Drives native discovery and owns the active scan callback slot.
pub struct Scanner {
    adapter: Arc<dyn NativeAdapter>,
    cache: Arc<PeripheralCache>,
    active: ActiveSlot,
    next_id: AtomicU64,
    batch_delay: Duration,
}

impl Scanner {
    /// Create a scanner.
    pub fn new(
        adapter: Arc<dyn NativeAdapter>,
        cache: Arc<PeripheralCache>,
        batch_delay: Duration,
    ) -> Self {
        Self {
            adapter,
            cache,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            batch_delay,
        }
    }

    /// Start a scan.
    ///
    /// Configuration is validated before anything touches the native stack.
    /// The returned stream starts discovery when first polled, yields results
    /// until it is dropped or the scan is stopped, and ends with an error item
    /// if the native stack refuses to start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a malformed service UUID.
    pub fn scan(&self, config: &ScanConfig) -> Result<ScanStream> {
        let request = config.to_native_request(
            self.adapter.supports_offloaded_batching(),
            self.batch_delay,
        )?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let cache = self.cache.clone();
        let callback = Arc::new(ScanCallback::new(id, move |record| {
            let result = to_scan_result(&cache, record);
            trace!("Scan result: {} rssi {}", result.peripheral.address(), result.rssi);
            let _ = tx.send(result);
        }));

        let adapter = self.adapter.clone();
        let cache = self.cache.clone();
        let active = self.active.clone();
        let start = async move {
            cache.clear(adapter.as_ref()).await;

            let previous = active.lock().replace(callback.clone());
            if let Some(previous) = previous {
                debug!("Replacing active scan {}", previous.id());
                adapter.stop_scan(&previous);
            }

            info!(
                "Starting BLE scan {} ({} filters, {:?})",
                id,
                request.filters.len(),
                request.settings.mode
            );

            if let Err(e) = adapter.start_scan(request, callback).await {
                warn!("Native scan start failed: {}", e);
                release(&active, id);
                return Err(e);
            }

            Ok(())
        };

        let adapter = self.adapter.clone();
        let active = self.active.clone();
        let registration = Registration::new(id, move || {
            if let Some(callback) = release(&active, id) {
                info!("Scan {} cancelled, stopping native discovery", id);
                adapter.stop_scan(&callback);
            }
        });

        Ok(ScanStream {
            state: ScanState::Starting(Box::pin(start)),
            rx,
            registration,
        })
    }

    /// Stop the active scan, if any. Safe to call at any time.
    ///
    /// Returns `true` if a scan was stopped.
    pub fn stop_scan(&self) -> bool {
        let callback = self.active.lock().take();
        match callback {
            Some(callback) => {
                info!("Stopping BLE scan {}", callback.id());
                self.adapter.stop_scan(&callback);
                true
            }
            None => {
                debug!("Not scanning, ignoring stop request");
                false
            }
        }
    }

    /// Check if a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.active.lock().is_some()
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("scanning", &self.is_scanning())
            .finish()
    }
}

/// Take the active callback if it belongs to scan `id`.
fn release(active: &ActiveSlot, id: u64) -> Option<Arc<ScanCallback>> {
    let mut slot = active.lock();
    if slot.as_ref().map(|c| c.id()) == Some(id) {
        slot.take()
    } else {
        None
    }
}

fn to_scan_result(cache: &PeripheralCache, record: NativeScanRecord) -> ScanResult {
    let mut advertisement = match record.payload {
        AdvertisementPayload::Parsed(ad) => ad,
        AdvertisementPayload::Raw(raw) => AdvertisementData::parse(&raw).unwrap_or_else(|e| {
            warn!(
                "Unparseable advertisement from {}: {}",
                record.device.address(),
                e
            );
            AdvertisementData::default()
        }),
    };
    if advertisement.connectable.is_none() {
        advertisement.connectable = record.connectable;
    }

    let peripheral = cache.get_or_create(record.device);
    peripheral.update_from_advertisement(&advertisement, record.rssi);

    ScanResult {
        peripheral,
        rssi: record.rssi,
        advertisement,
    }
}

enum ScanState {
    Starting(BoxFuture<'static, Result<()>>),
    Running,
    Finished,
}

/// Stream of scan results.
///
/// Items are `Ok(ScanResult)` while discovery runs. A native start failure is
/// delivered as one `Err` item, after which the stream ends. The stream also
/// ends if [`Scanner::stop_scan`] stops the scan or another scan replaces it.
/// Dropping the stream stops native discovery.
pub struct ScanStream {
    state: ScanState,
    rx: mpsc::UnboundedReceiver<ScanResult>,
    registration: Registration,
}

impl ScanStream {
    /// Registration id of this scan.
    pub fn id(&self) -> u64 {
        self.registration.id()
    }

    /// Stop the scan now. Equivalent to dropping the stream.
    pub fn cancel(self) {
        self.registration.cancel();
    }

    /// Keep only the first result per peripheral.
    pub fn unique_peripherals(self) -> UniquePeripherals {
        UniquePeripherals {
            inner: self,
            seen: HashSet::new(),
        }
    }
}

impl Stream for ScanStream {
    type Item = Result<ScanResult>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                ScanState::Starting(start) => match start.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => this.state = ScanState::Running,
                    Poll::Ready(Err(e)) => {
                        this.state = ScanState::Finished;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                ScanState::Running => {
                    return match this.rx.poll_recv(cx) {
                        Poll::Ready(Some(result)) => Poll::Ready(Some(Ok(result))),
                        Poll::Ready(None) => {
                            debug!("Scan {} ended", this.registration.id());
                            this.state = ScanState::Finished;
                            Poll::Ready(None)
                        }
                        Poll::Pending => Poll::Pending,
                    };
                }
                ScanState::Finished => return Poll::Ready(None),
            }
        }
    }
}

impl std::fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            ScanState::Starting(_) => "starting",
            ScanState::Running => "running",
            ScanState::Finished => "finished",
        };
        f.debug_struct("ScanStream")
            .field("id", &self.id())
            .field("state", &state)
            .finish()
    }
}

/// Scan stream yielding each peripheral once.
pub struct UniquePeripherals {
    inner: ScanStream,
    seen: HashSet<String>,
}

impl Stream for UniquePeripherals {
    type Item = Result<Arc<Peripheral>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(result))) => {
                    if this.seen.insert(result.peripheral.address().to_owned()) {
                        return Poll::Ready(Some(Ok(result.peripheral)));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
