//! BLE communication module.
//!
//! This module provides the protocol-level pieces of the central role: the
//! native seam and its btleplug backend, advertisement parsing, the identity
//! cache, event routing, scanning, pairing interception and GATT sessions.

pub mod advertising;
pub mod cache;
pub mod characteristics;
pub mod connection;
pub mod events;
pub mod native;
pub mod observer;
pub mod pairing;
pub mod platform;
pub mod scanner;
pub mod uuids;

#[cfg(test)]
pub(crate) mod mock;

pub use advertising::AdvertisementData;
pub use cache::PeripheralCache;
pub use characteristics::{CharacteristicHandler, NotificationEvent, NotificationStream};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use events::{EventRouter, EventStream, NamedMessage};
pub use native::{AccessState, BondState, NativeAdapter, NativeDevice};
pub use observer::{first_or_cancelled, first_within, with_cancellation, Observed, Registration};
pub use pairing::{PairingInterceptor, PairingOutcome};
pub use platform::{BtleplugAdapter, BtleplugDevice};
pub use scanner::{ScanConfig, ScanResult, ScanStream, ScanType, Scanner, UniquePeripherals};
