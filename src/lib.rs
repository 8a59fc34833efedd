//! # ble-central
//!
//! A Bluetooth Low Energy central-role engine: device discovery, stable
//! peripheral identity, connection and pairing event routing, and GATT
//! characteristic streams, all exposed as composable async streams with
//! cancellation.
//!
//! ## Features
//!
//! - **Scanning**: service UUID filters, power modes and hardware batching;
//!   dropping the scan stream stops native discovery
//! - **Identity**: one [`Peripheral`] per hardware address, stable across
//!   scans and reconnects
//! - **Event routing**: per-peripheral listeners for connection, pairing and
//!   bond events, plus a replaying adapter state stream
//! - **Pairing**: register a PIN up front and it is injected when the OS asks
//! - **GATT**: read, write and reference counted notification streams
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_central::{BleConfiguration, CentralContext, DelegateRegistry, Result, ScanConfig};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let central =
//!         CentralContext::with_default_adapter(BleConfiguration::default(), DelegateRegistry::new())
//!             .await?;
//!     central.start().await?;
//!
//!     let mut scan = central.scan_for_unique_peripherals(&ScanConfig::with_service_uuids(["FFF0"]))?;
//!     if let Some(peripheral) = scan.next().await {
//!         let peripheral = peripheral?;
//!         println!("Found {} ({:?})", peripheral.address(), peripheral.name());
//!     }
//!
//!     // Dropping the stream stops the scan.
//!     drop(scan);
//!     central.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Hardware addresses are hidden, so
//! peripherals are keyed by their CoreBluetooth identifier.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! The btleplug backend cannot inject pairing PINs; use a custom
//! [`NativeAdapter`](ble::NativeAdapter) where the platform allows it.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and
//!   advertisement types

// Public modules
pub mod ble;
pub mod central;
pub mod config;
pub mod delegate;
pub mod error;
pub mod peripheral;
pub mod utils;

// Re-exports for convenience
pub use central::{CentralContext, DeviceEventHandler};
pub use config::{BleConfiguration, ConnectionConfig};
pub use delegate::{BleDelegate, DelegateRegistry};
pub use error::{Error, Result};
pub use peripheral::Peripheral;

// Re-export commonly used types from submodules
pub use ble::events::{
    ACL_CONNECTED, ACL_DISCONNECTED, BLE_PAIRING_FAILED, BOND_STATE_CHANGED, PAIRING_REQUEST,
};
pub use ble::{
    AccessState, AdvertisementData, BondState, ConnectionState, NamedMessage, ScanConfig,
    ScanResult, ScanType,
};
pub use tokio_util::sync::CancellationToken;
