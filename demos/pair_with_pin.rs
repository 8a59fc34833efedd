//! Example: find an OBD-II style adapter, pair with a PIN and stream
//! notifications.
//!
//! Run with: cargo run --example pair_with_pin -- [PIN]

use ble_central::{
    ble::first_within, BleConfiguration, CancellationToken, CentralContext, DelegateRegistry,
    Result, ScanConfig,
};
use futures::StreamExt;
use std::time::Duration;

const SERVICE: &str = "FFF0";
const NOTIFY_CHARACTERISTIC: &str = "FFF1";
const WRITE_CHARACTERISTIC: &str = "FFF2";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_central=info".parse().unwrap()),
        )
        .init();

    let pin = std::env::args().nth(1).unwrap_or_else(|| "1234".to_string());

    let central =
        CentralContext::with_default_adapter(BleConfiguration::default(), DelegateRegistry::new())
            .await?;
    central.start().await?;

    println!("Looking for a device advertising {}...", SERVICE);
    let scan = central.scan_for_unique_peripherals(&ScanConfig::with_service_uuids([SERVICE]))?;
    let peripheral = first_within(scan, Duration::from_secs(20)).await??;
    println!("Found {} ({:?})", peripheral.address(), peripheral.name());

    peripheral.connect_and_maintain().await?;

    let token = CancellationToken::new();
    match peripheral.try_pairing_request(Some(pin), &token).await? {
        None => println!("Pairing is not available on this platform, continuing unpaired"),
        Some(true) => println!("Paired"),
        Some(false) => println!("Pairing refused, continuing unpaired"),
    }

    let notify = peripheral
        .get_known_characteristic(SERVICE, NOTIFY_CHARACTERISTIC)
        .await?;
    let write = peripheral
        .get_known_characteristic(SERVICE, WRITE_CHARACTERISTIC)
        .await?;

    let mut notifications = peripheral.notify(&notify).await?;
    peripheral.write(&write, b"ATZ\r", true).await?;

    println!("Streaming notifications, press Ctrl+C to stop.\n");
    loop {
        tokio::select! {
            Some(event) = notifications.next() => {
                println!("{}", String::from_utf8_lossy(&event.data).trim_end());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(notifications);
    central.shutdown().await?;

    Ok(())
}
