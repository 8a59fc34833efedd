//! Basic example: Discover nearby BLE peripherals
//!
//! Run with: cargo run --example discover_peripherals [SERVICE_UUID...]

use ble_central::ble::uuids::to_short;
use ble_central::{BleConfiguration, CentralContext, DelegateRegistry, Result, ScanConfig};
use futures::StreamExt;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_central=debug".parse().unwrap()),
        )
        .init();

    let central =
        CentralContext::with_default_adapter(BleConfiguration::default(), DelegateRegistry::new())
            .await?;
    central.start().await?;
    println!("Adapter: {}", central.status());

    let config = ScanConfig::with_service_uuids(std::env::args().skip(1));
    let mut scan = central.scan(&config)?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            result = scan.next() => match result {
                Some(Ok(result)) => {
                    let ad = &result.advertisement;
                    let services: Vec<String> = ad
                        .service_uuids
                        .iter()
                        .map(|uuid| match to_short(uuid) {
                            Some(short) => format!("{:04X}", short),
                            None => uuid.to_string(),
                        })
                        .collect();
                    println!(
                        "{} {:>4} dBm {} {:<20} services: {}",
                        result.peripheral.address(),
                        result.rssi,
                        if ad.is_general_discoverable() { "*" } else { " " },
                        ad.local_name.as_deref().unwrap_or("-"),
                        services.join(", ")
                    );
                }
                Some(Err(e)) => {
                    eprintln!("Scan failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
        }
    }

    // Dropping the stream stops native discovery.
    drop(scan);

    println!("\n--- Scan Complete ---");
    for peripheral in central.peripherals() {
        println!(
            "  {} - {:?} (RSSI: {:?})",
            peripheral.address(),
            peripheral.name(),
            peripheral.rssi()
        );
    }

    central.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
