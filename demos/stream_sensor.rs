//! Sensor streaming example
//!
//! Scans for an ESP32 sensor, connects to the first one found and prints
//! every record it sends until Ctrl+C.
//!
//! Run with: cargo run --example stream_sensor
//!
//! To match a different advertised name:
//!   cargo run --example stream_sensor -- --name SENSOR

use esp32_sensor_ble::{ClientConfig, Error, Result, SensorClient, SensorRecord, SessionOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,esp32_sensor_ble=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::new();
    if let Some(pattern) = args
        .iter()
        .position(|arg| arg == "--name")
        .and_then(|i| args.get(i + 1))
    {
        config = config.with_name_pattern(pattern.clone());
    }

    println!("Scanning for BLE devices...");

    let client = SensorClient::new(config).await?;
    client.set_consumer(|record: SensorRecord| {
        println!("Received data: {}", record);
    });

    match client.run().await {
        Ok(SessionOutcome::Shutdown) => {
            println!("Disconnected from device");
        }
        Ok(SessionOutcome::ConnectionLost) => {
            println!("Connection lost");
        }
        Err(Error::NoMatchingDevice { .. }) => {
            println!("No {} devices found", client.config().name_pattern);
        }
        Err(e) => return Err(e),
    }

    let stats = client.stats();
    println!(
        "{} record(s) delivered, {} malformed",
        stats.delivered, stats.malformed
    );

    Ok(())
}
