//! # esp32-sensor-ble
//!
//! A cross-platform Rust library for streaming sensor readings from ESP32
//! peripherals over Bluetooth Low Energy.
//!
//! The peripheral pushes UTF-8 JSON objects as notifications on the
//! `0000FFE1` characteristic. Each one is decoded, stamped with the local
//! receipt time under the `timestamp` key and handed to your consumer.
//!
//! ## Features
//!
//! - **Discovery**: Time-bounded scan filtered by advertised name
//! - **Connection State Machine**: Explicit states with cancellable connect
//! - **Streaming**: Ordered delivery of decoded JSON records
//! - **Resilience**: Malformed payloads are logged and skipped
//! - **Lifecycle Events**: Observe state changes and connection loss
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use esp32_sensor_ble::{ClientConfig, Result, SensorClient, SensorRecord};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = SensorClient::new(ClientConfig::default()).await?;
//!
//!     client.set_consumer(|record: SensorRecord| {
//!         println!("Received data: {}", record);
//!     });
//!
//!     // Scan, connect, stream until Ctrl+C, then disconnect
//!     client.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and stats

// Public modules
pub mod ble;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod notification;

// Re-exports for convenience
pub use client::{SensorClient, SessionOutcome};
pub use config::ClientConfig;
pub use error::{DecodeError, Error, Result};
pub use notification::{ChannelStats, Delivery, NotificationChannel, RecordConsumer};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionManager, ConnectionState, LifecycleEvent};
pub use ble::scanner::{DeviceFilter, DeviceSelector, FirstMatch, NameContains, StrongestSignal};
pub use ble::transport::{DeviceHandle, Link, Radio};
pub use ble::uuids::SENSOR_DATA_CHARACTERISTIC_UUID;
pub use data::{Clock, JsonDecoder, PayloadDecoder, SensorRecord};
