//! BLE Service and Characteristic UUIDs.
//!
//! The ESP32 sensor firmware exposes its readings through the common
//! HM-10 style serial service.

use uuid::Uuid;

/// Serial data service UUID (0xFFE0).
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);

/// Sensor data characteristic UUID (0xFFE1, Notify).
pub const SENSOR_DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);
