//! BLE communication module.
//!
//! This module provides the radio abstraction, device discovery and the
//! connection state machine used to stream from ESP32 sensors.

pub mod connection;
pub mod mock;
pub mod platform;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use connection::{ConnectionManager, ConnectionState, LifecycleEvent};
pub use platform::{BtleplugLink, BtleplugRadio};
pub use scanner::{
    AdvertisesService, DeviceDiscovery, DeviceFilter, DeviceSelector, FirstMatch, NameContains,
    StrongestSignal,
};
pub use transport::{DeviceHandle, Link, LinkEvent, NotificationEvent, Radio};
pub use uuids::*;
