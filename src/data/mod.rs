//! Data structures for sensor data.
//!
//! This module contains the decoded record type and the pluggable
//! payload decoder.

pub mod decoder;
pub mod record;

pub use decoder::{JsonDecoder, PayloadDecoder};
pub use record::{Clock, FixedClock, SensorRecord, SystemClock, TIMESTAMP_FIELD, TIMESTAMP_FORMAT};
