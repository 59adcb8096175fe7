//! Decoded sensor records.

use chrono::{Local, NaiveDateTime};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Name of the field stamped with the receipt time.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Format of the `timestamp` field.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source of wall-clock time for stamping records.
pub trait Clock: Send + Sync {
    /// Current local wall-clock time.
    fn now(&self) -> NaiveDateTime;
}

/// The system's local clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// A decoded notification payload.
///
/// The `timestamp` field always holds the time the notification was
/// received, replacing any field of that name sent by the peripheral.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SensorRecord {
    fields: Map<String, Value>,
    received_at: NaiveDateTime,
    characteristic: Uuid,
}

impl SensorRecord {
    /// Build a record from decoded fields, stamping the receipt time.
    pub fn new(
        mut fields: Map<String, Value>,
        received_at: NaiveDateTime,
        characteristic: Uuid,
    ) -> Self {
        fields.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(received_at.format(TIMESTAMP_FORMAT).to_string()),
        );

        Self {
            fields,
            received_at,
            characteristic,
        }
    }

    /// Get a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The stamped `timestamp` value.
    pub fn timestamp(&self) -> &str {
        self.fields
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// When the notification was received.
    pub fn received_at(&self) -> NaiveDateTime {
        self.received_at
    }

    /// The characteristic the notification arrived on.
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// All fields, including `timestamp`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume the record and return its fields.
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl fmt::Display for SensorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.fields).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
