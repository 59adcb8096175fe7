//! Notification decode and delivery pipeline.
//!
//! Each notification is decoded, stamped with its receipt time and handed
//! to the registered [`RecordConsumer`]. A payload that fails to decode is
//! logged and counted; it never ends the stream.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::ble::transport::NotificationEvent;
use crate::data::{Clock, JsonDecoder, PayloadDecoder, SensorRecord, SystemClock};
use crate::error::Result;

/// Receives decoded records.
///
/// Called synchronously, one record at a time, in arrival order. A consumer
/// that blocks stalls the pipeline.
pub trait RecordConsumer: Send + Sync {
    /// Handle one record.
    fn on_record(&self, record: SensorRecord);
}

impl<F> RecordConsumer for F
where
    F: Fn(SensorRecord) + Send + Sync,
{
    fn on_record(&self, record: SensorRecord) {
        self(record)
    }
}

/// What happened to a single notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Decoded and handed to the consumer.
    Delivered,
    /// Decoded, but no consumer was registered.
    Discarded,
    /// The payload could not be decoded.
    Malformed,
    /// Decoded after the stream was closed; not delivered.
    Dropped,
}

/// Running counters for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelStats {
    /// Records handed to a consumer.
    pub delivered: u64,
    /// Payloads that failed to decode.
    pub malformed: u64,
    /// Records decoded while no consumer was registered.
    pub discarded: u64,
    /// Notifications from characteristics other than the subscribed one.
    pub ignored: u64,
    /// Records that finished decoding after the stream was closed.
    pub dropped: u64,
}

/// Decodes notifications and delivers them to a consumer.
pub struct NotificationChannel {
    decoder: RwLock<Arc<dyn PayloadDecoder>>,
    clock: Arc<dyn Clock>,
    consumer: RwLock<Option<Arc<dyn RecordConsumer>>>,
    delivered: AtomicU64,
    malformed: AtomicU64,
    discarded: AtomicU64,
    ignored: AtomicU64,
    dropped: AtomicU64,
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationChannel {
    /// Create a channel using the JSON decoder and the system clock.
    pub fn new() -> Self {
        Self::with_decoder(JsonDecoder)
    }

    /// Create a channel with a custom decoder.
    pub fn with_decoder(decoder: impl PayloadDecoder + 'static) -> Self {
        Self {
            decoder: RwLock::new(Arc::new(decoder)),
            clock: Arc::new(SystemClock),
            consumer: RwLock::new(None),
            delivered: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Replace the clock used to stamp records.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the payload decoder.
    pub fn set_decoder(&self, decoder: impl PayloadDecoder + 'static) {
        *self.decoder.write() = Arc::new(decoder);
    }

    /// Register the consumer, replacing any previous one.
    ///
    /// Takes effect from the next notification onwards.
    pub fn set_consumer(&self, consumer: impl RecordConsumer + 'static) {
        *self.consumer.write() = Some(Arc::new(consumer));
    }

    /// Remove the consumer. Later records are discarded.
    pub fn clear_consumer(&self) {
        *self.consumer.write() = None;
    }

    /// Check if a consumer is registered.
    pub fn has_consumer(&self) -> bool {
        self.consumer.read().is_some()
    }

    /// Decode a notification into a stamped record without delivering it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedNotification`](crate::Error::MalformedNotification)
    /// if the payload cannot be decoded.
    pub fn decode(&self, event: &NotificationEvent) -> Result<SensorRecord> {
        let decoder = self.decoder.read().clone();
        let fields = decoder.decode(&event.payload)?;
        Ok(SensorRecord::new(
            fields,
            self.clock.now(),
            event.characteristic,
        ))
    }

    /// Decode a notification and deliver it to the consumer.
    pub fn on_notification(&self, event: &NotificationEvent) -> Delivery {
        self.on_notification_if(event, || true)
    }

    /// Decode a notification and deliver it only if `open` still holds
    /// once decoding has finished.
    pub fn on_notification_if<F>(&self, event: &NotificationEvent, open: F) -> Delivery
    where
        F: Fn() -> bool,
    {
        let record = match self.decode(event) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Dropping notification from {} ({} bytes): {}",
                    event.characteristic,
                    event.payload.len(),
                    e
                );
                self.malformed.fetch_add(1, Ordering::Relaxed);
                return Delivery::Malformed;
            }
        };

        if !open() {
            debug!("Stream closed while decoding, dropping record");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Delivery::Dropped;
        }

        // Clone out of the lock so the consumer may re-register itself.
        let consumer = self.consumer.read().clone();

        match consumer {
            Some(consumer) => {
                trace!("Delivering record: {}", record);
                consumer.on_record(record);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Delivered
            }
            None => {
                trace!("No consumer registered, discarding record");
                self.discarded.fetch_add(1, Ordering::Relaxed);
                Delivery::Discarded
            }
        }
    }

    /// Count a notification from a characteristic nobody subscribed to.
    pub(crate) fn note_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("has_consumer", &self.has_consumer())
            .field("stats", &self.stats())
            .finish()
    }
}
