//! In-memory radio for tests and demos.
//!
//! [`MockRadio`] replays scripted advertisements and hands out
//! [`MockLink`]s whose notification stream is driven through a
//! [`LinkController`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::transport::{
    AdvertisementStream, DeviceHandle, Link, LinkEvent, LinkEventStream, NotificationEvent, Radio,
};
use crate::ble::uuids::SENSOR_DATA_CHARACTERISTIC_UUID;
use crate::error::{Error, Result};

/// State shared between the radio, its links and the controller.
#[derive(Default)]
struct LinkShared {
    sender: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    subscribed: AtomicBool,
    disconnects: AtomicUsize,
}

/// Drives the active [`MockLink`] from a test.
#[derive(Clone)]
pub struct LinkController {
    shared: Arc<LinkShared>,
}

impl LinkController {
    fn send(&self, event: LinkEvent) -> bool {
        match self.shared.sender.lock().as_ref() {
            Some(tx) => tx.unbounded_send(event).is_ok(),
            None => false,
        }
    }

    /// Push a notification. Returns `false` if nothing is subscribed.
    pub fn notify(&self, characteristic: Uuid, payload: impl Into<Bytes>) -> bool {
        self.send(LinkEvent::Notification(NotificationEvent::new(
            characteristic,
            payload,
        )))
    }

    /// Push a notification on the sensor data characteristic.
    pub fn notify_sensor(&self, payload: impl Into<Bytes>) -> bool {
        self.notify(SENSOR_DATA_CHARACTERISTIC_UUID, payload)
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_connection(&self) -> bool {
        let sent = self.send(LinkEvent::Disconnected);
        self.shared.sender.lock().take();
        sent
    }

    /// Simulate an unrecoverable transport error.
    pub fn fault(&self, reason: impl Into<String>) -> bool {
        self.send(LinkEvent::Fault(reason.into()))
    }

    /// Check if a link is currently subscribed.
    pub fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::SeqCst)
    }

    /// Number of times a link was explicitly disconnected.
    pub fn disconnect_count(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }
}

/// Scripted [`Radio`] implementation.
pub struct MockRadio {
    advertisements: Vec<DeviceHandle>,
    keep_scan_open: bool,
    available: bool,
    connect_error: Option<String>,
    connect_delay: Option<Duration>,
    stop_scan_delay: Option<Duration>,
    characteristics: Vec<Uuid>,
    scanning: AtomicBool,
    connect_attempts: Mutex<Vec<String>>,
    shared: Arc<LinkShared>,
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    /// Create a radio exposing the sensor data characteristic.
    pub fn new() -> Self {
        Self {
            advertisements: Vec::new(),
            keep_scan_open: false,
            available: true,
            connect_error: None,
            connect_delay: None,
            stop_scan_delay: None,
            characteristics: vec![SENSOR_DATA_CHARACTERISTIC_UUID],
            scanning: AtomicBool::new(false),
            connect_attempts: Mutex::new(Vec::new()),
            shared: Arc::new(LinkShared::default()),
        }
    }

    /// Script an advertisement, replayed in order on every scan.
    pub fn with_advertisement(mut self, device: DeviceHandle) -> Self {
        self.advertisements.push(device);
        self
    }

    /// Keep the advertisement stream open after the script is exhausted.
    pub fn keep_scan_open(mut self) -> Self {
        self.keep_scan_open = true;
        self
    }

    /// Make the adapter unavailable.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Make every connect attempt fail.
    pub fn fail_connect(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    /// Delay every connect attempt.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Delay every request to stop scanning.
    pub fn with_stop_scan_delay(mut self, delay: Duration) -> Self {
        self.stop_scan_delay = Some(delay);
        self
    }

    /// Replace the characteristics exposed by connected links.
    pub fn with_characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Controller for the links handed out by this radio.
    pub fn controller(&self) -> LinkController {
        LinkController {
            shared: self.shared.clone(),
        }
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Identifiers passed to `connect`, in call order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.connect_attempts.lock().clone()
    }
}

#[async_trait]
impl Radio for MockRadio {
    type Link = MockLink;

    async fn start_scan(&self) -> Result<AdvertisementStream> {
        if !self.available {
            return Err(Error::RadioUnavailable {
                reason: "adapter powered off".to_string(),
            });
        }

        self.scanning.store(true, Ordering::SeqCst);

        let scripted = stream::iter(self.advertisements.clone());
        if self.keep_scan_open {
            Ok(scripted.chain(stream::pending()).boxed())
        } else {
            Ok(scripted.boxed())
        }
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(delay) = self.stop_scan_delay {
            tokio::time::sleep(delay).await;
        }
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<MockLink> {
        self.connect_attempts.lock().push(device.id.clone());

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = &self.connect_error {
            return Err(Error::ConnectFailed {
                device: device.id.clone(),
                reason: reason.clone(),
            });
        }

        Ok(MockLink {
            characteristics: self.characteristics.clone(),
            shared: self.shared.clone(),
        })
    }
}

/// A link produced by [`MockRadio`].
pub struct MockLink {
    characteristics: Vec<Uuid>,
    shared: Arc<LinkShared>,
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<LinkEventStream> {
        if !self.characteristics.contains(&characteristic) {
            return Err(Error::SubscribeFailed {
                characteristic: characteristic.to_string(),
                reason: "characteristic not found".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded();
        *self.shared.sender.lock() = Some(tx);
        self.shared.subscribed.store(true, Ordering::SeqCst);

        Ok(rx.boxed())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.shared.sender.lock().take();
        self.shared.subscribed.store(false, Ordering::SeqCst);
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_controller_without_subscription() {
        let radio = MockRadio::new();
        assert!(!radio.controller().notify_sensor(&b"{}"[..]));
    }

    #[tokio::test]
    async fn test_link_roundtrip() {
        let radio = MockRadio::new();
        let controller = radio.controller();

        let mut link = radio.connect(&DeviceHandle::new("A")).await.unwrap();
        let mut events = link.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();

        assert!(controller.is_subscribed());
        assert!(controller.notify_sensor(&b"{}"[..]));
        assert!(matches!(events.next().await, Some(LinkEvent::Notification(_))));

        link.disconnect().await.unwrap();
        assert_eq!(controller.disconnect_count(), 1);
        assert!(events.next().await.is_none());
        assert_eq!(radio.connect_attempts(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_characteristic() {
        let radio = MockRadio::new().with_characteristics(Vec::new());
        let mut link = radio.connect(&DeviceHandle::new("A")).await.unwrap();
        let result = link.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await;
        assert!(matches!(result, Err(Error::SubscribeFailed { .. })));
    }
}
