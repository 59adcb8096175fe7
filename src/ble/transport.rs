//! Radio abstraction.
//!
//! [`Radio`] and [`Link`] are the seam between the connection state
//! machine and the platform Bluetooth stack. The btleplug implementation
//! lives in [`platform`](crate::ble::platform); an in-memory one for tests
//! and demos lives in [`mock`](crate::ble::mock).

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

/// A peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceHandle {
    /// Platform-specific identifier (MAC address or OS UUID).
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl DeviceHandle {
    /// Create a handle with only an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
            services: Vec::new(),
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Add an advertised service.
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Fold a later advertisement from the same peripheral into this one.
    ///
    /// Names and services often arrive in a scan response after the
    /// initial advertisement, so missing fields are filled in and the
    /// signal strength is refreshed.
    pub fn merge(&mut self, later: DeviceHandle) {
        if later.name.is_some() {
            self.name = later.name;
        }
        if later.rssi.is_some() {
            self.rssi = later.rssi;
        }
        for service in later.services {
            if !self.services.contains(&service) {
                self.services.push(service);
            }
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A raw notification as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic: Uuid,
    /// The notification payload.
    pub payload: Bytes,
}

impl NotificationEvent {
    /// Create a new notification event.
    pub fn new(characteristic: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            characteristic,
            payload: payload.into(),
        }
    }
}

/// Something that happened on a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A notification arrived.
    Notification(NotificationEvent),
    /// The peripheral dropped the connection.
    Disconnected,
    /// The transport reported an unrecoverable error.
    Fault(String),
}

/// Stream of advertisements produced while scanning.
pub type AdvertisementStream = BoxStream<'static, DeviceHandle>;

/// Stream of events produced by a subscribed link.
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// A radio adapter capable of scanning and connecting.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// The connection type produced by [`Radio::connect`].
    type Link: Link;

    /// Start scanning and return the stream of observed advertisements.
    ///
    /// The same peripheral may appear more than once.
    async fn start_scan(&self) -> Result<AdvertisementStream>;

    /// Stop a scan started with [`Radio::start_scan`].
    async fn stop_scan(&self) -> Result<()>;

    /// Open a connection to a previously scanned device.
    async fn connect(&self, device: &DeviceHandle) -> Result<Self::Link>;
}

/// A live connection to one peripheral.
#[async_trait]
pub trait Link: Send + 'static {
    /// Enable notifications on a characteristic and return the event stream.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<LinkEventStream>;

    /// Tear down the connection.
    async fn disconnect(&mut self) -> Result<()>;
}
