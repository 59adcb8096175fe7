//! btleplug-backed [`Radio`] implementation.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    AdvertisementStream, DeviceHandle, Link, LinkEvent, LinkEventStream, NotificationEvent, Radio,
};
use crate::error::{Error, Result};

/// Peripherals seen while scanning, by identifier.
type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;

/// The host's Bluetooth adapter.
pub struct BtleplugRadio {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Peripherals seen during scans, so handles can be connected later.
    peripherals: PeripheralMap,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter on the system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if Bluetooth is missing,
    /// disabled, or not permitted.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(unavailable)?;

        let adapters = manager.adapters().await.map_err(unavailable)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::RadioUnavailable {
                reason: "no Bluetooth adapter found".to_string(),
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

fn unavailable(e: btleplug::Error) -> Error {
    Error::RadioUnavailable {
        reason: e.to_string(),
    }
}

/// Runs `cleanup` on the runtime if dropped before being disarmed.
///
/// The OS keeps connecting after a connect future is dropped, so an
/// abandoned attempt must be undone explicitly.
struct CleanupOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    cleanup: Option<F>,
}

impl<F> CleanupOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(&mut self) {
        self.cleanup = None;
    }
}

impl<F> Drop for CleanupOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(cleanup);
                }
                Err(_) => warn!("No runtime to release an abandoned connection on"),
            }
        }
    }
}

/// Build a handle for a peripheral and remember it for `connect`.
async fn describe_peripheral(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &PeripheralMap,
) -> Option<DeviceHandle> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(p) => p,
        Err(e) => {
            trace!("Failed to get peripheral: {}", e);
            return None;
        }
    };

    let properties = match peripheral.properties().await {
        Ok(Some(p)) => p,
        _ => return None,
    };

    let identifier = id.to_string();
    let handle = DeviceHandle {
        id: identifier.clone(),
        name: properties.local_name,
        rssi: properties.rssi,
        services: properties.services,
    };

    peripherals.write().insert(identifier, peripheral);

    Some(handle)
}

#[async_trait]
impl Radio for BtleplugRadio {
    type Link = BtleplugLink;

    async fn start_scan(&self) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await.map_err(unavailable)?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(unavailable)?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let advertisements = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => {
                        describe_peripheral(&adapter, &id, &peripherals).await
                    }
                    _ => None,
                }
            }
        });

        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<BtleplugLink> {
        let peripheral = self
            .peripherals
            .read()
            .get(&device.id)
            .cloned()
            .ok_or_else(|| Error::ConnectFailed {
                device: device.id.clone(),
                reason: "device was not seen by this adapter".to_string(),
            })?;

        let mut abandoned = CleanupOnDrop::new({
            let peripheral = peripheral.clone();
            async move {
                debug!("Connect to {} abandoned, disconnecting", peripheral.id());
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Error releasing abandoned connection: {}", e);
                }
            }
        });

        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
        } else {
            peripheral.connect().await?;
        }

        peripheral.discover_services().await?;
        abandoned.disarm();

        Ok(BtleplugLink {
            adapter: self.adapter.clone(),
            peripheral,
            subscribed: None,
        })
    }
}

/// A live btleplug connection.
pub struct BtleplugLink {
    /// Adapter, for disconnect events.
    adapter: Adapter,
    /// The connected peripheral.
    peripheral: Peripheral,
    /// Characteristic notifications are enabled on.
    subscribed: Option<Characteristic>,
}

impl BtleplugLink {
    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        let characteristics = self.peripheral.characteristics();

        let found = characteristics.iter().find(|c| c.uuid == uuid).cloned();

        found.ok_or_else(|| {
            for c in &characteristics {
                debug!("  Available characteristic: {}", c.uuid);
            }
            Error::SubscribeFailed {
                characteristic: uuid.to_string(),
                reason: "characteristic not found".to_string(),
            }
        })
    }
}

#[async_trait]
impl Link for BtleplugLink {
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<LinkEventStream> {
        let target = self.find_characteristic(characteristic)?;

        if !target
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(Error::SubscribeFailed {
                characteristic: characteristic.to_string(),
                reason: format!("characteristic does not notify ({:?})", target.properties),
            });
        }

        // Open the stream before enabling notifications so none are missed.
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;
        self.subscribed = Some(target);

        debug!("Subscribed to notifications from {}", characteristic);

        let notifications = notifications.map(|n| {
            LinkEvent::Notification(NotificationEvent::new(n.uuid, n.value))
        });

        let id = self.peripheral.id();
        let disconnects = self
            .adapter
            .events()
            .await?
            .filter_map(move |event| {
                let gone = matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == id);
                async move { gone.then_some(LinkEvent::Disconnected) }
            });

        // The notification stream closing means the link is gone too.
        let notifications = notifications.chain(stream::once(async { LinkEvent::Disconnected }));

        Ok(stream::select(notifications, disconnects).boxed())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(characteristic) = self.subscribed.take() {
            if let Err(e) = self.peripheral.unsubscribe(&characteristic).await {
                debug!("Failed to unsubscribe from {}: {}", characteristic.uuid, e);
            }
        }

        self.peripheral.disconnect().await?;
        info!("Disconnected peripheral {}", self.peripheral.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_cleanup_runs_when_attempt_is_dropped() {
        let (tx, rx) = oneshot::channel::<()>();

        let attempt = async move {
            let _guard = CleanupOnDrop::new(async move {
                let _ = tx.send(());
            });
            futures::future::pending::<()>().await;
        };

        let timed_out = tokio::time::timeout(Duration::from_millis(20), attempt).await;
        assert!(timed_out.is_err());

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_skipped_when_attempt_completes() {
        let (tx, rx) = oneshot::channel::<()>();

        let mut guard = CleanupOnDrop::new(async move {
            let _ = tx.send(());
        });
        guard.disarm();
        drop(guard);

        // The cleanup future was dropped unrun, closing the channel.
        assert!(rx.await.is_err());
    }
}
