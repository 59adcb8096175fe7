//! BLE connection management.
//!
//! [`ConnectionManager`] owns the link to a single peripheral and drives it
//! through `Idle → Connecting → Connected → Streaming → Disconnecting →
//! Idle`, with `Failed` entered when a connect, subscribe, or stream
//! fails.

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{DeviceHandle, Link, LinkEvent, LinkEventStream, Radio};
use crate::error::{Error, Result};
use crate::notification::NotificationChannel;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Idle,
    /// Waiting for the link to come up.
    Connecting,
    /// Link up, not subscribed.
    Connected,
    /// Subscribed; notifications are being delivered.
    Streaming,
    /// Tearing down the link.
    Disconnecting,
    /// A connect, subscribe or stream failure occurred. Only
    /// [`ConnectionManager::disconnect`] leaves this state.
    Failed,
}

impl ConnectionState {
    /// Check if a link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }

    /// Check if notifications are being delivered.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle notifications published by a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The state machine moved.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The peripheral dropped the connection while streaming.
    ConnectionLost {
        /// Identifier of the lost device.
        device: String,
    },
    /// The transport failed while streaming.
    StreamFault {
        /// Identifier of the device.
        device: String,
        /// Transport-provided description.
        reason: String,
    },
    /// The connection was closed on request.
    Disconnected {
        /// Identifier of the device.
        device: String,
    },
}

/// Current state plus the channel its changes are published on.
#[derive(Clone)]
struct StateCell {
    state: Arc<RwLock<ConnectionState>>,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl StateCell {
    fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            event_tx,
        }
    }

    fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Apply `f` atomically. Returns the state seen before the update.
    fn update<F>(&self, f: F) -> ConnectionState
    where
        F: FnOnce(ConnectionState) -> Option<ConnectionState>,
    {
        let (old, new) = {
            let mut state = self.state.write();
            let old = *state;
            let new = f(old);
            if let Some(new) = new {
                *state = new;
            }
            (old, new)
        };

        if let Some(new) = new {
            self.announce(old, new);
        }
        old
    }

    fn set(&self, new_state: ConnectionState) -> ConnectionState {
        self.update(|_| Some(new_state))
    }

    /// Move from `from` to `to`; no-op unless currently in `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.update(|s| (s == from).then_some(to)) == from
    }

    fn announce(&self, old: ConnectionState, new: ConnectionState) {
        if old != new {
            debug!("Connection state changed: {} -> {}", old, new);
            self.emit(LifecycleEvent::StateChanged { from: old, to: new });
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Resets `Connecting` back to `Idle` if a connect future is dropped
/// mid-flight.
struct ConnectingGuard<'a> {
    state: &'a StateCell,
    device: &'a RwLock<Option<DeviceHandle>>,
    armed: bool,
}

impl ConnectingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.device.write().take();
            self.state.update(|s| {
                matches!(s, ConnectionState::Connecting | ConnectionState::Disconnecting)
                    .then_some(ConnectionState::Idle)
            });
        }
    }
}

/// A running notification pump.
struct PumpHandle {
    /// Asks the pump to stop between events.
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Manages the connection to one peripheral.
pub struct ConnectionManager<R: Radio> {
    /// Radio used to open links.
    radio: Arc<R>,
    /// Current state and event channel.
    state: StateCell,
    /// The live link, if any.
    link: Arc<AsyncMutex<Option<R::Link>>>,
    /// Device the link belongs to.
    device: Arc<RwLock<Option<DeviceHandle>>>,
    /// Decode and delivery pipeline.
    channel: Arc<NotificationChannel>,
    /// Task draining the link's event stream.
    pump: Mutex<Option<PumpHandle>>,
    /// Wakes a pending connect when a disconnect is requested.
    cancel: Notify,
    /// Upper bound on a connect attempt.
    connect_timeout: Duration,
}

impl<R: Radio> ConnectionManager<R> {
    /// Create a new connection manager.
    pub fn new(
        radio: Arc<R>,
        channel: Arc<NotificationChannel>,
        connect_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        Self {
            radio,
            state: StateCell::new(event_capacity),
            link: Arc::new(AsyncMutex::new(None)),
            device: Arc::new(RwLock::new(None)),
            channel,
            pump: Mutex::new(None),
            cancel: Notify::new(),
            connect_timeout,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Check if notifications are being delivered.
    pub fn is_streaming(&self) -> bool {
        self.state().is_streaming()
    }

    /// The device currently connected or being connected to.
    pub fn device(&self) -> Option<DeviceHandle> {
        self.device.read().clone()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.state.event_tx.subscribe()
    }

    /// The notification pipeline fed by this manager.
    pub fn channel(&self) -> &Arc<NotificationChannel> {
        &self.channel
    }

    /// Connect to a device. Only valid while `Idle`.
    ///
    /// Makes a single attempt bounded by the connect timeout. On failure
    /// the manager is left `Failed` until [`disconnect`](Self::disconnect)
    /// is called.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if not `Idle`.
    /// - [`Error::ConnectFailed`] on timeout or transport failure.
    /// - [`Error::Cancelled`] if `disconnect` was called while connecting.
    pub async fn connect(&self, device: &DeviceHandle) -> Result<()> {
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        if !self
            .state
            .transition(ConnectionState::Idle, ConnectionState::Connecting)
        {
            return Err(Error::InvalidState {
                operation: "connect",
                state: self.state(),
            });
        }

        let mut guard = ConnectingGuard {
            state: &self.state,
            device: &self.device,
            armed: true,
        };

        info!("Connecting to {}", device);
        *self.device.write() = Some(device.clone());

        let attempt = tokio::time::timeout(self.connect_timeout, self.radio.connect(device));

        let outcome = tokio::select! {
            biased;
            _ = &mut cancelled => None,
            result = attempt => Some(result),
        };

        let link = match outcome {
            None => {
                guard.disarm();
                return Err(self.abort_connect(device));
            }
            Some(Err(_)) => {
                guard.disarm();
                let reason = format!("timed out after {:?}", self.connect_timeout);
                return Err(self.fail_connect(device, reason));
            }
            Some(Ok(Err(e))) => {
                guard.disarm();
                let reason = match e {
                    Error::ConnectFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                return Err(self.fail_connect(device, reason));
            }
            Some(Ok(Ok(link))) => link,
        };

        // Hold the slot so a concurrent disconnect sees the link once
        // Connected is visible.
        let mut slot = self.link.lock().await;

        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            drop(slot);
            guard.disarm();

            debug!("Disconnect requested while link to {} was completing", device);
            let mut link = link;
            if let Err(e) = link.disconnect().await {
                warn!("Failed to tear down cancelled link to {}: {}", device, e);
            }
            return Err(self.abort_connect(device));
        }

        *slot = Some(link);
        guard.disarm();

        info!("Connected to {}", device);
        Ok(())
    }

    fn abort_connect(&self, device: &DeviceHandle) -> Error {
        info!("Connect to {} cancelled", device);
        self.device.write().take();
        self.state.set(ConnectionState::Idle);
        Error::Cancelled
    }

    fn fail_connect(&self, device: &DeviceHandle, reason: String) -> Error {
        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Failed)
        {
            // A disconnect arrived while the attempt was failing.
            return self.abort_connect(device);
        }

        error!("Connection to {} failed: {}", device, reason);
        Error::ConnectFailed {
            device: device.id.clone(),
            reason,
        }
    }

    /// Subscribe to notifications on a characteristic. Only valid while
    /// `Connected`.
    ///
    /// On success the manager is `Streaming` and every notification from
    /// `characteristic` is handed to the [`NotificationChannel`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if not `Connected`.
    /// - [`Error::SubscribeFailed`] if the characteristic is missing or the
    ///   GATT operation fails; the manager is then `Failed`.
    pub async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let mut slot = self.link.lock().await;

        let state = self.state();
        let link = match (state, slot.as_mut()) {
            (ConnectionState::Connected, Some(link)) => link,
            _ => {
                return Err(Error::InvalidState {
                    operation: "subscribe",
                    state,
                })
            }
        };

        debug!("Subscribing to characteristic {}", characteristic);

        let events = match link.subscribe(characteristic).await {
            Ok(events) => events,
            Err(e) => {
                self.state
                    .transition(ConnectionState::Connected, ConnectionState::Failed);
                let reason = match e {
                    Error::SubscribeFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                error!("Subscribe to {} failed: {}", characteristic, reason);
                return Err(Error::SubscribeFailed {
                    characteristic: characteristic.to_string(),
                    reason,
                });
            }
        };

        drop(slot);

        if !self
            .state
            .transition(ConnectionState::Connected, ConnectionState::Streaming)
        {
            return Err(Error::InvalidState {
                operation: "subscribe",
                state: self.state(),
            });
        }

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(pump(
            events,
            stopped,
            characteristic,
            self.state.clone(),
            self.link.clone(),
            self.device.clone(),
            self.channel.clone(),
        ));
        *self.pump.lock() = Some(PumpHandle { stop, task });

        info!("Streaming notifications from {}", characteristic);
        Ok(())
    }

    /// Tear down the connection.
    ///
    /// - `Idle`: no-op.
    /// - `Connecting`: aborts the pending attempt, which returns
    ///   [`Error::Cancelled`].
    /// - `Connected`, `Streaming`, `Failed`: releases the link and returns
    ///   to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the link refused to close. The
    /// manager is `Idle` regardless.
    pub async fn disconnect(&self) -> Result<()> {
        let previous = self.state.update(|s| match s {
            ConnectionState::Idle | ConnectionState::Disconnecting => None,
            _ => Some(ConnectionState::Disconnecting),
        });

        match previous {
            ConnectionState::Idle => {
                debug!("Already idle, ignoring disconnect request");
                return Ok(());
            }
            ConnectionState::Disconnecting => {
                debug!("Disconnect already in progress");
                return Ok(());
            }
            ConnectionState::Connecting => {
                info!("Cancelling pending connect");
                self.cancel.notify_waiters();
                return Ok(());
            }
            ConnectionState::Connected | ConnectionState::Streaming | ConnectionState::Failed => {}
        }

        // Wait out any notification in flight so nothing is delivered
        // once this returns.
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.stop.send(());
            if let Err(e) = pump.task.await {
                warn!("Notification pump ended abnormally: {}", e);
            }
        }

        let link = self.link.lock().await.take();
        let result = match link {
            Some(mut link) => link.disconnect().await,
            None => Ok(()),
        };

        let device = self.device.write().take();
        self.state.set(ConnectionState::Idle);

        match result {
            Ok(()) => {
                if let Some(device) = device {
                    info!("Disconnected from {}", device);
                    self.state.emit(LifecycleEvent::Disconnected { device: device.id });
                }
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(e)
            }
        }
    }
}

impl<R: Radio> Drop for ConnectionManager<R> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.task.abort();
        }
    }
}

/// How the event stream of a link came to an end.
enum StreamEnd {
    /// The peripheral went away.
    Lost,
    /// The transport reported a fault.
    Fault(String),
    /// The manager asked the pump to stop, or left `Streaming`.
    TornDown,
}

/// Drain a link's events into the notification channel, one at a time.
async fn pump<L: Link>(
    mut events: LinkEventStream,
    mut stop: oneshot::Receiver<()>,
    characteristic: Uuid,
    state: StateCell,
    link: Arc<AsyncMutex<Option<L>>>,
    device: Arc<RwLock<Option<DeviceHandle>>>,
    channel: Arc<NotificationChannel>,
) {
    debug!("Notification pump started");

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => break StreamEnd::TornDown,
            next = events.next() => next,
        };

        let Some(event) = next else {
            break StreamEnd::Lost;
        };

        if !state.get().is_streaming() {
            trace!("Dropping event received after teardown");
            break StreamEnd::TornDown;
        }

        match event {
            LinkEvent::Notification(notification) => {
                if notification.characteristic != characteristic {
                    trace!(
                        "Ignoring notification from {}",
                        notification.characteristic
                    );
                    channel.note_ignored();
                    continue;
                }
                channel.on_notification_if(&notification, || state.get().is_streaming());
            }
            LinkEvent::Disconnected => break StreamEnd::Lost,
            LinkEvent::Fault(reason) => break StreamEnd::Fault(reason),
        }
    };

    match end {
        // The link is closed before the state moves, so nobody can
        // reconnect into the slot being released.
        StreamEnd::Lost if state.get().is_streaming() => {
            release(&link).await;
            if state.transition(ConnectionState::Streaming, ConnectionState::Idle) {
                let id = device.write().take().map(|d| d.id).unwrap_or_default();
                warn!("Connection to {} lost", id);
                state.emit(LifecycleEvent::ConnectionLost { device: id });
            }
        }
        StreamEnd::Fault(reason) if state.get().is_streaming() => {
            release(&link).await;
            if state.transition(ConnectionState::Streaming, ConnectionState::Failed) {
                let id = device.read().as_ref().map(|d| d.id.clone()).unwrap_or_default();
                error!("Stream from {} failed: {}", id, reason);
                state.emit(LifecycleEvent::StreamFault { device: id, reason });
            }
        }
        StreamEnd::Lost | StreamEnd::Fault(_) | StreamEnd::TornDown => {}
    }

    debug!("Notification pump stopped");
}

/// Take the link out of its slot and close it, logging any error.
async fn release<L: Link>(link: &AsyncMutex<Option<L>>) {
    if let Some(mut link) = link.lock().await.take() {
        if let Err(e) = link.disconnect().await {
            debug!("Error releasing link: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockRadio;
    use crate::ble::uuids::SENSOR_DATA_CHARACTERISTIC_UUID;
    use crate::data::{JsonDecoder, PayloadDecoder, SensorRecord};
    use crate::error::DecodeError;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn manager(radio: MockRadio) -> (Arc<MockRadio>, ConnectionManager<MockRadio>) {
        let radio = Arc::new(radio);
        let channel = Arc::new(NotificationChannel::new());
        let manager = ConnectionManager::new(radio.clone(), channel, Duration::from_secs(1), 16);
        (radio, manager)
    }

    fn device() -> DeviceHandle {
        DeviceHandle::new("A").with_name("ESP32-1")
    }

    fn record_sink(manager: &ConnectionManager<MockRadio>) -> mpsc::UnboundedReceiver<SensorRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.channel().set_consumer(move |record: SensorRecord| {
            let _ = tx.send(record);
        });
        rx
    }

    async fn next_matching<F>(
        events: &mut broadcast::Receiver<LifecycleEvent>,
        mut pred: F,
    ) -> LifecycleEvent
    where
        F: FnMut(&LifecycleEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Idle.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Streaming.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Streaming.is_streaming());
        assert!(!ConnectionState::Connected.is_streaming());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Streaming), "Streaming");
        assert_eq!(format!("{}", ConnectionState::Idle), "Idle");
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (radio, manager) = manager(MockRadio::new());
        let mut events = manager.subscribe_events();

        manager.connect(&device()).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.device(), Some(device()));

        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Streaming);

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.device(), None);
        assert_eq!(radio.controller().disconnect_count(), 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let transitions: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Streaming,
                ConnectionState::Disconnecting,
                ConnectionState::Idle,
            ]
        );
        assert!(seen.contains(&LifecycleEvent::Disconnected {
            device: "A".to_string()
        }));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let (_radio, manager) = manager(MockRadio::new());
        let mut events = manager.subscribe_events();

        tokio_test::assert_ok!(manager.disconnect().await);
        tokio_test::assert_ok!(manager.disconnect().await);

        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_enters_failed() {
        let (_radio, manager) = manager(MockRadio::new().fail_connect("refused"));

        let err = manager.connect(&device()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { ref device, ref reason }
            if device == "A" && reason == "refused"));
        assert_eq!(manager.state(), ConnectionState::Failed);

        // Failed only leaves through disconnect.
        let err = manager.connect(&device()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: ConnectionState::Failed, .. }));

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let radio = Arc::new(MockRadio::new().with_connect_delay(Duration::from_secs(30)));
        let manager = ConnectionManager::new(
            radio,
            Arc::new(NotificationChannel::new()),
            Duration::from_millis(20),
            16,
        );

        let err = manager.connect(&device()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { ref reason, .. } if reason.contains("timed out")));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let (radio, manager) = manager(MockRadio::new().with_connect_delay(Duration::from_secs(30)));
        let manager = Arc::new(manager);

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(&device()).await })
        };

        let mut events = manager.subscribe_events();
        if manager.state() != ConnectionState::Connecting {
            next_matching(&mut events, |e| {
                matches!(e, LifecycleEvent::StateChanged { to: ConnectionState::Connecting, .. })
            })
            .await;
        }

        manager.disconnect().await.unwrap();

        let result = tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.device(), None);
        assert_eq!(radio.connect_attempts(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_connect_returns_to_idle() {
        let (_radio, manager) = manager(MockRadio::new().with_connect_delay(Duration::from_secs(30)));

        let result = tokio::time::timeout(Duration::from_millis(20), manager.connect(&device())).await;
        assert!(result.is_err());
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.device(), None);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connected() {
        let (_radio, manager) = manager(MockRadio::new());
        let err = manager
            .subscribe(SENSOR_DATA_CHARACTERISTIC_UUID)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { operation: "subscribe", state: ConnectionState::Idle }));
    }

    #[tokio::test]
    async fn test_subscribe_failure_enters_failed() {
        let (radio, manager) = manager(MockRadio::new().with_characteristics(Vec::new()));

        manager.connect(&device()).await.unwrap();
        let err = manager
            .subscribe(SENSOR_DATA_CHARACTERISTIC_UUID)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SubscribeFailed { .. }));
        assert_eq!(manager.state(), ConnectionState::Failed);

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(radio.controller().disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_notifications_delivered_in_order() {
        let (radio, manager) = manager(MockRadio::new());
        let mut records = record_sink(&manager);
        let controller = radio.controller();

        manager.connect(&device()).await.unwrap();
        assert!(!controller.notify_sensor(&b"{\"seq\": 0}"[..]));

        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();

        for seq in 1..=5 {
            assert!(controller.notify_sensor(format!("{{\"seq\": {}}}", seq).into_bytes()));
        }

        for seq in 1..=5 {
            let record = tokio::time::timeout(WAIT, records.recv()).await.unwrap().unwrap();
            assert_eq!(record.get("seq"), Some(&serde_json::json!(seq)));
            assert!(!record.timestamp().is_empty());
        }
    }

    #[tokio::test]
    async fn test_malformed_notification_keeps_streaming() {
        let (radio, manager) = manager(MockRadio::new());
        let mut records = record_sink(&manager);
        let controller = radio.controller();

        manager.connect(&device()).await.unwrap();
        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();

        controller.notify_sensor(vec![0xff, 0xfe, 0xfd]);
        controller.notify_sensor(&b"{\"temp\": 21.5}"[..]);

        let record = tokio::time::timeout(WAIT, records.recv()).await.unwrap().unwrap();
        assert_eq!(record.get("temp"), Some(&serde_json::json!(21.5)));
        assert_eq!(manager.state(), ConnectionState::Streaming);
        assert_eq!(manager.channel().stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_other_characteristics_ignored() {
        let (radio, manager) = manager(MockRadio::new());
        let mut records = record_sink(&manager);
        let controller = radio.controller();

        manager.connect(&device()).await.unwrap();
        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();

        controller.notify(Uuid::from_u128(0x2a19), &b"{\"battery\": 90}"[..]);
        controller.notify_sensor(&b"{\"temp\": 20}"[..]);

        let record = tokio::time::timeout(WAIT, records.recv()).await.unwrap().unwrap();
        assert_eq!(record.get("temp"), Some(&serde_json::json!(20)));
        assert_eq!(manager.channel().stats().ignored, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_loss_returns_to_idle() {
        let (radio, manager) = manager(MockRadio::new());
        let mut events = manager.subscribe_events();

        manager.connect(&device()).await.unwrap();
        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();

        assert!(radio.controller().drop_connection());

        let lost = next_matching(&mut events, |e| {
            matches!(e, LifecycleEvent::ConnectionLost { .. })
        })
        .await;
        assert_eq!(lost, LifecycleEvent::ConnectionLost { device: "A".to_string() });
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.device(), None);

        // Failed was never entered.
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, LifecycleEvent::StateChanged { to: ConnectionState::Failed, .. }));
        }

        // A new session can start right away.
        manager.connect(&device()).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stream_fault_enters_failed() {
        let (radio, manager) = manager(MockRadio::new());
        let mut events = manager.subscribe_events();

        manager.connect(&device()).await.unwrap();
        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();

        assert!(radio.controller().fault("GATT error 0x85"));

        let fault = next_matching(&mut events, |e| matches!(e, LifecycleEvent::StreamFault { .. })).await;
        assert_eq!(
            fault,
            LifecycleEvent::StreamFault {
                device: "A".to_string(),
                reason: "GATT error 0x85".to_string(),
            }
        );
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(radio.controller().disconnect_count(), 1);

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_no_delivery_after_disconnect() {
        let (radio, manager) = manager(MockRadio::new());
        let mut records = record_sink(&manager);
        let controller = radio.controller();

        manager.connect(&device()).await.unwrap();
        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();
        manager.disconnect().await.unwrap();

        assert!(!controller.notify_sensor(&b"{\"late\": true}"[..]));
        let late = tokio::time::timeout(Duration::from_millis(50), records.recv()).await;
        assert!(!matches!(late, Ok(Some(_))));
        assert_eq!(manager.channel().stats().delivered, 0);
    }

    /// Blocks inside `decode` long enough for a disconnect to start.
    struct SlowDecoder {
        started: Arc<AtomicBool>,
        delay: Duration,
    }

    impl PayloadDecoder for SlowDecoder {
        fn decode(&self, payload: &[u8]) -> std::result::Result<Map<String, Value>, DecodeError> {
            self.started.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            JsonDecoder.decode(payload)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_in_flight_during_disconnect_is_not_delivered() {
        let started = Arc::new(AtomicBool::new(false));
        let radio = Arc::new(MockRadio::new());
        let channel = Arc::new(NotificationChannel::with_decoder(SlowDecoder {
            started: started.clone(),
            delay: Duration::from_millis(300),
        }));
        let manager = ConnectionManager::new(radio.clone(), channel.clone(), Duration::from_secs(1), 16);

        let returned = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicBool::new(false));
        {
            let returned = returned.clone();
            let delivered = delivered.clone();
            let late = late.clone();
            channel.set_consumer(move |_record: SensorRecord| {
                delivered.fetch_add(1, Ordering::SeqCst);
                if returned.load(Ordering::SeqCst) {
                    late.store(true, Ordering::SeqCst);
                }
            });
        }

        manager.connect(&device()).await.unwrap();
        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();
        assert!(radio.controller().notify_sensor(&br#"{"t": 1}"#[..]));

        tokio::time::timeout(WAIT, async {
            while !started.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.disconnect().await.unwrap();
        returned.store(true, Ordering::SeqCst);
        assert_eq!(manager.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!late.load(Ordering::SeqCst));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(channel.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_lost_link_released_before_idle() {
        let (radio, manager) = manager(MockRadio::new());
        let controller = radio.controller();
        let mut events = manager.subscribe_events();

        manager.connect(&device()).await.unwrap();
        manager.subscribe(SENSOR_DATA_CHARACTERISTIC_UUID).await.unwrap();
        assert!(controller.drop_connection());

        next_matching(&mut events, |e| {
            matches!(
                e,
                LifecycleEvent::StateChanged {
                    from: ConnectionState::Streaming,
                    to: ConnectionState::Idle,
                }
            )
        })
        .await;
        assert_eq!(controller.disconnect_count(), 1);
    }
}
