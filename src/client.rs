//! High-level sensor client.
//!
//! [`SensorClient`] ties discovery, the connection state machine and the
//! notification pipeline into one session: scan, pick a device, connect,
//! subscribe, stream until told to stop, then disconnect.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ble::connection::{ConnectionManager, ConnectionState, LifecycleEvent};
use crate::ble::platform::BtleplugRadio;
use crate::ble::scanner::{DeviceDiscovery, DeviceFilter, DeviceSelector, FirstMatch, NameContains};
use crate::ble::transport::{DeviceHandle, Radio};
use crate::config::ClientConfig;
use crate::data::PayloadDecoder;
use crate::error::{Error, Result};
use crate::notification::{ChannelStats, NotificationChannel, RecordConsumer};

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The shutdown signal fired and the client disconnected.
    Shutdown,
    /// The peripheral dropped the connection. The client is `Idle` and
    /// may be run again.
    ConnectionLost,
}

/// Client for one ESP32 sensor peripheral.
pub struct SensorClient<R: Radio> {
    /// Configuration.
    config: ClientConfig,
    /// Scanner.
    discovery: DeviceDiscovery<R>,
    /// Connection state machine.
    manager: ConnectionManager<R>,
    /// Decode and delivery pipeline, shared with the manager.
    channel: Arc<NotificationChannel>,
    /// Which scanned devices are candidates.
    filter: Box<dyn DeviceFilter>,
    /// Which candidate to connect to.
    selector: Box<dyn DeviceSelector>,
}

impl SensorClient<BtleplugRadio> {
    /// Create a client on the system's Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or the
    /// configuration is invalid.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let radio = BtleplugRadio::new().await?;
        Self::with_radio(radio, config)
    }
}

impl<R: Radio> SensorClient<R> {
    /// Create a client on a specific radio.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the configuration is invalid.
    pub fn with_radio(radio: R, config: ClientConfig) -> Result<Self> {
        Self::with_channel(radio, config, NotificationChannel::new())
    }

    /// Create a client with a preconfigured notification channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the configuration is invalid.
    pub fn with_channel(
        radio: R,
        config: ClientConfig,
        channel: NotificationChannel,
    ) -> Result<Self> {
        config.validate()?;

        let radio = Arc::new(radio);
        let channel = Arc::new(channel);
        let manager = ConnectionManager::new(
            radio.clone(),
            channel.clone(),
            config.connect_timeout,
            config.event_capacity,
        );

        Ok(Self {
            filter: Box::new(NameContains::new(config.name_pattern.clone())),
            selector: Box::new(FirstMatch),
            discovery: DeviceDiscovery::new(radio),
            manager,
            channel,
            config,
        })
    }

    /// Replace the device filter.
    pub fn with_filter(mut self, filter: impl DeviceFilter + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    /// Replace the device selection strategy.
    pub fn with_selector(mut self, selector: impl DeviceSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// The connected device, if any.
    pub fn connected_device(&self) -> Option<DeviceHandle> {
        self.manager.device()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.manager.subscribe_events()
    }

    /// Register the record consumer. May be called at any time.
    pub fn set_consumer(&self, consumer: impl RecordConsumer + 'static) {
        self.channel.set_consumer(consumer);
    }

    /// Remove the record consumer.
    pub fn clear_consumer(&self) {
        self.channel.clear_consumer();
    }

    /// Replace the payload decoder.
    pub fn set_decoder(&self, decoder: impl PayloadDecoder + 'static) {
        self.channel.set_decoder(decoder);
    }

    /// Delivery counters.
    pub fn stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    /// Scan with the configured filter and timeout.
    pub async fn scan(&self) -> Result<Vec<DeviceHandle>> {
        self.discovery
            .scan(self.filter.as_ref(), self.config.scan_timeout)
            .await
    }

    /// Connect to `device` and start streaming.
    ///
    /// On failure the manager is returned to `Idle` before the error is
    /// surfaced.
    pub async fn start(&self, device: &DeviceHandle) -> Result<()> {
        if let Err(e) = self.manager.connect(device).await {
            self.abandon().await;
            return Err(e);
        }

        if let Err(e) = self.manager.subscribe(self.config.characteristic).await {
            self.abandon().await;
            return Err(e);
        }

        Ok(())
    }

    /// Disconnect. A no-op when idle.
    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    /// Run one session until Ctrl-C or connection loss.
    pub async fn run(&self) -> Result<SessionOutcome> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                futures::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run one session until `shutdown` resolves or the connection is lost.
    ///
    /// Scans, selects a device, connects once, subscribes, streams, and
    /// disconnects when `shutdown` fires. Reconnecting after
    /// [`SessionOutcome::ConnectionLost`] is up to the caller.
    ///
    /// # Errors
    ///
    /// - [`Error::RadioUnavailable`] if scanning is impossible.
    /// - [`Error::NoMatchingDevice`] if the scan found no candidate.
    /// - [`Error::ConnectFailed`] or [`Error::SubscribeFailed`] if the
    ///   session could not be established.
    /// - [`Error::StreamFailed`] if the transport failed mid-stream.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut events = self.manager.subscribe_events();

        let candidates = tokio::select! {
            result = self.scan() => result?,
            _ = &mut shutdown => {
                info!("Shutdown requested during scan");
                return Ok(SessionOutcome::Shutdown);
            }
        };

        let device = self
            .selector
            .select(&candidates)
            .ok_or_else(|| Error::NoMatchingDevice {
                filter: self.filter.describe(),
            })?;

        info!("Selected {}", device);

        {
            let connect = self.manager.connect(&device);
            tokio::pin!(connect);

            let result = tokio::select! {
                result = &mut connect => result,
                _ = &mut shutdown => {
                    info!("Shutdown requested while connecting");
                    self.manager.disconnect().await?;
                    match connect.await {
                        Ok(()) => self.manager.disconnect().await?,
                        Err(Error::Cancelled) => {}
                        Err(e) => debug!("Connect ended after shutdown: {}", e),
                    }
                    self.abandon().await;
                    return Ok(SessionOutcome::Shutdown);
                }
            };

            if let Err(e) = result {
                self.abandon().await;
                return Err(e);
            }
        }

        if let Err(e) = self.manager.subscribe(self.config.characteristic).await {
            self.abandon().await;
            return Err(e);
        }

        info!("Streaming from {}", device);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, disconnecting from {}", device);
                    self.manager.disconnect().await?;
                    return Ok(SessionOutcome::Shutdown);
                }
                event = events.recv() => match event {
                    Ok(LifecycleEvent::ConnectionLost { .. }) => {
                        return Ok(SessionOutcome::ConnectionLost);
                    }
                    Ok(LifecycleEvent::StreamFault { reason, .. }) => {
                        self.abandon().await;
                        return Err(Error::StreamFailed { reason });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} lifecycle events", skipped);
                        match self.state() {
                            ConnectionState::Streaming => {}
                            ConnectionState::Failed => {
                                self.abandon().await;
                                return Err(Error::StreamFailed {
                                    reason: "transport fault".to_string(),
                                });
                            }
                            _ => return Ok(SessionOutcome::ConnectionLost),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Ok(SessionOutcome::ConnectionLost);
                    }
                }
            }
        }
    }

    /// Return to `Idle` after a failure, logging teardown errors.
    async fn abandon(&self) {
        if let Err(e) = self.manager.disconnect().await {
            warn!("Error during teardown: {}", e);
        }
    }
}

impl<R: Radio> std::fmt::Debug for SensorClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorClient")
            .field("filter", &self.filter.describe())
            .field("state", &self.state())
            .field("connected", &self.state().is_connected())
            .field("device", &self.connected_device())
            .finish()
    }
}
