//! Device discovery.
//!
//! Runs a time-bounded scan and returns the peripherals that satisfy a
//! [`DeviceFilter`], in the order they were first seen.

use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{DeviceHandle, Radio};
use crate::error::{Error, Result};

/// Upper bound on stopping the scan once the window has closed.
pub const STOP_SCAN_TIMEOUT: Duration = Duration::from_millis(500);

/// Decides whether a scanned device is a candidate.
pub trait DeviceFilter: Send + Sync {
    /// Check a device.
    fn matches(&self, device: &DeviceHandle) -> bool;

    /// Human-readable description used in logs and errors.
    fn describe(&self) -> String {
        "custom filter".to_string()
    }
}

impl<F> DeviceFilter for F
where
    F: Fn(&DeviceHandle) -> bool + Send + Sync,
{
    fn matches(&self, device: &DeviceHandle) -> bool {
        self(device)
    }
}

/// Matches devices whose advertised name contains a substring.
///
/// Devices that advertise no name never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameContains(pub String);

impl NameContains {
    /// Create a new name filter.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }
}

impl DeviceFilter for NameContains {
    fn matches(&self, device: &DeviceHandle) -> bool {
        device
            .name
            .as_ref()
            .map(|n| n.contains(self.0.as_str()))
            .unwrap_or(false)
    }

    fn describe(&self) -> String {
        format!("name containing \"{}\"", self.0)
    }
}

/// Matches devices advertising a service UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisesService(pub Uuid);

impl DeviceFilter for AdvertisesService {
    fn matches(&self, device: &DeviceHandle) -> bool {
        device.services.contains(&self.0)
    }

    fn describe(&self) -> String {
        format!("service {}", self.0)
    }
}

/// Picks the device to connect to from the scan result.
pub trait DeviceSelector: Send + Sync {
    /// Choose one candidate, or none.
    fn select(&self, candidates: &[DeviceHandle]) -> Option<DeviceHandle>;
}

impl<F> DeviceSelector for F
where
    F: Fn(&[DeviceHandle]) -> Option<DeviceHandle> + Send + Sync,
{
    fn select(&self, candidates: &[DeviceHandle]) -> Option<DeviceHandle> {
        self(candidates)
    }
}

/// Selects the first device discovered.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMatch;

impl DeviceSelector for FirstMatch {
    fn select(&self, candidates: &[DeviceHandle]) -> Option<DeviceHandle> {
        candidates.first().cloned()
    }
}

/// Selects the device with the strongest signal.
///
/// Ties go to the device discovered first.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrongestSignal;

impl DeviceSelector for StrongestSignal {
    fn select(&self, candidates: &[DeviceHandle]) -> Option<DeviceHandle> {
        candidates
            .iter()
            .rev()
            .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
            .cloned()
    }
}

/// Scans for devices through a [`Radio`].
pub struct DeviceDiscovery<R: Radio> {
    radio: Arc<R>,
}

impl<R: Radio> DeviceDiscovery<R> {
    /// Create a discovery helper over a radio.
    pub fn new(radio: Arc<R>) -> Self {
        Self { radio }
    }

    /// Scan for `timeout` and return matching devices in discovery order.
    ///
    /// Returns an empty list when nothing matches. Stopping the scan is
    /// bounded by [`STOP_SCAN_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if the scan cannot be started.
    pub async fn scan(
        &self,
        filter: &dyn DeviceFilter,
        timeout: Duration,
    ) -> Result<Vec<DeviceHandle>> {
        info!("Scanning for {:?} for devices with {}", timeout, filter.describe());

        let mut advertisements = self.radio.start_scan().await.map_err(|e| match e {
            Error::RadioUnavailable { .. } => e,
            other => Error::RadioUnavailable {
                reason: other.to_string(),
            },
        })?;

        let deadline = Instant::now() + timeout;
        let mut seen: Vec<DeviceHandle> = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, advertisements.next()).await {
                Ok(Some(advertisement)) => {
                    trace!("Advertisement: {}", advertisement);
                    match seen.iter_mut().find(|d| d.id == advertisement.id) {
                        Some(known) => known.merge(advertisement),
                        None => seen.push(advertisement),
                    }
                }
                Ok(None) => {
                    debug!("Advertisement stream ended before the scan window closed");
                    break;
                }
                Err(_) => break,
            }
        }

        drop(advertisements);

        match tokio::time::timeout(STOP_SCAN_TIMEOUT, self.radio.stop_scan()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to stop scan: {}", e),
            Err(_) => warn!("Stopping the scan took longer than {:?}", STOP_SCAN_TIMEOUT),
        }

        let total = seen.len();
        let matches: Vec<DeviceHandle> = seen.into_iter().filter(|d| filter.matches(d)).collect();

        info!("Scan finished: {} device(s) seen, {} matched", total, matches.len());

        Ok(matches)
    }
}
