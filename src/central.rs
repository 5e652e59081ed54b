//! The BLE capability surface consumed by discovery and the session
//! supervisor.
//!
//! Nothing in the core holds a process-wide adapter handle; every component
//! receives an `Arc<C: BleCentral>` so tests can substitute a scripted double.
//! The crate ships two implementations:
//!
//! | Type | Module | Backend |
//! |---|---|---|
//! | [`crate::btle::BtleplugCentral`] | `btle` | real radio via btleplug |
//! | [`crate::sim::SimulatedCentral`] | `sim` | synthetic oximeter, no hardware |

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::BleError;
use crate::types::Advertisement;

/// Callback invoked by [`BleCentral::scan`] for every received advertisement.
///
/// Runs on the collaborator's own task and must not block.
pub type AdvertisementCallback = Box<dyn Fn(Advertisement) + Send + Sync>;

/// Receiver of characteristic notifications.
///
/// The collaborator awaits [`NotificationSink::notify`] for each payload in
/// arrival order, so a sink that suspends applies backpressure to the
/// notification stream instead of dropping data.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification payload.
    async fn notify(&self, data: &[u8]);

    /// The link carrying the notifications has gone away.
    fn closed(&self);
}

/// Abstract BLE central role.
#[async_trait]
pub trait BleCentral: Send + Sync + 'static {
    /// A connected peripheral.
    type Device: Send + Sync + 'static;
    /// A discovered GATT service.
    type Service: Send + Sync + 'static;
    /// A discovered GATT characteristic.
    type Characteristic: Send + Sync + 'static;

    /// Power up / acquire the local adapter.  Must succeed before any other
    /// call.
    async fn enable_adapter(&self) -> Result<(), BleError>;

    /// Start scanning and invoke `on_advertisement` for every beacon.
    ///
    /// Resolves once [`BleCentral::stop_scan`] has been called, or with an
    /// error if the scan could not be started.
    async fn scan(&self, on_advertisement: AdvertisementCallback) -> Result<(), BleError>;

    /// Stop a running scan.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Connect to the peripheral with the given address.
    async fn connect(&self, address: &str) -> Result<Self::Device, BleError>;

    /// Disconnect a peripheral returned by [`BleCentral::connect`].
    async fn disconnect(&self, device: &Self::Device) -> Result<(), BleError>;

    /// Return the services of `device` whose UUID is in `uuids`, in the order
    /// of `uuids`.  An empty result means none were found.
    async fn discover_services(
        &self,
        device: &Self::Device,
        uuids: &[Uuid],
    ) -> Result<Vec<Self::Service>, BleError>;

    /// Return the characteristics of `service` whose UUID is in `uuids`, in
    /// the order of `uuids`.
    async fn discover_characteristics(
        &self,
        service: &Self::Service,
        uuids: &[Uuid],
    ) -> Result<Vec<Self::Characteristic>, BleError>;

    /// Subscribe to `characteristic` and feed every notification to `sink`
    /// until the link drops, then call [`NotificationSink::closed`].
    async fn enable_notifications(
        &self,
        characteristic: &Self::Characteristic,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<(), BleError>;
}

// ── Scan stop hand-off ────────────────────────────────────────────────────────

/// Pairs a running [`BleCentral::scan`] with the [`BleCentral::stop_scan`]
/// that ends it.
///
/// A stop that lands before the scan has registered is remembered, and the
/// next [`ScanStop::begin`] consumes it instead of starting.
#[derive(Default)]
pub(crate) struct ScanStop {
    slot: Mutex<(Option<CancellationToken>, bool)>,
}

impl ScanStop {
    /// Register a scan.  `None` means a stop is already pending.
    ///
    /// Call this first in `scan`, before any fallible step: the discovery
    /// teardown calls `stop_scan` even when `scan` failed.
    pub(crate) fn begin(&self) -> Option<CancellationToken> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if std::mem::take(&mut slot.1) {
            return None;
        }
        let token = CancellationToken::new();
        slot.0 = Some(token.clone());
        Some(token)
    }

    pub(crate) fn stop(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.0.take() {
            Some(token) => token.cancel(),
            None => slot.1 = true,
        }
    }
}
