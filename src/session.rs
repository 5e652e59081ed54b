//! The session supervisor: scan → connect → stream → teardown, forever.
//!
//! ```text
//!   ┌────────▶ Idle ──▶ Scanning ──(match)──▶ Connecting ──(ok)──▶ Streaming
//!   │            ▲          │ deadline            │ error              │ inactivity /
//!   │            └──backoff─┘                     ▼                    │ link closed
//!   └──────────────────────────────────────── Teardown ◀───────────────┘
//! ```
//!
//! Cancelling the token passed to [`Supervisor::run`] forces `Teardown` from
//! any state and ends the loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::{ByteSource, RingBuffer};
use crate::central::BleCentral;
use crate::discovery::{match_address, start_discovery};
use crate::error::{BleError, SessionError};
use crate::output::ReadingSink;
use crate::parse::{decode_reading, spawn_frame_parser};
use crate::protocol::{
    DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_RING_CAPACITY, DEFAULT_SCAN_DEADLINE,
    TRANSPARENT_UART_SERVICE, UART_CHARACTERISTICS,
};
use crate::types::{Frame, ReadingRecord};

// ── Configuration ─────────────────────────────────────────────────────────────

/// What to do when the Bluetooth adapter cannot be enabled or a scan cannot
/// be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterPolicy {
    /// Return the error from [`Supervisor::run`].  For interactive use.
    #[default]
    Fatal,
    /// Log and retry every `adapter_retry_interval`, indefinitely.  For
    /// unattended deployments with nobody to restart the process.
    Retry,
}

/// Configuration for [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// MAC address of the oximeter (`AA:BB:CC:DD:EE:FF`, any case).
    pub target_address: String,
    /// How long one discovery pass may run.  Default: 2 s.
    pub scan_deadline: Duration,
    /// Streaming is torn down when no frame arrives for this long.
    /// Default: 2 s.
    pub inactivity_timeout: Duration,
    /// Size of the notification ring buffer.  Default: 1024 bytes.
    pub ring_capacity: usize,
    /// Pause after a discovery pass that found nothing.  Default: 1 s.
    pub rescan_backoff: Duration,
    /// Pause after a session ends or fails to start.  Default: 1 s.
    pub session_backoff: Duration,
    /// Upper bound on a single connect call.  Default: 10 s.
    pub connect_timeout: Duration,
    pub adapter_policy: AdapterPolicy,
    /// Retry interval under [`AdapterPolicy::Retry`].  Default: 2 s.
    pub adapter_retry_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            target_address: String::new(),
            scan_deadline: DEFAULT_SCAN_DEADLINE,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            ring_capacity: DEFAULT_RING_CAPACITY,
            rescan_backoff: Duration::from_secs(1),
            session_backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            adapter_policy: AdapterPolicy::Fatal,
            adapter_retry_interval: Duration::from_secs(2),
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Streaming,
    Teardown,
}

/// Running counters, logged after every session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Discovery passes started.
    pub scans: u64,
    /// Discovery passes that ended without a match.
    pub scan_misses: u64,
    /// Connection attempts that failed before streaming.
    pub connect_failures: u64,
    /// Sessions that reached `Streaming`.
    pub sessions: u64,
    /// Readings forwarded to the sink.
    pub readings: u64,
    /// Sessions ended by the inactivity timer.
    pub inactivity_timeouts: u64,
    /// Sessions ended because the link closed.
    pub link_losses: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scans={} misses={} connect_failures={} sessions={} readings={} \
             inactivity_timeouts={} link_losses={}",
            self.scans,
            self.scan_misses,
            self.connect_failures,
            self.sessions,
            self.readings,
            self.inactivity_timeouts,
            self.link_losses
        )
    }
}

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Cancelled,
    Inactive,
    LinkClosed,
}

/// A connected device with its notification bridge.
struct Link<D> {
    address: String,
    device: D,
    ring: Arc<RingBuffer>,
    parser: CancellationToken,
}

enum ScanOutcome {
    Found(String),
    NotFound,
    Failed(BleError),
    Cancelled,
}

// ── Streaming helper ──────────────────────────────────────────────────────────

/// Decode frames from `frames` and forward them to `sink` until the channel
/// closes, `cancel` fires, or (when `inactivity` is set) no frame arrives
/// within that window.
///
/// `on_reading` is called after every forwarded reading.
pub async fn forward_readings<S: ReadingSink>(
    frames: &mut mpsc::Receiver<Frame>,
    sink: &mut S,
    inactivity: Option<Duration>,
    cancel: &CancellationToken,
    mut on_reading: impl FnMut(),
) -> Result<StreamEnd, SessionError> {
    // Without an inactivity window the timer is parked far in the future.
    let window = inactivity.unwrap_or(Duration::from_secs(86_400 * 365));
    let idle = tokio::time::sleep(window);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let reading = decode_reading(&frame);
                    sink.emit(&ReadingRecord::new(&frame, &reading))?;
                    on_reading();
                    idle.as_mut().reset(Instant::now() + window);
                }
                None => return Ok(StreamEnd::LinkClosed),
            },
            _ = &mut idle, if inactivity.is_some() => return Ok(StreamEnd::Inactive),
        }
    }
}

/// Sleep for `duration` unless cancelled first.  Returns `false` if cancelled.
async fn backoff(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Owns the scan → connect → stream loop for one target device.
pub struct Supervisor<C, S> {
    central: Arc<C>,
    sink: S,
    config: SupervisorConfig,
    state: watch::Sender<SessionState>,
    stats: SessionStats,
}

impl<C, S> Supervisor<C, S>
where
    C: BleCentral,
    S: ReadingSink,
{
    pub fn new(central: Arc<C>, sink: S, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            central,
            sink,
            config,
            state,
            stats: SessionStats::default(),
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Give back the sink, e.g. to inspect buffered output.
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("session: {prev:?} -> {next:?}");
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Returns an error only for failures the loop cannot recover from: an
    /// adapter failure under [`AdapterPolicy::Fatal`], or a sink error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SessionError> {
        info!(
            "supervisor: target {} (scan deadline {:?}, inactivity timeout {:?})",
            self.config.target_address, self.config.scan_deadline, self.config.inactivity_timeout
        );

        let result = self.run_sessions(&cancel).await;
        self.set_state(SessionState::Idle);
        info!("supervisor: stopped ({})", self.stats);
        result
    }

    async fn run_sessions(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        if !self.enable_adapter(cancel).await? {
            return Ok(());
        }

        while !cancel.is_cancelled() {
            self.set_state(SessionState::Idle);

            let address = match self.scan_once(cancel).await {
                ScanOutcome::Found(address) => address,
                ScanOutcome::Cancelled => break,
                ScanOutcome::NotFound => {
                    self.stats.scan_misses += 1;
                    backoff(self.config.rescan_backoff, cancel).await;
                    continue;
                }
                ScanOutcome::Failed(e) => match self.config.adapter_policy {
                    AdapterPolicy::Fatal => return Err(SessionError::Adapter(e)),
                    AdapterPolicy::Retry => {
                        error!("scanning error: {e}");
                        backoff(self.config.adapter_retry_interval, cancel).await;
                        continue;
                    }
                },
            };

            self.set_state(SessionState::Connecting);
            let link = match self.open_uart(&address, cancel).await {
                Ok(Some(link)) => link,
                Ok(None) => break,
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => {
                    warn!("{e}");
                    self.stats.connect_failures += 1;
                    backoff(self.config.session_backoff, cancel).await;
                    continue;
                }
            };

            self.stats.sessions += 1;
            info!("session: streaming from {address}");
            self.set_state(SessionState::Streaming);
            let ended = self.stream(&link, cancel).await;

            self.teardown(link).await;
            match ended? {
                StreamEnd::Cancelled => break,
                StreamEnd::Inactive => {
                    self.stats.inactivity_timeouts += 1;
                    info!(
                        "session: no frame from {address} for {:?}, link dropped",
                        self.config.inactivity_timeout
                    );
                }
                StreamEnd::LinkClosed => {
                    self.stats.link_losses += 1;
                    info!("session: link to {address} closed");
                }
            }
            backoff(self.config.session_backoff, cancel).await;
        }

        Ok(())
    }

    /// Returns `Ok(false)` if cancelled before the adapter came up.
    async fn enable_adapter(&self, cancel: &CancellationToken) -> Result<bool, SessionError> {
        loop {
            let enabled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(false),
                enabled = self.central.enable_adapter() => enabled,
            };
            match enabled {
                Ok(()) => {
                    info!("initialized bluetooth stack");
                    return Ok(true);
                }
                Err(e) => match self.config.adapter_policy {
                    AdapterPolicy::Fatal => return Err(SessionError::Adapter(e)),
                    AdapterPolicy::Retry => {
                        error!("unable to initialize bluetooth stack: {e}");
                        if !backoff(self.config.adapter_retry_interval, cancel).await {
                            return Ok(false);
                        }
                    }
                },
            }
        }
    }

    async fn scan_once(&mut self, cancel: &CancellationToken) -> ScanOutcome {
        self.set_state(SessionState::Scanning);
        self.stats.scans += 1;
        debug!("scanning...");

        let scan_cancel = cancel.child_token();
        let mut results = start_discovery(
            Arc::clone(&self.central),
            match_address(self.config.target_address.clone()),
            scan_cancel.clone(),
        );

        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            found = tokio::time::timeout(self.config.scan_deadline, results.next()) => {
                found.ok().flatten()
            }
        };

        scan_cancel.cancel();
        let failure = results.take_err();
        if let Some(e) = results.wait_closed().await {
            debug!("discovery teardown reported: {e}");
        }

        if cancel.is_cancelled() {
            return ScanOutcome::Cancelled;
        }
        match (found.and_then(|adv| adv.address), failure) {
            (Some(address), _) => ScanOutcome::Found(address),
            (None, Some(e)) => ScanOutcome::Failed(e),
            (None, None) => {
                debug!(
                    "{} not seen within {:?}",
                    self.config.target_address, self.config.scan_deadline
                );
                ScanOutcome::NotFound
            }
        }
    }

    /// Connect, find the transparent UART and subscribe its TX characteristic
    /// into a fresh ring buffer.
    ///
    /// Returns `Ok(None)` if `cancel` fires first.  A device that was already
    /// connected at that point is disconnected again.
    async fn open_uart(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Link<C::Device>>, SessionError> {
        let timeout = self.config.connect_timeout;
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            connected = tokio::time::timeout(timeout, self.central.connect(address)) => connected,
        };
        let device = connected
            .map_err(|_| BleError::Timeout {
                operation: "connect",
                timeout,
            })
            .and_then(|connected| connected)
            .map_err(|source| SessionError::Connect {
                address: address.to_owned(),
                source,
            })?;

        let ring = Arc::new(RingBuffer::new(self.config.ring_capacity));
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            subscribed = self.subscribe_uart(&device, address, &ring) => Some(subscribed),
        };
        if let Some(Ok(())) = subscribed {
            return Ok(Some(Link {
                address: address.to_owned(),
                device,
                ring,
                parser: cancel.child_token(),
            }));
        }

        if subscribed.is_none() {
            self.set_state(SessionState::Teardown);
        }
        ring.close();
        if let Err(de) = self.central.disconnect(&device).await {
            debug!("disconnect after failed setup: {de}");
        }
        match subscribed {
            Some(Err(e)) => Err(e),
            _ => {
                info!("session: cancelled while connecting to {address}");
                Ok(None)
            }
        }
    }

    async fn subscribe_uart(
        &self,
        device: &C::Device,
        address: &str,
        ring: &Arc<RingBuffer>,
    ) -> Result<(), SessionError> {
        let service = self
            .central
            .discover_services(device, &[TRANSPARENT_UART_SERVICE])
            .await
            .map_err(|e| SessionError::ServiceDiscovery {
                address: address.to_owned(),
                source: Some(e),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::ServiceDiscovery {
                address: address.to_owned(),
                source: None,
            })?;

        let chars = self
            .central
            .discover_characteristics(&service, &UART_CHARACTERISTICS)
            .await
            .map_err(|e| SessionError::CharacteristicDiscovery {
                address: address.to_owned(),
                source: Some(e),
            })?;
        // Results follow the request order: TX, then RX.
        let mut chars = chars.into_iter();
        let (Some(tx), Some(_rx)) = (chars.next(), chars.next()) else {
            return Err(SessionError::CharacteristicDiscovery {
                address: address.to_owned(),
                source: None,
            });
        };

        self.central
            .enable_notifications(&tx, ring.clone())
            .await
            .map_err(|source| SessionError::NotificationSetup {
                address: address.to_owned(),
                source,
            })
    }

    async fn stream(
        &mut self,
        link: &Link<C::Device>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, SessionError> {
        let source: Arc<dyn ByteSource> = link.ring.clone();
        let mut frames = spawn_frame_parser(source, link.address.clone(), link.parser.clone());

        let readings = &mut self.stats.readings;
        forward_readings(
            &mut frames,
            &mut self.sink,
            Some(self.config.inactivity_timeout),
            cancel,
            || *readings += 1,
        )
        .await
    }

    async fn teardown(&mut self, link: Link<C::Device>) {
        self.set_state(SessionState::Teardown);
        link.parser.cancel();
        link.ring.close();
        if let Err(e) = self.central.disconnect(&link.device).await {
            warn!("disconnect from {} failed: {e}", link.address);
        }
        info!("session: {} closed ({})", link.address, self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_render_every_counter() {
        let stats = SessionStats {
            scans: 5,
            scan_misses: 2,
            connect_failures: 1,
            sessions: 2,
            readings: 480,
            inactivity_timeouts: 1,
            link_losses: 1,
        };
        assert_eq!(
            stats.to_string(),
            "scans=5 misses=2 connect_failures=1 sessions=2 readings=480 \
             inactivity_timeouts=1 link_losses=1"
        );
    }

    #[test]
    fn default_config_matches_protocol_timings() {
        let config = SupervisorConfig::default();
        assert_eq!(config.scan_deadline, DEFAULT_SCAN_DEADLINE);
        assert_eq!(config.inactivity_timeout, DEFAULT_INACTIVITY_TIMEOUT);
        assert_eq!(config.ring_capacity, DEFAULT_RING_CAPACITY);
        assert_eq!(config.adapter_policy, AdapterPolicy::Fatal);
    }
}
