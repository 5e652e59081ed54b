//! A synthetic oximeter behind the [`BleCentral`] interface.
//!
//! `SimulatedCentral` advertises the configured target together with a few
//! unrelated "noise" devices, accepts connections to any of them, and on the
//! target streams frames at the real device rate:
//!
//! | Signal | Model |
//! |---|---|
//! | Pulse | `pulse_bpm`; the reported rate drifts ±3 bpm |
//! | Plethysmogram | skewed sine per beat, 0–127 |
//! | SpO₂ | `spo2`, ±1 % drift |
//! | Pulse beep | set on the first frame of every beat |
//!
//! Frames are packed into notifications of `mtu` bytes, so frame boundaries
//! do not line up with notification boundaries, the same as on the wire.
//! The output is a pure function of elapsed frame count: two runs with the
//! same configuration produce the same bytes.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::central::{AdvertisementCallback, BleCentral, NotificationSink, ScanStop};
use crate::error::BleError;
use crate::protocol::{
    DEFAULT_NOTIFICATION_MTU, FRAME_LEN, FRAME_RATE_HZ, MARKER_BIT, RX_CHARACTERISTIC,
    TRANSPARENT_UART_SERVICE, TX_CHARACTERISTIC,
};
use crate::types::{Advertisement, Reading};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Address of the simulated oximeter.
    pub target_address: String,
    /// Additional advertisers without the UART service.
    pub noise_addresses: Vec<String>,
    /// Interval between advertisement rounds.  Default: 100 ms.
    pub advertise_interval: Duration,
    /// Bytes per notification.  Default: 20.
    pub mtu: usize,
    /// Mean pulse rate.  Default: 72 bpm.
    pub pulse_bpm: f64,
    /// Mean saturation.  Default: 97 %.
    pub spo2: u8,
    /// Drop the link after this many frames, to exercise reconnection.
    /// `None` streams until disconnected.
    pub frames_per_link: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            target_address: "00:A0:50:C8:E7:31".into(),
            noise_addresses: vec!["11:22:33:44:55:66".into(), "C0:FF:EE:00:00:01".into()],
            advertise_interval: Duration::from_millis(100),
            mtu: DEFAULT_NOTIFICATION_MTU,
            pulse_bpm: 72.0,
            spo2: 97,
            frames_per_link: None,
        }
    }
}

// ── Signal model ──────────────────────────────────────────────────────────────

/// Synthetic reading for frame number `n`.
pub fn sim_reading(config: &SimConfig, n: u64) -> Reading {
    let t = n as f64 / FRAME_RATE_HZ;
    // The waveform beats at the mean rate; only the reported rate drifts.
    let bpm = config.pulse_bpm + 3.0 * (2.0 * PI * t / 40.0).sin();
    let frames_per_beat = (FRAME_RATE_HZ * 60.0 / config.pulse_bpm.max(1.0))
        .round()
        .max(1.0) as u64;
    let phase = (n % frames_per_beat) as f64 / frames_per_beat as f64;

    // Fast systolic upstroke, slower diastolic decay.
    let wave = if phase < 0.3 {
        (phase / 0.3 * PI / 2.0).sin()
    } else {
        ((1.0 - phase) / 0.7 * PI / 2.0).sin().powi(2)
    };
    let pleth = (10.0 + wave * 110.0).round() as u8;

    let spo2 = (f64::from(config.spo2) + (2.0 * PI * t / 90.0).sin()).round();
    Reading {
        signal_strength: 4,
        pulse_beep: n % frames_per_beat == 0,
        plethysmograph: pleth,
        bar_graph: (wave * 7.0).round() as u8,
        pulse_rate: bpm.round().clamp(0.0, 255.0) as u8,
        spo2: spo2.clamp(0.0, 100.0) as u8,
        ..Reading::default()
    }
}

/// Wire encoding of `reading`.  Inverse of [`crate::parse::decode_bytes`]
/// for readings whose 8-bit fields fit in 7 bits (pulse rate excepted).
pub fn encode_reading(r: &Reading) -> [u8; FRAME_LEN] {
    let flag = |set: bool, bit: u8| if set { 1 << bit } else { 0 };
    [
        MARKER_BIT
            | (r.signal_strength & 0x07)
            | flag(r.no_signal, 4)
            | flag(r.probe_unplugged, 5)
            | flag(r.pulse_beep, 6),
        r.plethysmograph & 0x7F,
        (r.bar_graph & 0x07)
            | flag(r.no_finger, 4)
            | flag(r.pulse_research, 5)
            | ((r.pulse_rate & 0x80) >> 1),
        r.pulse_rate & 0x7F,
        r.spo2 & 0x7F,
    ]
}

// ── Handles ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimDevice {
    pub address: String,
    is_target: bool,
    link: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct SimService {
    pub uuid: Uuid,
    link: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct SimCharacteristic {
    pub uuid: Uuid,
    link: CancellationToken,
}

// ── Central ───────────────────────────────────────────────────────────────────

pub struct SimulatedCentral {
    config: SimConfig,
    enabled: AtomicBool,
    scan: ScanStop,
}

impl SimulatedCentral {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            enabled: AtomicBool::new(false),
            scan: ScanStop::default(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn ensure_enabled(&self) -> Result<(), BleError> {
        if self.enabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::AdapterNotEnabled)
        }
    }

    fn advertisements(&self) -> Vec<Advertisement> {
        let target = Advertisement {
            address: Some(self.config.target_address.clone()),
            local_name: Some("BerryMed".into()),
            rssi: Some(-58),
            services: vec![TRANSPARENT_UART_SERVICE],
        };
        let noise = self.config.noise_addresses.iter().map(|a| Advertisement {
            rssi: Some(-80),
            ..Advertisement::with_address(a.clone())
        });
        std::iter::once(target).chain(noise).collect()
    }
}

#[async_trait]
impl BleCentral for SimulatedCentral {
    type Device = SimDevice;
    type Service = SimService;
    type Characteristic = SimCharacteristic;

    async fn enable_adapter(&self) -> Result<(), BleError> {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("sim: adapter enabled");
        }
        Ok(())
    }

    async fn scan(&self, on_advertisement: AdvertisementCallback) -> Result<(), BleError> {
        let Some(stop) = self.scan.begin() else {
            return Ok(());
        };
        self.ensure_enabled()?;

        let mut ticker = tokio::time::interval(self.config.advertise_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    for adv in self.advertisements() {
                        on_advertisement(adv);
                    }
                }
            }
        }
        debug!("sim: scan stopped");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scan.stop();
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<SimDevice, BleError> {
        self.ensure_enabled()?;
        let is_target = self.config.target_address.eq_ignore_ascii_case(address);
        let known = is_target
            || self
                .config
                .noise_addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(address));
        if !known {
            return Err(BleError::UnknownDevice(address.to_owned()));
        }
        info!("sim: connected to {address}");
        Ok(SimDevice {
            address: address.to_owned(),
            is_target,
            link: CancellationToken::new(),
        })
    }

    async fn disconnect(&self, device: &SimDevice) -> Result<(), BleError> {
        device.link.cancel();
        debug!("sim: disconnected from {}", device.address);
        Ok(())
    }

    async fn discover_services(
        &self,
        device: &SimDevice,
        uuids: &[Uuid],
    ) -> Result<Vec<SimService>, BleError> {
        if !device.is_target {
            return Ok(Vec::new());
        }
        Ok(uuids
            .iter()
            .filter(|u| **u == TRANSPARENT_UART_SERVICE)
            .map(|&uuid| SimService {
                uuid,
                link: device.link.clone(),
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &SimService,
        uuids: &[Uuid],
    ) -> Result<Vec<SimCharacteristic>, BleError> {
        Ok(uuids
            .iter()
            .filter(|u| **u == TX_CHARACTERISTIC || **u == RX_CHARACTERISTIC)
            .map(|&uuid| SimCharacteristic {
                uuid,
                link: service.link.clone(),
            })
            .collect())
    }

    async fn enable_notifications(
        &self,
        characteristic: &SimCharacteristic,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<(), BleError> {
        if characteristic.uuid != TX_CHARACTERISTIC {
            return Err(BleError::Other(format!(
                "characteristic {} does not notify",
                characteristic.uuid
            )));
        }
        if characteristic.link.is_cancelled() {
            return Err(BleError::Other("not connected".into()));
        }

        let config = self.config.clone();
        let link = characteristic.link.clone();
        tokio::spawn(async move {
            let mtu = config.mtu.max(1);
            let mut ticker =
                tokio::time::interval(Duration::from_secs_f64(1.0 / FRAME_RATE_HZ));
            let mut pending: Vec<u8> = Vec::with_capacity(mtu + FRAME_LEN);
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = link.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if config.frames_per_link.is_some_and(|limit| n >= limit) {
                    info!("sim: dropping link after {n} frames");
                    break;
                }
                pending.extend_from_slice(&encode_reading(&sim_reading(&config, n)));
                n += 1;
                while pending.len() >= mtu {
                    let chunk: Vec<u8> = pending.drain(..mtu).collect();
                    sink.notify(&chunk).await;
                }
            }
            sink.closed();
        });
        Ok(())
    }
}
