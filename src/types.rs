use serde::Serialize;
use uuid::Uuid;

use crate::protocol::FRAME_LEN;

/// A BLE advertisement observed during a scan.
///
/// Produced once per received beacon by a [`crate::central::BleCentral`]
/// implementation and consumed by the discovery pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Stringified 48-bit MAC (`AA:BB:CC:DD:EE:FF`).
    ///
    /// `None` when the platform could not resolve an address for the
    /// advertiser (e.g. CoreBluetooth, which only exposes opaque UUIDs).
    /// Such advertisements are ignored by discovery.
    pub address: Option<String>,
    /// Advertised local name, if present.
    pub local_name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the advertisement payload.
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// Shorthand for an advertisement that carries only an address.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }
}

/// One complete 5-byte telemetry frame as it came off the wire.
///
/// `bytes[0]` always has its high bit set and `bytes[1..]` never do; the
/// framing state machine guarantees this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Nanoseconds since Unix epoch at which the last byte of the frame was
    /// stored.
    pub timestamp: u64,
    /// Identifier of the device the frame was read from (usually its MAC).
    pub device_id: String,
    /// Raw frame bytes.
    pub bytes: [u8; FRAME_LEN],
}

/// A decoded oximeter frame.
///
/// Produced by [`crate::parse::decode_reading`]; every field is a direct bit
/// slice of the frame so any 5-byte input yields a value, plausible or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Reading {
    /// Probe signal strength, 0–7.
    pub signal_strength: u8,
    /// Device reports no usable signal.
    pub no_signal: bool,
    /// Probe cable is unplugged.
    pub probe_unplugged: bool,
    /// Set on the frame that coincides with a detected pulse.
    pub pulse_beep: bool,
    /// Plethysmogram sample, 0–255 (the only waveform channel).
    pub plethysmograph: u8,
    /// Pulse-intensity bar graph, 0–7.
    pub bar_graph: u8,
    /// No finger in the probe.
    pub no_finger: bool,
    /// Device is still searching for a pulse.
    pub pulse_research: bool,
    /// Pulse rate in beats per minute, 0–255.
    pub pulse_rate: u8,
    /// Oxygen saturation in percent, 0–255 (values above 100 are sentinels).
    pub spo2: u8,
}

/// One output record: a decoded reading with its timestamp and origin.
///
/// Field names are the wire names used by the JSON and CSV sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingRecord {
    /// Nanoseconds since Unix epoch.
    pub ts: u64,
    pub device_id: String,
    pub signal_strength: u8,
    pub no_signal: bool,
    pub probe_unplugged: bool,
    pub pulse_beep: bool,
    pub pleth: u8,
    pub bar_graph: u8,
    pub no_finger: bool,
    pub pulse_research: bool,
    pub pulse_rate: u8,
    pub spo2: u8,
    /// Undecoded frame bytes.
    #[serde(skip)]
    pub raw: [u8; FRAME_LEN],
}

impl ReadingRecord {
    /// Combine a frame's metadata with its decoded reading.
    pub fn new(frame: &Frame, reading: &Reading) -> Self {
        Self {
            ts: frame.timestamp,
            device_id: frame.device_id.clone(),
            signal_strength: reading.signal_strength,
            no_signal: reading.no_signal,
            probe_unplugged: reading.probe_unplugged,
            pulse_beep: reading.pulse_beep,
            pleth: reading.plethysmograph,
            bar_graph: reading.bar_graph,
            no_finger: reading.no_finger,
            pulse_research: reading.pulse_research,
            pulse_rate: reading.pulse_rate,
            spo2: reading.spo2,
            raw: frame.bytes,
        }
    }
}
