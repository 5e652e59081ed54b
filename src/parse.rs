//! Frame recovery and decoding for the oximeter byte stream.
//!
//! The device streams fixed 5-byte frames with no length prefix and no
//! checksum.  The only synchronisation aid is the high bit: it is set on the
//! first byte of every frame and clear on the four that follow.
//!
//! ```text
//! byte 0 : 1 b6=beep b5=unplugged b4=no-signal b3 b2..b0=signal strength
//! byte 1 : 0 pleth (7 bits used in practice)
//! byte 2 : 0 b6=pulse-rate bit 7 b5=research b4=no-finger b3 b2..b0=bar graph
//! byte 3 : 0 pulse-rate bits 6..0
//! byte 4 : 0 SpO2
//! ```
//!
//! [`FrameAssembler`] turns bytes into [`Frame`]s; [`decode_reading`] turns a
//! frame into a [`Reading`]; [`spawn_frame_parser`] runs the assembler as a
//! task over a [`ByteSource`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::ByteSource;
use crate::protocol::{is_marker, FRAME_LEN, FRAME_QUEUE_CAPACITY};
use crate::types::{Frame, Reading};

/// Nanoseconds since Unix epoch; `0` if the clock is before the epoch.
pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Where the assembler is within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingState {
    /// Waiting for a marker byte.
    SeekingStart,
    /// The start byte and `n - 1` payload bytes are stored (`n` in 1..=4).
    Collecting(usize),
}

/// Byte-at-a-time frame recogniser.
///
/// A marker byte that arrives while a frame is being collected aborts that
/// frame and is itself discarded: it does not start a new frame.  After two
/// consecutive markers the stream only resynchronises on the next marker.
/// Host software for these oximeters resynchronises the same way.
#[derive(Debug)]
pub struct FrameAssembler {
    device_id: String,
    state: FramingState,
    payload: [u8; FRAME_LEN],
    timestamp: u64,
    desyncs: u64,
}

impl FrameAssembler {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: FramingState::SeekingStart,
            payload: [0; FRAME_LEN],
            timestamp: 0,
            desyncs: 0,
        }
    }

    pub fn state(&self) -> FramingState {
        self.state
    }

    /// Number of partially collected frames aborted by an unexpected marker.
    pub fn desyncs(&self) -> u64 {
        self.desyncs
    }

    /// Feed one byte received at `timestamp` (ns since Unix epoch).
    ///
    /// Returns the completed frame when `byte` is its fifth byte.
    pub fn push(&mut self, byte: u8, timestamp: u64) -> Option<Frame> {
        match self.state {
            FramingState::SeekingStart => {
                if is_marker(byte) {
                    self.payload[0] = byte;
                    self.state = FramingState::Collecting(1);
                }
                None
            }
            FramingState::Collecting(_) if is_marker(byte) => {
                self.desyncs += 1;
                self.state = FramingState::SeekingStart;
                None
            }
            FramingState::Collecting(n) => {
                self.payload[n] = byte;
                self.timestamp = timestamp;
                if n + 1 == FRAME_LEN {
                    self.state = FramingState::SeekingStart;
                    Some(Frame {
                        timestamp: self.timestamp,
                        device_id: self.device_id.clone(),
                        bytes: self.payload,
                    })
                } else {
                    self.state = FramingState::Collecting(n + 1);
                    None
                }
            }
        }
    }

    /// Feed a slice of bytes that all share one timestamp.
    pub fn push_slice(&mut self, bytes: &[u8], timestamp: u64) -> Vec<Frame> {
        bytes
            .iter()
            .filter_map(|&b| self.push(b, timestamp))
            .collect()
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decode a frame into its fields.  Total: never fails, never validates.
pub fn decode_reading(frame: &Frame) -> Reading {
    decode_bytes(&frame.bytes)
}

/// Decode raw frame bytes; see the module docs for the bit layout.
pub fn decode_bytes(b: &[u8; FRAME_LEN]) -> Reading {
    Reading {
        signal_strength: b[0] & 0x07,
        no_signal: b[0] & (1 << 4) != 0,
        probe_unplugged: b[0] & (1 << 5) != 0,
        pulse_beep: b[0] & (1 << 6) != 0,
        plethysmograph: b[1],
        bar_graph: b[2] & 0x07,
        no_finger: b[2] & (1 << 4) != 0,
        pulse_research: b[2] & (1 << 5) != 0,
        pulse_rate: (b[3] & 0x7F) | ((b[2] & 0x40) << 1),
        spo2: b[4],
    }
}

// ── Parser task ───────────────────────────────────────────────────────────────

/// Run a [`FrameAssembler`] over `source` on its own task.
///
/// Frames are delivered through a channel of depth
/// [`FRAME_QUEUE_CAPACITY`]; when it is full the parser waits, which in turn
/// lets the source fill up.  The task ends, closing the channel, when
/// `cancel` fires, the source fails, or the receiver is dropped.
pub fn spawn_frame_parser(
    source: Arc<dyn ByteSource>,
    device_id: String,
    cancel: CancellationToken,
) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);

    tokio::spawn(async move {
        let mut assembler = FrameAssembler::new(device_id.clone());
        let mut frames: u64 = 0;

        loop {
            let byte = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = source.read_byte() => match read {
                    Ok(b) => b,
                    Err(e) => {
                        debug!("{device_id}: parser stopping: {e}");
                        break;
                    }
                },
            };

            if let Some(frame) = assembler.push(byte, now_ns()) {
                frames += 1;
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(frame) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
        }

        debug!(
            "{device_id}: parser finished, {frames} frame(s), {} resync(s)",
            assembler.desyncs()
        );
    });

    rx
}
