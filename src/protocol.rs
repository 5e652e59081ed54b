//! GATT UUIDs, framing constants, and queue sizes for transparent-UART pulse
//! oximeters.
//!
//! The device exposes the Microchip "transparent UART" profile: the host
//! subscribes to the TX characteristic and receives the oximeter's serial
//! byte stream as a sequence of notifications.  Notification boundaries carry
//! no meaning; frames are recovered from the byte stream by
//! [`crate::parse::FrameAssembler`].

use std::time::Duration;

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Transparent UART primary service.
pub const TRANSPARENT_UART_SERVICE: Uuid =
    Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Device → host data channel.  Notifications on this characteristic carry
/// the raw telemetry byte stream.
pub const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x49535343_1e4d_4bd9_ba61_23c647249616);

/// Host → device data channel.  Discovered alongside TX but never written.
pub const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3);

/// Characteristics requested during discovery, in the order the session
/// expects them back (TX first).
pub const UART_CHARACTERISTICS: [Uuid; 2] = [TX_CHARACTERISTIC, RX_CHARACTERISTIC];

// ── Framing ──────────────────────────────────────────────────────────────────

/// Number of bytes in one telemetry frame (start byte + 4 payload bytes).
pub const FRAME_LEN: usize = 5;

/// High bit that marks the first byte of a frame.  Every other byte of a
/// frame has this bit clear.
pub const MARKER_BIT: u8 = 0x80;

/// Returns `true` when `b` can start a frame.
#[inline]
pub fn is_marker(b: u8) -> bool {
    b & MARKER_BIT != 0
}

/// Nominal frame rate of the oximeter (frames per second).
pub const FRAME_RATE_HZ: f64 = 60.0;

// ── Queue sizes ───────────────────────────────────────────────────────────────

/// Depth of the raw advertisement queue between the scan callback and the
/// dedup consumer.  Advertisements that do not fit are dropped.
pub const SCAN_QUEUE_CAPACITY: usize = 10;

/// Depth of the matched-advertisement output channel.
pub const SCAN_RESULTS_CAPACITY: usize = 10;

/// Depth of the decoded-frame channel between parser and supervisor.
pub const FRAME_QUEUE_CAPACITY: usize = 64;

/// Default ring-buffer size for the notification bridge.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

// ── Timing defaults ───────────────────────────────────────────────────────────

/// How long a single discovery pass may run before giving up.
pub const DEFAULT_SCAN_DEADLINE: Duration = Duration::from_secs(2);

/// Streaming is torn down when no frame arrives for this long.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Startup delay used by the poll-based serial source before its first read.
pub const DEFAULT_SERIAL_STARTUP_DELAY: Duration = Duration::from_secs(3);

/// Maximum payload of one BLE notification at the default ATT MTU.
pub const DEFAULT_NOTIFICATION_MTU: usize = 20;
