//! # pulseox-rs
//!
//! Async Rust library and CLI for streaming SpO₂, pulse rate and
//! plethysmogram readings from BLE pulse oximeters that speak the 5-byte
//! BCI frame protocol over a Microchip "transparent UART" GATT service.
//!
//! ## Supported hardware
//!
//! | Device | Link | Notes |
//! |---|---|---|
//! | BerryMed BM1000-family oximeters | BLE transparent UART | 60 frames/s, 20-byte notifications |
//! | Any BCI-protocol oximeter | serial / USB-serial | via `--serial`, no BLE involved |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pulseox_rs::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SupervisorConfig {
//!         target_address: "00:A0:50:C8:E7:31".into(),
//!         ..SupervisorConfig::default()
//!     };
//!     let (sink, mut readings) = ChannelSink::channel();
//!     let mut supervisor = Supervisor::new(Arc::new(BtleplugCentral::new()), sink, config);
//!
//!     let cancel = CancellationToken::new();
//!     tokio::spawn(async move {
//!         while let Some(r) = readings.recv().await {
//!             println!("SpO2 {}%  pulse {} bpm", r.spo2, r.pulse_rate);
//!         }
//!     });
//!     supervisor.run(cancel).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | The scan → connect → stream → teardown supervisor |
//! | [`discovery`] | Scan pipeline with bounded queue, dedup and address filter |
//! | [`bridge`] | Ring buffer between notifications and the parser; serial bridge |
//! | [`parse`] | Frame resynchronisation and bit-field decoding |
//! | [`central`] | The [`central::BleCentral`] trait every backend implements |
//! | [`btle`] | btleplug backend |
//! | [`sim`] | Simulated oximeter backend |
//! | [`output`] | Raw, CSV, JSON and channel reading sinks |
//! | [`types`] | Advertisement, frame and reading types |
//! | [`protocol`] | GATT UUIDs, framing and timing constants |
//! | [`error`] | Error types |

pub mod bridge;
pub mod btle;
pub mod central;
pub mod discovery;
pub mod error;
pub mod output;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::session::{
        AdapterPolicy, SessionState, SessionStats, Supervisor, SupervisorConfig,
    };

    // ── Backends ──────────────────────────────────────────────────────────────
    pub use crate::btle::BtleplugCentral;
    pub use crate::central::BleCentral;
    pub use crate::sim::{SimConfig, SimulatedCentral};

    // ── Output ────────────────────────────────────────────────────────────────
    pub use crate::output::{ChannelSink, CsvSink, JsonSink, RawSink, ReadingSink};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::error::{BleError, SessionError};
    pub use crate::types::{Advertisement, Frame, Reading, ReadingRecord};
}
