//! # lightmaster-rs
//!
//! Async Rust harness for capturing and reverse-engineering the proprietary
//! BLE protocol of the [Opple Light Master Pro] handheld light meter.
//!
//! The instrument's wire format is undocumented.  This crate drives it
//! through measurement cycles, decodes the notification frames whose shapes
//! have been worked out so far (a 20-byte measurement packet and an 11-byte
//! battery packet), and exports each collection phase as a CSV of raw sensor
//! fields next to empty ground-truth columns.  The operator fills those
//! columns in by hand from the instrument's own app; the correlated pairs
//! feed the offline calibration analysis.  Deriving the actual lux/CCT/CRI
//! formulas is explicitly out of scope here.
//!
//! [Opple Light Master Pro]: https://www.opple.com/
//!
//! ## Quick start
//!
//! ```no_run
//! use lightmaster_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ProbeClient::new(ProbeClientConfig::default());
//!     let (mut rx, handle) = client.connect().await?;
//!     handle.start_measurement().await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             ProbeEvent::Decoded(record) => println!("{record:?}"),
//!             ProbeEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     handle.stop_measurement().await?;
//!     handle.disconnect().await
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`probe_client`] | BLE scanning, connecting, and the [`probe_client::ProbeHandle`] command API |
//! | [`types`] | Frames, decoded records, and session rows |
//! | [`protocol`] | Characteristic UUIDs, command payloads, frame-shape constants |
//! | [`classify`] | The pure frame classifier |
//! | [`session`] | Phase buffer, association heuristic, and the phase driver |
//! | [`export`] | CSV phase export and the raw-frame audit log |

pub mod classify;
pub mod export;
pub mod probe_client;
pub mod protocol;
pub mod session;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream code.
pub mod prelude {
    // ── Client ───────────────────────────────────────────────────────────────
    pub use crate::probe_client::{ProbeClient, ProbeClientConfig, ProbeDevice, ProbeHandle};

    // ── Records and events ───────────────────────────────────────────────────
    pub use crate::types::{
        AuxiliarySample, Channel, DecodedRecord, MeasurementState, PrimarySample, ProbeEvent,
        RawFrame, SessionRecord,
    };

    // ── Session machinery ────────────────────────────────────────────────────
    pub use crate::session::{
        CommandWriter, PhaseBuffer, PhaseConfig, PhaseDriver, PhasePlan, PhaseReport, PhaseStats,
    };

    // ── Classifier and protocol constants ────────────────────────────────────
    pub use crate::classify::classify;
    pub use crate::protocol::{START_MEASUREMENT, STOP_MEASUREMENT};
}
