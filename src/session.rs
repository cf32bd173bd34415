//! Measurement-session logic: the per-phase sample buffer and the phase
//! driver state machine.
//!
//! A *phase* is one bounded collection run under a fixed physical setup
//! (light source, filter stack, sample).  The [`PhaseDriver`] owns a
//! [`PhaseBuffer`] for the lifetime of the phase, paces the device with
//! start/stop command pairs, and drains classified notifications into the
//! buffer at every await point — the device pushes data asynchronously and
//! the command cadence never waits for a specific reply frame.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::export::{phase_csv_path, write_phase_csv};
use crate::protocol::{START_MEASUREMENT, STOP_MEASUREMENT};
use crate::types::{DecodedRecord, MeasurementState, ProbeEvent, SessionRecord};

// ── Command seam ──────────────────────────────────────────────────────────────

/// The one thing the phase driver needs from the transport: a fire-and-forget
/// command write.  [`crate::probe_client::ProbeHandle`] implements this for
/// the real BLE link; tests substitute a recording mock.
#[async_trait]
pub trait CommandWriter: Send + Sync {
    async fn write_command(&self, payload: &[u8]) -> Result<()>;
}

// ── PhaseBuffer ───────────────────────────────────────────────────────────────

/// Ordered store of correlated rows for one phase.
///
/// Records are appended in transport delivery order.  The auxiliary-to-primary
/// join is a best-effort temporal heuristic: a battery packet is attached to
/// the most recent row only if that row has no battery value yet.  There is no
/// correlation identifier in either frame (none has been found), so this
/// depends on the device sending the battery frame before the next
/// measurement frame.  Treat the association as provisional, not a verified
/// protocol contract.
#[derive(Debug, Default)]
pub struct PhaseBuffer {
    records: Vec<SessionRecord>,
}

impl PhaseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Fold one decoded record into the buffer.
    ///
    /// * Light-detected primaries become new rows.
    /// * Dark primaries are dropped — an all-zero reading carries no
    ///   information for calibration correlation.
    /// * Auxiliary samples attach to the latest row, first write wins.
    /// * Everything else is diagnostics only.
    pub fn on_decoded(&mut self, record: DecodedRecord) {
        match record {
            DecodedRecord::Primary(sample) => match sample.state {
                MeasurementState::LightDetected => {
                    info!(
                        "measurement: vals=({}, {}, {}) hex={}",
                        sample.raw_val_1, sample.raw_val_2, sample.raw_val_3, sample.raw_hex
                    );
                    self.records.push(SessionRecord::from_primary(&sample));
                }
                MeasurementState::Dark => {
                    info!("dark reading dropped: hex={}", sample.raw_hex);
                }
            },
            DecodedRecord::Auxiliary(sample) => {
                match self.records.last_mut() {
                    Some(last) if last.battery_millivolts.is_none() => {
                        info!("battery: {} mV", sample.battery_millivolts);
                        last.battery_millivolts = Some(sample.battery_millivolts);
                    }
                    Some(_) => {
                        debug!(
                            "battery {} mV discarded: latest row already has one",
                            sample.battery_millivolts
                        );
                    }
                    None => {
                        debug!(
                            "battery {} mV discarded: no measurement to attach to",
                            sample.battery_millivolts
                        );
                    }
                }
            }
            DecodedRecord::Unrecognized(frame) => {
                // The data channel is chatty but has never carried a
                // measurement; keep it out of the operator's console.
                match frame.channel {
                    crate::types::Channel::Data => {
                        debug!("unrecognized frame on data channel: len={} hex={}", frame.len, frame.raw_hex)
                    }
                    _ => info!(
                        "unrecognized frame on {} channel: len={} hex={}",
                        frame.channel, frame.len, frame.raw_hex
                    ),
                }
            }
            DecodedRecord::Truncated(frame) => {
                warn!(
                    "truncated frame: expected {} bytes, got {} (hex={})",
                    frame.expected_len, frame.actual_len, frame.raw_hex
                );
            }
        }
    }

    pub fn into_records(self) -> Vec<SessionRecord> {
        self.records
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Arithmetic means of the numeric raw fields across one phase.
///
/// A field is `None` when no record carried a value for it (an empty phase,
/// or no auxiliary frame ever associated).
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseStats {
    pub mean_raw_val_1: Option<f64>,
    pub mean_raw_val_2: Option<f64>,
    pub mean_raw_val_3: Option<f64>,
    pub mean_battery_mv: Option<f64>,
}

impl PhaseStats {
    pub fn compute(records: &[SessionRecord]) -> Self {
        fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
            let values: Vec<f64> = values.collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        Self {
            mean_raw_val_1: mean(records.iter().map(|r| f64::from(r.raw_val_1))),
            mean_raw_val_2: mean(records.iter().map(|r| f64::from(r.raw_val_2))),
            mean_raw_val_3: mean(records.iter().map(|r| f64::from(r.raw_val_3))),
            mean_battery_mv: mean(
                records
                    .iter()
                    .filter_map(|r| r.battery_millivolts.map(f64::from)),
            ),
        }
    }
}

impl std::fmt::Display for PhaseStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn fmt_opt(v: Option<f64>) -> String {
            v.map_or_else(|| "n/a".into(), |v| format!("{v:.1}"))
        }
        write!(
            f,
            "raw_val_1={} raw_val_2={} raw_val_3={} battery_mv={}",
            fmt_opt(self.mean_raw_val_1),
            fmt_opt(self.mean_raw_val_2),
            fmt_opt(self.mean_raw_val_3),
            fmt_opt(self.mean_battery_mv)
        )
    }
}

// ── Phase driver ──────────────────────────────────────────────────────────────

/// Command cadence and export settings shared by all phases in a session.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    /// Number of start/stop command pairs to issue. Default: `15`.
    pub repeat_count: usize,
    /// How long the device is left measuring between start and stop.  The
    /// instrument needs a nonzero settle time before stop or it reports
    /// nothing.  Default: `900 ms`.
    pub dwell: Duration,
    /// Pause after stop before the next iteration. Default: `100 ms`.
    pub settle: Duration,
    /// Directory for the per-phase CSV files. Default: current directory.
    pub output_dir: PathBuf,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            repeat_count: 15,
            dwell: Duration::from_millis(900),
            settle: Duration::from_millis(100),
            output_dir: PathBuf::from("."),
        }
    }
}

/// One phase to run: its export name and, where the physical setup must
/// change first, a note to show the operator before polling begins.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    /// Used in console output and to derive the CSV filename.
    pub name: String,
    /// When `Some`, the driver blocks (operator-paced, no timeout) until a
    /// line arrives on the prompt channel before issuing any command.
    pub setup_note: Option<String>,
}

impl PhasePlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup_note: None,
        }
    }

    pub fn with_setup_note(name: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup_note: Some(note.into()),
        }
    }
}

/// Where the driver currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    AwaitingOperatorReady,
    Polling,
    Finalized,
}

/// What one finished phase produced.
#[derive(Debug)]
pub struct PhaseReport {
    pub records: Vec<SessionRecord>,
    pub stats: PhaseStats,
    /// Start/stop pairs fully issued before the loop ended.
    pub iterations_completed: usize,
    /// `true` when the operator interrupt cut the phase short.
    pub cancelled: bool,
    /// CSV location, or `None` when the export write failed (the data is
    /// still in `records`).
    pub export_path: Option<PathBuf>,
}

enum WaitOutcome {
    Elapsed,
    Cancelled,
    LinkLost,
}

/// Drives one measurement phase through
/// `Idle → AwaitingOperatorReady → Polling → Finalized`.
///
/// The driver owns the phase's buffer exclusively; notifications are drained
/// from the event channel at every suspension point, so classified records
/// land in the buffer regardless of where the command loop happens to be.
/// Cancellation is observed at every suspension point and routes to
/// finalization with whatever was buffered — partial-phase exports are
/// expected, not an error.
pub struct PhaseDriver {
    plan: PhasePlan,
    config: PhaseConfig,
    state: PhaseState,
    buffer: PhaseBuffer,
}

impl PhaseDriver {
    pub fn new(plan: PhasePlan, config: PhaseConfig) -> Self {
        Self {
            plan,
            config,
            state: PhaseState::Idle,
            buffer: PhaseBuffer::new(),
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    /// Run the phase to completion (or cancellation) and return its report.
    ///
    /// `prompts` carries operator keystrokes (any line confirms a setup
    /// note); `events` is the classified notification stream from the probe
    /// client.  A failed command write aborts the polling loop early —
    /// fail-fast once the transport is known broken — but everything already
    /// buffered is still finalized and exported.
    pub async fn run<C: CommandWriter>(
        mut self,
        writer: &C,
        events: &mut mpsc::Receiver<ProbeEvent>,
        prompts: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> PhaseReport {
        info!("--- starting phase: {} ---", self.plan.name);
        self.buffer.clear();

        // Frames that arrived after the previous phase finalized (late
        // measurement tails, chatter during menu navigation) are still queued
        // on the shared channel.  They were captured under a different
        // physical setup, so folding them into this phase's buffer would
        // contaminate the correlation; discard them before polling begins.
        let mut stale = 0usize;
        while let Ok(ev) = events.try_recv() {
            match ev {
                ProbeEvent::Decoded(_) => stale += 1,
                ProbeEvent::Connected(_) => {}
                ProbeEvent::Disconnected => {
                    error!("device disconnected before phase '{}' started", self.plan.name);
                    return self.finalize(0, false);
                }
            }
        }
        if stale > 0 {
            info!(
                "discarded {stale} stale record(s) queued before phase '{}' started",
                self.plan.name
            );
        }

        // ── AwaitingOperatorReady ────────────────────────────────────────────
        if let Some(note) = self.plan.setup_note.clone() {
            self.state = PhaseState::AwaitingOperatorReady;
            println!("{note}");
            println!("Press Enter to begin...");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("phase '{}' cancelled while awaiting operator", self.plan.name);
                        return self.finalize(0, true);
                    }
                    line = prompts.recv() => match line {
                        Some(_) => break,
                        None => {
                            warn!("operator prompt channel closed; continuing without confirmation");
                            break;
                        }
                    },
                    ev = events.recv() => match ev {
                        Some(ProbeEvent::Decoded(rec)) => self.buffer.on_decoded(rec),
                        Some(ProbeEvent::Connected(_)) => {}
                        Some(ProbeEvent::Disconnected) | None => {
                            error!("device disconnected before phase '{}' started", self.plan.name);
                            return self.finalize(0, false);
                        }
                    },
                }
            }
        }

        // ── Polling ──────────────────────────────────────────────────────────
        self.state = PhaseState::Polling;
        println!(
            "Collecting up to {} measurements for '{}' ({:?} dwell per poll).",
            self.config.repeat_count, self.plan.name, self.config.dwell
        );
        println!(
            "As each LIGHT_DETECTED line appears, note the app's Lux/CCT/Ra/x/y/u/v and \
             battery % for that timestamp — you will fill them into the CSV afterwards."
        );

        let mut iterations_completed = 0;
        let mut cancelled = false;

        for i in 0..self.config.repeat_count {
            info!(
                "polling measurement {}/{} for '{}'",
                i + 1,
                self.config.repeat_count,
                self.plan.name
            );

            if let Err(e) = writer.write_command(&START_MEASUREMENT).await {
                error!("start command failed, aborting phase '{}': {e:#}", self.plan.name);
                break;
            }

            match self.wait_draining(self.config.dwell, events, cancel).await {
                WaitOutcome::Elapsed => {}
                WaitOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
                WaitOutcome::LinkLost => break,
            }

            if let Err(e) = writer.write_command(&STOP_MEASUREMENT).await {
                error!("stop command failed, aborting phase '{}': {e:#}", self.plan.name);
                break;
            }

            iterations_completed = i + 1;

            match self.wait_draining(self.config.settle, events, cancel).await {
                WaitOutcome::Elapsed => {}
                WaitOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
                WaitOutcome::LinkLost => break,
            }
        }

        if cancelled {
            info!("phase '{}' interrupted; finalizing partial data", self.plan.name);
        }
        self.finalize(iterations_completed, cancelled)
    }

    /// Sleep for `duration` while folding incoming notifications into the
    /// buffer.  Returns early on cancellation or link loss.
    async fn wait_draining(
        &mut self,
        duration: Duration,
        events: &mut mpsc::Receiver<ProbeEvent>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Elapsed,
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                ev = events.recv() => match ev {
                    Some(ProbeEvent::Decoded(rec)) => self.buffer.on_decoded(rec),
                    Some(ProbeEvent::Connected(_)) => {}
                    Some(ProbeEvent::Disconnected) | None => {
                        error!("device disconnected mid-phase");
                        return WaitOutcome::LinkLost;
                    }
                },
            }
        }
    }

    /// `Polling → Finalized`: export the buffer and compute aggregates.
    /// No buffer mutation happens after this returns.
    fn finalize(mut self, iterations_completed: usize, cancelled: bool) -> PhaseReport {
        self.state = PhaseState::Finalized;
        let records = std::mem::take(&mut self.buffer).into_records();
        let stats = PhaseStats::compute(&records);

        let path = phase_csv_path(&self.config.output_dir, &self.plan.name);
        let export_path = match write_phase_csv(&path, &records) {
            Ok(()) => {
                println!(
                    "Saved {} record(s) to {} — fill in the app_* columns by hand.",
                    records.len(),
                    path.display()
                );
                Some(path)
            }
            Err(e) => {
                // Export failure must not lose the in-memory data.
                error!("could not write {}: {e}", path.display());
                None
            }
        };

        println!("Phase '{}' means: {stats}", self.plan.name);
        PhaseReport {
            records,
            stats,
            iterations_completed,
            cancelled,
            export_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuxiliarySample, PrimarySample};
    use std::sync::Mutex;

    fn primary(vals: (u16, u16, u16)) -> DecodedRecord {
        let state = if vals == (0, 0, 0) {
            MeasurementState::Dark
        } else {
            MeasurementState::LightDetected
        };
        DecodedRecord::Primary(PrimarySample {
            raw_val_1: vals.0,
            raw_val_2: vals.1,
            raw_val_3: vals.2,
            state,
            raw_hex: "00".into(),
            received_at: chrono::Local::now(),
        })
    }

    fn auxiliary(mv: u16) -> DecodedRecord {
        DecodedRecord::Auxiliary(AuxiliarySample {
            battery_millivolts: mv,
            raw_hex: "00".into(),
        })
    }

    #[test]
    fn dark_readings_are_never_buffered() {
        let mut buf = PhaseBuffer::new();
        buf.on_decoded(primary((0, 0, 0)));
        buf.on_decoded(primary((1, 0, 0)));
        buf.on_decoded(primary((0, 0, 0)));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.records()[0].raw_val_1, 1);
    }

    #[test]
    fn auxiliary_first_write_wins() {
        let mut buf = PhaseBuffer::new();
        buf.on_decoded(primary((10, 20, 30)));
        buf.on_decoded(auxiliary(4100));
        buf.on_decoded(auxiliary(3900));
        assert_eq!(buf.records()[0].battery_millivolts, Some(4100));
    }

    #[test]
    fn auxiliary_without_a_primary_is_discarded() {
        let mut buf = PhaseBuffer::new();
        buf.on_decoded(auxiliary(4100));
        assert!(buf.is_empty());
    }

    #[test]
    fn light_dark_light_with_one_battery_frame() {
        // LIGHT, battery, DARK, LIGHT → two rows, only the first has battery.
        let mut buf = PhaseBuffer::new();
        buf.on_decoded(primary((5, 6, 7)));
        buf.on_decoded(auxiliary(4100));
        buf.on_decoded(primary((0, 0, 0)));
        buf.on_decoded(primary((8, 9, 10)));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.records()[0].battery_millivolts, Some(4100));
        assert_eq!(buf.records()[1].battery_millivolts, None);
    }

    #[test]
    fn stats_exclude_missing_battery_values() {
        let mut buf = PhaseBuffer::new();
        buf.on_decoded(primary((10, 0, 0)));
        buf.on_decoded(auxiliary(4000));
        buf.on_decoded(primary((20, 0, 0)));
        let stats = PhaseStats::compute(buf.records());
        assert_eq!(stats.mean_raw_val_1, Some(15.0));
        assert_eq!(stats.mean_battery_mv, Some(4000.0));
    }

    #[test]
    fn stats_on_empty_phase_are_all_none() {
        let stats = PhaseStats::compute(&[]);
        assert_eq!(stats.mean_raw_val_1, None);
        assert_eq!(stats.mean_battery_mv, None);
    }

    // ── Driver tests ─────────────────────────────────────────────────────────

    /// Records every payload written; can be armed to fail from a given call.
    struct MockWriter {
        writes: Mutex<Vec<Vec<u8>>>,
        fail_from: Option<usize>,
    }

    impl MockWriter {
        fn new() -> Self {
            Self {
                writes: Mutex::new(vec![]),
                fail_from: None,
            }
        }

        fn failing_from(n: usize) -> Self {
            Self {
                writes: Mutex::new(vec![]),
                fail_from: Some(n),
            }
        }

        fn count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandWriter for MockWriter {
        async fn write_command(&self, payload: &[u8]) -> Result<()> {
            let mut writes = self.writes.lock().unwrap();
            if let Some(n) = self.fail_from {
                if writes.len() >= n {
                    anyhow::bail!("transport gone");
                }
            }
            writes.push(payload.to_vec());
            Ok(())
        }
    }

    fn fast_config(dir: &std::path::Path, repeat: usize) -> PhaseConfig {
        PhaseConfig {
            repeat_count: repeat,
            dwell: Duration::from_millis(10),
            settle: Duration::from_millis(2),
            output_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn driver_issues_start_stop_pairs_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MockWriter::new();
        let (tx, mut events) = mpsc::channel(16);
        let (_ptx, mut prompts) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let tx_late = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            tx_late.send(ProbeEvent::Decoded(primary((1, 2, 3)))).await.unwrap();
            tx_late.send(ProbeEvent::Decoded(auxiliary(4100))).await.unwrap();
        });

        let driver = PhaseDriver::new(PhasePlan::new("unit test"), fast_config(dir.path(), 3));
        assert_eq!(driver.state(), PhaseState::Idle);
        let report = driver.run(&writer, &mut events, &mut prompts, &cancel).await;

        assert_eq!(writer.count(), 6); // 3 × (start + stop)
        assert_eq!(report.iterations_completed, 3);
        assert!(!report.cancelled);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].battery_millivolts, Some(4100));

        let path = report.export_path.expect("export should succeed");
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 2); // header + one row
    }

    #[tokio::test]
    async fn records_queued_between_phases_do_not_leak_forward() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MockWriter::new();
        let (tx, mut events) = mpsc::channel(16);
        let (_ptx, mut prompts) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Phase A runs and finalizes with nothing buffered.
        let driver = PhaseDriver::new(PhasePlan::new("phase a"), fast_config(dir.path(), 1));
        let report_a = driver.run(&writer, &mut events, &mut prompts, &cancel).await;
        assert_eq!(report_a.records.len(), 0);

        // A late measurement tail arrives while the operator is at the menu.
        tx.send(ProbeEvent::Decoded(primary((1, 1, 1)))).await.unwrap();
        tx.send(ProbeEvent::Decoded(primary((2, 2, 2)))).await.unwrap();

        // Phase B must not export frames captured under phase A's setup.
        let driver = PhaseDriver::new(PhasePlan::new("phase b"), fast_config(dir.path(), 1));
        let report_b = driver.run(&writer, &mut events, &mut prompts, &cancel).await;
        assert_eq!(report_b.records.len(), 0);

        // Frames delivered once the phase is underway are still collected.
        let tx_late = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            tx_late.send(ProbeEvent::Decoded(primary((3, 3, 3)))).await.unwrap();
        });
        let driver = PhaseDriver::new(PhasePlan::new("phase c"), fast_config(dir.path(), 1));
        let report_c = driver.run(&writer, &mut events, &mut prompts, &cancel).await;
        assert_eq!(report_c.records.len(), 1);
        assert_eq!(report_c.records[0].raw_val_1, 3);
    }

    #[tokio::test]
    async fn write_failure_aborts_early_but_keeps_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MockWriter::failing_from(3); // start, stop, start, then fail
        let (tx, mut events) = mpsc::channel(16);
        let (_ptx, mut prompts) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let tx_late = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            tx_late.send(ProbeEvent::Decoded(primary((7, 7, 7)))).await.unwrap();
        });

        let driver = PhaseDriver::new(PhasePlan::new("abort test"), fast_config(dir.path(), 10));
        let report = driver.run(&writer, &mut events, &mut prompts, &cancel).await;

        assert!(report.iterations_completed < 10);
        assert_eq!(report.records.len(), 1);
        assert!(report.export_path.is_some());
    }

    #[tokio::test]
    async fn cancellation_mid_wait_finalizes_partial_data() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MockWriter::new();
        let (tx, mut events) = mpsc::channel(16);
        let (_ptx, mut prompts) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let tx_late = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            tx_late.send(ProbeEvent::Decoded(primary((1, 1, 1)))).await.unwrap();
            tx_late.send(ProbeEvent::Decoded(primary((2, 2, 2)))).await.unwrap();
        });

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            // Land inside one of the first dwell waits.
            tokio::time::sleep(Duration::from_millis(25)).await;
            cancel_clone.cancel();
        });

        let config = PhaseConfig {
            repeat_count: 15,
            dwell: Duration::from_millis(20),
            settle: Duration::from_millis(5),
            output_dir: dir.path().to_path_buf(),
        };
        let driver = PhaseDriver::new(PhasePlan::new("cancel test"), config);
        let report = driver.run(&writer, &mut events, &mut prompts, &cancel).await;

        assert!(report.cancelled);
        assert!(report.iterations_completed < 15);
        assert_eq!(report.records.len(), 2);
        assert!(report.export_path.is_some());
    }

    #[tokio::test]
    async fn setup_note_blocks_until_operator_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MockWriter::new();
        let (_tx, mut events) = mpsc::channel::<ProbeEvent>(16);
        let (ptx, mut prompts) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        ptx.send(String::new()).unwrap();

        let driver = PhaseDriver::new(
            PhasePlan::with_setup_note("prompt test", "PLACE 2 LAYERS OF PAPER FILTER."),
            fast_config(dir.path(), 1),
        );
        let report = driver.run(&writer, &mut events, &mut prompts, &cancel).await;
        assert_eq!(report.iterations_completed, 1);
        assert_eq!(writer.count(), 2);
    }
}
