//! File outputs: the per-phase CSV export and the append-only raw-frame
//! audit log.
//!
//! Both writers are deliberately dumb.  The CSV is rewritten whole at phase
//! finalization; the audit log is appended one line per notification as it
//! arrives, independent of any phase, so a session can be replayed offline
//! even when a phase was aborted before export.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::types::{RawFrame, SessionRecord};

/// Column order of the phase CSV.  The `app_*` columns are left empty for
/// the operator to fill in from the instrument's app.
const CSV_HEADER: &str = "timestamp,raw_hex,raw_val_1,raw_val_2,raw_val_3,raw_battery_mv,\
                          app_lux,app_cct,app_ra,app_x,app_y,app_u,app_v,app_battery_percent";

/// Default filename of the audit log.
pub const RAW_LOG_FILE: &str = "raw_data_full_session_log.txt";

/// Derive the CSV path for a phase, e.g. `"2 Layers"` →
/// `<dir>/measurements_2_layers.csv`.
pub fn phase_csv_path(dir: &Path, phase_name: &str) -> PathBuf {
    let slug: String = phase_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("measurements_{slug}.csv"))
}

fn fmt_opt<T: std::fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map_or_else(String::new, |v| v.to_string())
}

/// Write one phase's records as CSV.  The header row is always written,
/// even for an empty phase, so a zero-record run still produces a valid file.
pub fn write_phase_csv(path: &Path, records: &[SessionRecord]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{CSV_HEADER}")?;
    for r in records {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            r.received_at.format("%H:%M:%S%.3f"),
            r.raw_hex,
            r.raw_val_1,
            r.raw_val_2,
            r.raw_val_3,
            fmt_opt(&r.battery_millivolts),
            fmt_opt(&r.app_lux),
            fmt_opt(&r.app_cct),
            fmt_opt(&r.app_ra),
            fmt_opt(&r.app_x),
            fmt_opt(&r.app_y),
            fmt_opt(&r.app_u),
            fmt_opt(&r.app_v),
            fmt_opt(&r.app_battery_percent),
        )?;
    }
    out.flush()
}

/// Append-only log of every raw notification, for offline audit.
///
/// Opened once per session.  A write failure is reported and swallowed — a
/// full disk must not take down the notification dispatch path.
pub struct RawFrameLog {
    out: Option<BufWriter<File>>,
    path: PathBuf,
}

impl RawFrameLog {
    /// Open (or create) the log in append mode.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            out: Some(BufWriter::new(file)),
            path,
        })
    }

    /// Append one frame.  Errors are logged once and the log is disabled for
    /// the rest of the session rather than warning on every notification.
    pub fn log_frame(&mut self, frame: &RawFrame) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let line = format!(
            "[{}] Raw data (Length: {}, Hex: {}) FROM {}",
            frame.received_at.format("%H:%M:%S%.3f"),
            frame.bytes.len(),
            frame.hex(),
            frame.channel,
        );
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!("raw log {} disabled after write error: {e}", self.path.display());
            self.out = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, PrimarySample};

    fn record(v1: u16, battery: Option<u16>) -> SessionRecord {
        let mut r = SessionRecord::from_primary(&PrimarySample {
            raw_val_1: v1,
            raw_val_2: 2,
            raw_val_3: 3,
            state: crate::types::MeasurementState::LightDetected,
            raw_hex: "8000".into(),
            received_at: chrono::Local::now(),
        });
        r.battery_millivolts = battery;
        r
    }

    #[test]
    fn empty_export_is_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = phase_csv_path(dir.path(), "No Filter");
        write_phase_csv(&path, &[]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("timestamp,raw_hex,raw_val_1"));
        assert!(lines[0].ends_with("app_battery_percent"));
    }

    #[test]
    fn missing_battery_exports_as_empty_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_phase_csv(&path, &[record(11, Some(4100)), record(12, None)]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = contents.lines().skip(1).collect();
        assert!(rows[0].contains(",4100,"));
        // raw_battery_mv is column 6; empty cell means two adjacent commas.
        assert!(rows[1].contains(",3,,"));
    }

    #[test]
    fn phase_names_are_slugged() {
        let p = phase_csv_path(Path::new("/tmp"), "Sample under Halogen: tile #3");
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "measurements_sample_under_halogen__tile__3.csv"
        );
    }

    #[test]
    fn raw_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.txt");
        let mut log = RawFrameLog::open(&path).unwrap();
        log.log_frame(&RawFrame::new(Channel::Command, vec![0xab, 0xcd]));
        log.log_frame(&RawFrame::new(Channel::Data, vec![0x01]));
        drop(log);
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Length: 2"));
        assert!(lines[0].contains("Hex: abcd"));
        assert!(lines[0].ends_with("FROM command"));
        assert!(lines[1].ends_with("FROM data"));
    }
}
