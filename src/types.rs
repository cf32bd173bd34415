use chrono::{DateTime, Local};

/// Logical origin of a BLE notification.
///
/// The Light Master exposes a Nordic-UART-style service with two
/// characteristics.  Naming here follows the observed protocol, not the UART
/// convention: every measurement payload seen so far arrives on the *command*
/// characteristic (`6e400003-…`), while the nominal *data* characteristic
/// (`6e400002-…`) has never been observed carrying a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The command/response characteristic — the real measurement source.
    Command,
    /// The nominal data characteristic — subscribed for completeness, but
    /// empirically silent.
    Data,
    /// Any other characteristic.
    Other,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Command => write!(f, "command"),
            Channel::Data => write!(f, "data"),
            Channel::Other => write!(f, "other"),
        }
    }
}

/// One raw BLE notification, exactly as delivered by the transport.
///
/// Created once per notification and never mutated; both the audit log and
/// the classifier consume it by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub channel: Channel,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl RawFrame {
    pub fn new(channel: Channel, bytes: Vec<u8>) -> Self {
        Self {
            channel,
            bytes,
            received_at: Local::now(),
        }
    }

    /// Lowercase hex dump of the payload, matching the format used in the
    /// audit log and CSV export.
    pub fn hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Whether a primary sample saw any light.
///
/// The device reports all-zero sensor fields when measuring in darkness;
/// any nonzero field means light reached the sensor.  This is the only
/// discriminator — there is no explicit status flag in the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementState {
    Dark,
    LightDetected,
}

impl std::fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementState::Dark => write!(f, "DARK"),
            MeasurementState::LightDetected => write!(f, "LIGHT_DETECTED"),
        }
    }
}

/// A decoded 20-byte measurement packet.
///
/// The three raw values are unsigned 16-bit **little-endian** integers at
/// byte offsets 14–15, 16–17 and 18–19.  Which physical quantity each one
/// represents is exactly what this tool exists to find out — they are
/// exported verbatim for offline correlation against app-reported values.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimarySample {
    pub raw_val_1: u16,
    pub raw_val_2: u16,
    pub raw_val_3: u16,
    pub state: MeasurementState,
    pub raw_hex: String,
    pub received_at: DateTime<Local>,
}

/// A decoded 11-byte telemetry packet.
///
/// The field at byte offsets 8–9 tracks the battery terminal voltage in
/// millivolts and is **big-endian** — the opposite byte order from the
/// 20-byte measurement packet.  Both orderings are empirically verified;
/// the asymmetry is preserved exactly as observed.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxiliarySample {
    pub battery_millivolts: u16,
    pub raw_hex: String,
}

/// A frame with no known decoding for its (channel, length) shape.
#[derive(Debug, Clone, PartialEq)]
pub struct UnrecognizedFrame {
    pub channel: Channel,
    pub len: usize,
    pub raw_hex: String,
}

/// A frame whose length claimed a known shape but whose payload was too
/// short to satisfy the fixed field offsets (upstream transport corruption).
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedFrame {
    pub channel: Channel,
    pub expected_len: usize,
    pub actual_len: usize,
    pub raw_hex: String,
}

/// Result of classifying one [`RawFrame`].
///
/// The variant is chosen solely by `(channel, byte length)`; payload content
/// is only inspected to populate fields once the variant is fixed.  Decode
/// failures are a variant, not a panic or an `Err` — the notification
/// dispatch path must never crash on a malformed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Primary(PrimarySample),
    Auxiliary(AuxiliarySample),
    Unrecognized(UnrecognizedFrame),
    Truncated(TruncatedFrame),
}

/// One exported row: a light-detected primary sample plus everything we want
/// to correlate against it.
///
/// The `app_*` fields are ground truth read manually off the instrument's own
/// app at capture time; they are always `None` in memory and are filled in by
/// hand in the exported CSV.  `battery_millivolts` is populated at most once,
/// from the first auxiliary packet that arrives before the next primary
/// sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub received_at: DateTime<Local>,
    pub raw_hex: String,
    pub raw_val_1: u16,
    pub raw_val_2: u16,
    pub raw_val_3: u16,
    pub battery_millivolts: Option<u16>,
    pub app_lux: Option<f64>,
    pub app_cct: Option<f64>,
    pub app_ra: Option<f64>,
    pub app_x: Option<f64>,
    pub app_y: Option<f64>,
    pub app_u: Option<f64>,
    pub app_v: Option<f64>,
    pub app_battery_percent: Option<f64>,
}

impl SessionRecord {
    /// Build a fresh row from a light-detected primary sample.  All
    /// correlation fields start empty.
    pub fn from_primary(sample: &PrimarySample) -> Self {
        Self {
            received_at: sample.received_at,
            raw_hex: sample.raw_hex.clone(),
            raw_val_1: sample.raw_val_1,
            raw_val_2: sample.raw_val_2,
            raw_val_3: sample.raw_val_3,
            battery_millivolts: None,
            app_lux: None,
            app_cct: None,
            app_ra: None,
            app_x: None,
            app_y: None,
            app_u: None,
            app_v: None,
            app_battery_percent: None,
        }
    }
}

/// All events emitted by [`crate::probe_client::ProbeClient`].
///
/// Consumers receive these through the `mpsc::Receiver` returned by
/// [`crate::probe_client::ProbeClient::connect`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    /// The BLE link is up and GATT services are discovered.  The inner
    /// `String` is the advertised device name (e.g. `"LMaster_0d72"`).
    Connected(String),
    /// One notification, already classified.
    Decoded(DecodedRecord),
    /// The BLE link was lost.  After this event the channel closes; no
    /// further events arrive.
    Disconnected,
}
