//! GATT UUIDs, command payloads, and frame-shape constants for the Opple
//! Light Master Pro.
//!
//! Everything here was inferred empirically by watching BLE traffic between
//! the instrument and its phone app.  None of it comes from documentation;
//! offsets and byte orders are observed contracts for the one firmware
//! revision studied and should not be assumed to generalise.

use uuid::Uuid;

use crate::types::Channel;

// ── Service ──────────────────────────────────────────────────────────────────

/// Nordic-UART-style vendor service advertised by the Light Master.
#[allow(dead_code)]
pub const LIGHTMASTER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Nominal data/Rx characteristic.
///
/// Despite the name, no measurement payload has ever been observed here.
/// It is still subscribed so that anything it does send ends up in the audit
/// log.
pub const DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Command/Tx characteristic.
///
/// Start/stop commands are written here, and — counter to the naming — this
/// is also where every 20-byte measurement and 11-byte telemetry notification
/// arrives.
pub const COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Map a notification's characteristic UUID to its logical [`Channel`].
pub fn channel_for_uuid(uuid: Uuid) -> Channel {
    if uuid == COMMAND_CHARACTERISTIC {
        Channel::Command
    } else if uuid == DATA_CHARACTERISTIC {
        Channel::Data
    } else {
        Channel::Other
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Begin a measurement.  Captured verbatim from app traffic; the two command
/// frames differ only in their final two bytes (`0a 00` = start).
pub const START_MEASUREMENT: [u8; 14] = [
    0x00, 0x00, 0x0e, 0x00, 0x13, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x0a, 0x00,
];

/// End a measurement (`0b 00` = stop).
pub const STOP_MEASUREMENT: [u8; 14] = [
    0x00, 0x00, 0x0e, 0x00, 0x13, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x0b, 0x00,
];

// ── Frame shapes ──────────────────────────────────────────────────────────────

/// Byte length of a primary measurement notification.
pub const PRIMARY_FRAME_LEN: usize = 20;

/// Byte offset of the first of three little-endian u16 sensor fields in a
/// primary frame (fields at 14–15, 16–17, 18–19).
pub const PRIMARY_FIELDS_OFFSET: usize = 14;

/// Byte length of an auxiliary (battery telemetry) notification.
pub const AUXILIARY_FRAME_LEN: usize = 11;

/// Byte offset of the big-endian u16 battery-millivolt field in an auxiliary
/// frame.
pub const AUXILIARY_BATTERY_OFFSET: usize = 8;

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Advertised-name prefix used to pick the Light Master out of a scan.
pub const DEFAULT_NAME_PREFIX: &str = "LMaster";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop_differ_only_in_opcode_bytes() {
        assert_eq!(START_MEASUREMENT.len(), 14);
        assert_eq!(STOP_MEASUREMENT.len(), 14);
        assert_eq!(START_MEASUREMENT[..12], STOP_MEASUREMENT[..12]);
        assert_eq!(&START_MEASUREMENT[12..], &[0x0a, 0x00]);
        assert_eq!(&STOP_MEASUREMENT[12..], &[0x0b, 0x00]);
    }

    #[test]
    fn uuid_channel_mapping() {
        assert_eq!(channel_for_uuid(COMMAND_CHARACTERISTIC), Channel::Command);
        assert_eq!(channel_for_uuid(DATA_CHARACTERISTIC), Channel::Data);
        assert_eq!(
            channel_for_uuid(Uuid::from_u128(0xdeadbeef)),
            Channel::Other
        );
    }
}
