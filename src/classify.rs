//! The frame classifier: raw BLE notification bytes → typed decoded record.
//!
//! [`classify`] is pure (no I/O, no hidden state) and total — every input
//! maps to some [`DecodedRecord`] variant, including malformed ones.  It is
//! safe to call from the notification dispatch task for every frame without
//! any risk of panicking that task.
//!
//! # Classification rule
//!
//! The variant is decided **only** by `(channel, byte length)`:
//!
//! | Channel | Length | Variant |
//! |---|---|---|
//! | command | 20 | [`DecodedRecord::Primary`] |
//! | command | 11 | [`DecodedRecord::Auxiliary`] |
//! | command | other | [`DecodedRecord::Unrecognized`] |
//! | data / other | any | [`DecodedRecord::Unrecognized`] |
//!
//! Payload bytes are inspected only to fill fields after the variant is
//! fixed.  The one content-derived value is [`MeasurementState`]: a primary
//! frame whose three sensor fields are all zero was measured in darkness.

use crate::protocol::{
    AUXILIARY_BATTERY_OFFSET, AUXILIARY_FRAME_LEN, PRIMARY_FIELDS_OFFSET, PRIMARY_FRAME_LEN,
};
use crate::types::{
    AuxiliarySample, Channel, DecodedRecord, MeasurementState, PrimarySample, RawFrame,
    TruncatedFrame, UnrecognizedFrame,
};

/// Read a little-endian u16 at `offset`, or `None` if out of bounds.
fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Read a big-endian u16 at `offset`, or `None` if out of bounds.
fn read_u16_be(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Classify one raw frame into a typed record.
///
/// Idempotent: classifying the same frame twice yields identical output.
pub fn classify(frame: &RawFrame) -> DecodedRecord {
    match frame.channel {
        Channel::Command => match frame.bytes.len() {
            PRIMARY_FRAME_LEN => classify_primary(frame),
            AUXILIARY_FRAME_LEN => classify_auxiliary(frame),
            len => DecodedRecord::Unrecognized(UnrecognizedFrame {
                channel: frame.channel,
                len,
                raw_hex: frame.hex(),
            }),
        },
        // The data characteristic has never been observed carrying a
        // measurement.  Tagged with its channel so callers can keep it out
        // of noisy logging without losing the bytes.
        Channel::Data | Channel::Other => DecodedRecord::Unrecognized(UnrecognizedFrame {
            channel: frame.channel,
            len: frame.bytes.len(),
            raw_hex: frame.hex(),
        }),
    }
}

fn classify_primary(frame: &RawFrame) -> DecodedRecord {
    let data = &frame.bytes;
    let fields = (
        read_u16_le(data, PRIMARY_FIELDS_OFFSET),
        read_u16_le(data, PRIMARY_FIELDS_OFFSET + 2),
        read_u16_le(data, PRIMARY_FIELDS_OFFSET + 4),
    );
    match fields {
        (Some(raw_val_1), Some(raw_val_2), Some(raw_val_3)) => {
            let state = if raw_val_1 == 0 && raw_val_2 == 0 && raw_val_3 == 0 {
                MeasurementState::Dark
            } else {
                MeasurementState::LightDetected
            };
            DecodedRecord::Primary(PrimarySample {
                raw_val_1,
                raw_val_2,
                raw_val_3,
                state,
                raw_hex: frame.hex(),
                received_at: frame.received_at,
            })
        }
        // Unreachable while callers hand us the full notification, but a
        // truncated slice must degrade to a record, not a panic.
        _ => DecodedRecord::Truncated(TruncatedFrame {
            channel: frame.channel,
            expected_len: PRIMARY_FRAME_LEN,
            actual_len: data.len(),
            raw_hex: frame.hex(),
        }),
    }
}

fn classify_auxiliary(frame: &RawFrame) -> DecodedRecord {
    match read_u16_be(&frame.bytes, AUXILIARY_BATTERY_OFFSET) {
        Some(battery_millivolts) => DecodedRecord::Auxiliary(AuxiliarySample {
            battery_millivolts,
            raw_hex: frame.hex(),
        }),
        None => DecodedRecord::Truncated(TruncatedFrame {
            channel: frame.channel,
            expected_len: AUXILIARY_FRAME_LEN,
            actual_len: frame.bytes.len(),
            raw_hex: frame.hex(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_frame(bytes: Vec<u8>) -> RawFrame {
        RawFrame::new(Channel::Command, bytes)
    }

    /// A 20-byte frame with the given six tail bytes at offsets 14–19.
    fn primary_frame(tail: [u8; 6]) -> RawFrame {
        let mut bytes = vec![
            0x80, 0x00, 0x1f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x0a, 0x01,
        ];
        bytes.extend_from_slice(&tail);
        command_frame(bytes)
    }

    #[test]
    fn twenty_byte_frame_decodes_little_endian_fields() {
        // Observed packet: …0b00 b210 8216 → (11, 0x10b2, 0x1682)
        let rec = classify(&primary_frame([0x0b, 0x00, 0xb2, 0x10, 0x82, 0x16]));
        match rec {
            DecodedRecord::Primary(s) => {
                assert_eq!(s.raw_val_1, 11);
                assert_eq!(s.raw_val_2, 4274);
                assert_eq!(s.raw_val_3, 5762);
                assert_eq!(s.state, MeasurementState::LightDetected);
                assert!(s.raw_hex.ends_with("0b00b2108216"));
            }
            other => panic!("expected Primary, got {other:?}"),
        }
    }

    #[test]
    fn all_zero_fields_mean_dark() {
        let rec = classify(&primary_frame([0; 6]));
        match rec {
            DecodedRecord::Primary(s) => assert_eq!(s.state, MeasurementState::Dark),
            other => panic!("expected Primary, got {other:?}"),
        }
    }

    #[test]
    fn any_nonzero_field_means_light() {
        for i in 0..6 {
            let mut tail = [0u8; 6];
            tail[i] = 1;
            match classify(&primary_frame(tail)) {
                DecodedRecord::Primary(s) => {
                    assert_eq!(s.state, MeasurementState::LightDetected, "byte {i}")
                }
                other => panic!("expected Primary, got {other:?}"),
            }
        }
    }

    #[test]
    fn eleven_byte_frame_decodes_big_endian_battery() {
        let mut bytes = vec![0u8; 11];
        bytes[8] = 0x27;
        bytes[9] = 0x10;
        match classify(&command_frame(bytes)) {
            DecodedRecord::Auxiliary(s) => assert_eq!(s.battery_millivolts, 10_000),
            other => panic!("expected Auxiliary, got {other:?}"),
        }
    }

    #[test]
    fn other_lengths_on_command_channel_are_unrecognized() {
        for len in [0usize, 1, 10, 12, 19, 21, 64] {
            match classify(&command_frame(vec![0xaa; len])) {
                DecodedRecord::Unrecognized(u) => {
                    assert_eq!(u.len, len);
                    assert_eq!(u.channel, Channel::Command);
                }
                other => panic!("len {len}: expected Unrecognized, got {other:?}"),
            }
        }
    }

    #[test]
    fn data_channel_frames_are_unrecognized_even_at_known_lengths() {
        let frame = RawFrame::new(Channel::Data, vec![0x55; 20]);
        match classify(&frame) {
            DecodedRecord::Unrecognized(u) => assert_eq!(u.channel, Channel::Data),
            other => panic!("expected Unrecognized, got {other:?}"),
        }
    }

    #[test]
    fn classify_is_idempotent() {
        let frames = [
            primary_frame([0x0b, 0x00, 0xb2, 0x10, 0x82, 0x16]),
            command_frame(vec![0u8; 11]),
            command_frame(vec![0xff; 7]),
            RawFrame::new(Channel::Data, vec![1, 2, 3]),
        ];
        for frame in &frames {
            assert_eq!(classify(frame), classify(frame));
        }
    }
}
