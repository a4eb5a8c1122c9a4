//! Typed parsers for the fixed-shape replies.
//!
//! Every parser checks length, start byte, terminator and hex-ness before
//! touching the payload, and reports a `ProtocolFormat` error carrying the raw
//! reply otherwise. Signal and measurement replies must also echo the reply
//! opcode and the addressed channel.

use super::SignalKind;
use crate::channel::AdcReading;
use crate::error::{AppResult, DaqError};
use std::ops::Range;

/// Exact handshake reply of a healthy board.
pub const HANDSHAKE_REPLY: &[u8] = b":55555555\r";

pub const ACK_LEN: usize = 4;
pub const SIGNAL_REPLY_LEN: usize = 14;
pub const MEASURE_REPLY_LEN: usize = 18;

const SIGNAL_REPLY_OPCODE: u32 = 0x03;
const MEASURE_REPLY_OPCODE: u32 = 0x08;

const TERMINATOR: u8 = b'\r';

/// `true` when the reply is exactly the handshake pattern.
pub fn is_handshake_reply(raw: &[u8]) -> bool {
    raw == HANDSHAKE_REPLY
}

/// Parse a `:XX\r` status reply; `:00\r` means success.
pub fn parse_ack(command: &str, raw: &[u8]) -> AppResult<bool> {
    check_shape(command, raw, ACK_LEN)?;
    Ok(hex_field(command, raw, 1..3)? == 0)
}

/// Parse a `:03CS<8 hex>\r` signal reply for `channel`/`kind`.
///
/// Boards in the field echo the two address nibbles in either order, so
/// `CS` and `SC` are both accepted.
pub fn parse_signal(command: &str, raw: &[u8], channel: usize, kind: SignalKind) -> AppResult<u32> {
    check_shape(command, raw, SIGNAL_REPLY_LEN)?;
    check_opcode(command, raw, SIGNAL_REPLY_OPCODE)?;
    let first = hex_field(command, raw, 3..4)?;
    let second = hex_field(command, raw, 4..5)?;
    let (c, s) = (channel as u32, u32::from(kind.code()));
    if (first, second) != (c, s) && (first, second) != (s, c) {
        return Err(DaqError::format(
            command,
            raw,
            format!("reply addresses {first:X}{second:X}, expected channel {c:X} signal {s:X}"),
        ));
    }
    hex_field(command, raw, 5..13)
}

/// Parse a `:08CC<4 hex><4 hex><4 hex>\r` measurement reply for `channel`.
pub fn parse_measurement(command: &str, raw: &[u8], channel: usize) -> AppResult<AdcReading> {
    check_shape(command, raw, MEASURE_REPLY_LEN)?;
    check_opcode(command, raw, MEASURE_REPLY_OPCODE)?;
    let echoed = hex_field(command, raw, 3..5)?;
    if echoed != channel as u32 {
        return Err(DaqError::format(
            command,
            raw,
            format!("reply is for channel {echoed}, expected {channel}"),
        ));
    }
    Ok(AdcReading {
        pulse1: hex_field(command, raw, 5..9)? as u16,
        pulse2: hex_field(command, raw, 9..13)? as u16,
        background: hex_field(command, raw, 13..17)? as u16,
    })
}

fn check_opcode(command: &str, raw: &[u8], expected: u32) -> AppResult<()> {
    let opcode = hex_field(command, raw, 1..3)?;
    if opcode != expected {
        return Err(DaqError::format(
            command,
            raw,
            format!("reply opcode {opcode:02X}, expected {expected:02X}"),
        ));
    }
    Ok(())
}

fn check_shape(command: &str, raw: &[u8], expected: usize) -> AppResult<()> {
    if raw.len() != expected {
        return Err(DaqError::format(
            command,
            raw,
            format!("expected {expected} bytes, got {}", raw.len()),
        ));
    }
    if raw[0] != super::SENTINEL {
        return Err(DaqError::format(command, raw, "reply does not start with ':'"));
    }
    if raw[expected - 1] != TERMINATOR {
        return Err(DaqError::format(command, raw, "reply is not terminated by CR"));
    }
    Ok(())
}

fn hex_field(command: &str, raw: &[u8], range: Range<usize>) -> AppResult<u32> {
    let field = &raw[range.clone()];
    if !field.iter().all(u8::is_ascii_hexdigit) {
        return Err(DaqError::format(
            command,
            raw,
            format!("bytes {}..{} are not hexadecimal", range.start, range.end),
        ));
    }
    // All ASCII hex digits, so both conversions succeed; at most 8 digits fit a u32.
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| DaqError::format(command, raw, "hex field overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_reply() {
        assert_eq!(parse_signal(":0250", b":030500001A2B\r", 5, SignalKind::Dac).unwrap(), 6699);
        assert_eq!(parse_signal(":0250", b":035000001A2B\r", 5, SignalKind::Dac).unwrap(), 6699);
        assert_eq!(parse_signal(":02F3", b":03f300001a2b\r", 15, SignalKind::Samples).unwrap(), 6699);
    }

    #[test]
    fn test_signal_reply_wrong_length() {
        let err = parse_signal(":0250", b":0305001A2B\r", 5, SignalKind::Dac).unwrap_err();
        match err {
            DaqError::ProtocolFormat { raw, reason, .. } => {
                assert_eq!(raw, b":0305001A2B\r".to_vec());
                assert!(reason.contains("expected 14 bytes"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_signal_reply_not_hex() {
        assert!(matches!(
            parse_signal(":0250", b":03050000XYZW\r", 5, SignalKind::Dac),
            Err(DaqError::ProtocolFormat { .. })
        ));
    }

    #[test]
    fn test_measurement_reply() {
        let reading = parse_measurement(":0703", b":08032EE01F400064\r", 3).unwrap();
        assert_eq!(reading.pulse1, 12000);
        assert_eq!(reading.pulse2, 8000);
        assert_eq!(reading.background, 100);
    }

    #[test]
    fn test_measurement_reply_missing_terminator() {
        assert!(parse_measurement(":0703", b":08032EE01F4000640", 3).is_err());
    }

    #[test]
    fn test_signal_reply_for_other_address() {
        for raw in [&b":03A000001A2B\r"[..], b":035100001A2B\r", b":080500001A2B\r"] {
            assert!(
                matches!(
                    parse_signal(":0250", raw, 5, SignalKind::Dac),
                    Err(DaqError::ProtocolFormat { .. })
                ),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn test_measurement_reply_for_other_channel() {
        let err = parse_measurement(":0703", b":08042EE01F400064\r", 3).unwrap_err();
        match err {
            DaqError::ProtocolFormat { reason, .. } => assert!(reason.contains("channel 4")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(parse_measurement(":0703", b":03032EE01F400064\r", 3).is_err());
    }

    #[test]
    fn test_ack_reply() {
        assert!(parse_ack(":04...", b":00\r").unwrap());
        assert!(!parse_ack(":04...", b":FF\r").unwrap());
        assert!(parse_ack(":04...", b":0Z\r").is_err());
        assert!(parse_ack(":04...", b":00").is_err());
    }

    #[test]
    fn test_handshake_pattern() {
        assert!(is_handshake_reply(b":55555555\r"));
        assert!(!is_handshake_reply(b":55555554\r"));
        assert!(!is_handshake_reply(b":5555555\r"));
    }
}
