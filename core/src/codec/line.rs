//! Decoder for the radio modem's serial output.
//!
//! Two line shapes are recognised:
//!
//! ```text
//! +TEST: RX "4131...3B"              data frame, quoted hex payload
//! +TEST: LEN:24, RSSI:-71, SNR:9     diagnostics for the next frame
//! ```
//!
//! A data payload decodes to `<prefix><field>;<field>;...`. Prefix `A` carries
//! six telemetry floats, prefix `B` carries latitude, longitude and status.

use log::{debug, warn};

use crate::packets::{AuxiliaryPacket, Frame, PacketKind, TelemetryPacket, TransmissionInfo};

const RX_PREFIX: &str = "+TEST: RX";
const DIAGNOSTIC_MARKER: &str = "+TEST: LEN:";
const TELEMETRY_FIELDS: usize = 6;
const AUXILIARY_FIELDS: usize = 3;

/// Reasons a data frame produced no packet.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("invalid hex payload: {0}")]
    InvalidHex(String),
    #[error("empty payload")]
    EmptyPayload,
    #[error("unknown packet prefix {0:?}")]
    UnknownPrefix(char),
    #[error("{kind:?} packet needs {expected} fields, got {found}")]
    InsufficientFields {
        kind: PacketKind,
        expected: usize,
        found: usize,
    },
    #[error("field {index} ({name}) is not valid: {value:?}")]
    InvalidField {
        index: usize,
        name: &'static str,
        value: String,
    },
}

/// Decodes one serial line, logging and swallowing decode failures.
pub fn decode_line(line: &str) -> Option<Frame> {
    match try_decode_line(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("dropping radio frame: {} (line {:?})", err, line);
            None
        }
    }
}

/// Decodes one serial line.
///
/// `Ok(None)` means the line is not a recognised shape; `Err` means it looked
/// like a data frame but could not be turned into a packet.
pub fn try_decode_line(line: &str) -> Result<Option<Frame>, DecodeError> {
    let line = line.trim();
    if line.starts_with(RX_PREFIX) {
        return decode_rx(line);
    }
    match parse_transmission(line) {
        Some(info) => Ok(Some(Frame::Transmission(info))),
        None => {
            debug!("unrecognised modem line: {:?}", line);
            Ok(None)
        }
    }
}

fn decode_rx(line: &str) -> Result<Option<Frame>, DecodeError> {
    let Some(hex_run) = quoted_hex(line) else {
        debug!("RX line without hex payload: {:?}", line);
        return Ok(None);
    };
    let bytes = hex::decode(hex_run).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
    let text = String::from_utf8_lossy(&bytes);
    let payload = text.trim();
    debug!("decoded RX payload {:?}", payload);

    let mut chars = payload.chars();
    let prefix = chars.next().ok_or(DecodeError::EmptyPayload)?;
    let fields: Vec<&str> = chars.as_str().split(';').collect();

    match prefix {
        'A' => parse_telemetry(&fields).map(|p| Some(Frame::Telemetry(p))),
        'B' => parse_auxiliary(&fields).map(|p| Some(Frame::Auxiliary(p))),
        other => Err(DecodeError::UnknownPrefix(other)),
    }
}

/// Finds the first `"<hex digits>"` run in the line.
fn quoted_hex(line: &str) -> Option<&str> {
    let mut rest = line;
    while let Some(open) = rest.find('"') {
        let after = &rest[open + 1..];
        let run = after
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(after.len());
        if run > 0 && after[run..].starts_with('"') {
            return Some(&after[..run]);
        }
        rest = after;
    }
    None
}

fn parse_telemetry(fields: &[&str]) -> Result<TelemetryPacket, DecodeError> {
    require(PacketKind::Telemetry, fields, TELEMETRY_FIELDS)?;
    Ok(TelemetryPacket {
        pitch: float_field(fields, 0, "pitch")?,
        roll: float_field(fields, 1, "roll")?,
        yaw: float_field(fields, 2, "yaw")?,
        vertical_velocity: float_field(fields, 3, "vertical_velocity")?,
        altitude: float_field(fields, 4, "altitude")?,
        battery_level: float_field(fields, 5, "battery_level")?,
        rssi: None,
        snr: None,
    })
}

fn parse_auxiliary(fields: &[&str]) -> Result<AuxiliaryPacket, DecodeError> {
    require(PacketKind::Auxiliary, fields, AUXILIARY_FIELDS)?;
    let status = fields[2].trim();
    Ok(AuxiliaryPacket {
        latitude: fields[0].trim().to_string(),
        longitude: fields[1].trim().to_string(),
        status: status.parse().map_err(|_| DecodeError::InvalidField {
            index: 2,
            name: "status",
            value: status.to_string(),
        })?,
        rssi: None,
        snr: None,
    })
}

fn require(kind: PacketKind, fields: &[&str], expected: usize) -> Result<(), DecodeError> {
    if fields.len() < expected {
        return Err(DecodeError::InsufficientFields {
            kind,
            expected,
            found: fields.len(),
        });
    }
    Ok(())
}

fn float_field(fields: &[&str], index: usize, name: &'static str) -> Result<f64, DecodeError> {
    let raw = fields[index].trim();
    raw.parse().map_err(|_| DecodeError::InvalidField {
        index,
        name,
        value: raw.to_string(),
    })
}

/// Parses `+TEST: LEN:<int>, RSSI:<int>, SNR:<int>` anywhere in the line.
fn parse_transmission(line: &str) -> Option<TransmissionInfo> {
    let start = line.find(DIAGNOSTIC_MARKER)?;
    let rest = &line[start + DIAGNOSTIC_MARKER.len()..];

    let (len, rest) = leading_int(rest, false)?;
    let rest = rest.strip_prefix(", RSSI:")?;
    let (rssi, rest) = leading_int(rest, true)?;
    let rest = rest.strip_prefix(", SNR:")?;
    let (snr, _) = leading_int(rest, true)?;

    Some(TransmissionInfo {
        len: u32::try_from(len).ok()?,
        rssi: i32::try_from(rssi).ok()?,
        snr: i32::try_from(snr).ok()?,
    })
}

fn leading_int(text: &str, signed: bool) -> Option<(i64, &str)> {
    let sign_len = usize::from(signed && text.starts_with('-'));
    let digits = text[sign_len..]
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len() - sign_len);
    if digits == 0 {
        return None;
    }
    let end = sign_len + digits;
    Some((text[..end].parse().ok()?, &text[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx_line(payload: &str) -> String {
        format!("+TEST: RX \"{}\"", hex::encode_upper(payload))
    }

    #[test]
    fn telemetry_frame_yields_fields_in_order() {
        let line = rx_line("A1.5;-2.25;180;35.5;1200.75;7.9");
        match decode_line(&line) {
            Some(Frame::Telemetry(packet)) => {
                assert_eq!(packet.pitch, 1.5);
                assert_eq!(packet.roll, -2.25);
                assert_eq!(packet.yaw, 180.0);
                assert_eq!(packet.vertical_velocity, 35.5);
                assert_eq!(packet.altitude, 1200.75);
                assert_eq!(packet.battery_level, 7.9);
                assert_eq!(packet.snr, None);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn telemetry_ignores_fields_beyond_six() {
        let line = rx_line("A1;2;3;4;5;6;7;8");
        assert!(matches!(decode_line(&line), Some(Frame::Telemetry(_))));
    }

    #[test]
    fn short_telemetry_frame_is_dropped() {
        let line = rx_line("A1;2;3;4;5");
        assert_eq!(
            try_decode_line(&line),
            Err(DecodeError::InsufficientFields {
                kind: PacketKind::Telemetry,
                expected: 6,
                found: 5,
            })
        );
        assert_eq!(decode_line(&line), None);
    }

    #[test]
    fn auxiliary_frame_keeps_coordinates_as_text() {
        let line = rx_line("B52.254912;20.900411;3\r\n");
        match decode_line(&line) {
            Some(Frame::Auxiliary(packet)) => {
                assert_eq!(packet.latitude, "52.254912");
                assert_eq!(packet.longitude, "20.900411");
                assert_eq!(packet.status, 3);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn short_auxiliary_frame_is_dropped() {
        let line = rx_line("B52.25;20.90");
        assert!(matches!(
            try_decode_line(&line),
            Err(DecodeError::InsufficientFields { found: 2, .. })
        ));
    }

    #[test]
    fn unknown_prefix_and_bad_numbers_do_not_panic() {
        assert_eq!(
            try_decode_line(&rx_line("C1;2;3")),
            Err(DecodeError::UnknownPrefix('C'))
        );
        assert!(matches!(
            try_decode_line(&rx_line("A1;x;3;4;5;6")),
            Err(DecodeError::InvalidField { index: 1, .. })
        ));
        assert_eq!(decode_line(&rx_line("A1;x;3;4;5;6")), None);
    }

    #[test]
    fn malformed_hex_is_reported_and_missing_hex_ignored() {
        assert_eq!(try_decode_line("+TEST: RX no payload here"), Ok(None));
        assert!(matches!(
            try_decode_line("+TEST: RX \"ABC\""),
            Err(DecodeError::InvalidHex(_))
        ));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let mut bytes = b"A1;2;3;4;5;6".to_vec();
        bytes.push(0xFF);
        let line = format!("+TEST: RX \"{}\"", hex::encode(bytes));
        // the replacement character lands in the sixth field
        assert!(matches!(
            try_decode_line(&line),
            Err(DecodeError::InvalidField { index: 5, .. })
        ));
    }

    #[test]
    fn hex_run_is_found_after_other_quoted_text() {
        let line = format!("+TEST: RX \"len\", \"{}\"", hex::encode("B1;2;0"));
        assert!(matches!(decode_line(&line), Some(Frame::Auxiliary(_))));
    }

    #[test]
    fn diagnostic_line_yields_transmission_info() {
        assert_eq!(
            decode_line("+TEST: LEN:24, RSSI:-71, SNR:-3"),
            Some(Frame::Transmission(TransmissionInfo {
                len: 24,
                rssi: -71,
                snr: -3,
            }))
        );
    }

    #[test]
    fn unrelated_lines_yield_nothing() {
        assert_eq!(try_decode_line("+TEST: RXLRPKT"), Ok(None));
        assert_eq!(try_decode_line("+MODE: TEST"), Ok(None));
        assert_eq!(try_decode_line("+TEST: LEN:x, RSSI:1, SNR:1"), Ok(None));
        assert_eq!(try_decode_line(""), Ok(None));
    }
}
