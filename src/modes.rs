//! Mode-S decoder wrapper.
//!
//! The bit-level heavy lifting (CRC validation, downlink-format parsing,
//! callsign/velocity/altitude decoding) is delegated to rs1090; this module
//! turns one hex frame into a typed [`DecodedMessage`] that the assembler
//! can merge. The 24-bit ICAO address and the 17-bit CPR fields sit at
//! fixed positions in a DF17 frame and are read straight from the bytes.

use chrono::{DateTime, Utc};
use rs1090::decode::adsb::ME;
use rs1090::decode::bds::bds09::AirborneVelocitySubType;
use rs1090::decode::{Capability, DF};
use rs1090::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpr::{CprFormat, CprFrame};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid frame length: {0} bytes (expected 7 or 14)")]
    InvalidLength(usize),
    #[error("undecodable Mode S frame: {0}")]
    Frame(String),
    #[error("unsupported downlink format")]
    UnsupportedFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityKind {
    Airborne,
    Surface,
}

/// One decoded Mode-S message, reduced to what the assembler consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Identification {
        icao: u32,
        callsign: String,
        rx_time: DateTime<Utc>,
    },
    AirbornePosition {
        icao: u32,
        cpr: CprFrame,
        altitude_ft: Option<i32>,
        rx_time: DateTime<Utc>,
    },
    SurfacePosition {
        icao: u32,
        cpr: CprFrame,
        rx_time: DateTime<Utc>,
    },
    Velocity {
        icao: u32,
        ground_speed: Option<f64>,
        track_deg: Option<f64>,
        vertical_rate_fpm: Option<i32>,
        kind: VelocityKind,
        rx_time: DateTime<Utc>,
    },
    /// Valid DF17 frame with a typecode we do not consume. Counted,
    /// otherwise only refreshes `last_seen`.
    Other { icao: u32, rx_time: DateTime<Utc> },
}

impl DecodedMessage {
    pub fn icao(&self) -> u32 {
        match self {
            Self::Identification { icao, .. }
            | Self::AirbornePosition { icao, .. }
            | Self::SurfacePosition { icao, .. }
            | Self::Velocity { icao, .. }
            | Self::Other { icao, .. } => *icao,
        }
    }

    pub fn rx_time(&self) -> DateTime<Utc> {
        match self {
            Self::Identification { rx_time, .. }
            | Self::AirbornePosition { rx_time, .. }
            | Self::SurfacePosition { rx_time, .. }
            | Self::Velocity { rx_time, .. }
            | Self::Other { rx_time, .. } => *rx_time,
        }
    }
}

/// Decode one hex frame as received from dump1090.
pub fn decode(hex_frame: &str, rx_time: DateTime<Utc>) -> Result<DecodedMessage, DecodeError> {
    let bytes = hex::decode(hex_frame.trim())?;
    if bytes.len() != 7 && bytes.len() != 14 {
        return Err(DecodeError::InvalidLength(bytes.len()));
    }

    let message =
        Message::try_from(bytes.as_slice()).map_err(|e| DecodeError::Frame(e.to_string()))?;

    let DF::ExtendedSquitterADSB(adsb) = &message.df else {
        return Err(DecodeError::UnsupportedFormat);
    };

    let icao = icao_from_frame(&bytes);

    let decoded = match &adsb.message {
        ME::BDS08 { inner, .. } => match normalize_callsign(&inner.callsign) {
            Some(callsign) => DecodedMessage::Identification {
                icao,
                callsign,
                rx_time,
            },
            None => DecodedMessage::Other { icao, rx_time },
        },
        ME::BDS05 { inner, .. } => DecodedMessage::AirbornePosition {
            icao,
            cpr: cpr_from_frame(&bytes),
            altitude_ft: inner.alt,
            rx_time,
        },
        ME::BDS06 { .. } => DecodedMessage::SurfacePosition {
            icao,
            cpr: cpr_from_frame(&bytes),
            rx_time,
        },
        ME::BDS09(velocity) => {
            let (ground_speed, track_deg) = match &velocity.velocity {
                AirborneVelocitySubType::GroundSpeedDecoding(gsd) => {
                    (Some(gsd.groundspeed as f64), Some(gsd.track as f64))
                }
                AirborneVelocitySubType::AirspeedSubsonic(asd) => (
                    asd.airspeed.map(|a| a as f64),
                    asd.heading.map(|h| h as f64),
                ),
                AirborneVelocitySubType::AirspeedSupersonic(asd) => (
                    asd.airspeed.map(|a| a as f64),
                    asd.heading.map(|h| h as f64),
                ),
                _ => (None, None),
            };
            let vertical_rate_fpm = velocity.vertical_rate.map(|v| v as i32);

            if ground_speed.is_none() && track_deg.is_none() && vertical_rate_fpm.is_none() {
                DecodedMessage::Other { icao, rx_time }
            } else {
                DecodedMessage::Velocity {
                    icao,
                    ground_speed,
                    track_deg,
                    vertical_rate_fpm,
                    kind: velocity_kind(adsb.capability),
                    rx_time,
                }
            }
        }
        _ => DecodedMessage::Other { icao, rx_time },
    };

    Ok(decoded)
}

/// BDS09 is always an airborne-velocity report; the capability field tells
/// us whether the transponder considers itself on the ground.
fn velocity_kind(capability: Capability) -> VelocityKind {
    match capability {
        Capability::AG_GROUND => VelocityKind::Surface,
        _ => VelocityKind::Airborne,
    }
}

/// AA field of a DF17 frame: bytes 1..=3.
fn icao_from_frame(frame: &[u8]) -> u32 {
    u32::from_be_bytes([0, frame[1], frame[2], frame[3]])
}

/// CPR fields of an airborne (BDS 0,5) or surface (BDS 0,6) ME.
/// F flag at ME bit 21, LAT-CPR at 22..=38, LON-CPR at 39..=55;
/// the ME starts at frame byte 4.
fn cpr_from_frame(frame: &[u8]) -> CprFrame {
    let format = if frame[6] & 0x04 != 0 {
        CprFormat::Odd
    } else {
        CprFormat::Even
    };
    let lat_cpr =
        (u32::from(frame[6] & 0x03) << 15) | (u32::from(frame[7]) << 7) | (u32::from(frame[8]) >> 1);
    let lon_cpr =
        (u32::from(frame[8] & 0x01) << 16) | (u32::from(frame[9]) << 8) | u32::from(frame[10]);
    CprFrame {
        format,
        lat_cpr,
        lon_cpr,
    }
}

/// Callsigns are at most eight characters, uppercase alphanumeric; rs1090
/// already maps the 6-bit charset, we strip padding and anything bogus.
fn normalize_callsign(raw: &str) -> Option<String> {
    let callsign: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(8)
        .collect();
    if callsign.is_empty() { None } else { Some(callsign) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn decodes_identification() {
        let msg = decode("8D406B902015A678D4D220AA4BDA", now()).unwrap();
        match msg {
            DecodedMessage::Identification { icao, callsign, .. } => {
                assert_eq!(icao, 0x406B90);
                assert_eq!(callsign, "EZY85MH");
            }
            other => panic!("expected identification, got {other:?}"),
        }
    }

    #[test]
    fn decodes_airborne_position_even() {
        let msg = decode("8D40058B58C901375147EFD09357", now()).unwrap();
        match msg {
            DecodedMessage::AirbornePosition {
                icao,
                cpr,
                altitude_ft,
                ..
            } => {
                assert_eq!(icao, 0x40058B);
                assert_eq!(cpr.format, CprFormat::Even);
                assert_eq!(cpr.lat_cpr, 39848);
                assert_eq!(cpr.lon_cpr, 83951);
                assert_eq!(altitude_ft, Some(39000));
            }
            other => panic!("expected airborne position, got {other:?}"),
        }
    }

    #[test]
    fn decodes_airborne_position_odd() {
        let msg = decode("8D40058B58C904A87F402D3B8C59", now()).unwrap();
        match msg {
            DecodedMessage::AirbornePosition { cpr, .. } => {
                assert_eq!(cpr.format, CprFormat::Odd);
                assert_eq!(cpr.lat_cpr, 21567);
                assert_eq!(cpr.lon_cpr, 81965);
            }
            other => panic!("expected airborne position, got {other:?}"),
        }
    }

    #[test]
    fn decodes_velocity() {
        let msg = decode("8D485020994409940838175B284F", now()).unwrap();
        match msg {
            DecodedMessage::Velocity {
                icao,
                ground_speed,
                track_deg,
                vertical_rate_fpm,
                kind,
                ..
            } => {
                assert_eq!(icao, 0x485020);
                let gs = ground_speed.unwrap();
                assert!((gs - 159.0).abs() < 1.0, "ground speed {gs}");
                let track = track_deg.unwrap();
                assert!((track - 182.88).abs() < 0.1, "track {track}");
                assert_eq!(vertical_rate_fpm, Some(-832));
                assert_eq!(kind, VelocityKind::Airborne);
            }
            other => panic!("expected velocity, got {other:?}"),
        }
    }

    #[test]
    fn decodes_surface_position() {
        let msg = decode("8c4841753aab238733c8cd4020b1", now()).unwrap();
        match msg {
            DecodedMessage::SurfacePosition { icao, cpr, .. } => {
                assert_eq!(icao, 0x484175);
                assert_eq!(cpr.format, CprFormat::Even);
                assert_eq!(cpr.lat_cpr, 115609);
                assert_eq!(cpr.lon_cpr, 116941);
            }
            other => panic!("expected surface position, got {other:?}"),
        }
    }

    #[test]
    fn unknown_typecode_maps_to_other() {
        // TC 0, no position information.
        let msg = decode("8D4BB463003D10000000001B5BEC", now()).unwrap();
        match msg {
            DecodedMessage::Other { icao, .. } => assert_eq!(icao, 0x4BB463),
            other => panic!("expected other, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            decode("not hex at all", now()),
            Err(DecodeError::InvalidHex(_))
        ));
        assert!(matches!(
            decode("8D40058B", now()),
            Err(DecodeError::InvalidLength(4))
        ));
        // Valid hex, valid length, corrupted CRC.
        assert!(matches!(
            decode("8D406B902015A678D4D220AA4BDB", now()),
            Err(DecodeError::Frame(_))
        ));
    }

    #[test]
    fn rejects_unsupported_downlink_format() {
        // DF11 all-call reply, 7 bytes: not an extended squitter.
        assert!(decode("5D4840D6202CC3", now()).is_err());
    }

    #[test]
    fn callsign_normalization() {
        assert_eq!(normalize_callsign("UAL123  "), Some("UAL123".to_string()));
        assert_eq!(normalize_callsign("ezy85mh"), Some("EZY85MH".to_string()));
        assert_eq!(normalize_callsign("  #####  "), None);
        assert_eq!(
            normalize_callsign("ABCDEFGH9"),
            Some("ABCDEFGH".to_string())
        );
    }
}
