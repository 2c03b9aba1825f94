//! Compact Position Reporting.
//!
//! ADS-B encodes positions in alternating even/odd CPR frames. A pair of
//! opposite-parity frames received close together decodes globally; a
//! single frame decodes locally against a reference within half a cell
//! (a configured receiver location or a recent position of the same
//! aircraft).

use serde::{Deserialize, Serialize};

/// Parity flag of a CPR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CprFormat {
    Even,
    Odd,
}

/// One encoded position frame: parity plus the 17-bit latitude and
/// longitude fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CprFrame {
    pub format: CprFormat,
    pub lat_cpr: u32,
    pub lon_cpr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn is_plausible(&self) -> bool {
        // (0, 0) means missing data upstream, not the Gulf of Guinea.
        if self.latitude.abs() < 0.001 && self.longitude.abs() < 0.001 {
            return false;
        }
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Number of latitude zones between the equator and a pole (Mode S).
const NZ: f64 = 15.0;

/// 2^17, CPR lat/lon are 17-bit fields.
const CPR_MAX: f64 = 131_072.0;

const D_LAT_EVEN: f64 = 360.0 / (4.0 * NZ);
const D_LAT_ODD: f64 = 360.0 / (4.0 * NZ - 1.0);

/// Euclidean-style modulo: the result carries the sign of the divisor.
fn modulo(a: f64, b: f64) -> f64 {
    if a >= 0.0 { a % b } else { a % b + b.abs() }
}

/// Number of longitude zones (1..=59) at a given latitude.
/// Precomputed table from 1090-WP-9-14.
#[rustfmt::skip]
fn nl(lat: f64) -> u64 {
    let lat = lat.abs();
    if lat < 29.911_356_86 {
        if lat < 10.470_471_30 { return 59; }
        if lat < 14.828_174_37 { return 58; }
        if lat < 18.186_263_57 { return 57; }
        if lat < 21.029_394_93 { return 56; }
        if lat < 23.545_044_87 { return 55; }
        if lat < 25.829_247_07 { return 54; }
        if lat < 27.938_987_10 { return 53; }
        return 52;
    }
    if lat < 44.194_549_51 {
        if lat < 31.772_097_08 { return 51; }
        if lat < 33.539_934_36 { return 50; }
        if lat < 35.228_995_98 { return 49; }
        if lat < 36.850_251_08 { return 48; }
        if lat < 38.412_418_92 { return 47; }
        if lat < 39.922_566_84 { return 46; }
        if lat < 41.386_518_32 { return 45; }
        if lat < 42.809_140_12 { return 44; }
        return 43;
    }
    if lat < 59.954_592_77 {
        if lat < 45.546_267_23 { return 42; }
        if lat < 46.867_332_52 { return 41; }
        if lat < 48.160_391_28 { return 40; }
        if lat < 49.427_764_39 { return 39; }
        if lat < 50.671_501_66 { return 38; }
        if lat < 51.893_424_69 { return 37; }
        if lat < 53.095_161_53 { return 36; }
        if lat < 54.278_174_72 { return 35; }
        if lat < 55.443_784_44 { return 34; }
        if lat < 56.593_187_56 { return 33; }
        if lat < 57.727_473_54 { return 32; }
        if lat < 58.847_637_76 { return 31; }
        return 30;
    }
    if lat < 61.049_177_74 { return 29; }
    if lat < 62.132_166_59 { return 28; }
    if lat < 63.204_274_79 { return 27; }
    if lat < 64.266_165_23 { return 26; }
    if lat < 65.318_453_10 { return 25; }
    if lat < 66.361_710_08 { return 24; }
    if lat < 67.396_467_74 { return 23; }
    if lat < 68.423_220_22 { return 22; }
    if lat < 69.442_426_31 { return 21; }
    if lat < 70.454_510_75 { return 20; }
    if lat < 71.459_864_73 { return 19; }
    if lat < 72.458_845_45 { return 18; }
    if lat < 73.451_774_42 { return 17; }
    if lat < 74.438_934_16 { return 16; }
    if lat < 75.420_562_57 { return 15; }
    if lat < 76.396_843_91 { return 14; }
    if lat < 77.367_894_61 { return 13; }
    if lat < 78.333_740_83 { return 12; }
    if lat < 79.294_282_25 { return 11; }
    if lat < 80.249_232_13 { return 10; }
    if lat < 81.198_013_49 { return 9; }
    if lat < 82.139_569_81 { return 8; }
    if lat < 83.071_994_45 { return 7; }
    if lat < 83.991_735_63 { return 6; }
    if lat < 84.891_661_91 { return 5; }
    if lat < 85.755_416_21 { return 4; }
    if lat < 86.535_369_98 { return 3; }
    if lat < 87.000_000_00 { return 2; }
    1
}

/// Globally-unambiguous airborne decoding from an even/odd pair.
///
/// Returns `None` when the two frames share a parity or when the pair
/// straddles a longitude-zone boundary (NL mismatch).
pub fn airborne_global(oldest: &CprFrame, latest: &CprFrame) -> Option<Position> {
    let (even, odd) = match (oldest.format, latest.format) {
        (CprFormat::Even, CprFormat::Odd) => (oldest, latest),
        (CprFormat::Odd, CprFormat::Even) => (latest, oldest),
        _ => return None,
    };

    let cpr_lat_even = f64::from(even.lat_cpr) / CPR_MAX;
    let cpr_lon_even = f64::from(even.lon_cpr) / CPR_MAX;
    let cpr_lat_odd = f64::from(odd.lat_cpr) / CPR_MAX;
    let cpr_lon_odd = f64::from(odd.lon_cpr) / CPR_MAX;

    let j = (59.0 * cpr_lat_even - 60.0 * cpr_lat_odd + 0.5).floor();

    let mut lat_even = D_LAT_EVEN * (modulo(j, 60.0) + cpr_lat_even);
    let mut lat_odd = D_LAT_ODD * (modulo(j, 59.0) + cpr_lat_odd);

    if lat_even >= 270.0 {
        lat_even -= 360.0;
    }
    if lat_odd >= 270.0 {
        lat_odd -= 360.0;
    }

    if !(-90.0..=90.0).contains(&lat_even) || !(-90.0..=90.0).contains(&lat_odd) {
        return None;
    }
    if nl(lat_even) != nl(lat_odd) {
        return None;
    }

    let lat = if latest.format == CprFormat::Even {
        lat_even
    } else {
        lat_odd
    };

    let (p, c) = if latest.format == CprFormat::Even {
        (0, cpr_lon_even)
    } else {
        (1, cpr_lon_odd)
    };
    let ni = std::cmp::max(nl(lat) - p, 1) as f64;
    let m = (cpr_lon_even * (nl(lat) - 1) as f64 - cpr_lon_odd * nl(lat) as f64 + 0.5).floor();

    let r = modulo(m, ni);

    let mut lon = (360.0 / ni) * (r + c);
    if lon >= 180.0 {
        lon -= 360.0;
    }

    Some(Position {
        latitude: lat,
        longitude: lon,
    })
}

/// Locally-unambiguous airborne decoding against a reference within
/// 180 NM of the true position.
pub fn airborne_local(frame: &CprFrame, latitude_ref: f64, longitude_ref: f64) -> Option<Position> {
    local_decode(frame, latitude_ref, longitude_ref, 360.0)
}

/// Locally-unambiguous surface decoding; reference within 45 NM.
pub fn surface_local(frame: &CprFrame, latitude_ref: f64, longitude_ref: f64) -> Option<Position> {
    local_decode(frame, latitude_ref, longitude_ref, 90.0)
}

fn local_decode(
    frame: &CprFrame,
    latitude_ref: f64,
    longitude_ref: f64,
    span: f64,
) -> Option<Position> {
    let cpr_lat = f64::from(frame.lat_cpr) / CPR_MAX;
    let cpr_lon = f64::from(frame.lon_cpr) / CPR_MAX;

    let d_lat = if frame.format == CprFormat::Even {
        span / 60.0
    } else {
        span / 59.0
    };

    let j = (latitude_ref / d_lat).floor()
        + (0.5 + modulo(latitude_ref, d_lat) / d_lat - cpr_lat).floor();

    let lat = d_lat * (j + cpr_lat);

    if !(-90.0..=90.0).contains(&lat) {
        return None;
    }
    // The answer may not be more than half a cell away from the reference.
    if (lat - latitude_ref).abs() > d_lat / 2.0 {
        return None;
    }

    let ni = if frame.format == CprFormat::Even {
        nl(lat)
    } else {
        nl(lat) - 1
    };
    let d_lon = if ni > 0 { span / ni as f64 } else { span };
    let m = (longitude_ref / d_lon).floor()
        + (0.5 + modulo(longitude_ref, d_lon) / d_lon - cpr_lon).floor();
    let lon = d_lon * (m + cpr_lon);

    if (lon - longitude_ref).abs() > d_lon / 2.0 {
        return None;
    }

    Some(Position {
        latitude: lat,
        longitude: lon,
    })
}

/// Great-circle distance in kilometers, for jump-plausibility checks.
pub fn haversine_km(a: &Position, b: &Position) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    6371.0 * c
}

#[cfg(test)]
mod tests {
    use super::*;

    // Encoded fields of the frame pair
    // 8D40058B58C901375147EFD09357 / 8D40058B58C904A87F402D3B8C59.
    const EVEN_A: CprFrame = CprFrame {
        format: CprFormat::Even,
        lat_cpr: 39848,
        lon_cpr: 83951,
    };
    const ODD_A: CprFrame = CprFrame {
        format: CprFormat::Odd,
        lat_cpr: 21567,
        lon_cpr: 81965,
    };

    #[test]
    fn global_pair_decodes() {
        let pos = airborne_global(&EVEN_A, &ODD_A).unwrap();
        assert!((pos.latitude - 49.81755).abs() < 0.01, "lat {}", pos.latitude);
        assert!((pos.longitude - 6.08442).abs() < 0.01, "lon {}", pos.longitude);
    }

    #[test]
    fn global_pair_order_independent_parity() {
        // 8d4d224f58bf07c2d41a9a353d70 (odd) then
        // 8d4d224f58bf003b221b34aa5b8d (even); latest even drives latitude.
        let odd = CprFrame {
            format: CprFormat::Odd,
            lat_cpr: 123242,
            lon_cpr: 6810,
        };
        let even = CprFrame {
            format: CprFormat::Even,
            lat_cpr: 7569,
            lon_cpr: 6964,
        };
        let pos = airborne_global(&odd, &even).unwrap();
        assert!((pos.latitude - 42.346).abs() < 0.05, "lat {}", pos.latitude);
        assert!((pos.longitude - 0.4347).abs() < 0.005, "lon {}", pos.longitude);
    }

    #[test]
    fn same_parity_pair_is_rejected() {
        assert!(airborne_global(&EVEN_A, &EVEN_A).is_none());
        assert!(airborne_global(&ODD_A, &ODD_A).is_none());
    }

    #[test]
    fn local_airborne_decodes_near_reference() {
        let pos = airborne_local(&EVEN_A, 49.0, 6.0).unwrap();
        assert!((pos.latitude - 49.82410).abs() < 0.01, "lat {}", pos.latitude);
        assert!((pos.longitude - 6.06785).abs() < 0.01, "lon {}", pos.longitude);
    }

    #[test]
    fn local_airborne_rejects_far_reference() {
        // Half a latitude cell is 3 degrees for even frames.
        assert!(airborne_local(&EVEN_A, 30.0, 6.0).is_none());
    }

    #[test]
    fn local_surface_decodes() {
        // 8c4841753aab238733c8cd4020b1 near EHAM.
        let frame = CprFrame {
            format: CprFormat::Even,
            lat_cpr: 115609,
            lon_cpr: 116941,
        };
        let pos = surface_local(&frame, 51.99, 4.375).unwrap();
        assert!((pos.latitude - 52.32061).abs() < 0.01, "lat {}", pos.latitude);
        assert!((pos.longitude - 4.73473).abs() < 0.01, "lon {}", pos.longitude);
    }

    #[test]
    fn plausibility_rejects_null_island_and_out_of_range() {
        assert!(!Position { latitude: 0.0, longitude: 0.0 }.is_plausible());
        assert!(!Position { latitude: 91.0, longitude: 0.0 }.is_plausible());
        assert!(Position { latitude: 49.8, longitude: 6.1 }.is_plausible());
    }

    #[test]
    fn haversine_sanity() {
        let paris = Position { latitude: 48.8566, longitude: 2.3522 };
        let london = Position { latitude: 51.5074, longitude: -0.1278 };
        let d = haversine_km(&paris, &london);
        assert!((d - 343.5).abs() < 5.0, "distance {d}");
    }
}
