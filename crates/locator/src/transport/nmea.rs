//! NMEA 0183 `$GPGGA`/`$GPRMC` sentence encoding.

use super::time::utc_from_unix;
use crate::geo::GeoPoint;

const KNOTS_PER_MPS: f64 = 1.943_844_5;

/// XOR of every byte between `$` and `*`, formatted as two uppercase hex
/// digits.
pub fn checksum(body: &str) -> String {
    let cs = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{cs:02X}")
}

fn format_lat(lat: f64) -> (String, char) {
    let hemi = if lat >= 0.0 { 'N' } else { 'S' };
    let abs = lat.abs();
    let deg = abs.floor() as u32;
    let minutes = (abs - deg as f64) * 60.0;
    (format!("{deg:02}{minutes:08.5}"), hemi)
}

fn format_lon(lon: f64) -> (String, char) {
    let hemi = if lon >= 0.0 { 'E' } else { 'W' };
    let abs = lon.abs();
    let deg = abs.floor() as u32;
    let minutes = (abs - deg as f64) * 60.0;
    (format!("{deg:03}{minutes:08.5}"), hemi)
}

fn num_satellites_hint(hdop: f64) -> u32 {
    (12.0 / hdop.max(0.5)).round().clamp(4.0, 12.0) as u32
}

/// Builds a `$GPGGA` sentence for a fused fix.
pub fn encode_gga(pos: GeoPoint, hdop: f64, timestamp: f64) -> String {
    let t = utc_from_unix(timestamp);
    let (lat_str, lat_hemi) = format_lat(pos.lat);
    let (lon_str, lon_hemi) = format_lon(pos.lon);
    let nn = num_satellites_hint(hdop);

    let body = format!(
        "GPGGA,{:02}{:02}{:02}.{:02},{},{},{},{},1,{:02},{:.1},0.0,M,0.0,M,,",
        t.hour, t.minute, t.second, t.centisecond, lat_str, lat_hemi, lon_str, lon_hemi, nn, hdop
    );
    format!("${body}*{}\r\n", checksum(&body))
}

/// Builds a `$GPRMC` sentence for a fused fix.
pub fn encode_rmc(pos: GeoPoint, speed_mps: f64, heading_deg: f64, timestamp: f64) -> String {
    let t = utc_from_unix(timestamp);
    let (lat_str, lat_hemi) = format_lat(pos.lat);
    let (lon_str, lon_hemi) = format_lon(pos.lon);
    let knots = speed_mps * KNOTS_PER_MPS;

    let body = format!(
        "GPRMC,{:02}{:02}{:02}.{:02},A,{},{},{},{},{:.1},{:.1},{:02}{:02}{:02},,,A",
        t.hour,
        t.minute,
        t.second,
        t.centisecond,
        lat_str,
        lat_hemi,
        lon_str,
        lon_hemi,
        knots,
        heading_deg,
        t.day,
        t.month,
        t.year2
    );
    format!("${body}*{}\r\n", checksum(&body))
}
