//! MSP (MultiWii Serial Protocol) `SET_RAW_GPS` binary frame encoding.

use crate::geo::GeoPoint;

pub const FRAME_LEN: usize = 24;
const PAYLOAD_LEN: u8 = 18;
const CMD_SET_RAW_GPS: u8 = 0xC9;

/// Builds the 24-byte MSP `SET_RAW_GPS` frame.
///
/// `fix_type`: 0 = no fix, 2 = 2D fix, 3 = 3D fix (MSP convention).
/// `alt_cm`: signed centimeters; written as the raw 16-bit pattern of the
/// `i16` value onto the wire `u16` field, matching the upstream flight
/// controller's own wire contract (wraps above roughly 327m).
pub fn encode_set_raw_gps(
    pos: GeoPoint,
    fix_type: u8,
    num_sats: u8,
    alt_cm: i16,
    speed_cm_per_s: u16,
    course_0_1deg: u16,
    hdop: f64,
) -> [u8; FRAME_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN as usize];
    payload[0] = fix_type;
    payload[1] = num_sats;
    payload[2..6].copy_from_slice(&((pos.lat * 1e7) as i32).to_le_bytes());
    payload[6..10].copy_from_slice(&((pos.lon * 1e7) as i32).to_le_bytes());
    payload[10..12].copy_from_slice(&(alt_cm as u16).to_le_bytes());
    payload[12..14].copy_from_slice(&speed_cm_per_s.to_le_bytes());
    payload[14..16].copy_from_slice(&course_0_1deg.to_le_bytes());
    let hdop_scaled = (hdop * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
    payload[16..18].copy_from_slice(&hdop_scaled.to_le_bytes());

    let mut frame = [0u8; FRAME_LEN];
    frame[0..3].copy_from_slice(b"$M<");
    frame[3] = PAYLOAD_LEN;
    frame[4] = CMD_SET_RAW_GPS;
    frame[5..23].copy_from_slice(&payload);

    let mut cs = PAYLOAD_LEN ^ CMD_SET_RAW_GPS;
    for b in &payload {
        cs ^= b;
    }
    frame[23] = cs;

    frame
}
