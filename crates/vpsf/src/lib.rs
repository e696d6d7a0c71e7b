//! VPSF: dependency-free binary format for onboard flight-position recordings.
//!
//! A flight recording is a header followed by a flat run of fixed-size
//! records, one per processed frame, written in append-only order.
//!
//! File layout (little-endian):
//!   00 : [u8;4] magic = b"VPSF"
//!   04 : u16    version (current = 2)
//!   06 : u16    record_size (= 56)
//!   08 : records, RECORD_SIZE bytes each, until EOF
//!
//! Record layout (56 bytes, little-endian, matches `<3d5fBBHfHH>`):
//!   f64 timestamp
//!   f64 lat
//!   f64 lon
//!   f32 vn_mps
//!   f32 ve_mps
//!   f32 hdop
//!   f32 speed_mps
//!   f32 heading_deg
//!   u8  fix_quality   (0=none, 1=visual, 2=ekf_predict, 3=dead_reckoning)
//!   u8  source        (same encoding as fix_quality)
//!   u16 match_count
//!   f32 inlier_ratio
//!   u16 latency_ms
//!   u16 flags         (0x01=geofence_ok, 0x02=ekf_accepted, 0x04=blur_skip)

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const VPSF_MAGIC: [u8; 4] = *b"VPSF";
pub const VPSF_VERSION: u16 = 2;
pub const RECORD_SIZE: u16 = 56;
const HEADER_SIZE: u64 = 8;

/// Bit in `FlightRecord::flags` set when the output survived the geofence check.
pub const FLAG_GEOFENCE_OK: u16 = 0x01;
/// Bit set when the EKF accepted the measurement that produced this record.
pub const FLAG_EKF_ACCEPTED: u16 = 0x02;
/// Bit set when this tick was skipped for matching due to blur.
pub const FLAG_BLUR_SKIP: u16 = 0x04;

/// Fix/position source codes, shared with `FlightRecord::source`.
pub const SOURCE_NONE: u8 = 0;
pub const SOURCE_VISUAL: u8 = 1;
pub const SOURCE_EKF_PREDICT: u8 = 2;
pub const SOURCE_DEAD_RECKONING: u8 = 3;

/// A single frame's fused position and match diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightRecord {
    pub timestamp: f64,
    pub lat: f64,
    pub lon: f64,
    pub vn_mps: f32,
    pub ve_mps: f32,
    pub hdop: f32,
    pub speed_mps: f32,
    pub heading_deg: f32,
    pub fix_quality: u8,
    pub source: u8,
    pub match_count: u16,
    pub inlier_ratio: f32,
    pub latency_ms: u16,
    pub flags: u16,
}

impl FlightRecord {
    pub fn pack(&self) -> [u8; RECORD_SIZE as usize] {
        let mut buf = [0u8; RECORD_SIZE as usize];
        let mut w = &mut buf[..];
        w.write_all(&self.timestamp.to_le_bytes()).unwrap();
        w.write_all(&self.lat.to_le_bytes()).unwrap();
        w.write_all(&self.lon.to_le_bytes()).unwrap();
        w.write_all(&self.vn_mps.to_le_bytes()).unwrap();
        w.write_all(&self.ve_mps.to_le_bytes()).unwrap();
        w.write_all(&self.hdop.to_le_bytes()).unwrap();
        w.write_all(&self.speed_mps.to_le_bytes()).unwrap();
        w.write_all(&self.heading_deg.to_le_bytes()).unwrap();
        w.write_all(&[self.fix_quality]).unwrap();
        w.write_all(&[self.source]).unwrap();
        w.write_all(&self.match_count.to_le_bytes()).unwrap();
        w.write_all(&self.inlier_ratio.to_le_bytes()).unwrap();
        w.write_all(&self.latency_ms.to_le_bytes()).unwrap();
        w.write_all(&self.flags.to_le_bytes()).unwrap();
        buf
    }

    pub fn unpack(data: &[u8]) -> io::Result<Self> {
        if data.len() < RECORD_SIZE as usize {
            return Err(bad("truncated flight record"));
        }
        let mut p = data;
        Ok(Self {
            timestamp: le_f64(&mut p)?,
            lat: le_f64(&mut p)?,
            lon: le_f64(&mut p)?,
            vn_mps: le_f32(&mut p)?,
            ve_mps: le_f32(&mut p)?,
            hdop: le_f32(&mut p)?,
            speed_mps: le_f32(&mut p)?,
            heading_deg: le_f32(&mut p)?,
            fix_quality: le_u8(&mut p)?,
            source: le_u8(&mut p)?,
            match_count: le_u16(&mut p)?,
            inlier_ratio: le_f32(&mut p)?,
            latency_ms: le_u16(&mut p)?,
            flags: le_u16(&mut p)?,
        })
    }
}

/// Metadata about a flight file, recovered without reading every record.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub version: u16,
    pub record_size: u16,
    pub record_count: u64,
    pub file_size_bytes: u64,
}

/// Append-only writer for a flight recording.
///
/// Usage:
/// ```ignore
/// let mut rec = FlightRecorder::start(path)?;
/// rec.record(&flight_record)?;
/// rec.stop()?;
/// ```
pub struct FlightRecorder {
    file: BufWriter<File>,
    count: u64,
}

impl FlightRecorder {
    /// Creates (or truncates) the file and writes the header.
    pub fn start<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut file = BufWriter::new(file);
        file.write_all(&VPSF_MAGIC)?;
        file.write_all(&VPSF_VERSION.to_le_bytes())?;
        file.write_all(&RECORD_SIZE.to_le_bytes())?;
        Ok(Self { file, count: 0 })
    }

    pub fn record_count(&self) -> u64 {
        self.count
    }

    /// Appends one record, flushing every 100 records.
    pub fn record(&mut self, rec: &FlightRecord) -> io::Result<()> {
        self.file.write_all(&rec.pack())?;
        self.count += 1;
        if self.count % 100 == 0 {
            self.file.flush()?;
        }
        Ok(())
    }

    /// Flushes and closes the recording. Consumes self so it can't be written
    /// to again without reopening.
    pub fn stop(mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Reads every record from a flight file.
///
/// Rejects files with a foreign magic or a version newer than this crate
/// understands.
pub fn read<P: AsRef<Path>>(path: P) -> io::Result<Vec<FlightRecord>> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)?;

    let mut h = &header[..];
    if take(&mut h, 4)? != VPSF_MAGIC {
        return Err(bad("bad VPSF magic"));
    }
    let version = le_u16(&mut h)?;
    if version > VPSF_VERSION {
        return Err(bad("unsupported VPSF version"));
    }
    let record_size = le_u16(&mut h)? as usize;

    let mut records = Vec::new();
    let mut buf = vec![0u8; record_size];
    loop {
        match file.read_exact(&mut buf) {
            Ok(()) => records.push(FlightRecord::unpack(&buf)?),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Reads header and file length without materializing every record.
pub fn file_info<P: AsRef<Path>>(path: P) -> io::Result<FileInfo> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)?;

    let mut h = &header[..];
    if take(&mut h, 4)? != VPSF_MAGIC {
        return Err(bad("bad VPSF magic"));
    }
    let version = le_u16(&mut h)?;
    let record_size = le_u16(&mut h)?;

    let file_size_bytes = file.seek(SeekFrom::End(0))?;
    let data_size = file_size_bytes.saturating_sub(HEADER_SIZE);
    let record_count = if record_size == 0 {
        0
    } else {
        data_size / record_size as u64
    };

    Ok(FileInfo {
        version,
        record_size,
        record_count,
        file_size_bytes,
    })
}

/// Opens an existing file for append (used by `file_info`-style tooling that
/// needs to resume a recording; the onboard locator always starts fresh).
pub fn open_append<P: AsRef<Path>>(path: P) -> io::Result<File> {
    OpenOptions::new().append(true).open(path)
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(bad("truncated VPSF"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u8(buf: &mut &[u8]) -> io::Result<u8> {
    Ok(take(buf, 1)?[0])
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> io::Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_f32(buf: &mut &[u8]) -> io::Result<f32> {
    let b = take(buf, 4)?;
    Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f64(buf: &mut &[u8]) -> io::Result<f64> {
    let b = take(buf, 8)?;
    Ok(f64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;

    fn sample(i: u64) -> FlightRecord {
        FlightRecord {
            timestamp: i as f64 * 0.333,
            lat: 52.52 + i as f64 * 1e-6,
            lon: 13.405,
            vn_mps: 1.5,
            ve_mps: -0.5,
            hdop: 1.2,
            speed_mps: 1.58,
            heading_deg: 341.0,
            fix_quality: SOURCE_VISUAL,
            source: SOURCE_VISUAL,
            match_count: 42,
            inlier_ratio: 0.81,
            latency_ms: 37,
            flags: FLAG_GEOFENCE_OK | FLAG_EKF_ACCEPTED,
        }
    }

    #[test]
    fn record_round_trip_is_identity() {
        let rec = sample(7);
        let packed = rec.pack();
        assert_eq!(packed.len(), RECORD_SIZE as usize);
        let unpacked = FlightRecord::unpack(&packed).unwrap();
        assert_eq!(rec, unpacked);
    }

    #[test]
    fn file_round_trip_and_info() {
        let path = temp_dir().join(format!("vpsf_test_{}.vpsf", std::process::id()));
        let mut rec = FlightRecorder::start(&path).unwrap();
        for i in 0..1_000u64 {
            rec.record(&sample(i)).unwrap();
        }
        rec.stop().unwrap();

        let info = file_info(&path).unwrap();
        assert_eq!(info.version, VPSF_VERSION);
        assert_eq!(info.record_size, RECORD_SIZE);
        assert_eq!(info.record_count, 1_000);

        let records = read(&path).unwrap();
        assert_eq!(records.len(), 1_000);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(*r, sample(i as u64));
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_foreign_magic() {
        let path = temp_dir().join(format!("vpsf_bad_magic_{}.bin", std::process::id()));
        std::fs::write(&path, b"XXXX\x02\x00\x3a\x00").unwrap();
        let err = read(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_future_version() {
        let path = temp_dir().join(format!("vpsf_future_ver_{}.bin", std::process::id()));
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&VPSF_MAGIC);
        bytes.extend_from_slice(&(VPSF_VERSION + 1).to_le_bytes());
        bytes.extend_from_slice(&RECORD_SIZE.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        let err = read(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        std::fs::remove_file(&path).ok();
    }
}
