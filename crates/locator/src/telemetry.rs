//! CSV telemetry sink. 21 named columns mirroring [`FusionOutput`] plus
//! timing and match diagnostics, flushed every 100 rows.

use std::path::Path;

use csv::Writer;

use crate::error::Result;
use crate::fusion::FusionOutput;

const FLUSH_EVERY: u64 = 100;

/// One row of telemetry. Field order matches [`HEADER`].
#[derive(Debug, Clone, Copy)]
pub struct TelemetryRow {
    pub timestamp: f64,
    pub lat: f64,
    pub lon: f64,
    pub vn_mps: f64,
    pub ve_mps: f64,
    pub hdop: f64,
    pub speed_mps: f64,
    pub heading_deg: f64,
    pub fix_quality: u8,
    pub source: &'static str,
    pub match_count: u32,
    pub inlier_ratio: f64,
    pub latency_ms: f64,
    pub ekf_accepted: bool,
    pub geofence_ok: bool,
    pub blur_skip: bool,
    pub outliers_rejected_total: u64,
    pub frames_total: u64,
    pub fixes_total: u64,
    pub innovation_gate: f64,
    pub candidate_tile: String,
}

const HEADER: [&str; 21] = [
    "timestamp",
    "lat",
    "lon",
    "vn_mps",
    "ve_mps",
    "hdop",
    "speed_mps",
    "heading_deg",
    "fix_quality",
    "source",
    "match_count",
    "inlier_ratio",
    "latency_ms",
    "ekf_accepted",
    "geofence_ok",
    "blur_skip",
    "outliers_rejected_total",
    "frames_total",
    "fixes_total",
    "innovation_gate",
    "candidate_tile",
];

impl TelemetryRow {
    /// Builds a row from a fusion output, filling in the diagnostics the
    /// frame loop collected this tick.
    #[allow(clippy::too_many_arguments)]
    pub fn from_output(
        out: &FusionOutput,
        timestamp: f64,
        vn_mps: f64,
        ve_mps: f64,
        match_count: u32,
        inlier_ratio: f64,
        latency_ms: f64,
        blur_skip: bool,
        outliers_rejected_total: u64,
        frames_total: u64,
        fixes_total: u64,
        innovation_gate: f64,
        candidate_tile: String,
    ) -> Self {
        let (lat, lon) = out.position.map(|p| (p.lat, p.lon)).unwrap_or((0.0, 0.0));
        Self {
            timestamp,
            lat,
            lon,
            vn_mps,
            ve_mps,
            hdop: out.hdop,
            speed_mps: out.speed_mps,
            heading_deg: out.heading_deg,
            fix_quality: out.fix_quality,
            source: out.source,
            match_count,
            inlier_ratio,
            latency_ms,
            ekf_accepted: out.ekf_accepted,
            geofence_ok: out.geofence_ok,
            blur_skip,
            outliers_rejected_total,
            frames_total,
            fixes_total,
            innovation_gate,
            candidate_tile,
        }
    }
}

pub struct TelemetrySink {
    writer: Writer<std::fs::File>,
    rows_written: u64,
}

impl TelemetrySink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut writer = Writer::from_path(path)?;
        writer.write_record(HEADER)?;
        Ok(Self {
            writer,
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, row: &TelemetryRow) -> Result<()> {
        self.writer.write_record(&[
            row.timestamp.to_string(),
            row.lat.to_string(),
            row.lon.to_string(),
            row.vn_mps.to_string(),
            row.ve_mps.to_string(),
            row.hdop.to_string(),
            row.speed_mps.to_string(),
            row.heading_deg.to_string(),
            row.fix_quality.to_string(),
            row.source.to_string(),
            row.match_count.to_string(),
            row.inlier_ratio.to_string(),
            row.latency_ms.to_string(),
            row.ekf_accepted.to_string(),
            row.geofence_ok.to_string(),
            row.blur_skip.to_string(),
            row.outliers_rejected_total.to_string(),
            row.frames_total.to_string(),
            row.fixes_total.to_string(),
            row.innovation_gate.to_string(),
            row.candidate_tile.clone(),
        ])?;
        self.rows_written += 1;
        if self.rows_written % FLUSH_EVERY == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl From<csv::Error> for crate::error::LocatorError {
    fn from(e: csv::Error) -> Self {
        crate::error::LocatorError::InvalidInput(format!("telemetry csv: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;

    fn sample_output() -> FusionOutput {
        FusionOutput {
            position: Some(crate::geo::GeoPoint::new(52.52, 13.405)),
            hdop: 1.2,
            speed_mps: 2.0,
            heading_deg: 90.0,
            fix_quality: 1,
            source: "visual",
            geofence_ok: true,
            ekf_accepted: true,
        }
    }

    #[test]
    fn header_has_21_columns() {
        assert_eq!(HEADER.len(), 21);
    }

    #[test]
    fn writes_rows_and_flushes() {
        let path = temp_dir().join(format!("telemetry_test_{}.csv", std::process::id()));
        let mut sink = TelemetrySink::create(&path).unwrap();
        let out = sample_output();
        for i in 0..5u64 {
            let row = TelemetryRow::from_output(
                &out,
                i as f64,
                1.0,
                1.0,
                40,
                0.8,
                25.0,
                false,
                0,
                i,
                i,
                0.5,
                "14/8800/5374".to_string(),
            );
            sink.write_row(&row).unwrap();
        }
        assert_eq!(sink.rows_written(), 5);
        sink.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 6); // header + 5 rows
        std::fs::remove_file(&path).ok();
    }
}
