//! Orchestrates the filter, dead-reckoner, and geofence into a single
//! per-frame [`FusionOutput`], per the precedence described in the module
//! docs of [`FusionEngine::update`].

use crate::dead_reckoning::{DeadReckonParams, DeadReckoner};
use crate::filter::{FilterParams, PositionFilter};
use crate::geo::GeoPoint;
use crate::geofence::{Geofence, GeofenceChecker};

pub const FIX_QUALITY_NONE: u8 = 0;
pub const FIX_QUALITY_VISUAL: u8 = 1;
pub const FIX_QUALITY_PREDICT: u8 = 2;
pub const FIX_QUALITY_DEAD_RECKONING: u8 = 3;

/// Per-frame fusion result. Produced once per tick, consumed once.
#[derive(Debug, Clone, Copy)]
pub struct FusionOutput {
    pub position: Option<GeoPoint>,
    pub hdop: f64,
    pub speed_mps: f64,
    pub heading_deg: f64,
    pub fix_quality: u8,
    pub source: &'static str,
    pub geofence_ok: bool,
    pub ekf_accepted: bool,
}

impl FusionOutput {
    fn none() -> Self {
        Self {
            position: None,
            hdop: 0.0,
            speed_mps: 0.0,
            heading_deg: 0.0,
            fix_quality: FIX_QUALITY_NONE,
            source: "none",
            geofence_ok: true,
            ekf_accepted: false,
        }
    }
}

pub struct FusionEngine {
    filter: PositionFilter,
    dead_reckoner: DeadReckoner,
    geofence: Option<GeofenceChecker>,
    geofence_violations_total: u64,
}

impl FusionEngine {
    pub fn new(filter_params: FilterParams, dr_params: DeadReckonParams, fence: Option<Geofence>) -> Self {
        Self {
            filter: PositionFilter::new(filter_params),
            dead_reckoner: DeadReckoner::new(dr_params),
            geofence: fence.map(|f| GeofenceChecker::new(f, 5)),
            geofence_violations_total: 0,
        }
    }

    pub fn filter(&self) -> &PositionFilter {
        &self.filter
    }

    pub fn dead_reckoner(&self) -> &DeadReckoner {
        &self.dead_reckoner
    }

    pub fn geofence_violations_total(&self) -> u64 {
        self.geofence_violations_total
    }

    fn heading_deg(&self, vn: f64, ve: f64, speed: f64) -> f64 {
        if speed <= 0.5 {
            return 0.0;
        }
        let deg = ve.atan2(vn).to_degrees();
        ((deg % 360.0) + 360.0) % 360.0
    }

    /// Runs one tick of fusion. `visual` is `Some((position, hdop))` when the
    /// matching pipeline produced a candidate position this tick.
    pub fn update(&mut self, visual: Option<(GeoPoint, f64)>, t: f64) -> FusionOutput {
        let mut out = FusionOutput::none();

        if let Some((pos, hdop)) = visual {
            let outcome = self.filter.update(pos, hdop, t);
            out.ekf_accepted = outcome.accepted();
            if self.filter.is_initialized() {
                let (vn, ve) = self.filter.velocity_mps();
                self.dead_reckoner
                    .set_reference(self.filter.position(), vn, ve, hdop, t);
                out.position = Some(self.filter.position());
                out.hdop = hdop;
                out.fix_quality = FIX_QUALITY_VISUAL;
                out.source = "visual";
            }
        } else if self.filter.is_initialized() {
            let predicted = self.filter.predict(t);
            out.position = Some(predicted);
            out.hdop = 3.0;
            out.fix_quality = FIX_QUALITY_PREDICT;
            out.source = "ekf_predict";
        } else if let Some((pos, hdop)) = self.dead_reckoner.extrapolate(t) {
            out.position = Some(pos);
            out.hdop = hdop;
            out.fix_quality = FIX_QUALITY_DEAD_RECKONING;
            out.source = "dead_reckoning";
        }

        if let (Some(pos), Some(fence)) = (out.position, self.geofence.as_mut()) {
            if !fence.check(pos) {
                self.geofence_violations_total += 1;
                tracing::warn!(?pos, "geofence violation; suppressing position");
                out.position = None;
                out.fix_quality = FIX_QUALITY_NONE;
                out.source = "none";
                out.geofence_ok = false;
            }
        }

        if out.position.is_some() {
            out.speed_mps = self.filter.speed_mps();
            let (vn, ve) = self.filter.velocity_mps();
            out.heading_deg = self.heading_deg(vn, ve, out.speed_mps);
        }

        out
    }
}
