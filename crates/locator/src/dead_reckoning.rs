//! Single-reference constant-velocity extrapolator used when the filter has
//! never been initialized (no visual fix has ever been accepted).

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy)]
pub struct DeadReckonParams {
    pub max_extrap_s: f64,
    pub hdop_growth_rate: f64,
}

impl Default for DeadReckonParams {
    fn default() -> Self {
        Self {
            max_extrap_s: 10.0,
            hdop_growth_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reference {
    fix: GeoPoint,
    vn_mps: f64,
    ve_mps: f64,
    base_hdop: f64,
    t_ref: f64,
}

/// Extrapolates position from the last known visual fix and velocity.
/// Holds at most one reference, replaced atomically whenever the
/// FusionEngine accepts a new visual fix.
pub struct DeadReckoner {
    params: DeadReckonParams,
    reference: Option<Reference>,
}

impl DeadReckoner {
    pub fn new(params: DeadReckonParams) -> Self {
        Self {
            params,
            reference: None,
        }
    }

    /// Replaces the reference fix. Called whenever the FusionEngine accepts
    /// a visual measurement.
    pub fn set_reference(&mut self, fix: GeoPoint, vn_mps: f64, ve_mps: f64, base_hdop: f64, t: f64) {
        self.reference = Some(Reference {
            fix,
            vn_mps,
            ve_mps,
            base_hdop,
            t_ref: t,
        });
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Seconds since the last visual fix, or `f64::INFINITY` if unreferenced.
    pub fn time_since_fix(&self, t: f64) -> f64 {
        match self.reference {
            Some(r) => t - r.t_ref,
            None => f64::INFINITY,
        }
    }

    /// Extrapolates a position and an inflated HDOP at time `t`. Returns
    /// `None` when unreferenced, when `t` precedes the reference, or when
    /// the gap exceeds `max_extrap_s`.
    pub fn extrapolate(&self, t: f64) -> Option<(GeoPoint, f64)> {
        let r = self.reference?;
        let dt = t - r.t_ref;
        if dt < 0.0 || dt > self.params.max_extrap_s {
            return None;
        }

        let dlat = r.vn_mps * dt / 111_320.0;
        let dlon = r.ve_mps * dt / (111_320.0 * r.fix.lat.to_radians().cos().max(1e-9));
        let pos = GeoPoint::new(r.fix.lat + dlat, r.fix.lon + dlon);
        let hdop = r.base_hdop + self.params.hdop_growth_rate * dt;

        Some((pos, hdop))
    }
}
