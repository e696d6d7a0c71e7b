//! Constant-velocity Extended Kalman Filter over `[lat, lon, vlat, vlon]`,
//! with Mahalanobis-gated measurement updates.
//!
//! This is a pure, config-driven numerical struct: no I/O, no clock reads
//! beyond the timestamps callers pass in, so it is trivially unit-testable.

use nalgebra::{Matrix2, Matrix4, Vector2, Vector4};

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    /// Process noise on position, deg^2/s.
    pub q_pos: f64,
    /// Process noise on velocity, (deg/s)^2/s.
    pub q_vel: f64,
    /// Measurement noise, deg^2.
    pub r: f64,
    /// Mahalanobis-squared gate threshold (chi-sq, 2 DoF, ~3 sigma).
    pub gate_threshold: f64,
    /// Maximum gap, in seconds, before the filter resets instead of predicting.
    pub max_gap_s: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            q_pos: 1e-9,
            q_vel: 1e-7,
            r: 1e-8,
            gate_threshold: 9.0,
            max_gap_s: 5.0,
        }
    }
}

/// Outcome of a single `update` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateOutcome {
    /// First measurement since (re-)initialization; state seeded directly
    /// from the measurement.
    Initialized,
    /// Measurement passed the gate and updated the filter.
    Accepted { innovation: f64 },
    /// Measurement failed the gate; state was still advanced to `x_pred`.
    Rejected { innovation: f64 },
}

impl UpdateOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, UpdateOutcome::Initialized | UpdateOutcome::Accepted { .. })
    }
}

/// Constant-velocity EKF over geodetic position and velocity.
pub struct PositionFilter {
    params: FilterParams,
    x: Vector4<f64>,
    p: Matrix4<f64>,
    last_t: f64,
    initialized: bool,
    last_innovation: f64,
}

impl PositionFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            params,
            x: Vector4::zeros(),
            p: Matrix4::identity(),
            last_t: 0.0,
            initialized: false,
            last_innovation: 0.0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_innovation(&self) -> f64 {
        self.last_innovation
    }

    /// Current fused position, or `(0,0)` if never initialized.
    pub fn position(&self) -> GeoPoint {
        if !self.initialized {
            return GeoPoint::ZERO;
        }
        GeoPoint::new(self.x[0], self.x[1])
    }

    /// Velocity in (north, east) m/s, converted from deg/s.
    pub fn velocity_mps(&self) -> (f64, f64) {
        if !self.initialized {
            return (0.0, 0.0);
        }
        let vn = self.x[2] * 111_320.0;
        let ve = self.x[3] * 111_320.0 * self.x[0].to_radians().cos();
        (vn, ve)
    }

    pub fn speed_mps(&self) -> f64 {
        let (vn, ve) = self.velocity_mps();
        (vn * vn + ve * ve).sqrt()
    }

    /// Discards all state and re-initializes as if `update` were the first
    /// call ever made.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.x = Vector4::zeros();
        self.p = Matrix4::identity();
        self.last_innovation = 0.0;
    }

    fn initialize(&mut self, z: GeoPoint, hdop: f64, t: f64) {
        self.x = Vector4::new(z.lat, z.lon, 0.0, 0.0);
        let r = self.params.r;
        let q_vel = self.params.q_vel;
        self.p = Matrix4::from_diagonal(&Vector4::new(
            r * hdop,
            r * hdop,
            10.0 * q_vel,
            10.0 * q_vel,
        ));
        self.last_t = t;
        self.initialized = true;
        self.last_innovation = 0.0;
    }

    fn predict_state(&self, dt: f64) -> (Vector4<f64>, Matrix4<f64>) {
        let mut f = Matrix4::identity();
        f[(0, 2)] = dt;
        f[(1, 3)] = dt;

        let x_pred = f * self.x;
        let q = Matrix4::from_diagonal(&Vector4::new(
            self.params.q_pos * dt,
            self.params.q_pos * dt,
            self.params.q_vel * dt,
            self.params.q_vel * dt,
        ));
        let p_pred = f * self.p * f.transpose() + q;
        (x_pred, p_pred)
    }

    /// Pure read: the filter's position extrapolated to time `t` without
    /// mutating any state. Returns `(0,0)` if never initialized.
    pub fn predict(&self, t: f64) -> GeoPoint {
        if !self.initialized {
            return GeoPoint::ZERO;
        }
        let dt = (t - self.last_t).max(0.001);
        let (x_pred, _) = self.predict_state(dt);
        GeoPoint::new(x_pred[0], x_pred[1])
    }

    /// Feeds a new measurement. See module docs for the exact algebra.
    pub fn update(&mut self, z: GeoPoint, hdop: f64, t: f64) -> UpdateOutcome {
        if !self.initialized {
            self.initialize(z, hdop, t);
            return UpdateOutcome::Initialized;
        }

        let gap = t - self.last_t;
        if gap > self.params.max_gap_s {
            self.reset();
            self.initialize(z, hdop, t);
            return UpdateOutcome::Initialized;
        }

        let dt = gap.max(0.001);
        let (x_pred, p_pred) = self.predict_state(dt);

        let h = nalgebra::Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0,
        );
        let r_mat = Matrix2::identity() * (self.params.r * hdop.max(1.0));

        let z_vec = Vector2::new(z.lat, z.lon);
        let hx = Vector2::new(x_pred[0], x_pred[1]);
        let y = z_vec - hx;

        let s = h * p_pred * h.transpose() + r_mat;
        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => {
                // Singular innovation covariance: treat as a gate failure,
                // still advance the state with the predicted values.
                self.x = x_pred;
                self.p = p_pred;
                self.last_t = t;
                self.last_innovation = f64::INFINITY;
                return UpdateOutcome::Rejected {
                    innovation: f64::INFINITY,
                };
            }
        };

        let m = (y.transpose() * s_inv * y)[(0, 0)];
        self.last_innovation = m.max(0.0).sqrt();

        if m > self.params.gate_threshold {
            self.x = x_pred;
            self.p = p_pred;
            self.last_t = t;
            return UpdateOutcome::Rejected {
                innovation: self.last_innovation,
            };
        }

        let k = p_pred * h.transpose() * s_inv;
        self.x = x_pred + k * y;
        self.p = (Matrix4::identity() - k * h) * p_pred;
        self.last_t = t;

        UpdateOutcome::Accepted {
            innovation: self.last_innovation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn base() -> PositionFilter {
        PositionFilter::new(FilterParams::default())
    }

    #[test]
    fn first_update_initializes_exactly() {
        let mut f = base();
        let z = GeoPoint::new(52.52, 13.405);
        let outcome = f.update(z, 1.0, 0.0);
        assert_eq!(outcome, UpdateOutcome::Initialized);
        assert!(f.is_initialized());
        assert_eq!(f.position(), z);
    }

    #[test]
    fn uninitialized_predict_returns_zero() {
        let f = base();
        assert_eq!(f.predict(10.0), GeoPoint::ZERO);
    }

    #[test]
    fn converges_under_gaussian_noise() {
        let truth = GeoPoint::new(52.5200, 13.4050);
        let mut f = base();
        let mut rng = StdRng::seed_from_u64(42);
        let sigma_deg = 1.0 / 111_320.0; // ~1 meter in degrees of latitude

        let mut t = 0.0;
        for _ in 0..50 {
            let noisy = GeoPoint::new(
                truth.lat + rng.gen_range(-1.0..1.0) * sigma_deg,
                truth.lon + rng.gen_range(-1.0..1.0) * sigma_deg,
            );
            f.update(noisy, 1.0, t);
            t += 1.0;
        }

        let err_km = crate::geo::haversine_km(f.position(), truth);
        assert!(err_km * 1000.0 < 2.0, "final error {}m", err_km * 1000.0);
    }

    #[test]
    fn rejects_kilometer_outlier_after_stable_history() {
        let mut f = base();
        let stable = GeoPoint::new(52.52, 13.405);
        let mut t = 0.0;
        for _ in 0..10 {
            f.update(stable, 1.0, t);
            t += 1.0;
        }
        let before = f.position();

        let outlier = GeoPoint::new(53.0, 13.405); // ~53 km away
        let outcome = f.update(outlier, 1.0, t);
        assert!(!outcome.accepted(), "outlier must be rejected: {outcome:?}");

        let moved_km = crate::geo::haversine_km(before, f.position());
        assert!(moved_km * 1000.0 < 50.0, "moved {}m", moved_km * 1000.0);
    }

    #[test]
    fn long_gap_forces_reinitialize() {
        let mut f = base();
        f.update(GeoPoint::new(52.52, 13.405), 1.0, 0.0);
        let far_later = GeoPoint::new(10.0, 10.0);
        let outcome = f.update(far_later, 1.0, 100.0);
        assert_eq!(outcome, UpdateOutcome::Initialized);
        assert_eq!(f.position(), far_later);
    }

    #[test]
    fn velocity_reflects_constant_eastward_motion() {
        let mut f = base();
        let lat = 52.52;
        let lon_per_s = 15.0 / (111_320.0 * lat.to_radians().cos());
        let mut t = 0.0;
        let mut lon = 13.405;
        for _ in 0..20 {
            f.update(GeoPoint::new(lat, lon), 1.0, t);
            t += 1.0;
            lon += lon_per_s;
        }
        let (_vn, ve) = f.velocity_mps();
        assert!((ve - 15.0).abs() < 3.0, "ve={ve}");
    }
}
