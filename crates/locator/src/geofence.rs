//! Spatial safety boundary with consecutive-violation tracking. A breach
//! does not stop the loop by itself; the FusionEngine consults
//! [`GeofenceChecker::check`] and suppresses the position for that tick.

use crate::geo::{haversine_km, GeoPoint};

#[derive(Debug, Clone, Copy)]
pub enum Geofence {
    Circle {
        center: GeoPoint,
        radius_km: f64,
        margin_km: f64,
    },
    Rectangle {
        nw: GeoPoint,
        se: GeoPoint,
    },
}

impl Geofence {
    pub fn contains(&self, p: GeoPoint) -> bool {
        match *self {
            Geofence::Circle {
                center,
                radius_km,
                margin_km,
            } => haversine_km(center, p) <= radius_km + margin_km,
            Geofence::Rectangle { nw, se } => {
                let (lat_lo, lat_hi) = (se.lat.min(nw.lat), se.lat.max(nw.lat));
                let (lon_lo, lon_hi) = (nw.lon.min(se.lon), nw.lon.max(se.lon));
                p.lat >= lat_lo && p.lat <= lat_hi && p.lon >= lon_lo && p.lon <= lon_hi
            }
        }
    }
}

/// Wraps a [`Geofence`] with running violation counters.
pub struct GeofenceChecker {
    fence: Geofence,
    max_violations: u32,
    total_checks: u64,
    total_violations: u64,
    consecutive_violations: u32,
}

impl GeofenceChecker {
    pub fn new(fence: Geofence, max_violations: u32) -> Self {
        Self {
            fence,
            max_violations,
            total_checks: 0,
            total_violations: 0,
            consecutive_violations: 0,
        }
    }

    /// Checks `p`, updating counters. Returns `true` if `p` is inside the
    /// fence.
    pub fn check(&mut self, p: GeoPoint) -> bool {
        self.total_checks += 1;
        let inside = self.fence.contains(p);
        if inside {
            self.consecutive_violations = 0;
        } else {
            self.total_violations += 1;
            self.consecutive_violations += 1;
        }
        inside
    }

    pub fn is_breached(&self) -> bool {
        self.consecutive_violations >= self.max_violations
    }

    pub fn violation_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.total_violations as f64 / self.total_checks as f64
        }
    }

    pub fn total_violations(&self) -> u64 {
        self.total_violations
    }

    pub fn consecutive_violations(&self) -> u32 {
        self.consecutive_violations
    }
}

impl Default for GeofenceChecker {
    fn default() -> Self {
        Self::new(
            Geofence::Circle {
                center: GeoPoint::ZERO,
                radius_km: f64::MAX / 2.0,
                margin_km: 0.0,
            },
            5,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_contains_center_and_rejects_far_point() {
        let fence = Geofence::Circle {
            center: GeoPoint::new(52.52, 13.405),
            radius_km: 1.0,
            margin_km: 0.0,
        };
        assert!(fence.contains(GeoPoint::new(52.52, 13.405)));
        assert!(!fence.contains(GeoPoint::new(52.60, 13.405)));
    }

    #[test]
    fn rectangle_respects_both_axes() {
        let fence = Geofence::Rectangle {
            nw: GeoPoint::new(53.0, 13.0),
            se: GeoPoint::new(52.0, 14.0),
        };
        assert!(fence.contains(GeoPoint::new(52.5, 13.5)));
        assert!(!fence.contains(GeoPoint::new(51.9, 13.5)));
        assert!(!fence.contains(GeoPoint::new(52.5, 14.1)));
    }

    #[test]
    fn consecutive_violations_reset_on_success() {
        let fence = Geofence::Circle {
            center: GeoPoint::new(52.52, 13.405),
            radius_km: 1.0,
            margin_km: 0.0,
        };
        let mut checker = GeofenceChecker::new(fence, 3);
        let outside = GeoPoint::new(52.60, 13.405);
        let inside = GeoPoint::new(52.52, 13.405);

        assert!(!checker.check(outside));
        assert!(!checker.check(outside));
        assert_eq!(checker.consecutive_violations(), 2);
        assert!(!checker.is_breached());

        assert!(checker.check(inside));
        assert_eq!(checker.consecutive_violations(), 0);

        for _ in 0..3 {
            checker.check(outside);
        }
        assert!(checker.is_breached());
        assert_eq!(checker.total_violations(), 5);
    }
}
