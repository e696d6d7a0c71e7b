//! End-to-end scenarios spanning fusion, transport encoding, the rate
//! limiter, and the health monitor together, as opposed to the per-module
//! unit tests inside each source file.

use locator::fusion::{FusionEngine, FIX_QUALITY_PREDICT, FIX_QUALITY_VISUAL};
use locator::dead_reckoning::DeadReckonParams;
use locator::filter::FilterParams;
use locator::geo::{haversine_km, GeoPoint};
use locator::geofence::Geofence;
use locator::health::{HealthConfig, HealthMonitor};
use locator::rate_limiter::{RateLimiter, RateLimiterConfig};
use locator::transport::{encode, Protocol};

/// S1: a stationary drone with visual fixes every tick settles to a quality-1
/// fix within 2 m of truth, and the NMEA `$GPGGA` sentence built from that
/// fix decodes back to within 1e-6 degrees.
#[test]
fn stationary_drone_converges_and_encodes_to_nmea() {
    let truth = GeoPoint::new(52.5200, 13.4050);
    let mut eng = FusionEngine::new(FilterParams::default(), DeadReckonParams::default(), None);

    let mut out = None;
    for i in 0..100 {
        out = Some(eng.update(Some((truth, 1.0)), i as f64));
    }
    let out = out.unwrap();

    assert_eq!(out.fix_quality, FIX_QUALITY_VISUAL);
    let err_m = haversine_km(out.position.unwrap(), truth) * 1000.0;
    assert!(err_m < 2.0, "final filter error {err_m}m exceeds 2m");

    let bytes = encode(Protocol::Nmea, &out, 99.0).expect("fix present, frame expected");
    let text = String::from_utf8(bytes).unwrap();
    let gga = text.lines().find(|l| l.starts_with("$GPGGA")).unwrap();
    let fields: Vec<&str> = gga.trim_start_matches('$').split(',').collect();
    let lat_field = fields[2];
    let hemi = fields[3];
    let deg: f64 = lat_field[0..2].parse().unwrap();
    let min: f64 = lat_field[2..].parse().unwrap();
    let mut lat = deg + min / 60.0;
    if hemi == "S" {
        lat = -lat;
    }
    assert!((lat - truth.lat).abs() < 1e-6);
}

/// S2: an eastward flight at 15 m/s for 30 s with an 80% visual fix rate
/// (misses at ticks 0, 5, 10, ...) never falls back to dead reckoning,
/// because each gap is well under the EKF's `max_gap_s`, and every hit is
/// immediately followed by an `ekf_predict` source on the next tick.
#[test]
fn eastward_flight_with_partial_hits_never_dead_reckons() {
    let origin = GeoPoint::new(52.5200, 13.4050);
    let speed_mps = 15.0;
    let mut eng = FusionEngine::new(FilterParams::default(), DeadReckonParams::default(), None);
    let mut health = HealthMonitor::new(HealthConfig::default());

    let meters_per_deg_lon = 111_320.0 * origin.lat.to_radians().cos();

    for tick in 0..30 {
        let t = tick as f64;
        let hit = tick % 5 != 0;
        let east_m = speed_mps * t;
        let truth = GeoPoint::new(origin.lat, origin.lon + east_m / meters_per_deg_lon);

        let visual = if hit { Some((truth, 1.0)) } else { None };
        let out = eng.update(visual, t);

        assert_ne!(out.source, "dead_reckoning", "tick {tick} fell back to dead reckoning");
        if hit {
            assert_eq!(out.fix_quality, FIX_QUALITY_VISUAL);
        } else if tick > 0 {
            // A miss right after the filter has already seen at least one
            // fix predicts forward instead of reporting no position.
            assert_eq!(out.fix_quality, FIX_QUALITY_PREDICT);
        }
        health.record_tick(out.position.is_some(), 5.0, false, false);
    }

    let status = health.snapshot();
    assert!(status.fix_rate > 0.0);
}

/// S4: a geofence breach suppresses the position and is counted exactly
/// once by both the fusion engine and the health monitor.
#[test]
fn geofence_breach_suppresses_position_and_counts_once() {
    let fence = Geofence::Circle {
        center: GeoPoint::new(52.52, 13.405),
        radius_km: 1.0,
        margin_km: 0.0,
    };
    let mut eng = FusionEngine::new(FilterParams::default(), DeadReckonParams::default(), Some(fence));
    let mut health = HealthMonitor::new(HealthConfig::default());

    let far = GeoPoint::new(52.60, 13.405);
    let out = eng.update(Some((far, 1.0)), 0.0);

    assert_eq!(out.position, None);
    assert_eq!(out.source, "none");
    assert!(!out.geofence_ok);
    assert_eq!(eng.geofence_violations_total(), 1);

    health.record_tick(out.position.is_some(), 5.0, false, !out.geofence_ok);
    assert_eq!(health.snapshot().geofence_violations_total, 1);

    assert!(encode(Protocol::Nmea, &out, 0.0).is_none());
}

/// S5: with `max_hz = 5`, `burst = 1`, admissions at t = 0, 0.05, ..., 1.00
/// (21 calls) land between 5 and 6 total, at roughly 0.2-second spacing
/// after the first.
#[test]
fn rate_limiter_throughput_matches_expected_admission_band() {
    let mut limiter = RateLimiter::new(RateLimiterConfig { max_hz: 5.0, burst: 1 });
    let mut admitted_at = Vec::new();

    let mut t = 0.0;
    for _ in 0..21 {
        if limiter.allow(t) {
            admitted_at.push(t);
        }
        t += 0.05;
    }

    assert!(!admitted_at.is_empty());
    assert_eq!(admitted_at[0], 0.0, "first call at t=0 must be admitted with a full bucket");
    assert!(
        (5..=6).contains(&admitted_at.len()),
        "admitted {} times, expected 5 or 6",
        admitted_at.len()
    );

    for pair in admitted_at.windows(2) {
        let gap = pair[1] - pair[0];
        assert!((gap - 0.2).abs() < 0.051, "admission gap {gap}s far from the 0.2s token period");
    }
}
