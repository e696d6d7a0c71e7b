//! Prometheus mirror of [`crate::health::HealthStatus`], served over axum.
//! Compiled in only with the `metrics` feature; the frame loop works
//! identically without it.

use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

use crate::health::HealthStatus;

/// Gauges and counters exposing the same fields as [`HealthStatus`], plus
/// the rate-limiter and transport reconnect counters the health snapshot
/// doesn't carry.
pub struct LocatorMetrics {
    registry: Registry,
    fix_rate: Gauge,
    avg_latency_ms: Gauge,
    max_latency_ms: Gauge,
    frames_total: IntCounter,
    fixes_total: IntCounter,
    outliers_rejected_total: IntCounter,
    geofence_violations_total: IntCounter,
    consecutive_misses: Gauge,
    transport_reconnects_total: IntCounter,
    rate_limiter_throttled_total: IntCounter,
}

impl LocatorMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("locator".into()), None).expect("valid metrics namespace");

        macro_rules! reg_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = Gauge::new($name, $help).unwrap();
                registry.register(Box::new(gauge.clone())).unwrap();
                gauge
            }};
        }
        macro_rules! reg_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help).unwrap();
                registry.register(Box::new(counter.clone())).unwrap();
                counter
            }};
        }

        Self {
            fix_rate: reg_gauge!("locator_fix_rate", "Fraction of recent frames with an accepted fix."),
            avg_latency_ms: reg_gauge!("locator_avg_latency_ms", "Average tick latency over the health window."),
            max_latency_ms: reg_gauge!("locator_max_latency_ms", "Max tick latency over the health window."),
            frames_total: reg_counter!("locator_frames_total", "Total frames processed."),
            fixes_total: reg_counter!("locator_fixes_total", "Total frames that produced a position."),
            outliers_rejected_total: reg_counter!(
                "locator_outliers_rejected_total",
                "Total measurements rejected by the EKF gate."
            ),
            geofence_violations_total: reg_counter!(
                "locator_geofence_violations_total",
                "Total positions suppressed by the geofence."
            ),
            consecutive_misses: reg_gauge!("locator_consecutive_misses", "Current consecutive-miss streak."),
            transport_reconnects_total: reg_counter!(
                "locator_transport_reconnects_total",
                "Total serial transport reconnects."
            ),
            rate_limiter_throttled_total: reg_counter!(
                "locator_rate_limiter_throttled_total",
                "Total fixes withheld by the output rate limiter."
            ),
            registry,
        }
    }

    /// Updates the gauges/counters from a fresh health snapshot. Counters
    /// are monotonic in `HealthStatus` already, so this sets them to the
    /// snapshot's running totals rather than incrementing.
    pub fn observe(&self, status: &HealthStatus, transport_reconnects: u64, rate_limiter_throttled: u64) {
        self.fix_rate.set(status.fix_rate);
        self.avg_latency_ms.set(status.avg_latency_ms);
        self.max_latency_ms.set(status.max_latency_ms);
        self.consecutive_misses.set(status.consecutive_misses as f64);

        reset_counter_to(&self.frames_total, status.frames_total);
        reset_counter_to(&self.fixes_total, status.fixes_total);
        reset_counter_to(&self.outliers_rejected_total, status.outliers_rejected_total);
        reset_counter_to(&self.geofence_violations_total, status.geofence_violations_total);
        reset_counter_to(&self.transport_reconnects_total, transport_reconnects);
        reset_counter_to(&self.rate_limiter_throttled_total, rate_limiter_throttled);
    }

    /// An axum router serving the registry's families on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let reg = registry.clone();
                async move {
                    let metric_families = reg.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();
                    String::from_utf8(buffer).unwrap().into_response()
                }
            }),
        )
    }
}

impl Default for LocatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// `IntCounter` only exposes `inc`/`inc_by`; since the health snapshot
/// already tracks running totals, bring the exported counter up to that
/// value rather than double-accumulating.
fn reset_counter_to(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthMonitor;

    #[test]
    fn observe_reflects_health_snapshot_counters() {
        let metrics = LocatorMetrics::new();
        let mut monitor = HealthMonitor::new(crate::health::HealthConfig::default());
        monitor.record_tick(true, 20.0, false, false);
        monitor.record_tick(false, 20.0, true, false);

        let status = monitor.snapshot();
        metrics.observe(&status, 2, 1);

        assert_eq!(metrics.frames_total.get(), 2);
        assert_eq!(metrics.fixes_total.get(), 1);
        assert_eq!(metrics.outliers_rejected_total.get(), 1);
        assert_eq!(metrics.transport_reconnects_total.get(), 2);
    }
}
