//! Sliding-window fix-rate/latency monitor. Counters live only in the
//! frame-loop task; readers of [`HealthMonitor::snapshot`] get a value copy.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub window: usize,
    pub min_fix_rate: f64,
    pub min_frames_for_fix_rate_warning: usize,
    pub max_avg_latency_ms: f64,
    pub max_consecutive_misses: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 100,
            min_fix_rate: 0.3,
            min_frames_for_fix_rate_warning: 10,
            max_avg_latency_ms: 500.0,
            max_consecutive_misses: 30,
        }
    }
}

/// Value-copy view of the monitor's current state.
#[derive(Debug, Clone, Copy)]
pub struct HealthStatus {
    pub fix_rate: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub frames_total: u64,
    pub fixes_total: u64,
    pub outliers_rejected_total: u64,
    pub geofence_violations_total: u64,
    pub consecutive_misses: u32,
    pub low_fix_rate_warning: bool,
    pub high_latency_warning: bool,
    pub excessive_misses_warning: bool,
}

pub struct HealthMonitor {
    config: HealthConfig,
    fix_hits: VecDeque<bool>,
    latencies_ms: VecDeque<f64>,
    frames_total: u64,
    fixes_total: u64,
    outliers_rejected_total: u64,
    geofence_violations_total: u64,
    consecutive_misses: u32,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            fix_hits: VecDeque::new(),
            latencies_ms: VecDeque::new(),
            frames_total: 0,
            fixes_total: 0,
            outliers_rejected_total: 0,
            geofence_violations_total: 0,
            consecutive_misses: 0,
        }
    }

    /// Records one tick's outcome.
    pub fn record_tick(&mut self, has_fix: bool, latency_ms: f64, outlier_rejected: bool, geofence_violation: bool) {
        self.frames_total += 1;
        if has_fix {
            self.fixes_total += 1;
            self.consecutive_misses = 0;
        } else {
            self.consecutive_misses += 1;
        }
        if outlier_rejected {
            self.outliers_rejected_total += 1;
        }
        if geofence_violation {
            self.geofence_violations_total += 1;
        }

        self.fix_hits.push_back(has_fix);
        while self.fix_hits.len() > self.config.window {
            self.fix_hits.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
        while self.latencies_ms.len() > self.config.window {
            self.latencies_ms.pop_front();
        }
    }

    fn fix_rate(&self) -> f64 {
        if self.fix_hits.is_empty() {
            return 1.0;
        }
        let hits = self.fix_hits.iter().filter(|&&h| h).count();
        hits as f64 / self.fix_hits.len() as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    fn max_latency_ms(&self) -> f64 {
        self.latencies_ms.iter().cloned().fold(0.0, f64::max)
    }

    pub fn snapshot(&self) -> HealthStatus {
        let fix_rate = self.fix_rate();
        let avg_latency = self.avg_latency_ms();

        let low_fix_rate_warning = self.fix_hits.len() >= self.config.min_frames_for_fix_rate_warning
            && fix_rate < self.config.min_fix_rate;
        let high_latency_warning = avg_latency > self.config.max_avg_latency_ms;
        let excessive_misses_warning = self.consecutive_misses >= self.config.max_consecutive_misses;

        HealthStatus {
            fix_rate,
            avg_latency_ms: avg_latency,
            max_latency_ms: self.max_latency_ms(),
            frames_total: self.frames_total,
            fixes_total: self.fixes_total,
            outliers_rejected_total: self.outliers_rejected_total,
            geofence_violations_total: self.geofence_violations_total,
            consecutive_misses: self.consecutive_misses,
            low_fix_rate_warning,
            high_latency_warning,
            excessive_misses_warning,
        }
    }

    /// Logs the current snapshot at `warn` if any warning is active,
    /// otherwise at `debug`.
    pub fn log_status(&self) {
        let s = self.snapshot();
        if s.low_fix_rate_warning || s.high_latency_warning || s.excessive_misses_warning {
            tracing::warn!(
                fix_rate = %format!("{:.2}", s.fix_rate),
                avg_latency_ms = %format!("{:.1}", s.avg_latency_ms),
                consecutive_misses = s.consecutive_misses,
                "locator health degraded"
            );
        } else {
            tracing::debug!(
                fix_rate = %format!("{:.2}", s.fix_rate),
                avg_latency_ms = %format!("{:.1}", s.avg_latency_ms),
                "locator health nominal"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_rate_reflects_recent_hits() {
        let mut h = HealthMonitor::new(HealthConfig::default());
        for _ in 0..10 {
            h.record_tick(true, 50.0, false, false);
        }
        for _ in 0..10 {
            h.record_tick(false, 50.0, false, false);
        }
        let s = h.snapshot();
        assert!((s.fix_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn low_fix_rate_warning_requires_minimum_sample_count() {
        let mut h = HealthMonitor::new(HealthConfig::default());
        h.record_tick(false, 10.0, false, false);
        assert!(!h.snapshot().low_fix_rate_warning, "too few samples to warn");
        for _ in 0..20 {
            h.record_tick(false, 10.0, false, false);
        }
        assert!(h.snapshot().low_fix_rate_warning);
    }

    #[test]
    fn consecutive_misses_reset_on_a_hit() {
        let mut h = HealthMonitor::new(HealthConfig::default());
        for _ in 0..5 {
            h.record_tick(false, 10.0, false, false);
        }
        assert_eq!(h.snapshot().consecutive_misses, 5);
        h.record_tick(true, 10.0, false, false);
        assert_eq!(h.snapshot().consecutive_misses, 0);
    }

    #[test]
    fn high_latency_triggers_warning() {
        let mut h = HealthMonitor::new(HealthConfig::default());
        for _ in 0..5 {
            h.record_tick(true, 1000.0, false, false);
        }
        assert!(h.snapshot().high_latency_warning);
    }

    #[test]
    fn geofence_violations_counter_increments() {
        let mut h = HealthMonitor::new(HealthConfig::default());
        h.record_tick(false, 10.0, false, true);
        assert_eq!(h.snapshot().geofence_violations_total, 1);
    }
}
