//! Token-bucket gate on the output stream, plus a trailing-window estimate
//! of the actual admitted rate.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub max_hz: f64,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_hz: 3.0,
            burst: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimiterStats {
    pub total: u64,
    pub accepted: u64,
    pub throttled: u64,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    tokens: f64,
    last_refill_t: Option<f64>,
    stats: RateLimiterStats,
    accept_times: VecDeque<f64>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            tokens: config.burst as f64,
            config,
            last_refill_t: None,
            stats: RateLimiterStats::default(),
            accept_times: VecDeque::new(),
        }
    }

    fn refill(&mut self, t: f64) {
        let dt = match self.last_refill_t {
            Some(last) => (t - last).max(0.0),
            None => 0.0,
        };
        self.last_refill_t = Some(t);
        self.tokens = (self.tokens + dt * self.config.max_hz).min(self.config.burst as f64);
    }

    /// Consumes one token if available at time `t`. Returns whether the
    /// event is admitted.
    pub fn allow(&mut self, t: f64) -> bool {
        self.refill(t);
        self.stats.total += 1;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.stats.accepted += 1;
            self.accept_times.push_back(t);
            while self.accept_times.len() > 20 {
                self.accept_times.pop_front();
            }
            true
        } else {
            self.stats.throttled += 1;
            false
        }
    }

    /// Seconds until the next token would be available, without mutating
    /// any state other than the implicit refill bookkeeping (performed
    /// against the current time snapshot).
    pub fn time_until_next(&mut self, t: f64) -> f64 {
        self.refill(t);
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.config.max_hz
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.stats
    }

    /// Estimated actual admitted Hz over the trailing accept-time window.
    pub fn actual_hz(&self) -> f64 {
        if self.accept_times.len() < 2 {
            return 0.0;
        }
        let span = self.accept_times.back().unwrap() - self.accept_times.front().unwrap();
        if span <= 0.0 {
            return 0.0;
        }
        (self.accept_times.len() - 1) as f64 / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_within_burst_immediately() {
        let mut rl = RateLimiter::new(RateLimiterConfig {
            max_hz: 1.0,
            burst: 2,
        });
        assert!(rl.allow(0.0));
        assert!(rl.allow(0.0));
        assert!(!rl.allow(0.0));
    }

    #[test]
    fn throughput_matches_expected_admission_count() {
        let h = 5.0;
        let burst = 1u32;
        let mut rl = RateLimiter::new(RateLimiterConfig {
            max_hz: h,
            burst,
        });

        // 21 calls at t = 0, 0.05, ..., 1.00 (10x the max rate).
        let mut admitted = 0u32;
        for i in 0..21 {
            let t = i as f64 * 0.05;
            if rl.allow(t) {
                admitted += 1;
            }
        }
        let expected = (h * 1.0 + burst as f64).floor() as i64;
        assert!(
            (admitted as i64 - expected).abs() <= 1,
            "admitted={admitted} expected~{expected}"
        );
    }

    #[test]
    fn time_until_next_is_zero_when_token_available() {
        let mut rl = RateLimiter::new(RateLimiterConfig {
            max_hz: 2.0,
            burst: 1,
        });
        assert_eq!(rl.time_until_next(0.0), 0.0);
        rl.allow(0.0);
        let wait = rl.time_until_next(0.0);
        assert!((wait - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stats_track_accept_and_throttle_counts() {
        let mut rl = RateLimiter::new(RateLimiterConfig {
            max_hz: 1.0,
            burst: 1,
        });
        rl.allow(0.0);
        rl.allow(0.0);
        let stats = rl.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.throttled, 1);
    }
}
