//! Sliding-window controller that relaxes or tightens matcher thresholds
//! from recent fix outcomes, and flags the next frame for a blur skip.

use std::collections::VecDeque;

/// Thresholds mutated only by [`AdaptiveController`]; process-lifetime
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    pub min_matches: u32,
    pub ransac_px: f64,
    pub min_inlier_ratio: f64,
    pub max_features: u32,
    pub ratio_test: f64,
    pub blur_reject: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            min_matches: 15,
            ransac_px: 5.0,
            min_inlier_ratio: 0.3,
            max_features: 1000,
            ratio_test: 0.75,
            blur_reject: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveConfig {
    pub window_size: usize,
    pub target_fix_rate: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            target_fix_rate: 0.7,
        }
    }
}

pub struct AdaptiveController {
    config: AdaptiveConfig,
    defaults: MatchParams,
    params: MatchParams,
    success: VecDeque<bool>,
    inlier_ratios: VecDeque<f64>,
    blur_scores: VecDeque<f64>,
    skip_next_frame: bool,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, defaults: MatchParams) -> Self {
        Self {
            config,
            defaults,
            params: defaults,
            success: VecDeque::new(),
            inlier_ratios: VecDeque::new(),
            blur_scores: VecDeque::new(),
            skip_next_frame: false,
        }
    }

    pub fn params(&self) -> &MatchParams {
        &self.params
    }

    /// Whether the frame currently being processed should skip the match
    /// attempt because the *previous* frame's blur sample was too low.
    pub fn should_skip_frame(&self) -> bool {
        self.skip_next_frame
    }

    fn fix_rate(&self) -> f64 {
        if self.success.is_empty() {
            return self.config.target_fix_rate;
        }
        let hits = self.success.iter().filter(|&&s| s).count();
        hits as f64 / self.success.len() as f64
    }

    fn trim(window: &mut VecDeque<f64>, cap: usize) {
        while window.len() > cap {
            window.pop_front();
        }
    }

    /// Records one tick's outcome and adjusts thresholds.
    pub fn record(&mut self, success: bool, inlier_ratio: f64, blur: f64) {
        let cap = self.config.window_size * 2;

        self.success.push_back(success);
        while self.success.len() > cap {
            self.success.pop_front();
        }
        self.inlier_ratios.push_back(inlier_ratio);
        Self::trim(&mut self.inlier_ratios, cap);
        self.blur_scores.push_back(blur);
        Self::trim(&mut self.blur_scores, cap);

        let rate = self.fix_rate();
        let target = self.config.target_fix_rate;

        if rate < 0.5 * target {
            self.params.min_matches = self.params.min_matches.saturating_sub(1).max(8);
            self.params.min_inlier_ratio = (self.params.min_inlier_ratio - 0.02).max(0.15);
            self.params.ratio_test = (self.params.ratio_test + 0.02).min(0.85);
            self.params.max_features = (self.params.max_features + 50).min(1000);
        } else if rate < target {
            self.params.min_matches = self.params.min_matches.saturating_sub(1).max(8);
            self.params.min_inlier_ratio = (self.params.min_inlier_ratio - 0.01).max(0.20);
        } else if rate > 1.5 * target {
            self.params.min_matches = (self.params.min_matches + 1).min(25);
            self.params.min_inlier_ratio = (self.params.min_inlier_ratio + 0.02).min(0.50);
            self.params.ratio_test = (self.params.ratio_test - 0.02).max(0.65);
            self.params.max_features = self.params.max_features.saturating_sub(50).max(300);
        }

        self.skip_next_frame = blur < self.params.blur_reject;
    }

    pub fn reset(&mut self) {
        self.params = self.defaults;
        self.success.clear();
        self.inlier_ratios.clear();
        self.blur_scores.clear();
        self.skip_next_frame = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_fix_rate_relaxes_thresholds() {
        let mut ctrl = AdaptiveController::new(AdaptiveConfig::default(), MatchParams::default());
        for _ in 0..20 {
            ctrl.record(false, 0.1, 100.0);
        }
        assert!(ctrl.params().min_matches < MatchParams::default().min_matches);
        assert!(ctrl.params().min_inlier_ratio < MatchParams::default().min_inlier_ratio);
        assert!(ctrl.params().max_features >= MatchParams::default().max_features);
    }

    #[test]
    fn high_fix_rate_tightens_thresholds() {
        let mut ctrl = AdaptiveController::new(AdaptiveConfig::default(), MatchParams::default());
        for _ in 0..20 {
            ctrl.record(true, 0.9, 100.0);
        }
        assert!(ctrl.params().min_matches >= MatchParams::default().min_matches);
        assert!(ctrl.params().min_inlier_ratio >= MatchParams::default().min_inlier_ratio);
    }

    #[test]
    fn blur_below_reject_threshold_flags_skip() {
        let mut ctrl = AdaptiveController::new(AdaptiveConfig::default(), MatchParams::default());
        ctrl.record(true, 0.5, 10.0);
        assert!(ctrl.should_skip_frame());
        ctrl.record(true, 0.5, 200.0);
        assert!(!ctrl.should_skip_frame());
    }

    #[test]
    fn reset_restores_defaults() {
        let mut ctrl = AdaptiveController::new(AdaptiveConfig::default(), MatchParams::default());
        for _ in 0..20 {
            ctrl.record(false, 0.1, 5.0);
        }
        ctrl.reset();
        assert_eq!(*ctrl.params(), MatchParams::default());
        assert!(!ctrl.should_skip_frame());
    }

    #[test]
    fn windows_are_trimmed_to_twice_window_size() {
        let mut ctrl = AdaptiveController::new(AdaptiveConfig::default(), MatchParams::default());
        for _ in 0..100 {
            ctrl.record(true, 0.5, 100.0);
        }
        assert!(ctrl.success.len() <= 40);
        assert!(ctrl.inlier_ratios.len() <= 40);
        assert!(ctrl.blur_scores.len() <= 40);
    }
}
