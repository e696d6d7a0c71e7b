//! Robust homography estimation: normalized DLT inside a RANSAC loop.
//!
//! Maps point correspondences from image A (the drone frame) to image B
//! (the matched tile), rejecting degenerate fits rather than propagating
//! NaN into the filter.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{LocatorError, Result};

#[derive(Debug, Clone, Copy)]
pub struct HomographyParams {
    pub ransac_px: f64,
    pub confidence: f64,
    pub min_inlier_ratio: f64,
    pub max_iterations: usize,
}

impl Default for HomographyParams {
    fn default() -> Self {
        Self {
            ransac_px: 5.0,
            confidence: 0.999,
            min_inlier_ratio: 0.3,
            max_iterations: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HomographyResult {
    pub h: Matrix3<f64>,
    pub inliers: Vec<bool>,
    pub inlier_ratio: f64,
}

fn normalize(points: &[(f64, f64)]) -> (Vec<(f64, f64)>, Matrix3<f64>) {
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    let (cx, cy) = (sx / n, sy / n);

    let mean_dist = points
        .iter()
        .map(|&(x, y)| (((x - cx).powi(2) + (y - cy).powi(2)).sqrt()))
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|&(x, y)| (scale * (x - cx), scale * (y - cy)))
        .collect();
    (normalized, t)
}

/// Solves for the homography null space via SVD over the `2n x 9` DLT
/// constraint matrix. Requires at least 4 correspondences.
fn solve_dlt(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < 4 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (x, y) = src[i];
        let (xp, yp) = dst[i];
        a.set_row(2 * i, &DMatrix::from_row_slice(1, 9, &[-x, -y, -1.0, 0.0, 0.0, 0.0, xp * x, xp * y, xp]));
        a.set_row(
            2 * i + 1,
            &DMatrix::from_row_slice(1, 9, &[0.0, 0.0, 0.0, -x, -y, -1.0, yp * x, yp * y, yp]),
        );
    }

    let svd = nalgebra::linalg::SVD::new(a, true, true);
    let v_t = svd.v_t?;
    let last_row = v_t.nrows() - 1;
    let h_vec = v_t.row(last_row);

    let mut h = Matrix3::zeros();
    for i in 0..3 {
        for j in 0..3 {
            h[(i, j)] = h_vec[i * 3 + j];
        }
    }
    Some(h)
}

/// Fits a homography over exactly the given correspondences using
/// normalized DLT.
fn fit_normalized(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let (src_n, t_src) = normalize(src);
    let (dst_n, t_dst) = normalize(dst);
    let h_n = solve_dlt(&src_n, &dst_n)?;
    let t_dst_inv = t_dst.try_inverse()?;
    let h = t_dst_inv * h_n * t_src;
    if h[(2, 2)].abs() < 1e-12 {
        return None;
    }
    Some(h / h[(2, 2)])
}

fn reprojection_error(h: &Matrix3<f64>, src: (f64, f64), dst: (f64, f64)) -> Option<f64> {
    let v = h * Vector3::new(src.0, src.1, 1.0);
    if v.z.abs() < 1e-10 {
        return None;
    }
    let px = v.x / v.z;
    let py = v.y / v.z;
    Some(((px - dst.0).powi(2) + (py - dst.1).powi(2)).sqrt())
}

fn adaptive_iteration_cap(confidence: f64, inlier_ratio: f64, sample_size: usize, cap: usize) -> usize {
    if inlier_ratio <= 0.0 || inlier_ratio >= 1.0 {
        return cap;
    }
    let denom = (1.0 - inlier_ratio.powi(sample_size as i32)).ln();
    if denom >= 0.0 {
        return cap;
    }
    let n = ((1.0 - confidence).ln() / denom).ceil();
    if n.is_finite() && n > 0.0 {
        (n as usize).min(cap)
    } else {
        cap
    }
}

/// Robustly estimates a homography mapping `pts_a -> pts_b`. Rejects with
/// [`LocatorError::Degenerate`] when fewer than 4 pairs are given, when no
/// RANSAC sample yields a well-conditioned fit, or when the best fit's
/// inlier ratio falls below `min_inlier_ratio`.
pub fn estimate(pts_a: &[(f64, f64)], pts_b: &[(f64, f64)], params: HomographyParams) -> Result<HomographyResult> {
    if pts_a.len() != pts_b.len() {
        return Err(LocatorError::InvalidInput(
            "point set length mismatch in homography estimation".into(),
        ));
    }
    if pts_a.len() < 4 {
        return Err(LocatorError::Degenerate(format!(
            "need at least 4 correspondences, got {}",
            pts_a.len()
        )));
    }

    let n = pts_a.len();
    let mut rng = rand::thread_rng();
    let indices: Vec<usize> = (0..n).collect();

    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;
    let mut iterations_cap = params.max_iterations;
    let mut iter = 0usize;

    while iter < iterations_cap.min(params.max_iterations) {
        iter += 1;
        let mut sample = indices.clone();
        sample.shuffle(&mut rng);
        let sample = &sample[0..4];

        let src: Vec<(f64, f64)> = sample.iter().map(|&i| pts_a[i]).collect();
        let dst: Vec<(f64, f64)> = sample.iter().map(|&i| pts_b[i]).collect();

        let h = match fit_normalized(&src, &dst) {
            Some(h) if h.determinant().is_finite() && h.determinant() > 0.0 => h,
            _ => continue,
        };

        let mut inliers = vec![false; n];
        let mut inlier_count = 0usize;
        for i in 0..n {
            if let Some(err) = reprojection_error(&h, pts_a[i], pts_b[i]) {
                if err <= params.ransac_px {
                    inliers[i] = true;
                    inlier_count += 1;
                }
            }
        }

        let better = match &best {
            Some((_, _, best_count)) => inlier_count > *best_count,
            None => true,
        };
        if better {
            let ratio = inlier_count as f64 / n as f64;
            iterations_cap = adaptive_iteration_cap(params.confidence, ratio, 4, params.max_iterations);
            best = Some((h, inliers, inlier_count));
        }
    }

    let Some((_, inliers, inlier_count)) = best else {
        return Err(LocatorError::Degenerate("RANSAC found no valid sample".into()));
    };

    // Refit over all inliers for a tighter final estimate.
    let inlier_src: Vec<(f64, f64)> = (0..n).filter(|&i| inliers[i]).map(|i| pts_a[i]).collect();
    let inlier_dst: Vec<(f64, f64)> = (0..n).filter(|&i| inliers[i]).map(|i| pts_b[i]).collect();

    let h_final = fit_normalized(&inlier_src, &inlier_dst)
        .ok_or_else(|| LocatorError::Degenerate("refit over inliers failed".into()))?;

    if h_final.determinant() <= 0.0 || !h_final.determinant().is_finite() {
        return Err(LocatorError::Degenerate("non-positive or non-finite determinant".into()));
    }

    let inlier_ratio = inlier_count as f64 / n as f64;
    if inlier_ratio < params.min_inlier_ratio {
        return Err(LocatorError::Degenerate(format!(
            "inlier ratio {inlier_ratio:.3} below threshold {:.3}",
            params.min_inlier_ratio
        )));
    }

    Ok(HomographyResult {
        h: h_final,
        inliers,
        inlier_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(h: &Matrix3<f64>, p: (f64, f64)) -> (f64, f64) {
        let v = h * Vector3::new(p.0, p.1, 1.0);
        (v.x / v.z, v.y / v.z)
    }

    #[test]
    fn recovers_known_translation() {
        let h_true = Matrix3::new(1.0, 0.0, 50.0, 0.0, 1.0, -20.0, 0.0, 0.0, 1.0);
        let src: Vec<(f64, f64)> = vec![(0.0, 0.0), (100.0, 0.0), (0.0, 100.0), (100.0, 100.0), (50.0, 50.0), (20.0, 80.0)];
        let dst: Vec<(f64, f64)> = src.iter().map(|&p| apply(&h_true, p)).collect();

        let result = estimate(&src, &dst, HomographyParams::default()).unwrap();
        assert!(result.inlier_ratio > 0.9);

        for &p in &src {
            let expect = apply(&h_true, p);
            let got = apply(&result.h, p);
            assert!((expect.0 - got.0).abs() < 1.0);
            assert!((expect.1 - got.1).abs() < 1.0);
        }
    }

    #[test]
    fn rejects_fewer_than_four_pairs() {
        let src = vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)];
        let dst = src.clone();
        let err = estimate(&src, &dst, HomographyParams::default()).unwrap_err();
        assert!(matches!(err, LocatorError::Degenerate(_)));
    }

    #[test]
    fn rejects_when_inlier_ratio_too_low() {
        let h_true = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let mut src: Vec<(f64, f64)> = vec![
            (0.0, 0.0),
            (100.0, 0.0),
            (0.0, 100.0),
            (100.0, 100.0),
        ];
        let mut dst: Vec<(f64, f64)> = src.iter().map(|&p| apply(&h_true, p)).collect();

        // Add many random, inconsistent outlier pairs to push inlier ratio down.
        for i in 0..20 {
            src.push((i as f64 * 3.0, i as f64 * 7.0));
            dst.push((i as f64 * -11.0, i as f64 * 13.0));
        }

        let params = HomographyParams {
            min_inlier_ratio: 0.5,
            ..HomographyParams::default()
        };
        let err = estimate(&src, &dst, params);
        assert!(err.is_err(), "expected low inlier ratio rejection, got {err:?}");
    }

    #[test]
    fn mismatched_lengths_are_invalid_input() {
        let src = vec![(0.0, 0.0); 4];
        let dst = vec![(0.0, 0.0); 5];
        let err = estimate(&src, &dst, HomographyParams::default()).unwrap_err();
        assert!(matches!(err, LocatorError::InvalidInput(_)));
    }
}
