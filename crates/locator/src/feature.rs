//! Per-image local features, pairwise correspondences, and a global
//! descriptor for coarse tile retrieval. Two interchangeable back-ends,
//! selected once at start-up and fixed for the process lifetime: a
//! dependency-light classical pipeline (FAST corners + a BRIEF-style binary
//! patch descriptor + Hamming matching) and a learned pipeline (a frozen
//! ONNX inference runtime). Expressed as a tagged enum rather than a trait
//! object so the hot matching path never pays for dynamic dispatch.

use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};

use crate::adaptive::MatchParams;
use crate::error::{LocatorError, Result};

/// Point correspondences between a drone frame (`pts_a`) and a tile image
/// (`pts_b`), with a per-pair confidence in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct Correspondences {
    pub pts_a: Vec<(f64, f64)>,
    pub pts_b: Vec<(f64, f64)>,
    pub scores: Vec<f32>,
}

impl Correspondences {
    pub fn len(&self) -> usize {
        self.pts_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pts_a.is_empty()
    }
}

/// Binary patch descriptor length in bytes (256 bits), matching the
/// classical back-end's BRIEF-style encoding.
const DESCRIPTOR_BYTES: usize = 32;

/// A fixed, deterministic sampling pattern of pixel-pair offsets around a
/// keypoint, used to build the binary descriptor. Generated once from a
/// simple linear-congruential sequence so the pattern is reproducible
/// without shipping a lookup table.
fn brief_pattern() -> Vec<((i32, i32), (i32, i32))> {
    let mut state: u32 = 0x9E3779B9;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    let patch_radius = 15i32;
    (0..DESCRIPTOR_BYTES * 8)
        .map(|_| {
            let a = (
                (next() % (2 * patch_radius as u32 + 1)) as i32 - patch_radius,
                (next() % (2 * patch_radius as u32 + 1)) as i32 - patch_radius,
            );
            let b = (
                (next() % (2 * patch_radius as u32 + 1)) as i32 - patch_radius,
                (next() % (2 * patch_radius as u32 + 1)) as i32 - patch_radius,
            );
            (a, b)
        })
        .collect()
}

fn sample(image: &GrayImage, x: i32, y: i32) -> u8 {
    let (w, h) = image.dimensions();
    let cx = x.clamp(0, w as i32 - 1) as u32;
    let cy = y.clamp(0, h as i32 - 1) as u32;
    image.get_pixel(cx, cy)[0]
}

fn describe(image: &GrayImage, corner: &Corner, pattern: &[((i32, i32), (i32, i32))]) -> [u8; DESCRIPTOR_BYTES] {
    let mut desc = [0u8; DESCRIPTOR_BYTES];
    for (bit, &((ax, ay), (bx, by))) in pattern.iter().enumerate() {
        let va = sample(image, corner.x as i32 + ax, corner.y as i32 + ay);
        let vb = sample(image, corner.x as i32 + bx, corner.y as i32 + by);
        if va < vb {
            desc[bit / 8] |= 1 << (bit % 8);
        }
    }
    desc
}

fn hamming_distance(a: &[u8; DESCRIPTOR_BYTES], b: &[u8; DESCRIPTOR_BYTES]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// FAST-corner + BRIEF-style binary-descriptor classical back-end, matched
/// by brute-force Hamming distance with Lowe's ratio test.
pub struct ClassicalMatcher {
    pattern: Vec<((i32, i32), (i32, i32))>,
    fast_threshold: u8,
}

impl ClassicalMatcher {
    pub fn new() -> Self {
        Self {
            pattern: brief_pattern(),
            fast_threshold: 20,
        }
    }

    fn detect(&self, image: &GrayImage, max_features: u32) -> (Vec<Corner>, Vec<[u8; DESCRIPTOR_BYTES]>) {
        let mut corners = corners_fast9(image, self.fast_threshold);
        corners.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        corners.truncate(max_features as usize);
        let descriptors = corners.iter().map(|c| describe(image, c, &self.pattern)).collect();
        (corners, descriptors)
    }

    /// Mean of the per-keypoint binary descriptors, cast to float, used as a
    /// coarse global descriptor for tile retrieval.
    pub fn extract_global_descriptor(&self, image: &GrayImage, max_features: u32) -> Vec<f32> {
        let (_, descriptors) = self.detect(image, max_features);
        if descriptors.is_empty() {
            return vec![0.0; DESCRIPTOR_BYTES];
        }
        let mut sums = vec![0f64; DESCRIPTOR_BYTES];
        for desc in &descriptors {
            for (i, &byte) in desc.iter().enumerate() {
                sums[i] += byte as f64;
            }
        }
        let n = descriptors.len() as f64;
        sums.iter().map(|&s| (s / n) as f32).collect()
    }

    pub fn match_images(&self, a: &GrayImage, b: &GrayImage, params: &MatchParams) -> Correspondences {
        let (corners_a, desc_a) = self.detect(a, params.max_features);
        let (corners_b, desc_b) = self.detect(b, params.max_features);

        if desc_a.is_empty() || desc_b.is_empty() {
            return Correspondences::default();
        }

        let mut out = Correspondences::default();
        for (i, da) in desc_a.iter().enumerate() {
            let mut best = (usize::MAX, u32::MAX);
            let mut second = u32::MAX;
            for (j, db) in desc_b.iter().enumerate() {
                let d = hamming_distance(da, db);
                if d < best.1 {
                    second = best.1;
                    best = (j, d);
                } else if d < second {
                    second = d;
                }
            }
            if best.0 == usize::MAX {
                continue;
            }
            // Lowe's ratio test over Hamming distances.
            if (best.1 as f64) < params.ratio_test * second as f64 {
                let max_bits = (DESCRIPTOR_BYTES * 8) as f64;
                let score = (1.0 - best.1 as f64 / max_bits).clamp(0.0, 1.0);
                out.pts_a.push((corners_a[i].x as f64, corners_a[i].y as f64));
                out.pts_b.push((corners_b[best.0].x as f64, corners_b[best.0].y as f64));
                out.scores.push(score as f32);
            }
        }
        out
    }
}

impl Default for ClassicalMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A frozen ONNX inference session for one graph. Constructing this owns
/// the loaded, optimized model; `run` does not mutate the session.
struct OnnxSession {
    plan: tract_onnx::prelude::TypedRunnableModel<tract_onnx::prelude::TypedModel>,
}

impl OnnxSession {
    fn load(path: &std::path::Path) -> Result<Self> {
        use tract_onnx::prelude::*;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| LocatorError::InvalidInput(format!("onnx model {}: {e}", path.display())))?
            .into_optimized()
            .map_err(|e| LocatorError::InvalidInput(format!("onnx optimize {}: {e}", path.display())))?
            .into_runnable()
            .map_err(|e| LocatorError::InvalidInput(format!("onnx plan {}: {e}", path.display())))?;
        Ok(Self { plan })
    }
}

/// Neural feature extractor + learned matcher via a frozen ONNX runtime.
/// Global descriptor is the mean of per-keypoint descriptors (256-d).
pub struct LearnedMatcher {
    extractor: OnnxSession,
    matcher: OnnxSession,
}

const LEARNED_DESCRIPTOR_DIM: usize = 256;

impl LearnedMatcher {
    pub fn load(extractor_path: &std::path::Path, matcher_path: &std::path::Path) -> Result<Self> {
        Ok(Self {
            extractor: OnnxSession::load(extractor_path)?,
            matcher: OnnxSession::load(matcher_path)?,
        })
    }

    fn run_extractor(&self, image: &GrayImage) -> Result<(Vec<(f32, f32)>, Vec<Vec<f32>>)> {
        use tract_onnx::prelude::*;
        let (w, h) = image.dimensions();
        let input: Tensor = tract_ndarray::Array4::from_shape_fn((1, 1, h as usize, w as usize), |(_, _, y, x)| {
            image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
        })
        .into();

        let outputs = self
            .extractor
            .plan
            .run(tvec!(input.into()))
            .map_err(|e| LocatorError::Degenerate(format!("onnx extractor inference: {e}")))?;

        let keypoints = outputs[0]
            .to_array_view::<f32>()
            .map_err(|e| LocatorError::Degenerate(format!("onnx keypoint tensor: {e}")))?
            .to_owned();
        let descriptors = outputs[1]
            .to_array_view::<f32>()
            .map_err(|e| LocatorError::Degenerate(format!("onnx descriptor tensor: {e}")))?
            .to_owned();

        let n = keypoints.shape()[0];
        let d = descriptors.shape().get(1).copied().unwrap_or(LEARNED_DESCRIPTOR_DIM);
        let pts = (0..n).map(|i| (keypoints[[i, 0]], keypoints[[i, 1]])).collect();
        let descs = (0..n).map(|i| (0..d).map(|j| descriptors[[i, j]]).collect()).collect();
        Ok((pts, descs))
    }

    pub fn extract_global_descriptor(&self, image: &GrayImage) -> Vec<f32> {
        match self.run_extractor(image) {
            Ok((_, descs)) if !descs.is_empty() => {
                let d = descs[0].len();
                let mut mean = vec![0f32; d];
                for desc in &descs {
                    for (i, &v) in desc.iter().enumerate() {
                        mean[i] += v;
                    }
                }
                let n = descs.len() as f32;
                mean.iter_mut().for_each(|v| *v /= n);
                mean
            }
            _ => vec![0.0; LEARNED_DESCRIPTOR_DIM],
        }
    }

    pub fn match_images(&self, a: &GrayImage, b: &GrayImage) -> Correspondences {
        use tract_onnx::prelude::*;

        let (Ok((kp_a, desc_a)), Ok((kp_b, desc_b))) = (self.run_extractor(a), self.run_extractor(b)) else {
            return Correspondences::default();
        };
        if kp_a.is_empty() || kp_b.is_empty() {
            return Correspondences::default();
        }

        let d = desc_a[0].len();
        let kpts0: Tensor = tract_ndarray::Array3::from_shape_fn((1, kp_a.len(), 2), |(_, i, c)| {
            if c == 0 { kp_a[i].0 } else { kp_a[i].1 }
        })
        .into();
        let kpts1: Tensor = tract_ndarray::Array3::from_shape_fn((1, kp_b.len(), 2), |(_, i, c)| {
            if c == 0 { kp_b[i].0 } else { kp_b[i].1 }
        })
        .into();
        let desc0: Tensor = tract_ndarray::Array3::from_shape_fn((1, kp_a.len(), d), |(_, i, c)| desc_a[i][c]).into();
        let desc1: Tensor = tract_ndarray::Array3::from_shape_fn((1, kp_b.len(), d), |(_, i, c)| desc_b[i][c]).into();

        let outputs = match self
            .matcher
            .plan
            .run(tvec!(kpts0.into(), kpts1.into(), desc0.into(), desc1.into()))
        {
            Ok(o) => o,
            Err(_) => return Correspondences::default(),
        };

        let matches = match outputs[0].to_array_view::<i64>() {
            Ok(v) => v.to_owned(),
            Err(_) => return Correspondences::default(),
        };
        let scores = outputs
            .get(1)
            .and_then(|t| t.to_array_view::<f32>().ok())
            .map(|v| v.to_owned());

        let mut out = Correspondences::default();
        let m = matches.shape()[0];
        for i in 0..m {
            let ia = matches[[i, 0]] as usize;
            let ib = matches[[i, 1]] as usize;
            if ia >= kp_a.len() || ib >= kp_b.len() {
                continue;
            }
            out.pts_a.push((kp_a[ia].0 as f64, kp_a[ia].1 as f64));
            out.pts_b.push((kp_b[ib].0 as f64, kp_b[ib].1 as f64));
            out.scores.push(scores.as_ref().map(|s| s[[i]]).unwrap_or(1.0));
        }
        out
    }
}

/// Tagged variant over the two back-ends, selected once at start-up.
pub enum FeatureMatcher {
    Classical(ClassicalMatcher),
    Learned(LearnedMatcher),
}

impl FeatureMatcher {
    pub fn extract_global_descriptor(&self, image: &GrayImage, params: &MatchParams) -> Vec<f32> {
        match self {
            FeatureMatcher::Classical(m) => m.extract_global_descriptor(image, params.max_features),
            FeatureMatcher::Learned(m) => m.extract_global_descriptor(image),
        }
    }

    /// Matches `frame` (drone) against `tile`. When fewer than four
    /// correspondences come back, callers should short-circuit to "no
    /// match" rather than invoke homography estimation.
    pub fn match_images(&self, frame: &GrayImage, tile: &GrayImage, params: &MatchParams) -> Correspondences {
        match self {
            FeatureMatcher::Classical(m) => m.match_images(frame, tile, params),
            FeatureMatcher::Learned(m) => m.match_images(frame, tile),
        }
    }

    pub fn is_classical(&self) -> bool {
        matches!(self, FeatureMatcher::Classical(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn checkerboard(w: u32, h: u32) -> GrayImage {
        ImageBuffer::from_fn(w, h, |x, y| {
            if (x / 6 + y / 6) % 2 == 0 {
                Luma([20u8])
            } else {
                Luma([230u8])
            }
        })
    }

    #[test]
    fn classical_matches_an_image_against_itself() {
        let img = checkerboard(128, 128);
        let matcher = ClassicalMatcher::new();
        let params = MatchParams::default();
        let out = matcher.match_images(&img, &img, &params);
        assert!(out.len() >= 4, "expected self-matches, got {}", out.len());
        for &(ax, ay) in &out.pts_a {
            assert!(ax >= 0.0 && ay >= 0.0);
        }
    }

    #[test]
    fn global_descriptor_has_fixed_dimension() {
        let matcher = ClassicalMatcher::new();
        let img = checkerboard(64, 64);
        let desc = matcher.extract_global_descriptor(&img, 500);
        assert_eq!(desc.len(), DESCRIPTOR_BYTES);
    }

    #[test]
    fn flat_image_yields_no_confident_correspondences() {
        let flat = ImageBuffer::from_pixel(64, 64, Luma([128u8]));
        let matcher = ClassicalMatcher::new();
        let out = matcher.match_images(&flat, &flat, &MatchParams::default());
        assert!(out.is_empty());
    }

    #[test]
    fn enum_dispatch_matches_classical_variant() {
        let fm = FeatureMatcher::Classical(ClassicalMatcher::new());
        assert!(fm.is_classical());
        let img = checkerboard(64, 64);
        let desc = fm.extract_global_descriptor(&img, &MatchParams::default());
        assert_eq!(desc.len(), DESCRIPTOR_BYTES);
    }
}
