//! Grayscale conversion, CLAHE-style local contrast, and the two
//! diagnostics used downstream: a Laplacian-variance sharpness score (for
//! blur skipping) and a normalized mean brightness.

use image::{DynamicImage, GrayImage};

use crate::error::{LocatorError, Result};

#[derive(Debug, Clone, Copy)]
pub struct PreprocessConfig {
    pub clahe_clip: f64,
    pub clahe_grid: (u32, u32),
    pub denoise: bool,
    pub resize_to: Option<(u32, u32)>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            clahe_clip: 3.0,
            clahe_grid: (8, 8),
            denoise: false,
            resize_to: None,
        }
    }
}

pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Grayscales, equalizes, optionally denoises and resizes `image`,
    /// returning the processed frame plus `(sharpness, brightness)`.
    /// Idempotent for a fixed configuration; fails on empty/zero-sized
    /// images rather than producing garbage diagnostics.
    pub fn process(&self, image: &DynamicImage) -> Result<(GrayImage, f64, f64)> {
        if image.width() == 0 || image.height() == 0 {
            return Err(LocatorError::InvalidInput(
                "cannot preprocess a zero-sized image".into(),
            ));
        }

        let mut gray = image.to_luma8();
        gray = clahe(&gray, self.config.clahe_clip, self.config.clahe_grid);
        if self.config.denoise {
            gray = median_denoise_3x3(&gray);
        }
        if let Some((w, h)) = self.config.resize_to {
            gray = image::imageops::resize(&gray, w, h, image::imageops::FilterType::Triangle);
        }

        let sharpness = laplacian_variance(&gray);
        let brightness = mean_brightness(&gray);
        Ok((gray, sharpness, brightness))
    }

    /// Preprocesses a drone frame and a tile image with identical settings,
    /// so downstream matching compares frames with symmetric contrast.
    pub fn process_pair(
        &self,
        frame: &DynamicImage,
        tile: &DynamicImage,
    ) -> Result<((GrayImage, f64, f64), (GrayImage, f64, f64))> {
        Ok((self.process(frame)?, self.process(tile)?))
    }
}

/// Contrast-limited adaptive histogram equalization over an 8x8-ish grid of
/// tiles, with bilinear interpolation of each tile's mapping between the
/// four nearest tile centers.
fn clahe(gray: &GrayImage, clip: f64, grid: (u32, u32)) -> GrayImage {
    let (w, h) = gray.dimensions();
    let (gx, gy) = (grid.0.max(1), grid.1.max(1));
    let tile_w = (w as f64 / gx as f64).ceil() as u32;
    let tile_h = (h as f64 / gy as f64).ceil() as u32;

    let mut mappings: Vec<Vec<[u8; 256]>> = Vec::with_capacity(gy as usize);
    for ty in 0..gy {
        let mut row = Vec::with_capacity(gx as usize);
        for tx in 0..gx {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            row.push(tile_mapping(gray, x0, y0, x1, y1, clip));
        }
        mappings.push(row);
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = gray.get_pixel(x, y)[0];

            // Tile-center coordinates, for locating the four neighbors to
            // interpolate between.
            let fx = (x as f64) / tile_w as f64 - 0.5;
            let fy = (y as f64) / tile_h as f64 - 0.5;
            let tx0 = fx.floor().clamp(0.0, (gx - 1) as f64) as u32;
            let ty0 = fy.floor().clamp(0.0, (gy - 1) as f64) as u32;
            let tx1 = (tx0 + 1).min(gx - 1);
            let ty1 = (ty0 + 1).min(gy - 1);
            let ax = (fx - tx0 as f64).clamp(0.0, 1.0);
            let ay = (fy - ty0 as f64).clamp(0.0, 1.0);

            let v00 = mappings[ty0 as usize][tx0 as usize][v as usize] as f64;
            let v10 = mappings[ty0 as usize][tx1 as usize][v as usize] as f64;
            let v01 = mappings[ty1 as usize][tx0 as usize][v as usize] as f64;
            let v11 = mappings[ty1 as usize][tx1 as usize][v as usize] as f64;

            let top = v00 * (1.0 - ax) + v10 * ax;
            let bottom = v01 * (1.0 - ax) + v11 * ax;
            let value = (top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8;

            out.put_pixel(x, y, image::Luma([value]));
        }
    }
    out
}

fn tile_mapping(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip: f64) -> [u8; 256] {
    let mut hist = [0u32; 256];
    let mut count = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
            count += 1;
        }
    }
    if count == 0 {
        let mut identity = [0u8; 256];
        for (i, v) in identity.iter_mut().enumerate() {
            *v = i as u8;
        }
        return identity;
    }

    let clip_limit = ((clip * count as f64 / 256.0).max(1.0)) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip_limit {
            excess += *bin - clip_limit;
            *bin = clip_limit;
        }
    }
    let redistribute = excess / 256;
    let remainder = excess % 256;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += redistribute;
        if (i as u32) < remainder {
            *bin += 1;
        }
    }

    let mut cdf = [0u32; 256];
    let mut running = 0u32;
    for (i, &bin) in hist.iter().enumerate() {
        running += bin;
        cdf[i] = running;
    }

    let total = cdf[255].max(1) as f64;
    let mut mapping = [0u8; 256];
    for (i, &c) in cdf.iter().enumerate() {
        mapping[i] = ((c as f64 / total) * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    mapping
}

fn median_denoise_3x3(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut out = gray.clone();
    for y in 0..h {
        for x in 0..w {
            let mut window = [0u8; 9];
            let mut n = 0;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    let sx = (x as i32 + dx).clamp(0, w as i32 - 1) as u32;
                    let sy = (y as i32 + dy).clamp(0, h as i32 - 1) as u32;
                    window[n] = gray.get_pixel(sx, sy)[0];
                    n += 1;
                }
            }
            window.sort_unstable();
            out.put_pixel(x, y, image::Luma([window[4]]));
        }
    }
    out
}

/// Variance of the discrete 4-connected Laplacian, used as a sharpness
/// score: a blurry frame has a flat, low-variance Laplacian response.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut responses = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = -4.0 * px(x, y) + px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1);
            responses.push(lap);
        }
    }

    let mean = responses.iter().sum::<f64>() / responses.len() as f64;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / responses.len() as f64
}

/// Mean pixel intensity, normalized to `[0, 1]`.
pub fn mean_brightness(gray: &GrayImage) -> f64 {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| p as f64).sum::<f64>() / pixels.len() as f64 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn checkerboard(w: u32, h: u32) -> DynamicImage {
        let buf = ImageBuffer::from_fn(w, h, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Luma([20u8])
            } else {
                Luma([230u8])
            }
        });
        DynamicImage::ImageLuma8(buf)
    }

    fn flat(w: u32, h: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_pixel(w, h, Luma([value])))
    }

    #[test]
    fn rejects_zero_sized_images() {
        let pre = Preprocessor::new(PreprocessConfig::default());
        let img = DynamicImage::new_luma8(0, 0);
        assert!(matches!(pre.process(&img), Err(LocatorError::InvalidInput(_))));
    }

    #[test]
    fn sharp_image_has_higher_laplacian_variance_than_flat() {
        let pre = Preprocessor::new(PreprocessConfig::default());
        let (_, sharp_score, _) = pre.process(&checkerboard(64, 64)).unwrap();
        let (_, flat_score, _) = pre.process(&flat(64, 64, 128)).unwrap();
        assert!(sharp_score > flat_score);
    }

    #[test]
    fn brightness_is_normalized_to_unit_interval() {
        let pre = Preprocessor::new(PreprocessConfig::default());
        let (_, _, brightness) = pre.process(&flat(32, 32, 255)).unwrap();
        assert!(brightness > 0.9 && brightness <= 1.0);

        let (_, _, brightness_dark) = pre.process(&flat(32, 32, 0)).unwrap();
        assert!(brightness_dark < 0.1);
    }

    #[test]
    fn process_is_idempotent_for_a_fixed_config() {
        let pre = Preprocessor::new(PreprocessConfig::default());
        let img = checkerboard(32, 32);
        let (g1, s1, b1) = pre.process(&img).unwrap();
        let regrayed = DynamicImage::ImageLuma8(g1.clone());
        let (g2, s2, b2) = pre.process(&regrayed).unwrap();
        assert_eq!(g1.dimensions(), g2.dimensions());
        assert!((s1 - s2).abs() < s1.max(1.0) * 0.5);
        assert!((b1 - b2).abs() < 0.2);
    }

    #[test]
    fn resize_produces_requested_dimensions() {
        let pre = Preprocessor::new(PreprocessConfig {
            resize_to: Some((16, 16)),
            ..PreprocessConfig::default()
        });
        let (gray, _, _) = pre.process(&checkerboard(64, 64)).unwrap();
        assert_eq!(gray.dimensions(), (16, 16));
    }
}
