use crate::config::DetectorConfig;
use image::GrayImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Descriptor length in bytes (256 binary tests).
pub const DESCRIPTOR_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub response: f32,
    pub angle: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub keypoint: Keypoint,
    pub descriptor: [u8; DESCRIPTOR_BYTES],
}

/// FAST corner detector with oriented BRIEF descriptors.
///
/// Deterministic: identical pixels and identical configuration always yield
/// the same feature set. A blank or near-uniform raster simply yields few or
/// no keypoints.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    pub fast_threshold: u8,
    pub max_keypoints: usize,
}

// Offsets of the 16-pixel Bresenham circle used by the FAST-9 segment test.
const CIRCLE_OFFSETS: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

impl OrbExtractor {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            fast_threshold: config.fast_threshold,
            max_keypoints: config.max_keypoints,
        }
    }

    /// Detect keypoints and compute their descriptors.
    pub fn extract(&self, image: &GrayImage) -> Vec<Feature> {
        let (width, height) = (image.width(), image.height());
        if width < 8 || height < 8 {
            return Vec::new();
        }

        let corners = self.detect_corners(image);
        let selected = self.non_maximum_suppression(corners);

        selected
            .into_par_iter()
            .map(|mut keypoint| {
                keypoint.angle =
                    intensity_centroid_angle(image, keypoint.x as u32, keypoint.y as u32);
                let descriptor = compute_descriptor(image, &keypoint);
                Feature { keypoint, descriptor }
            })
            .collect()
    }

    fn detect_corners(&self, image: &GrayImage) -> Vec<Keypoint> {
        let (width, height) = (image.width(), image.height());

        (3..height - 3)
            .into_par_iter()
            .flat_map_iter(|y| {
                (3..width - 3).filter_map(move |x| {
                    let center = image.get_pixel(x, y)[0];
                    if !self.cardinal_pre_check(image, x, y, center) {
                        return None;
                    }
                    if !self.segment_test(image, x, y, center) {
                        return None;
                    }
                    Some(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        response: corner_response(image, x, y),
                        angle: 0.0,
                    })
                })
            })
            .collect()
    }

    /// Cheap rejection: at least 3 of the 4 cardinal circle pixels must
    /// already differ from the center before running the full segment test.
    fn cardinal_pre_check(&self, image: &GrayImage, x: u32, y: u32, center: u8) -> bool {
        let bright = center.saturating_add(self.fast_threshold);
        let dark = center.saturating_sub(self.fast_threshold);

        let pixels = [
            image.get_pixel(x, y - 3)[0],
            image.get_pixel(x + 3, y)[0],
            image.get_pixel(x, y + 3)[0],
            image.get_pixel(x - 3, y)[0],
        ];

        let bright_count = pixels.iter().filter(|&&p| p > bright).count();
        let dark_count = pixels.iter().filter(|&&p| p < dark).count();
        bright_count >= 3 || dark_count >= 3
    }

    /// FAST-9: some arc of 9 contiguous circle pixels must be uniformly
    /// brighter or darker than the center. The circle is walked twice to
    /// handle arcs that wrap around the starting index.
    fn segment_test(&self, image: &GrayImage, x: u32, y: u32, center: u8) -> bool {
        let bright = center.saturating_add(self.fast_threshold);
        let dark = center.saturating_sub(self.fast_threshold);

        let mut max_bright_run = 0u32;
        let mut max_dark_run = 0u32;
        let mut bright_run = 0u32;
        let mut dark_run = 0u32;

        for i in 0..CIRCLE_OFFSETS.len() * 2 {
            let (dx, dy) = CIRCLE_OFFSETS[i % CIRCLE_OFFSETS.len()];
            let px = (x as i32 + dx) as u32;
            let py = (y as i32 + dy) as u32;
            let pixel = image.get_pixel(px, py)[0];

            if pixel > bright {
                bright_run += 1;
                dark_run = 0;
                max_bright_run = max_bright_run.max(bright_run);
            } else if pixel < dark {
                dark_run += 1;
                bright_run = 0;
                max_dark_run = max_dark_run.max(dark_run);
            } else {
                bright_run = 0;
                dark_run = 0;
            }
        }

        max_bright_run >= 9 || max_dark_run >= 9
    }

    /// Response-ordered suppression: strongest corners claim a radius, weaker
    /// neighbors inside it are discarded, capped at `max_keypoints`.
    fn non_maximum_suppression(&self, mut corners: Vec<Keypoint>) -> Vec<Keypoint> {
        if corners.is_empty() {
            return corners;
        }

        corners.sort_by(|a, b| {
            b.response
                .partial_cmp(&a.response)
                .unwrap_or(Ordering::Equal)
                .then_with(|| (a.y, a.x).partial_cmp(&(b.y, b.x)).unwrap_or(Ordering::Equal))
        });

        let suppression_radius = 5.0f32;
        let mut suppressed_cells = std::collections::HashSet::new();
        let mut selected = Vec::new();

        for corner in corners {
            let grid_x = (corner.x / suppression_radius) as i32;
            let grid_y = (corner.y / suppression_radius) as i32;

            let mut is_maximum = true;
            'cells: for dy in -1..=1 {
                for dx in -1..=1 {
                    if suppressed_cells.contains(&(grid_x + dx, grid_y + dy)) {
                        is_maximum = false;
                        break 'cells;
                    }
                }
            }

            if is_maximum {
                suppressed_cells.insert((grid_x, grid_y));
                selected.push(corner);
                if selected.len() >= self.max_keypoints {
                    break;
                }
            }
        }

        selected
    }
}

/// Corner response as the intensity standard deviation of the 5x5
/// neighborhood; used only to rank corners for suppression.
fn corner_response(image: &GrayImage, x: u32, y: u32) -> f32 {
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0;

    for dy in -2i32..=2 {
        for dx in -2i32..=2 {
            let px = (x as i32 + dx) as u32;
            let py = (y as i32 + dy) as u32;
            if px < image.width() && py < image.height() {
                let intensity = image.get_pixel(px, py)[0] as f32;
                sum += intensity;
                sum_sq += intensity * intensity;
                count += 1;
            }
        }
    }

    let mean = sum / count as f32;
    let variance = (sum_sq / count as f32) - (mean * mean);
    variance.max(0.0).sqrt()
}

/// Patch orientation by the intensity centroid method.
fn intensity_centroid_angle(image: &GrayImage, x: u32, y: u32) -> f32 {
    let radius = 15i32;
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let px = x as i32 + dx;
            let py = y as i32 + dy;

            if px >= 0
                && py >= 0
                && (px as u32) < image.width()
                && (py as u32) < image.height()
                && dx * dx + dy * dy <= radius * radius
            {
                let intensity = image.get_pixel(px as u32, py as u32)[0] as f32;
                m01 += intensity * dy as f32;
                m10 += intensity * dx as f32;
            }
        }
    }

    m01.atan2(m10)
}

/// Oriented BRIEF: each bit compares a pair of pattern points rotated by the
/// keypoint orientation; samples are clamped to the image border.
fn compute_descriptor(image: &GrayImage, keypoint: &Keypoint) -> [u8; DESCRIPTOR_BYTES] {
    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    let x = keypoint.x as i32;
    let y = keypoint.y as i32;
    let cos_angle = keypoint.angle.cos();
    let sin_angle = keypoint.angle.sin();

    for (byte_idx, byte_tests) in ORB_PATTERN.chunks(8).enumerate() {
        let mut byte_val = 0u8;

        for (bit_idx, &(dx1, dy1, dx2, dy2)) in byte_tests.iter().enumerate() {
            let rx1 = (dx1 as f32 * cos_angle - dy1 as f32 * sin_angle) as i32;
            let ry1 = (dx1 as f32 * sin_angle + dy1 as f32 * cos_angle) as i32;
            let rx2 = (dx2 as f32 * cos_angle - dy2 as f32 * sin_angle) as i32;
            let ry2 = (dx2 as f32 * sin_angle + dy2 as f32 * cos_angle) as i32;

            let p1_x = (x + rx1).clamp(0, image.width() as i32 - 1) as u32;
            let p1_y = (y + ry1).clamp(0, image.height() as i32 - 1) as u32;
            let p2_x = (x + rx2).clamp(0, image.width() as i32 - 1) as u32;
            let p2_y = (y + ry2).clamp(0, image.height() as i32 - 1) as u32;

            if image.get_pixel(p1_x, p1_y)[0] < image.get_pixel(p2_x, p2_y)[0] {
                byte_val |= 1 << bit_idx;
            }
        }

        descriptor[byte_idx] = byte_val;
    }

    descriptor
}

// The standard learned ORB test pattern (256 point pairs in a 31x31 patch).
const ORB_PATTERN: [(i8, i8, i8, i8); 256] = [
    (8, -3, 9, 5), (-11, 9, -8, 2), (3, -12, -13, 2), (-3, -7, -4, 5),
    (1, -11, 12, -2), (1, -1, 11, -1), (4, -2, -5, -8), (2, -13, -8, 9),
    (-11, 1, 6, 2), (11, 11, 12, -1), (6, -12, -9, -8), (12, 5, 3, -6),
    (1, 1, -4, -1), (7, -4, -6, 7), (-3, 2, 9, -8), (-4, -8, 3, 3),
    (-5, 3, 0, -4), (2, -11, -13, 0), (10, 5, 5, 2), (0, 9, 10, -3),
    (5, -8, -10, 1), (8, 3, -8, -5), (2, -6, -9, -4), (-12, 2, 0, -10),
    (5, -10, -7, -2), (-7, 9, -1, 0), (0, -1, -3, 3), (-12, 5, -2, -1),
    (-1, 1, -5, -11), (-1, 2, -3, 0), (-5, -6, 7, -1), (4, 7, 0, -8),
    (-9, 9, 3, -13), (7, -3, 13, -7), (10, -4, -5, 3), (6, 1, -13, -13),
    (-12, -11, 7, 0), (0, -1, -8, -6), (-10, -5, -6, 7), (10, 2, -6, -12),
    (-11, 8, 4, -2), (9, 0, -11, -4), (0, 11, 6, -11), (4, 1, -10, -3),
    (-6, 12, 1, 12), (-4, -8, 8, -7), (-3, 0, 8, 3), (3, 3, -3, -1),
    (-6, -11, -2, 12), (0, -3, -6, -3), (-6, 3, -12, -8), (6, 3, -2, -10),
    (-3, -10, -1, 0), (11, 2, 11, 3), (1, -8, -10, 8), (2, -2, -7, 8),
    (0, -13, 13, 0), (6, -9, -1, -1), (7, 5, 6, 3), (-13, 7, -7, -7),
    (-5, -13, 5, -11), (6, 7, -2, 12), (-6, -11, 8, 6), (-2, -2, -5, 9),
    (5, 4, 7, -6), (0, 11, -4, -5), (10, 1, 2, -8), (-3, -10, -10, -10),
    (1, 9, 6, -5), (-7, -11, 11, 3), (11, -2, -4, 3), (7, -1, 5, 12),
    (-5, 5, -2, -5), (8, -11, -1, -13), (-13, 2, -11, -8), (-2, 9, 5, 0),
    (2, -5, 2, 0), (3, -13, -12, 9), (6, -3, 5, 4), (10, 10, 1, -9),
    (-13, -8, -4, 10), (2, -2, -3, 8), (-13, -11, -8, -3), (2, -4, -7, -3),
    (12, 0, -2, 13), (-11, 7, -10, -1), (-5, -10, 0, -11), (6, 7, 12, -3),
    (-1, -1, 8, -6), (-6, 3, -1, -3), (-2, -11, -11, -3), (12, -2, 3, -10),
    (-11, -1, -2, -8), (3, -1, 7, 3), (2, -2, -12, 12), (6, -4, 12, -2),
    (-3, 11, 2, -12), (-1, 3, 2, 3), (1, 3, -11, -3), (2, -8, -7, -5),
    (0, -5, -11, -6), (-12, 8, -2, 9), (3, -7, 9, -8), (-10, -6, -1, -11),
    (11, -6, -3, -13), (3, 0, 0, -8), (-5, -2, -1, -13), (-8, -5, -10, -13),
    (7, -13, 0, -3), (1, -4, -1, -13), (6, -5, -7, 8), (8, 7, -5, -13),
    (2, 0, -8, -6), (-8, -3, -13, -6), (-6, 5, 0, 6), (-8, 8, -9, 1),
    (10, 1, -9, 4), (-4, -8, -5, 7), (7, 7, 10, -8), (-7, -3, -1, 1),
    (10, -1, 3, 1), (5, 6, -10, -8), (-6, -13, 5, -8), (4, -3, -4, -13),
    (-3, 4, -2, -13), (10, -11, 9, 11), (-9, 0, 12, 2), (-4, -2, 13, -6),
    (2, -10, -6, 1), (11, -13, 4, -13), (1, -1, 1, 9), (1, -5, -13, -5),
    (7, 4, 12, -7), (0, -2, -8, 3), (7, 2, 2, -8), (-2, 7, -12, -4),
    (1, 11, 6, -2), (-1, -1, -4, 10), (0, 8, 0, -13), (3, 12, 5, -13),
    (-9, -1, 9, -13), (12, 4, -6, -4), (-13, 13, 1, -4), (0, -2, -7, -9),
    (10, -8, -13, 3), (2, -13, 6, 8), (10, -6, -7, 0), (-11, 7, -1, -7),
    (12, 0, 5, -4), (-7, -8, 4, -12), (-13, 5, -5, -2), (0, 5, 4, 4),
    (-2, -11, -1, 8), (9, 3, -1, -12), (0, 6, -10, 12), (1, -8, -7, -10),
    (-6, 4, -6, 3), (5, 1, -3, -9), (-6, 6, -6, 3), (7, -8, 1, -7),
    (3, 8, -9, -5), (2, -4, 5, 7), (11, 4, 6, -3), (-8, -1, 11, -1),
    (-3, -6, -10, -8), (2, 7, 3, -12), (-4, -10, 12, -3), (1, -2, -4, 6),
    (3, 11, -11, 0), (-6, 2, 3, -8), (6, 12, 0, -13), (3, 2, -2, -5),
    (-4, 1, -6, 5), (-12, 0, -13, 9), (-6, 2, 7, -8), (-2, -4, -6, 5),
    (0, 0, 0, -13), (9, -13, -2, 0), (3, -13, 5, -12), (10, 11, -13, -13),
    (-2, 3, -12, 3), (11, 7, -7, 0), (12, 2, 1, -13), (12, -11, 12, -8),
    (-7, -2, -4, -7), (7, 5, -1, -13), (-5, -8, -9, 10), (6, 0, -3, -13),
    (12, 4, -13, 1), (-7, 8, 8, -3), (10, -4, 0, -13), (2, 1, -7, 0),
    (-5, 4, 2, -8), (12, 8, 4, -13), (8, 7, -10, 0), (-3, 6, -2, 4),
    (-5, -1, -8, -12), (4, -1, -2, -10), (6, -4, -13, 9), (-7, 8, -6, -12),
    (-10, 2, -13, 10), (-1, -7, 0, 2), (-5, 6, -5, -12), (6, -13, 7, -3),
    (-13, 2, -1, 8), (2, 8, -13, 0), (-6, -9, 1, -4), (-9, 13, 0, -13),
    (-2, -3, 8, 0), (4, 0, -11, 12), (0, 3, -10, 10), (-6, -9, -3, -2),
    (9, -4, -6, 2), (5, 0, -13, -10), (-3, -8, -13, 3), (-12, -1, -4, -2),
    (7, -9, -4, 3), (-8, -4, 1, 11), (11, 6, 2, -12), (6, 6, -8, 12),
    (-3, -8, 2, -10), (2, 5, -8, 8), (-9, 8, -6, -8), (-4, 0, -11, -7),
    (7, 6, -3, 8), (-5, 7, -12, 5), (2, -8, -5, 1), (0, 4, -5, -3),
    (9, -9, -6, -12), (0, -13, 0, -13), (-7, -11, -3, -13), (6, -12, -7, 10),
    (6, -8, -13, 7), (8, 7, -11, -1), (-11, -5, -6, 9), (6, 4, 2, -13),
    (-1, -6, 3, -9), (1, -4, 4, -3), (-6, 8, -12, 0), (-11, 3, -6, 2),
    (7, -10, 11, -6), (5, 0, 12, -13), (4, -8, 1, -1), (-13, 12, -6, 3),
    (1, 4, -9, -2), (-8, -12, -8, 7), (-9, 5, 0, -5), (9, 7, 5, 3),
    (-12, -2, 8, -8), (3, 7, 12, -8), (-13, 3, -1, -1), (-10, -4, -10, 12),
    (5, -2, 0, 13), (-7, 1, -12, 8), (2, 9, -5, -11), (11, -13, 0, 2),
];

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checker(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let intensity = if (x % 8 < 4) ^ (y % 8 < 4) { 255 } else { 50 };
            Luma([intensity])
        })
    }

    #[test]
    fn uniform_image_yields_no_features() {
        let image = GrayImage::from_pixel(64, 64, Luma([128]));
        let extractor = OrbExtractor { fast_threshold: 20, max_keypoints: 500 };
        assert!(extractor.extract(&image).is_empty());
    }

    #[test]
    fn checkerboard_yields_features_within_cap() {
        let image = checker(96, 96);
        let extractor = OrbExtractor { fast_threshold: 20, max_keypoints: 50 };
        let features = extractor.extract(&image);
        assert!(!features.is_empty());
        assert!(features.len() <= 50);
    }

    #[test]
    fn extraction_is_deterministic() {
        let image = checker(96, 96);
        let extractor = OrbExtractor { fast_threshold: 15, max_keypoints: 200 };
        let a = extractor.extract(&image);
        let b = extractor.extract(&image);
        assert_eq!(a.len(), b.len());
        for (fa, fb) in a.iter().zip(b.iter()) {
            assert_eq!(fa.keypoint.x, fb.keypoint.x);
            assert_eq!(fa.keypoint.y, fb.keypoint.y);
            assert_eq!(fa.descriptor, fb.descriptor);
        }
    }

    #[test]
    fn tiny_image_is_not_an_error() {
        let image = GrayImage::from_pixel(4, 4, Luma([7]));
        let extractor = OrbExtractor { fast_threshold: 20, max_keypoints: 500 };
        assert!(extractor.extract(&image).is_empty());
    }
}
