use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for a [`crate::Stitcher`] instance. Built once, passed by
/// reference into every call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StitchConfig {
    /// Ordered rescale factors to try; the first scale that yields a valid
    /// fit wins. Smaller-first is the usual speed optimization.
    pub scales: Vec<f64>,
    pub crop: CropMargins,
    /// Directory for the on-disk feature cache; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    pub detector: DetectorConfig,
    pub matcher: MatcherConfig,
    pub ransac: RansacConfig,
}

/// Fractions of the image extent excluded from each side before feature
/// extraction, e.g. to drop vignetted sensor borders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CropMargins {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub fast_threshold: u8,
    pub max_keypoints: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Absolute Hamming cutoff (bits) for an acceptable match.
    pub max_distance: u32,
    /// Lowe ratio: best distance must be below `ratio * second_best`.
    pub ratio: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RansacConfig {
    pub max_iterations: u32,
    /// Reprojection error tolerance in pixels for counting inliers.
    pub inlier_threshold: f64,
    /// Minimum inlier count for a candidate to be accepted.
    pub min_inliers: usize,
    /// Minimum fraction of correspondences that must be inliers.
    pub min_inlier_ratio: f64,
    /// Stop sampling early once this inlier ratio is reached.
    pub early_exit_ratio: f64,
    /// Candidate transforms scaling outside `[1/max_scale, max_scale]`
    /// per axis are rejected as geometric nonsense.
    pub max_scale: f64,
}

impl CropMargins {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.top == 0.0 && self.bottom == 0.0 && self.left == 0.0 && self.right == 0.0
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            max_keypoints: 500,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_distance: 96,
            ratio: 0.75,
        }
    }
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            inlier_threshold: 3.0,
            min_inliers: 10,
            min_inlier_ratio: 0.2,
            early_exit_ratio: 0.8,
            max_scale: 10.0,
        }
    }
}

impl StitchConfig {
    /// Sensible defaults for aerial tile pairs: a fast half-resolution
    /// attempt before full resolution, no cropping, no cache.
    pub fn new() -> Self {
        Self {
            scales: vec![0.5, 1.0],
            ..Self::default()
        }
    }

    /// Load from a TOML or JSON file (JSON is sniffed by a leading `{`).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = if content.trim_start().starts_with('{') {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Ok(config)
    }

    /// Collect every configuration problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scales.is_empty() {
            errors.push("scales must not be empty".to_string());
        }
        for &scale in &self.scales {
            if !scale.is_finite() || scale <= 0.0 {
                errors.push(format!("scale factor {scale} must be finite and positive"));
            }
        }

        let crop = &self.crop;
        for (name, value) in [
            ("top", crop.top),
            ("bottom", crop.bottom),
            ("left", crop.left),
            ("right", crop.right),
        ] {
            if !(0.0..1.0).contains(&value) {
                errors.push(format!("crop margin {name}={value} must be in [0, 1)"));
            }
        }
        if crop.top + crop.bottom >= 1.0 {
            errors.push("crop margins top + bottom must leave a non-empty window".to_string());
        }
        if crop.left + crop.right >= 1.0 {
            errors.push("crop margins left + right must leave a non-empty window".to_string());
        }

        if self.detector.max_keypoints == 0 {
            errors.push("detector max_keypoints must be positive".to_string());
        }

        if !(0.0..=1.0).contains(&self.matcher.ratio) || self.matcher.ratio == 0.0 {
            errors.push("matcher ratio must be in (0, 1]".to_string());
        }

        if self.ransac.max_iterations == 0 {
            errors.push("ransac max_iterations must be positive".to_string());
        }
        if self.ransac.inlier_threshold <= 0.0 {
            errors.push("ransac inlier_threshold must be positive".to_string());
        }
        if self.ransac.min_inliers < 3 {
            errors.push("ransac min_inliers must be at least 3".to_string());
        }
        if !(0.0..=1.0).contains(&self.ransac.min_inlier_ratio) {
            errors.push("ransac min_inlier_ratio must be in [0, 1]".to_string());
        }
        if self.ransac.max_scale <= 1.0 {
            errors.push("ransac max_scale must exceed 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(StitchConfig::new().validate().is_ok());
    }

    #[test]
    fn empty_scale_list_is_rejected() {
        let config = StitchConfig {
            scales: vec![],
            ..StitchConfig::new()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("scales")));
    }

    #[test]
    fn bad_crop_and_bad_scale_are_both_reported() {
        let config = StitchConfig {
            scales: vec![-1.0],
            crop: CropMargins {
                top: 0.6,
                bottom: 0.6,
                left: 0.0,
                right: 0.0,
            },
            ..StitchConfig::new()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 2);
    }

    #[test]
    fn toml_round_trip() {
        let config = StitchConfig::new();
        let text = toml::to_string(&config).unwrap();
        let back: StitchConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.scales, config.scales);
        assert_eq!(back.detector.max_keypoints, config.detector.max_keypoints);
    }
}
