use serde::Serialize;
use std::path::PathBuf;

/// Structured record describing one registration attempt.
///
/// `n_match` is always present. `n_inlier` exists only when a transform was
/// found. `scale` is the factor actually used, or the last one attempted on
/// exhaustion. `img0`/`img1` identify the inputs for the path-based entry
/// point.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub n_match: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_inlier: Option<usize>,
    pub scale: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub img0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub img1: Option<String>,
    /// Keypoints detected per image at the reported scale.
    pub n_feature0: usize,
    pub n_feature1: usize,
    pub elapsed_ms: f32,
    /// Paths of any rendered visualization artifacts.
    pub artifacts: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_inlier_is_omitted_from_serialization_when_absent() {
        let diag = Diagnostics {
            n_match: 12,
            scale: 0.9,
            ..Default::default()
        };
        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("\"n_match\":12"));
        assert!(!json.contains("n_inlier"));
    }

    #[test]
    fn n_inlier_appears_when_present() {
        let diag = Diagnostics {
            n_match: 12,
            n_inlier: Some(9),
            scale: 1.0,
            ..Default::default()
        };
        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("\"n_inlier\":9"));
    }
}
