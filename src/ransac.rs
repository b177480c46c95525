use crate::config::RansacConfig;
use crate::features::Feature;
use crate::geometry::{fit_affine, AffineTransform};
use crate::matching::Match;
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

/// Outcome of a robust fit attempt. `transform` is `None` when no candidate
/// reached the acceptance thresholds; that is the expected outcome for
/// non-overlapping pairs, not an error.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub transform: Option<AffineTransform>,
    /// Indices into the correspondence set consistent with `transform`.
    pub inliers: Vec<usize>,
    /// Size of the correspondence set the fit was attempted on.
    pub n_match: usize,
}

impl FitResult {
    pub fn no_result(n_match: usize) -> Self {
        Self {
            transform: None,
            inliers: Vec::new(),
            n_match,
        }
    }

    /// Inlier count, present only when a transform was found.
    pub fn n_inlier(&self) -> Option<usize> {
        self.transform.as_ref().map(|_| self.inliers.len())
    }
}

const MIN_SAMPLE: usize = 3;

/// Estimate an affine transform consistent with a maximal subset of the
/// correspondences, under gross outlier contamination.
///
/// Random-sampling consensus: draw minimal 3-correspondence subsets, fit a
/// candidate in closed form, score by inlier count under the reprojection
/// threshold, keep the best candidate, then refine it by least squares over
/// its full inlier set. The sampling is randomized; pass a seeded `rng` for
/// reproducible runs.
pub fn estimate_affine_ransac(
    features0: &[Feature],
    features1: &[Feature],
    matches: &[Match],
    config: &RansacConfig,
    rng: &mut impl Rng,
) -> FitResult {
    let n_match = matches.len();
    if n_match < MIN_SAMPLE {
        return FitResult::no_result(n_match);
    }

    let pairs: Vec<((f64, f64), (f64, f64))> = matches
        .iter()
        .map(|m| {
            let kp0 = &features0[m.idx0].keypoint;
            let kp1 = &features1[m.idx1].keypoint;
            ((kp0.x as f64, kp0.y as f64), (kp1.x as f64, kp1.y as f64))
        })
        .collect();

    let indices: Vec<usize> = (0..n_match).collect();
    let mut best_transform: Option<AffineTransform> = None;
    let mut best_inlier_count = 0usize;

    for _ in 0..config.max_iterations {
        let sample: Vec<((f64, f64), (f64, f64))> = indices
            .choose_multiple(rng, MIN_SAMPLE)
            .map(|&i| pairs[i])
            .collect();

        let candidate = match fit_affine(&sample) {
            Some(t) => t,
            None => continue, // collinear sample
        };
        if !candidate.is_invertible() || !candidate.is_scale_valid(config.max_scale) {
            continue;
        }

        let inlier_count = count_inliers(&pairs, &candidate, config.inlier_threshold);
        if inlier_count > best_inlier_count {
            best_inlier_count = inlier_count;
            best_transform = Some(candidate);

            if inlier_count as f64 / n_match as f64 >= config.early_exit_ratio {
                break;
            }
        }
    }

    let candidate = match best_transform {
        Some(t) => t,
        None => return FitResult::no_result(n_match),
    };

    let inlier_ratio = best_inlier_count as f64 / n_match as f64;
    if best_inlier_count < config.min_inliers || inlier_ratio < config.min_inlier_ratio {
        debug!(
            "consensus too weak: {best_inlier_count}/{n_match} inliers \
             (need {} and ratio {:.2})",
            config.min_inliers, config.min_inlier_ratio
        );
        return FitResult::no_result(n_match);
    }

    // Refine over the winning inlier set only, then recollect inliers under
    // the refined transform.
    let inliers = inlier_indices(&pairs, &candidate, config.inlier_threshold);
    let inlier_pairs: Vec<_> = inliers.iter().map(|&i| pairs[i]).collect();
    let refined = fit_affine(&inlier_pairs)
        .filter(|t| t.is_invertible() && t.is_scale_valid(config.max_scale))
        .unwrap_or(candidate);
    let inliers = inlier_indices(&pairs, &refined, config.inlier_threshold);

    if inliers.len() < config.min_inliers {
        return FitResult::no_result(n_match);
    }

    debug!("fit accepted: {}/{} inliers", inliers.len(), n_match);
    FitResult {
        transform: Some(refined),
        inliers,
        n_match,
    }
}

fn reprojection_error(pair: &((f64, f64), (f64, f64)), transform: &AffineTransform) -> f64 {
    let ((x, y), (u, v)) = *pair;
    let (px, py) = transform.apply(x, y);
    let (dx, dy) = (px - u, py - v);
    (dx * dx + dy * dy).sqrt()
}

fn count_inliers(
    pairs: &[((f64, f64), (f64, f64))],
    transform: &AffineTransform,
    threshold: f64,
) -> usize {
    pairs
        .iter()
        .filter(|pair| reprojection_error(pair, transform) < threshold)
        .count()
}

fn inlier_indices(
    pairs: &[((f64, f64), (f64, f64))],
    transform: &AffineTransform,
    threshold: f64,
) -> Vec<usize> {
    pairs
        .iter()
        .enumerate()
        .filter_map(|(idx, pair)| (reprojection_error(pair, transform) < threshold).then_some(idx))
        .collect()
}
