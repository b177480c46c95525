use crate::cache::{CacheKey, FeatureCache};
use crate::config::StitchConfig;
use crate::data;
use crate::diagnostics::Diagnostics;
use crate::features::{Feature, OrbExtractor};
use crate::geometry::AffineTransform;
use crate::matching::{self, Match};
use crate::ransac::{self, FitResult};
use crate::visualization;
use image::{imageops, GrayImage};
use instant::Instant;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// Per-call options for the registration entry points.
#[derive(Debug, Clone, Default)]
pub struct StitchOptions {
    /// Base path for rendered artifacts: `<base>_match.png` is written for
    /// the final attempt, `<base>_overlay.png` only when a transform was
    /// found. No rendering work happens when unset.
    pub show: Option<PathBuf>,
    /// Pins the consensus fitter's RNG for reproducible runs.
    pub seed: Option<u64>,
}

/// Result of one pairwise registration call. `transform` maps pixel
/// coordinates of the first image into the second and is `None` when the
/// pair has no geometrically consistent overlap.
#[derive(Debug, Clone)]
pub struct Registration {
    pub transform: Option<AffineTransform>,
    pub diagnostics: Diagnostics,
}

/// Pairwise registration engine: detects features, matches them, and fits an
/// affine transform robustly, retrying over the configured scale ladder.
///
/// Each call is independent and keeps no mutable state, so one `Stitcher`
/// may be shared across threads working on different pairs.
#[derive(Debug)]
pub struct Stitcher {
    config: StitchConfig,
    extractor: OrbExtractor,
    cache: Option<FeatureCache>,
}

/// Multi-scale retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchState {
    Pending,
    Trying(usize),
    Succeeded(usize),
    Exhausted,
}

/// One image prepared for an attempt: cropped by the configured margins and
/// rescaled by the trial factor, plus the bookkeeping needed to fold the
/// fitted transform back into original pixel coordinates.
struct ScaledView {
    image: GrayImage,
    /// Crop offset in original pixels.
    offset: (f64, f64),
    /// Actual per-axis resize ratio (scaled size / cropped size).
    ratio: (f64, f64),
}

struct Attempt {
    scale: f64,
    features0: Vec<Feature>,
    features1: Vec<Feature>,
    matches: Vec<Match>,
    fit: FitResult,
    view0: ScaledView,
    view1: ScaledView,
}

impl Stitcher {
    /// Build a stitcher, rejecting malformed configuration up front.
    pub fn new(config: StitchConfig) -> crate::Result<Self> {
        if let Err(problems) = config.validate() {
            return Err(anyhow::anyhow!(
                "invalid stitcher configuration: {}",
                problems.join("; ")
            ));
        }
        let extractor = OrbExtractor::new(&config.detector);
        let cache = config.cache_dir.as_ref().map(FeatureCache::new);
        Ok(Self {
            config,
            extractor,
            cache,
        })
    }

    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    /// Register two in-memory rasters. The returned transform maps `img0`
    /// pixel coordinates into `img1`'s frame, in original (uncropped,
    /// unscaled) coordinates.
    pub fn estimate_affine(
        &self,
        img0: &GrayImage,
        img1: &GrayImage,
        options: &StitchOptions,
    ) -> crate::Result<Registration> {
        match options.seed {
            Some(seed) => self.run(img0, img1, options, &mut StdRng::seed_from_u64(seed), None),
            None => self.run(img0, img1, options, &mut rand::thread_rng(), None),
        }
    }

    /// Register two rasters by file path, consulting the feature cache when
    /// one is configured. Diagnostics always carry the `img0`/`img1`
    /// identifiers and the scale used.
    pub fn stitch_pair<P: AsRef<Path>>(
        &self,
        path0: P,
        path1: P,
        options: &StitchOptions,
    ) -> crate::Result<Registration> {
        let path0 = path0.as_ref();
        let path1 = path1.as_ref();
        let img0 = data::load_image(path0)?;
        let img1 = data::load_image(path1)?;

        let paths = Some((path0, path1));
        let mut registration = match options.seed {
            Some(seed) => self.run(
                &img0,
                &img1,
                options,
                &mut StdRng::seed_from_u64(seed),
                paths,
            )?,
            None => self.run(&img0, &img1, options, &mut rand::thread_rng(), paths)?,
        };

        registration.diagnostics.img0 = Some(path0.display().to_string());
        registration.diagnostics.img1 = Some(path1.display().to_string());
        Ok(registration)
    }

    fn run<R: Rng>(
        &self,
        img0: &GrayImage,
        img1: &GrayImage,
        options: &StitchOptions,
        rng: &mut R,
        paths: Option<(&Path, &Path)>,
    ) -> crate::Result<Registration> {
        data::validate_raster(img0)?;
        data::validate_raster(img1)?;

        let start = Instant::now();
        let mut state = SearchState::Pending;
        let mut last_attempt: Option<Attempt> = None;

        loop {
            state = match state {
                SearchState::Pending => SearchState::Trying(0),
                SearchState::Trying(index) => {
                    let scale = self.config.scales[index];
                    let attempt = self.attempt(img0, img1, scale, paths, rng);
                    debug!(
                        "scale {scale}: {} x {} keypoints, {} matches, fit {}",
                        attempt.features0.len(),
                        attempt.features1.len(),
                        attempt.matches.len(),
                        if attempt.fit.transform.is_some() { "ok" } else { "none" },
                    );

                    let next = if attempt.fit.transform.is_some() {
                        SearchState::Succeeded(index)
                    } else if index + 1 < self.config.scales.len() {
                        SearchState::Trying(index + 1)
                    } else {
                        SearchState::Exhausted
                    };
                    last_attempt = Some(attempt);
                    next
                }
                SearchState::Succeeded(_) | SearchState::Exhausted => break,
            };
        }

        let attempt = last_attempt.expect("validated scale list is never empty");
        let transform = attempt
            .fit
            .transform
            .as_ref()
            .map(|fitted| to_original_frame(fitted, &attempt.view0, &attempt.view1));

        match (&transform, state) {
            (Some(_), SearchState::Succeeded(_)) => info!(
                "registered pair at scale {}: {}/{} inliers",
                attempt.scale,
                attempt.fit.inliers.len(),
                attempt.fit.n_match,
            ),
            _ => info!(
                "no geometric consensus after {} scale(s)",
                self.config.scales.len()
            ),
        }

        let mut diagnostics = Diagnostics {
            n_match: attempt.fit.n_match,
            n_inlier: attempt.fit.n_inlier(),
            scale: attempt.scale,
            img0: None,
            img1: None,
            n_feature0: attempt.features0.len(),
            n_feature1: attempt.features1.len(),
            elapsed_ms: start.elapsed().as_millis() as f32,
            artifacts: Vec::new(),
        };

        if let Some(base) = &options.show {
            self.render_artifacts(base, img0, img1, &attempt, &transform, &mut diagnostics)?;
        }

        Ok(Registration {
            transform,
            diagnostics,
        })
    }

    fn attempt<R: Rng>(
        &self,
        img0: &GrayImage,
        img1: &GrayImage,
        scale: f64,
        paths: Option<(&Path, &Path)>,
        rng: &mut R,
    ) -> Attempt {
        let view0 = self.prepare_view(img0, scale);
        let view1 = self.prepare_view(img1, scale);

        let features0 = self.features_for(&view0.image, scale, paths.map(|(p, _)| p));
        let features1 = self.features_for(&view1.image, scale, paths.map(|(_, p)| p));

        let matches = matching::match_features(&features0, &features1, &self.config.matcher);
        let fit = ransac::estimate_affine_ransac(
            &features0,
            &features1,
            &matches,
            &self.config.ransac,
            rng,
        );

        Attempt {
            scale,
            features0,
            features1,
            matches,
            fit,
            view0,
            view1,
        }
    }

    /// Crop by the configured margins, then rescale by the trial factor.
    fn prepare_view(&self, image: &GrayImage, scale: f64) -> ScaledView {
        let (width, height) = (image.width(), image.height());
        let crop = &self.config.crop;

        let left = (crop.left * width as f64).round() as u32;
        let top = (crop.top * height as f64).round() as u32;
        let right = (crop.right * width as f64).round() as u32;
        let bottom = (crop.bottom * height as f64).round() as u32;

        let cropped_w = width.saturating_sub(left + right).max(1);
        let cropped_h = height.saturating_sub(top + bottom).max(1);
        let cropped = imageops::crop_imm(image, left, top, cropped_w, cropped_h).to_image();

        let (scaled, ratio) = if scale == 1.0 {
            (cropped, (1.0, 1.0))
        } else {
            let scaled_w = ((cropped_w as f64 * scale).round() as u32).max(1);
            let scaled_h = ((cropped_h as f64 * scale).round() as u32).max(1);
            let resized =
                imageops::resize(&cropped, scaled_w, scaled_h, imageops::FilterType::Triangle);
            (
                resized,
                (
                    scaled_w as f64 / cropped_w as f64,
                    scaled_h as f64 / cropped_h as f64,
                ),
            )
        };

        ScaledView {
            image: scaled,
            offset: (left as f64, top as f64),
            ratio,
        }
    }

    fn features_for(&self, image: &GrayImage, scale: f64, path: Option<&Path>) -> Vec<Feature> {
        match (path, &self.cache) {
            (Some(path), Some(cache)) => {
                let key = CacheKey {
                    path,
                    scale,
                    crop: self.config.crop,
                    detector: self.config.detector,
                };
                cache.get_or_compute(&key, || self.extractor.extract(image))
            }
            _ => self.extractor.extract(image),
        }
    }

    fn render_artifacts(
        &self,
        base: &Path,
        img0: &GrayImage,
        img1: &GrayImage,
        attempt: &Attempt,
        transform: &Option<AffineTransform>,
        diagnostics: &mut Diagnostics,
    ) -> crate::Result<()> {
        // The match canvas shows the attempt as the fitter saw it: the
        // cropped, rescaled views with their keypoints and correspondences.
        let match_canvas = visualization::render_matches(
            &attempt.view0.image,
            &attempt.view1.image,
            &attempt.features0,
            &attempt.features1,
            &attempt.matches,
            &attempt.fit.inliers,
        );
        let match_path = artifact_path(base, "_match.png");
        match_canvas.save(&match_path)?;
        diagnostics.artifacts.push(match_path);

        // The overlay is rendered at original resolution; it exists only
        // when a transform was found.
        if let Some(transform) = transform {
            let overlay = visualization::render_overlay(img0, img1, transform)?;
            let overlay_path = artifact_path(base, "_overlay.png");
            overlay.save(&overlay_path)?;
            diagnostics.artifacts.push(overlay_path);
        }
        Ok(())
    }
}

/// Fold the crop offsets and resize ratios of both views back into a fitted
/// transform so it maps original image 0 coordinates to original image 1
/// coordinates.
fn to_original_frame(
    fitted: &AffineTransform,
    view0: &ScaledView,
    view1: &ScaledView,
) -> AffineTransform {
    AffineTransform::translation(-view0.offset.0, -view0.offset.1)
        .then(&AffineTransform::scaling(view0.ratio.0, view0.ratio.1))
        .then(fitted)
        .then(&AffineTransform::scaling(
            1.0 / view1.ratio.0,
            1.0 / view1.ratio.1,
        ))
        .then(&AffineTransform::translation(view1.offset.0, view1.offset.1))
}

fn artifact_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
