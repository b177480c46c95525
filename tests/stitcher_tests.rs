use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raster_stitch::geometry::warp_into;
use raster_stitch::{
    AffineTransform, CropMargins, DetectorConfig, MatcherConfig, RansacConfig, StitchConfig,
    StitchOptions, Stitcher,
};

/// Deterministic mosaic of random-intensity blocks; the block junctions give
/// the detector plenty of corners while staying stable under mild warps.
fn textured_raster(width: u32, height: u32, seed: u64) -> GrayImage {
    let cell = 12u32;
    let cols = width / cell + 2;
    let rows = height / cell + 2;
    let mut rng = StdRng::seed_from_u64(seed);
    let grid: Vec<u8> = (0..rows * cols).map(|_| rng.gen()).collect();

    GrayImage::from_fn(width, height, |x, y| {
        Luma([grid[((y / cell) * cols + x / cell) as usize]])
    })
}

/// Cut a sub-image out of `raw`: `geo` maps sub-image pixel coordinates to
/// raw coordinates, the way a georeferenced tile maps into a scene.
fn sub_image(geo: &AffineTransform, width: u32, height: u32, raw: &GrayImage) -> GrayImage {
    let raw_to_sub = geo.invert().expect("tile transforms are invertible");
    warp_into(raw, &raw_to_sub, width, height).unwrap()
}

fn test_config() -> StitchConfig {
    StitchConfig {
        scales: vec![0.9, 1.0],
        crop: CropMargins::none(),
        cache_dir: None,
        detector: DetectorConfig {
            fast_threshold: 15,
            max_keypoints: 1500,
        },
        matcher: MatcherConfig {
            max_distance: 96,
            ratio: 0.75,
        },
        ransac: RansacConfig {
            max_iterations: 2000,
            inlier_threshold: 3.0,
            min_inliers: 12,
            min_inlier_ratio: 0.1,
            early_exit_ratio: 0.8,
            max_scale: 10.0,
        },
    }
}

fn seeded() -> StitchOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    StitchOptions {
        show: None,
        seed: Some(5),
    }
}

/// Overlapping tiles cut from one scene with known placements.
fn overlapping_pair() -> (GrayImage, GrayImage, AffineTransform) {
    let raw = textured_raster(700, 950, 99);
    let g0 = AffineTransform {
        a11: 0.95,
        a12: 0.0,
        tx: 10.0,
        a21: 0.0,
        a22: 0.95,
        ty: 40.0,
    };
    let g1 = AffineTransform {
        a11: 1.05,
        a12: -0.05,
        tx: 180.0,
        a21: 0.05,
        a22: 1.05,
        ty: 20.0,
    };
    let img0 = sub_image(&g0, 500, 700, &raw);
    let img1 = sub_image(&g1, 400, 800, &raw);
    // img0 -> raw -> img1
    let expected = g0.then(&g1.invert().unwrap());
    (img0, img1, expected)
}

/// Tiles cut from disjoint regions of the scene: both are richly textured
/// but share no geometry.
fn disjoint_pair() -> (GrayImage, GrayImage) {
    let raw = textured_raster(700, 950, 99);
    let g0 = AffineTransform {
        a11: 0.95,
        a12: 0.0,
        tx: 10.0,
        a21: 0.0,
        a22: 0.95,
        ty: 40.0,
    };
    let g1 = AffineTransform {
        a11: 1.0,
        a12: 0.0,
        tx: 500.0,
        a21: 0.0,
        a22: 1.0,
        ty: 600.0,
    };
    (sub_image(&g0, 500, 700, &raw), sub_image(&g1, 180, 300, &raw))
}

/// Linear coefficients must agree within 2% (plus a small absolute floor);
/// translations within 2% with a floor of a few pixels. The fit is
/// randomized, so only approximate agreement is meaningful.
fn assert_transform_close(actual: &AffineTransform, expected: &AffineTransform) {
    let a = actual.coefficients();
    let e = expected.coefficients();
    for (i, (av, ev)) in a.iter().zip(e.iter()).enumerate() {
        let tol = if i == 2 || i == 5 {
            3.0 + 0.02 * ev.abs()
        } else {
            0.03 + 0.02 * ev.abs()
        };
        assert!(
            (av - ev).abs() <= tol,
            "coefficient {i}: got {av}, expected {ev} (tol {tol})"
        );
    }
}

#[test]
fn estimate_affine_recovers_known_transform() {
    let (img0, img1, expected) = overlapping_pair();
    let stitcher = Stitcher::new(test_config()).unwrap();

    let registration = stitcher.estimate_affine(&img0, &img1, &seeded()).unwrap();
    let transform = registration.transform.expect("pair overlaps");
    assert_transform_close(&transform, &expected);

    let diag = &registration.diagnostics;
    assert!(diag.n_match > 0);
    let n_inlier = diag.n_inlier.expect("inliers reported on success");
    assert!(n_inlier <= diag.n_match);
    assert!(n_inlier >= 12);
}

#[test]
fn disjoint_pair_yields_no_result() {
    let (img0, img1) = disjoint_pair();
    let stitcher = Stitcher::new(test_config()).unwrap();

    let registration = stitcher.estimate_affine(&img0, &img1, &seeded()).unwrap();
    assert!(registration.transform.is_none());

    let diag = &registration.diagnostics;
    assert!(diag.n_inlier.is_none(), "no inliers without a transform");
    // The last attempted scale is reported on exhaustion.
    assert!((diag.scale - 1.0).abs() < 1e-12);
}

#[test]
fn first_successful_scale_is_reported() {
    let (img0, img1, _) = overlapping_pair();
    let stitcher = Stitcher::new(test_config()).unwrap();

    let registration = stitcher.estimate_affine(&img0, &img1, &seeded()).unwrap();
    assert!(registration.transform.is_some());
    // Scales are tried in order, so 1.0 is never attempted.
    assert!((registration.diagnostics.scale - 0.9).abs() < 1e-12);
}

#[test]
fn seeded_runs_are_reproducible() {
    let (img0, img1, _) = overlapping_pair();
    let stitcher = Stitcher::new(test_config()).unwrap();

    let a = stitcher.estimate_affine(&img0, &img1, &seeded()).unwrap();
    let b = stitcher.estimate_affine(&img0, &img1, &seeded()).unwrap();
    assert_eq!(a.transform.unwrap(), b.transform.unwrap());
    assert_eq!(a.diagnostics.n_inlier, b.diagnostics.n_inlier);
}

#[test]
fn crop_margins_do_not_disturb_the_reported_frame() {
    let (img0, img1, expected) = overlapping_pair();
    let config = StitchConfig {
        crop: CropMargins {
            top: 0.0,
            bottom: 0.0,
            left: 0.1,
            right: 0.0,
        },
        ..test_config()
    };
    let stitcher = Stitcher::new(config).unwrap();

    let registration = stitcher.estimate_affine(&img0, &img1, &seeded()).unwrap();
    let transform = registration.transform.expect("pair still overlaps");
    // Crop offsets are folded back, so the transform stays in original
    // uncropped pixel coordinates.
    assert_transform_close(&transform, &expected);
}

#[test]
fn match_artifact_is_written_even_without_a_result() {
    let (img0, img1) = disjoint_pair();
    let stitcher = Stitcher::new(test_config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("pair1");

    let options = StitchOptions {
        show: Some(base.clone()),
        seed: Some(5),
    };
    let registration = stitcher.estimate_affine(&img0, &img1, &options).unwrap();
    assert!(registration.transform.is_none());

    let match_path = dir.path().join("pair1_match.png");
    let overlay_path = dir.path().join("pair1_overlay.png");
    assert!(match_path.exists());
    assert!(!overlay_path.exists(), "no overlay without a transform");
    assert_eq!(registration.diagnostics.artifacts, vec![match_path]);
}

#[test]
fn overlay_artifact_is_written_on_success() {
    let (img0, img1, _) = overlapping_pair();
    let stitcher = Stitcher::new(test_config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("pair0");

    let options = StitchOptions {
        show: Some(base.clone()),
        seed: Some(5),
    };
    let registration = stitcher.estimate_affine(&img0, &img1, &options).unwrap();
    assert!(registration.transform.is_some());

    let match_path = dir.path().join("pair0_match.png");
    let overlay_path = dir.path().join("pair0_overlay.png");
    assert!(match_path.exists());
    assert!(overlay_path.exists());

    // The overlay lives in the second image's frame.
    let overlay = image::open(&overlay_path).unwrap().to_luma8();
    assert_eq!(overlay.dimensions(), img1.dimensions());
}

#[test]
fn stitch_pair_reports_identifiers_scale_and_uses_the_cache() {
    let (img0, img1, expected) = overlapping_pair();
    let dir = tempfile::tempdir().unwrap();
    let path0 = dir.path().join("tile0.png");
    let path1 = dir.path().join("tile1.png");
    img0.save(&path0).unwrap();
    img1.save(&path1).unwrap();

    let cache_dir = dir.path().join("cache");
    let config = StitchConfig {
        cache_dir: Some(cache_dir.clone()),
        ..test_config()
    };
    let stitcher = Stitcher::new(config).unwrap();

    let registration = stitcher.stitch_pair(&path0, &path1, &seeded()).unwrap();
    let transform = registration.transform.expect("pair overlaps");
    assert_transform_close(&transform, &expected);

    let diag = &registration.diagnostics;
    assert_eq!(diag.img0.as_deref(), Some(path0.display().to_string().as_str()));
    assert_eq!(diag.img1.as_deref(), Some(path1.display().to_string().as_str()));
    assert!((diag.scale - 0.9).abs() < 1e-12);
    assert!(diag.n_match > 0);
    assert!(diag.n_inlier.is_some());

    // The first call populated per-image feature entries.
    let entries: Vec<_> = std::fs::read_dir(&cache_dir).unwrap().collect();
    assert!(!entries.is_empty());

    // A cache-served second run reproduces the registration.
    let again = stitcher.stitch_pair(&path0, &path1, &seeded()).unwrap();
    assert_eq!(again.transform.unwrap(), transform);
}

#[test]
fn stitch_pair_on_disjoint_tiles_is_no_result_not_an_error() {
    let (img0, img1) = disjoint_pair();
    let dir = tempfile::tempdir().unwrap();
    let path0 = dir.path().join("a.png");
    let path1 = dir.path().join("b.png");
    img0.save(&path0).unwrap();
    img1.save(&path1).unwrap();

    let stitcher = Stitcher::new(test_config()).unwrap();
    let registration = stitcher.stitch_pair(&path0, &path1, &seeded()).unwrap();
    assert!(registration.transform.is_none());
    assert!(registration.diagnostics.n_inlier.is_none());
    assert!(registration.diagnostics.img0.is_some());
    assert!(registration.diagnostics.img1.is_some());
}

#[test]
fn stitch_pair_with_missing_file_is_an_error() {
    let stitcher = Stitcher::new(test_config()).unwrap();
    let result = stitcher.stitch_pair("/no/such/tile0.png", "/no/such/tile1.png", &seeded());
    assert!(result.is_err());
}

#[test]
fn more_keypoints_do_not_lose_matches() {
    let (img0, img1, _) = overlapping_pair();

    let few = DetectorConfig {
        fast_threshold: 15,
        max_keypoints: 150,
    };
    let many = DetectorConfig {
        fast_threshold: 15,
        max_keypoints: 1200,
    };
    let matcher = MatcherConfig::default();

    let n_few = {
        let extractor = raster_stitch::OrbExtractor::new(&few);
        raster_stitch::matching::match_features(
            &extractor.extract(&img0),
            &extractor.extract(&img1),
            &matcher,
        )
        .len()
    };
    let n_many = {
        let extractor = raster_stitch::OrbExtractor::new(&many);
        raster_stitch::matching::match_features(
            &extractor.extract(&img0),
            &extractor.extract(&img1),
            &matcher,
        )
        .len()
    };

    assert!(
        n_many >= n_few,
        "match count shrank when keypoints grew: {n_few} -> {n_many}"
    );
}
