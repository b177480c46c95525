pub mod cache;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod features;
pub mod geometry;
pub mod matching;
pub mod ransac;
pub mod stitcher;
pub mod visualization;

pub use config::{CropMargins, DetectorConfig, MatcherConfig, RansacConfig, StitchConfig};
pub use diagnostics::Diagnostics;
pub use features::{Feature, Keypoint, OrbExtractor};
pub use geometry::AffineTransform;
pub use matching::Match;
pub use ransac::FitResult;
pub use stitcher::{Registration, StitchOptions, Stitcher};

pub type Result<T> = anyhow::Result<T>;
