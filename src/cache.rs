use crate::config::{CropMargins, DetectorConfig};
use crate::features::Feature;
use log::warn;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// On-disk get-or-compute cache for extracted feature sets.
///
/// Keyed by the source image (path plus file length/mtime) and everything the
/// feature set depends on: the attempt's scale, the crop margins, and the
/// detector configuration. Entries are JSON files under the cache directory.
///
/// The cache never blocks correctness: unreadable or stale entries are
/// recomputed, and a failed write only costs the next lookup.
#[derive(Debug, Clone)]
pub struct FeatureCache {
    dir: PathBuf,
}

#[derive(Debug)]
pub struct CacheKey<'a> {
    pub path: &'a Path,
    pub scale: f64,
    pub crop: CropMargins,
    pub detector: DetectorConfig,
}

impl FeatureCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        let dir = dir.into();
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!("cannot create cache directory {}: {err}", dir.display());
        }
        Self { dir }
    }

    /// Return the cached feature set for `key`, or compute and store it.
    pub fn get_or_compute(&self, key: &CacheKey, compute: impl FnOnce() -> Vec<Feature>) -> Vec<Feature> {
        let entry = self.entry_path(key);

        if let Some(features) = self.read_entry(&entry) {
            return features;
        }

        let features = compute();
        self.write_entry(&entry, &features);
        features
    }

    fn read_entry(&self, entry: &Path) -> Option<Vec<Feature>> {
        let content = match fs::read_to_string(entry) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("cache read failed for {}: {err}", entry.display());
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(features) => Some(features),
            Err(err) => {
                warn!("discarding corrupt cache entry {}: {err}", entry.display());
                None
            }
        }
    }

    fn write_entry(&self, entry: &Path, features: &[Feature]) {
        let payload = match serde_json::to_string(features) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cannot serialize features for cache: {err}");
                return;
            }
        };
        if let Err(err) = fs::write(entry, payload) {
            warn!("cache write failed for {}: {err}", entry.display());
        }
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let mut hasher = DefaultHasher::new();

        let canonical = key
            .path
            .canonicalize()
            .unwrap_or_else(|_| key.path.to_path_buf());
        canonical.hash(&mut hasher);

        // File identity, so an overwritten image invalidates its entry.
        if let Ok(meta) = fs::metadata(key.path) {
            meta.len().hash(&mut hasher);
            if let Ok(mtime) = meta.modified() {
                mtime.hash(&mut hasher);
            }
        }

        // Micro-unit quantization keeps the float parameters hashable.
        ((key.scale * 1e6) as i64).hash(&mut hasher);
        for margin in [key.crop.top, key.crop.bottom, key.crop.left, key.crop.right] {
            ((margin * 1e6) as i64).hash(&mut hasher);
        }
        key.detector.fast_threshold.hash(&mut hasher);
        key.detector.max_keypoints.hash(&mut hasher);

        let stem = key
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        self.dir.join(format!("{stem}-{:016x}.json", hasher.finish()))
    }
}
