use image::{open, GrayImage};
use std::path::Path;

/// Load a raster from disk as single-channel grayscale. Missing or corrupt
/// files are call-boundary errors.
pub fn load_image<P: AsRef<Path>>(path: P) -> crate::Result<GrayImage> {
    let path = path.as_ref();
    let img = open(path)
        .map_err(|err| anyhow::anyhow!("cannot load image {}: {err}", path.display()))?;
    let gray = img.to_luma8();
    validate_raster(&gray)?;
    Ok(gray)
}

/// Reject empty rasters at the call boundary.
pub fn validate_raster(img: &GrayImage) -> crate::Result<()> {
    if img.width() == 0 || img.height() == 0 {
        return Err(anyhow::anyhow!(
            "empty raster: {}x{}",
            img.width(),
            img.height()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_an_error() {
        assert!(load_image("/definitely/not/here.png").is_err());
    }

    #[test]
    fn empty_raster_is_rejected() {
        let img = GrayImage::new(0, 0);
        assert!(validate_raster(&img).is_err());
    }
}
