use image::{GrayImage, ImageBuffer, Luma};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// 2D affine transform mapping pixel coordinates of one raster into another:
///
/// ```text
///   x' = a11 * x + a12 * y + tx
///   y' = a21 * x + a22 * y + ty
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a11: f64,
    pub a12: f64,
    pub tx: f64,
    pub a21: f64,
    pub a22: f64,
    pub ty: f64,
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            a11: 1.0,
            a12: 0.0,
            tx: 0.0,
            a21: 0.0,
            a22: 1.0,
            ty: 0.0,
        }
    }

    pub fn translation(tx: f64, ty: f64) -> Self {
        Self { tx, ty, ..Self::identity() }
    }

    pub fn scaling(sx: f64, sy: f64) -> Self {
        Self {
            a11: sx,
            a22: sy,
            ..Self::identity()
        }
    }

    /// Apply the transform to a point.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a11 * x + self.a12 * y + self.tx,
            self.a21 * x + self.a22 * y + self.ty,
        )
    }

    /// Determinant of the 2x2 linear part.
    pub fn det(&self) -> f64 {
        self.a11 * self.a22 - self.a12 * self.a21
    }

    /// A transform is usable only when its linear part is non-degenerate.
    pub fn is_invertible(&self) -> bool {
        self.det().abs() > 1e-9
    }

    /// Checks that the row magnitudes of the linear part stay within
    /// `[1/scale_bound, scale_bound]`, rejecting wildly scaled candidates.
    pub fn is_scale_valid(&self, scale_bound: f64) -> bool {
        if scale_bound <= 0.0 {
            return false;
        }
        let min_scale = 1.0 / scale_bound;
        let scale_x = (self.a11 * self.a11 + self.a12 * self.a12).sqrt();
        let scale_y = (self.a21 * self.a21 + self.a22 * self.a22).sqrt();
        scale_x > min_scale && scale_x < scale_bound && scale_y > min_scale && scale_y < scale_bound
    }

    pub fn invert(&self) -> Option<Self> {
        let det = self.det();
        if det.abs() <= 1e-9 {
            return None;
        }
        let a11 = self.a22 / det;
        let a12 = -self.a12 / det;
        let a21 = -self.a21 / det;
        let a22 = self.a11 / det;
        Some(Self {
            a11,
            a12,
            tx: -(a11 * self.tx + a12 * self.ty),
            a21,
            a22,
            ty: -(a21 * self.tx + a22 * self.ty),
        })
    }

    /// Returns the transform that applies `self` first, then `next`.
    pub fn then(&self, next: &AffineTransform) -> Self {
        Self::from_matrix(next.to_matrix() * self.to_matrix())
    }

    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.a11, self.a12, self.tx, //
            self.a21, self.a22, self.ty, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn from_matrix(m: Matrix3<f64>) -> Self {
        Self {
            a11: m[(0, 0)],
            a12: m[(0, 1)],
            tx: m[(0, 2)],
            a21: m[(1, 0)],
            a22: m[(1, 1)],
            ty: m[(1, 2)],
        }
    }

    pub fn coefficients(&self) -> [f64; 6] {
        [self.a11, self.a12, self.tx, self.a21, self.a22, self.ty]
    }

    /// Coefficient-wise comparison: each pair must agree within `rel` of its
    /// magnitude or within `abs`, whichever is larger.
    pub fn approx_eq(&self, other: &AffineTransform, rel: f64, abs: f64) -> bool {
        self.coefficients()
            .iter()
            .zip(other.coefficients().iter())
            .all(|(a, b)| {
                let tol = abs.max(rel * a.abs().max(b.abs()));
                (a - b).abs() <= tol
            })
    }
}

/// Least-squares affine fit from point correspondences `(src, dst)`.
///
/// Exact for three non-collinear pairs, overdetermined otherwise. Returns
/// `None` when fewer than three pairs are given or the pairs are (near)
/// collinear.
pub fn fit_affine(pairs: &[((f64, f64), (f64, f64))]) -> Option<AffineTransform> {
    if pairs.len() < 3 {
        return None;
    }

    // Normal equations: the same 3x3 system solved once per output row.
    let mut m = Matrix3::zeros();
    let mut bx = Vector3::zeros();
    let mut by = Vector3::zeros();
    for &((x, y), (u, v)) in pairs {
        let p = Vector3::new(x, y, 1.0);
        m += p * p.transpose();
        bx += p * u;
        by += p * v;
    }

    let lu = m.lu();
    let rx = lu.solve(&bx)?;
    let ry = lu.solve(&by)?;

    let transform = AffineTransform {
        a11: rx[0],
        a12: rx[1],
        tx: rx[2],
        a21: ry[0],
        a22: ry[1],
        ty: ry[2],
    };
    if !transform.coefficients().iter().all(|c| c.is_finite()) {
        return None;
    }
    Some(transform)
}

/// Warp `src` into the destination frame of the given size, where `transform`
/// maps source pixel coordinates to destination pixel coordinates. Inverse
/// mapping with bilinear interpolation; pixels with no source are black.
pub fn warp_into(
    src: &GrayImage,
    transform: &AffineTransform,
    width: u32,
    height: u32,
) -> crate::Result<GrayImage> {
    let inverse = transform
        .invert()
        .ok_or_else(|| anyhow::anyhow!("cannot warp through a degenerate transform"))?;

    let mut out = ImageBuffer::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let (sx, sy) = inverse.apply(x as f64, y as f64);
            let value = bilinear_interpolate(src, sx as f32, sy as f32);
            out.put_pixel(x, y, Luma([value]));
        }
    }
    Ok(out)
}

/// Bilinear interpolation; out-of-bounds samples read as black.
pub fn bilinear_interpolate(image: &GrayImage, x: f32, y: f32) -> u8 {
    let width = image.width();
    let height = image.height();

    if x < 0.0 || y < 0.0 || x >= width as f32 || y >= height as f32 {
        return 0;
    }

    let x1 = x.floor() as u32;
    let y1 = y.floor() as u32;
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);

    let fx = x - x1 as f32;
    let fy = y - y1 as f32;

    let p11 = image.get_pixel(x1, y1)[0] as f32;
    let p12 = image.get_pixel(x1, y2)[0] as f32;
    let p21 = image.get_pixel(x2, y1)[0] as f32;
    let p22 = image.get_pixel(x2, y2)[0] as f32;

    let interpolated = p11 * (1.0 - fx) * (1.0 - fy)
        + p21 * fx * (1.0 - fy)
        + p12 * (1.0 - fx) * fy
        + p22 * fx * fy;

    interpolated.round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_maps_points_to_themselves() {
        let t = AffineTransform::identity();
        assert_eq!(t.apply(12.5, -3.0), (12.5, -3.0));
        assert!(t.is_invertible());
    }

    #[test]
    fn invert_round_trips() {
        let t = AffineTransform {
            a11: 0.9,
            a12: -0.1,
            tx: 40.0,
            a21: 0.1,
            a22: 1.1,
            ty: -7.0,
        };
        let inv = t.invert().unwrap();
        let round = t.then(&inv);
        assert!(round.approx_eq(&AffineTransform::identity(), 1e-9, 1e-9));
    }

    #[test]
    fn degenerate_transform_has_no_inverse() {
        let t = AffineTransform {
            a11: 1.0,
            a12: 2.0,
            tx: 0.0,
            a21: 2.0,
            a22: 4.0,
            ty: 0.0,
        };
        assert!(!t.is_invertible());
        assert!(t.invert().is_none());
    }

    #[test]
    fn then_applies_left_to_right() {
        let scale = AffineTransform::scaling(2.0, 2.0);
        let shift = AffineTransform::translation(10.0, 0.0);
        // Scale first, then shift.
        let combined = scale.then(&shift);
        assert_eq!(combined.apply(3.0, 4.0), (16.0, 8.0));
    }

    #[test]
    fn fit_affine_recovers_exact_transform_from_three_points() {
        let truth = AffineTransform {
            a11: 1.1,
            a12: -0.2,
            tx: 15.0,
            a21: 0.3,
            a22: 0.9,
            ty: -4.0,
        };
        let pairs: Vec<_> = [(0.0, 0.0), (100.0, 10.0), (20.0, 80.0)]
            .iter()
            .map(|&(x, y)| ((x, y), truth.apply(x, y)))
            .collect();
        let fit = fit_affine(&pairs).unwrap();
        assert!(fit.approx_eq(&truth, 1e-9, 1e-9));
    }

    #[test]
    fn fit_affine_rejects_collinear_points() {
        let pairs = vec![
            ((0.0, 0.0), (1.0, 1.0)),
            ((10.0, 10.0), (11.0, 11.0)),
            ((20.0, 20.0), (21.0, 21.0)),
        ];
        assert!(fit_affine(&pairs).is_none());
    }

    #[test]
    fn warp_translation_moves_pixels() {
        let mut src = GrayImage::new(16, 16);
        src.put_pixel(4, 5, Luma([200]));
        let shift = AffineTransform::translation(3.0, 2.0);
        let out = warp_into(&src, &shift, 16, 16).unwrap();
        assert_eq!(out.get_pixel(7, 7)[0], 200);
        assert_eq!(out.get_pixel(4, 5)[0], 0);
    }
}
