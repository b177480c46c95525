use crate::features::Feature;
use crate::geometry::{warp_into, AffineTransform};
use crate::matching::Match;
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::collections::HashSet;

const INLIER_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const OUTLIER_COLOR: Rgb<u8> = Rgb([220, 40, 40]);
const KEYPOINT_COLOR: Rgb<u8> = Rgb([80, 160, 255]);

/// Side-by-side match visualization: both images on one canvas, keypoints
/// marked, correspondence lines drawn with inliers and outliers in different
/// colors.
pub fn render_matches(
    img0: &GrayImage,
    img1: &GrayImage,
    features0: &[Feature],
    features1: &[Feature],
    matches: &[Match],
    inliers: &[usize],
) -> RgbImage {
    let offset = img0.width();
    let width = img0.width() + img1.width();
    let height = img0.height().max(img1.height()).max(1);

    let mut canvas = RgbImage::new(width, height);
    blit_gray(&mut canvas, img0, 0);
    blit_gray(&mut canvas, img1, offset);

    for feature in features0 {
        draw_marker(&mut canvas, feature.keypoint.x, feature.keypoint.y, KEYPOINT_COLOR);
    }
    for feature in features1 {
        draw_marker(
            &mut canvas,
            feature.keypoint.x + offset as f32,
            feature.keypoint.y,
            KEYPOINT_COLOR,
        );
    }

    let inlier_set: HashSet<usize> = inliers.iter().copied().collect();
    for (idx, m) in matches.iter().enumerate() {
        let color = if inlier_set.contains(&idx) {
            INLIER_COLOR
        } else {
            OUTLIER_COLOR
        };
        let kp0 = &features0[m.idx0].keypoint;
        let kp1 = &features1[m.idx1].keypoint;
        draw_line(
            &mut canvas,
            (kp0.x as i32, kp0.y as i32),
            (kp1.x as i32 + offset as i32, kp1.y as i32),
            color,
        );
    }

    canvas
}

/// Overlay visualization: `img0` warped into `img1`'s frame by `transform`,
/// blended half and half with `img1`.
pub fn render_overlay(
    img0: &GrayImage,
    img1: &GrayImage,
    transform: &AffineTransform,
) -> crate::Result<GrayImage> {
    let warped = warp_into(img0, transform, img1.width(), img1.height())?;

    let mut out = GrayImage::new(img1.width(), img1.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let a = warped.get_pixel(x, y)[0] as u16;
        let b = img1.get_pixel(x, y)[0] as u16;
        *pixel = Luma([((a + b) / 2) as u8]);
    }
    Ok(out)
}

fn blit_gray(canvas: &mut RgbImage, src: &GrayImage, x_offset: u32) {
    for (x, y, pixel) in src.enumerate_pixels() {
        let v = pixel[0];
        canvas.put_pixel(x + x_offset, y, Rgb([v, v, v]));
    }
}

/// 3x3 cross marker, clipped at the borders.
fn draw_marker(canvas: &mut RgbImage, x: f32, y: f32, color: Rgb<u8>) {
    let cx = x as i32;
    let cy = y as i32;
    for (dx, dy) in [(0, 0), (-1, 0), (1, 0), (0, -1), (0, 1)] {
        put_pixel_checked(canvas, cx + dx, cy + dy, color);
    }
}

/// Bresenham line, clipped at the borders.
fn draw_line(canvas: &mut RgbImage, from: (i32, i32), to: (i32, i32), color: Rgb<u8>) {
    let (mut x0, mut y0) = from;
    let (x1, y1) = to;

    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put_pixel_checked(canvas, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn put_pixel_checked(canvas: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Keypoint, DESCRIPTOR_BYTES};

    fn feature(x: f32, y: f32) -> Feature {
        Feature {
            keypoint: Keypoint { x, y, response: 1.0, angle: 0.0 },
            descriptor: [0; DESCRIPTOR_BYTES],
        }
    }

    #[test]
    fn match_canvas_is_side_by_side() {
        let img0 = GrayImage::from_pixel(40, 30, Luma([100]));
        let img1 = GrayImage::from_pixel(50, 60, Luma([150]));
        let f0 = vec![feature(5.0, 5.0)];
        let f1 = vec![feature(10.0, 10.0)];
        let matches = vec![Match { idx0: 0, idx1: 0, distance: 0 }];

        let canvas = render_matches(&img0, &img1, &f0, &f1, &matches, &[0]);
        assert_eq!(canvas.width(), 90);
        assert_eq!(canvas.height(), 60);
        // Un-drawn area below the shorter image stays black.
        assert_eq!(canvas.get_pixel(5, 45), &Rgb([0, 0, 0]));
        // The second image starts at the offset.
        assert_eq!(canvas.get_pixel(45, 45), &Rgb([150, 150, 150]));
    }

    #[test]
    fn overlay_blends_both_images() {
        let img0 = GrayImage::from_pixel(20, 20, Luma([100]));
        let img1 = GrayImage::from_pixel(20, 20, Luma([200]));
        let overlay = render_overlay(&img0, &img1, &AffineTransform::identity()).unwrap();
        assert_eq!(overlay.dimensions(), (20, 20));
        assert_eq!(overlay.get_pixel(10, 10)[0], 150);
    }

    #[test]
    fn overlay_with_degenerate_transform_is_an_error() {
        let img = GrayImage::from_pixel(8, 8, Luma([10]));
        let degenerate = AffineTransform {
            a11: 0.0,
            a12: 0.0,
            tx: 0.0,
            a21: 0.0,
            a22: 0.0,
            ty: 0.0,
        };
        assert!(render_overlay(&img, &img, &degenerate).is_err());
    }
}
