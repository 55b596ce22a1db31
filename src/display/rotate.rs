//! Display-time rotation of converted frames

use image::{imageops, Rgba, RgbaImage};

/// Rotate `image` clockwise by `degrees` around its center.
///
/// The result is sized to fit the rotated content: right angles are exact
/// (90 and 270 swap width and height), other angles produce the bounding box
/// of the rotated rectangle with transparent corners.
pub fn rotate(image: &RgbaImage, degrees: i32) -> RgbaImage {
    match degrees.rem_euclid(360) {
        0 => image.clone(),
        90 => imageops::rotate90(image),
        180 => imageops::rotate180(image),
        270 => imageops::rotate270(image),
        other => rotate_arbitrary(image, other as f32),
    }
}

fn rotate_arbitrary(image: &RgbaImage, degrees: f32) -> RgbaImage {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let (sin, cos) = degrees.to_radians().sin_cos();

    // Small epsilon keeps exact fits from rounding up a pixel
    let out_w = ((w * cos).abs() + (h * sin).abs() - 1e-3).ceil().max(1.0) as u32;
    let out_h = ((w * sin).abs() + (h * cos).abs() - 1e-3).ceil().max(1.0) as u32;

    let (cx, cy) = (w / 2.0, h / 2.0);
    let (ocx, ocy) = (out_w as f32 / 2.0, out_h as f32 / 2.0);

    RgbaImage::from_fn(out_w, out_h, |x, y| {
        // Inverse-map each destination pixel center back into the source
        let dx = x as f32 + 0.5 - ocx;
        let dy = y as f32 + 0.5 - ocy;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;

        if sx >= 0.0 && sy >= 0.0 && sx < w && sy < h {
            *image.get_pixel(sx as u32, sy as u32)
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}
