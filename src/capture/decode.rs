//! Frame to RGBA conversion

use image::RgbaImage;
use jpeg_decoder::Decoder;

use super::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::{CameraError, Result};

/// Decode a frame into an RGBA bitmap.
pub fn decode_rgba(frame: &Frame) -> Result<RgbaImage> {
    decode_frame(&frame.data, &frame.meta)
}

pub fn decode_frame(data: &[u8], meta: &FrameMetadata) -> Result<RgbaImage> {
    if data.is_empty() {
        return Err(CameraError::decode("empty frame buffer"));
    }
    if meta.format != PixelFormat::Mjpeg && (meta.width == 0 || meta.height == 0) {
        return Err(CameraError::decode(format!(
            "invalid frame dimensions {}x{}",
            meta.width, meta.height
        )));
    }

    match meta.format {
        PixelFormat::Mjpeg => decode_jpeg(data),
        PixelFormat::Rgb24 => packed_to_rgba(data, meta, 3, |px| [px[0], px[1], px[2], 255]),
        PixelFormat::Bgr24 => packed_to_rgba(data, meta, 3, |px| [px[2], px[1], px[0], 255]),
        PixelFormat::Rgba32 => packed_to_rgba(data, meta, 4, |px| [px[0], px[1], px[2], px[3]]),
        PixelFormat::Yuyv4 => yuyv_to_rgba(data, meta),
        PixelFormat::Nv12 => nv12_to_rgba(data, meta),
        PixelFormat::I420 => i420_to_rgba(data, meta),
    }
}

fn decode_jpeg(data: &[u8]) -> Result<RgbaImage> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| CameraError::decode("jpeg header missing"))?;
    let (width, height) = (info.width as u32, info.height as u32);

    let rgba: Vec<u8> = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect(),
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l, 255]).collect(),
        // Big-endian 16-bit luma, keep the high byte
        jpeg_decoder::PixelFormat::L16 => pixels
            .chunks_exact(2)
            .flat_map(|px| [px[0], px[0], px[0], 255])
            .collect(),
        jpeg_decoder::PixelFormat::CMYK32 => pixels
            .chunks_exact(4)
            .flat_map(|px| {
                let k = 255 - px[3] as u32;
                let ch = |c: u8| ((255 - c as u32) * k / 255) as u8;
                [ch(px[0]), ch(px[1]), ch(px[2]), 255]
            })
            .collect(),
    };

    into_image(width, height, rgba)
}

fn row_stride(meta: &FrameMetadata, bytes_per_pixel: u32) -> Result<usize> {
    let tight = meta.width * bytes_per_pixel;
    let stride = if meta.stride == 0 { tight } else { meta.stride };
    if stride < tight {
        return Err(CameraError::decode(format!(
            "stride {} shorter than row of {} bytes",
            stride, tight
        )));
    }
    Ok(stride as usize)
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(CameraError::decode(format!(
            "frame buffer holds {} bytes, expected at least {}",
            data.len(),
            needed
        )));
    }
    Ok(())
}

fn packed_to_rgba(
    data: &[u8],
    meta: &FrameMetadata,
    bytes_per_pixel: u32,
    convert: impl Fn(&[u8]) -> [u8; 4],
) -> Result<RgbaImage> {
    let (w, h) = (meta.width as usize, meta.height as usize);
    let bpp = bytes_per_pixel as usize;
    let stride = row_stride(meta, bytes_per_pixel)?;
    ensure_len(data, stride * (h - 1) + w * bpp)?;

    let mut rgba = Vec::with_capacity(w * h * 4);
    for row in 0..h {
        let line = &data[row * stride..row * stride + w * bpp];
        for px in line.chunks_exact(bpp) {
            rgba.extend_from_slice(&convert(px));
        }
    }
    into_image(meta.width, meta.height, rgba)
}

/// YUYV: Y0 U Y1 V - each 4-byte group encodes 2 pixels.
fn yuyv_to_rgba(data: &[u8], meta: &FrameMetadata) -> Result<RgbaImage> {
    let (w, h) = (meta.width as usize, meta.height as usize);
    let stride = row_stride(meta, 2)?;
    let row_bytes = w.div_ceil(2) * 4;
    ensure_len(data, stride * (h - 1) + row_bytes)?;

    let mut rgba = Vec::with_capacity(w * h * 4);
    for row in 0..h {
        let line = &data[row * stride..row * stride + row_bytes];
        for (i, chunk) in line.chunks_exact(4).enumerate() {
            rgba.extend_from_slice(&yuv_to_rgba(chunk[0], chunk[1], chunk[3]));
            if i * 2 + 1 < w {
                rgba.extend_from_slice(&yuv_to_rgba(chunk[2], chunk[1], chunk[3]));
            }
        }
    }
    into_image(meta.width, meta.height, rgba)
}

/// NV12: full-resolution Y plane followed by interleaved UV at half resolution.
fn nv12_to_rgba(data: &[u8], meta: &FrameMetadata) -> Result<RgbaImage> {
    let (w, h) = (meta.width as usize, meta.height as usize);
    let stride = row_stride(meta, 1)?;
    let chroma_rows = h.div_ceil(2);
    let y_size = stride * h;
    ensure_len(data, y_size + stride * (chroma_rows - 1) + w.div_ceil(2) * 2)?;

    let (luma, chroma) = data.split_at(y_size);
    let mut rgba = Vec::with_capacity(w * h * 4);
    for row in 0..h {
        for col in 0..w {
            let y = luma[row * stride + col];
            let uv = (row / 2) * stride + (col / 2) * 2;
            rgba.extend_from_slice(&yuv_to_rgba(y, chroma[uv], chroma[uv + 1]));
        }
    }
    into_image(meta.width, meta.height, rgba)
}

/// I420: Y plane, then U plane, then V plane, chroma at half resolution.
fn i420_to_rgba(data: &[u8], meta: &FrameMetadata) -> Result<RgbaImage> {
    let (w, h) = (meta.width as usize, meta.height as usize);
    let stride = row_stride(meta, 1)?;
    let chroma_stride = stride.div_ceil(2);
    let chroma_rows = h.div_ceil(2);
    let y_size = stride * h;
    let chroma_size = chroma_stride * chroma_rows;
    ensure_len(data, y_size + chroma_size * 2)?;

    let luma = &data[..y_size];
    let u_plane = &data[y_size..y_size + chroma_size];
    let v_plane = &data[y_size + chroma_size..y_size + chroma_size * 2];

    let mut rgba = Vec::with_capacity(w * h * 4);
    for row in 0..h {
        for col in 0..w {
            let y = luma[row * stride + col];
            let c = (row / 2) * chroma_stride + col / 2;
            rgba.extend_from_slice(&yuv_to_rgba(y, u_plane[c], v_plane[c]));
        }
    }
    into_image(meta.width, meta.height, rgba)
}

/// BT.601 full-range YUV to RGBA.
fn yuv_to_rgba(y: u8, u: u8, v: u8) -> [u8; 4] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    [r, g, b, 255]
}

fn into_image(width: u32, height: u32, rgba: Vec<u8>) -> Result<RgbaImage> {
    RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| CameraError::decode(format!("pixel buffer does not fit {}x{}", width, height)))
}
