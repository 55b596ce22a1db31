use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub format: PixelFormat,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Enumerate V4L2 capture devices that stream a format we can decode.
pub fn detect_capture_devices() -> Vec<FoundDevice> {
    info!("Detecting capture devices...");

    let mut found = Vec::new();
    for i in 0..16 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Metadata nodes share the driver but cannot capture
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("Skipping {} ({}): no capture capability", path, caps.card);
            continue;
        }

        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        let format = formats.iter().find_map(|fmt| fourcc_to_format(fmt.fourcc));
        if let Some(format) = format {
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            found.push(FoundDevice {
                path,
                card: caps.card,
                format,
            });
        }
    }
    found
}

pub fn fourcc_to_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"NV12" => Some(PixelFormat::Nv12),
        b"YU12" => Some(PixelFormat::I420),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        _ => None,
    }
}

pub fn format_to_fourcc(format: PixelFormat) -> Option<FourCC> {
    let repr = match format {
        PixelFormat::Mjpeg => b"MJPG",
        PixelFormat::Yuyv4 => b"YUYV",
        PixelFormat::Nv12 => b"NV12",
        PixelFormat::I420 => b"YU12",
        PixelFormat::Rgb24 => b"RGB3",
        PixelFormat::Bgr24 => b"BGR3",
        PixelFormat::Rgba32 => return None,
    };
    Some(FourCC::new(repr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_is_symmetric() {
        for format in [
            PixelFormat::Mjpeg,
            PixelFormat::Yuyv4,
            PixelFormat::Nv12,
            PixelFormat::I420,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
        ] {
            let fourcc = format_to_fourcc(format).unwrap();
            assert_eq!(fourcc_to_format(fourcc), Some(format));
        }
        assert!(format_to_fourcc(PixelFormat::Rgba32).is_none());
    }
}
