use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Called exactly once when a frame is closed or dropped.
pub type ReleaseHook = Box<dyn FnOnce(&FrameMetadata) + Send + 'static>;

/// Camera frame handed from the runtime to a consumer.
///
/// Frames are move-only: whoever holds one owns the underlying camera buffer
/// and must give it back by calling [`Frame::close`] (or letting it drop) as
/// soon as the pixel data has been extracted.
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,

    release: Option<ReleaseHook>,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane. Zero means tightly packed.
    pub stride: u32,
    pub format: PixelFormat,
    /// Clockwise rotation needed to display the frame upright (0, 90, 180, 270).
    pub rotation_degrees: u32,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Yuyv4,
    Mjpeg,
    Nv12,
    /// Planar YUV 4:2:0 (Y, then U, then V)
    I420,
}

impl PixelFormat {
    pub fn is_yuv(&self) -> bool {
        matches!(self, Self::Yuyv4 | Self::Nv12 | Self::I420)
    }
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
            release: None,
        }
    }

    /// Attach the hook that hands the buffer back to its producer.
    pub fn with_release(mut self, hook: impl FnOnce(&FrameMetadata) + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn rotation_degrees(&self) -> u32 {
        self.meta.rotation_degrees
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    /// Release the frame back to the camera runtime.
    pub fn close(self) {
        drop(self)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.meta);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("size", &format_args!("{}x{}", self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("rotation_degrees", &self.meta.rotation_degrees)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta(sequence: u64) -> FrameMetadata {
        FrameMetadata {
            sequence,
            width: 2,
            height: 2,
            stride: 0,
            format: PixelFormat::Rgba32,
            rotation_degrees: 90,
            device_timestamp: None,
        }
    }

    #[test]
    fn close_fires_release_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let frame = Frame::new(Bytes::from_static(&[0; 16]), meta(7)).with_release(move |m| {
            assert_eq!(m.sequence, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        frame.close();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_without_close_still_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        {
            let _frame = Frame::new(Bytes::new(), meta(1)).with_release(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn accessors_read_metadata() {
        let frame = Frame::new(Bytes::new(), meta(3));
        assert_eq!(frame.rotation_degrees(), 90);
        assert_eq!(frame.sequence(), 3);
        assert_eq!((frame.width(), frame.height()), (2, 2));
        assert!(!frame.format().is_yuv());
    }
}
