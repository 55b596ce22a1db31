//! Native preview surface fed directly by the camera runtime

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use image::RgbaImage;
use tokio::sync::watch;
use tracing::warn;

use crate::capture::decode::decode_frame;
use crate::capture::{Frame, FrameMetadata};
use crate::pipeline::SurfaceProvider;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImplementationMode {
    /// Keep the raw buffer and convert on the display thread when drawn.
    Performance,
    /// Convert on the capture thread as each frame arrives.
    #[default]
    Compatible,
}

#[derive(Clone)]
enum SurfaceContent {
    Empty,
    Raw(Bytes, Arc<FrameMetadata>),
    Decoded(Arc<RgbaImage>),
}

/// Display-side handle for the preview output.
///
/// Clones share the same surface. The runtime writes through the
/// [`SurfaceProvider`] returned by [`PreviewView::surface_provider`]; the UI
/// reads with [`PreviewView::snapshot`] after [`PreviewView::subscribe`]
/// reports a change.
#[derive(Clone)]
pub struct PreviewView {
    inner: Arc<PreviewInner>,
}

struct PreviewInner {
    mode: Mutex<ImplementationMode>,
    tap_to_focus: AtomicBool,
    content: watch::Sender<SurfaceContent>,
    /// Converted image for the buffer last drawn in performance mode
    cache: Mutex<Option<(Arc<FrameMetadata>, Arc<RgbaImage>)>>,
    version: watch::Sender<u64>,
    frames: AtomicU64,
}

impl PreviewView {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PreviewInner {
                mode: Mutex::new(ImplementationMode::default()),
                tap_to_focus: AtomicBool::new(false),
                content: watch::Sender::new(SurfaceContent::Empty),
                cache: Mutex::new(None),
                version: watch::Sender::new(0),
                frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn implementation_mode(&self) -> ImplementationMode {
        *lock(&self.inner.mode)
    }

    pub fn set_implementation_mode(&self, mode: ImplementationMode) {
        *lock(&self.inner.mode) = mode;
    }

    pub fn set_tap_to_focus(&self, enabled: bool) {
        self.inner.tap_to_focus.store(enabled, Ordering::Release);
    }

    pub fn is_tap_to_focus_enabled(&self) -> bool {
        self.inner.tap_to_focus.load(Ordering::Acquire)
    }

    pub fn frames_received(&self) -> u64 {
        self.inner.frames.load(Ordering::Acquire)
    }

    pub fn surface_provider(&self) -> Arc<dyn SurfaceProvider> {
        Arc::new(self.clone())
    }

    /// Change notification; the value is the sequence of the latest frame.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Current preview image, converting a raw buffer if necessary.
    pub fn snapshot(&self) -> Option<Arc<RgbaImage>> {
        let content = self.inner.content.borrow().clone();
        match content {
            SurfaceContent::Empty => None,
            SurfaceContent::Decoded(image) => Some(image),
            SurfaceContent::Raw(data, meta) => {
                let mut cache = lock(&self.inner.cache);
                if let Some((drawn, image)) = cache.as_ref() {
                    if Arc::ptr_eq(drawn, &meta) {
                        return Some(image.clone());
                    }
                }
                match decode_frame(&data, &meta) {
                    Ok(image) => {
                        let image = Arc::new(image);
                        *cache = Some((meta.clone(), image.clone()));
                        Some(image)
                    }
                    Err(e) => {
                        warn!("Preview frame {} not drawable: {}", meta.sequence, e);
                        None
                    }
                }
            }
        }
    }
}

impl Default for PreviewView {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceProvider for PreviewView {
    fn on_frame(&self, frame: Frame) {
        self.inner.frames.fetch_add(1, Ordering::AcqRel);
        let content = match self.implementation_mode() {
            ImplementationMode::Performance => {
                SurfaceContent::Raw(frame.data.clone(), frame.meta.clone())
            }
            ImplementationMode::Compatible => match decode_frame(&frame.data, &frame.meta) {
                Ok(image) => SurfaceContent::Decoded(Arc::new(image)),
                Err(e) => {
                    warn!("Preview frame {} not drawable: {}", frame.sequence(), e);
                    frame.close();
                    return;
                }
            },
        };
        let sequence = frame.sequence();
        frame.close();
        self.inner.content.send_replace(content);
        self.inner.version.send_replace(sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    fn frame(sequence: u64, released: &Arc<AtomicUsize>) -> Frame {
        let released = released.clone();
        Frame::new(
            Bytes::from(vec![90u8; 4 * 2 * 3]),
            FrameMetadata {
                sequence,
                width: 4,
                height: 2,
                stride: 0,
                format: PixelFormat::Rgb24,
                rotation_degrees: 0,
                device_timestamp: None,
            },
        )
        .with_release(move |_| {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn both_modes_release_and_draw() {
        for mode in [ImplementationMode::Performance, ImplementationMode::Compatible] {
            let view = PreviewView::new();
            view.set_implementation_mode(mode);
            let mut rx = view.subscribe();
            assert!(view.snapshot().is_none());

            let released = Arc::new(AtomicUsize::new(0));
            view.surface_provider().on_frame(frame(4, &released));

            assert_eq!(released.load(Ordering::SeqCst), 1);
            assert!(rx.has_changed().unwrap());
            assert_eq!(*rx.borrow_and_update(), 4);
            assert_eq!(view.snapshot().unwrap().dimensions(), (4, 2));
            assert_eq!(view.frames_received(), 1);
        }
    }

    #[test]
    fn repeated_sequence_still_redraws() {
        let view = PreviewView::new();
        view.set_implementation_mode(ImplementationMode::Performance);
        let meta = FrameMetadata {
            sequence: 1,
            width: 1,
            height: 1,
            stride: 0,
            format: PixelFormat::Rgb24,
            rotation_degrees: 0,
            device_timestamp: None,
        };

        view.on_frame(Frame::new(Bytes::from_static(&[10, 20, 30]), meta.clone()));
        assert_eq!(view.snapshot().unwrap().get_pixel(0, 0).0, [10, 20, 30, 255]);

        // A new binding may number its frames from the start again
        view.on_frame(Frame::new(Bytes::from_static(&[40, 50, 60]), meta));
        assert_eq!(view.snapshot().unwrap().get_pixel(0, 0).0, [40, 50, 60, 255]);
    }

    #[test]
    fn broken_frame_keeps_previous_content() {
        let view = PreviewView::new();
        let released = Arc::new(AtomicUsize::new(0));
        view.on_frame(frame(1, &released));

        let broken = Frame::new(
            Bytes::new(),
            FrameMetadata {
                sequence: 2,
                width: 4,
                height: 2,
                stride: 0,
                format: PixelFormat::Rgb24,
                rotation_degrees: 0,
                device_timestamp: None,
            },
        );
        view.on_frame(broken);
        assert!(view.snapshot().is_some());
        assert_eq!(*view.subscribe().borrow(), 1);
    }
}
