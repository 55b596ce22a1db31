//! Frame adapter and the latest-frame cell it publishes into

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use tokio::sync::watch;
use tracing::warn;

use crate::capture::decode::decode_rgba;
use crate::capture::{Frame, FrameMetadata};

/// Application callback for the analysis output.
///
/// Called once per frame, never concurrently with itself, on the session's
/// worker thread. Implementations own the frame and must release it before
/// returning; a slow analyzer holds back the whole camera pipeline.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, frame: Frame);
}

/// Orientation and identity of the frame an output was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub rotation_degrees: u32,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl ImageInfo {
    pub fn from_frame(meta: &FrameMetadata, timestamp: Instant) -> Self {
        Self {
            rotation_degrees: meta.rotation_degrees,
            sequence: meta.sequence,
            width: meta.width,
            height: meta.height,
            timestamp,
        }
    }
}

/// Converted frame: the bitmap is absent when decoding failed, both fields are
/// absent before the first frame.
#[derive(Clone, Default)]
pub struct AnalyzerOutput {
    pub image: Option<Arc<RgbaImage>>,
    pub info: Option<ImageInfo>,
}

impl AnalyzerOutput {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.info.is_none()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.info.map(|info| info.sequence)
    }
}

impl fmt::Debug for AnalyzerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerOutput")
            .field("image", &self.image.as_ref().map(|img| img.dimensions()))
            .field("info", &self.info)
            .finish()
    }
}

/// Converts every analyzed frame to RGBA and passes it to `on_output`.
pub struct ImageAnalyzer<F> {
    on_output: F,
}

impl<F> ImageAnalyzer<F>
where
    F: Fn(AnalyzerOutput) + Send + Sync,
{
    pub fn new(on_output: F) -> Self {
        Self { on_output }
    }
}

impl<F> Analyzer for ImageAnalyzer<F>
where
    F: Fn(AnalyzerOutput) + Send + Sync,
{
    fn analyze(&self, frame: Frame) {
        let decode_start = Instant::now();
        let image = match decode_rgba(&frame) {
            Ok(image) => {
                metrics::counter!("frames_decoded").increment(1);
                Some(Arc::new(image))
            }
            Err(e) => {
                warn!("Frame {} not converted: {}", frame.sequence(), e);
                metrics::counter!("decode_failures").increment(1);
                None
            }
        };
        metrics::histogram!("decode_time_us").record(decode_start.elapsed().as_micros() as f64);

        let info = ImageInfo::from_frame(&frame.meta, frame.timestamp);
        (self.on_output)(AnalyzerOutput {
            image,
            info: Some(info),
        });

        frame.close();
    }
}

/// Single-slot cell holding the most recent [`AnalyzerOutput`].
///
/// One writer (the analysis worker), any number of readers. Each publish
/// replaces the value atomically and wakes subscribers; an output from an
/// older frame than the one currently held is ignored.
#[derive(Clone)]
pub struct LatestFrame {
    tx: Arc<watch::Sender<Arc<AnalyzerOutput>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(Arc::new(AnalyzerOutput::default()))),
        }
    }

    /// Returns whether the value was replaced.
    pub fn publish(&self, output: AnalyzerOutput) -> bool {
        self.tx.send_if_modified(|current| {
            let newer = match (output.sequence(), current.sequence()) {
                (Some(next), Some(held)) => next > held,
                _ => true,
            };
            if newer {
                *current = Arc::new(output);
            }
            newer
        })
    }

    pub fn current(&self) -> Arc<AnalyzerOutput> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AnalyzerOutput>> {
        self.tx.subscribe()
    }

    /// Callback suitable for [`ImageAnalyzer::new`].
    pub fn sink(&self) -> impl Fn(AnalyzerOutput) + Send + Sync + 'static {
        let cell = self.clone();
        move |output| {
            cell.publish(output);
        }
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn frame(sequence: u64, data: &'static [u8], released: &Arc<AtomicUsize>) -> Frame {
        let released = released.clone();
        Frame::new(
            Bytes::from_static(data),
            FrameMetadata {
                sequence,
                width: 2,
                height: 1,
                stride: 0,
                format: PixelFormat::Rgb24,
                rotation_degrees: 270,
                device_timestamp: None,
            },
        )
        .with_release(move |_| {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn output(sequence: u64) -> AnalyzerOutput {
        AnalyzerOutput {
            image: None,
            info: Some(ImageInfo {
                rotation_degrees: 0,
                sequence,
                width: 1,
                height: 1,
                timestamp: Instant::now(),
            }),
        }
    }

    #[test]
    fn analyzer_publishes_then_releases() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let sink = outputs.clone();
        let analyzer = ImageAnalyzer::new(move |out| sink.lock().unwrap().push(out));
        let released = Arc::new(AtomicUsize::new(0));

        analyzer.analyze(frame(1, &[1, 2, 3, 4, 5, 6], &released));

        let outputs = outputs.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        let image = outputs[0].image.as_ref().expect("decoded image");
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(outputs[0].info.map(|i| i.rotation_degrees), Some(270));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decode_failure_publishes_metadata_only() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let sink = outputs.clone();
        let analyzer = ImageAnalyzer::new(move |out| sink.lock().unwrap().push(out));
        let released = Arc::new(AtomicUsize::new(0));

        analyzer.analyze(frame(9, &[], &released));

        let outputs = outputs.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].image.is_none());
        assert_eq!(outputs[0].sequence(), Some(9));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn latest_frame_starts_empty_and_replaces() {
        let latest = LatestFrame::new();
        assert!(latest.current().is_empty());

        let mut rx = latest.subscribe();
        assert!(latest.publish(output(1)));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().sequence(), Some(1));

        assert!(latest.publish(output(2)));
        assert_eq!(latest.current().sequence(), Some(2));
    }

    #[test]
    fn older_outputs_never_replace_newer() {
        let latest = LatestFrame::new();
        latest.publish(output(5));
        let mut rx = latest.subscribe();
        rx.borrow_and_update();

        assert!(!latest.publish(output(3)));
        assert!(!latest.publish(output(5)));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(latest.current().sequence(), Some(5));
    }

    #[test]
    fn readers_observe_monotonic_sequence() {
        let latest = LatestFrame::new();
        let writer = latest.clone();
        let handle = std::thread::spawn(move || {
            for seq in 1..=500 {
                writer.publish(output(seq));
            }
        });

        let mut last = 0;
        while !handle.is_finished() {
            if let Some(seq) = latest.current().sequence() {
                assert!(seq >= last);
                last = seq;
            }
        }
        handle.join().unwrap();
        assert_eq!(latest.current().sequence(), Some(500));
    }
}
