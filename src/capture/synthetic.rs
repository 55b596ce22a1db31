//! Software camera producing test-pattern frames
//!
//! Useful without hardware and in tests: frames are produced either by a
//! generator thread at a fixed rate or on demand through a [`FrameInjector`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::resolution::{Size, SupportedSize};
use crate::capture::runtime::{
    ensure_bindable, resolve_group, select_camera, BoundCamera, CameraInfo, CameraRuntime,
    CameraSelector, FrameSequence, LensFacing,
};
use crate::error::{CameraError, Result};
use crate::lifecycle::Lifecycle;
use crate::pipeline::{ImageAnalysis, OutputImageFormat, Preview, UseCaseGroup};
use crate::utils::lock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSettings {
    pub sizes: Vec<Size>,
    pub fps: u32,
    pub rotation_degrees: u32,
    pub lens_facing: Vec<LensFacing>,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            sizes: vec![
                Size::new(1920, 1080),
                Size::new(1280, 720),
                Size::new(640, 480),
            ],
            fps: 30,
            rotation_degrees: 90,
            lens_facing: vec![LensFacing::Front],
        }
    }
}

pub struct SyntheticRuntime {
    cameras: Vec<CameraInfo>,
    sizes: Vec<SupportedSize>,
    fps: u32,
    injector: FrameInjector,
    generator: Option<Generator>,
    binds: usize,
}

struct Generator {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl SyntheticRuntime {
    /// `fps == 0` disables the generator thread; frames then only arrive
    /// through [`SyntheticRuntime::injector`].
    pub fn new(settings: &SyntheticSettings) -> Self {
        let cameras = settings
            .lens_facing
            .iter()
            .enumerate()
            .map(|(i, facing)| CameraInfo {
                id: format!("synthetic:{}", i),
                name: format!("Synthetic {:?} camera", facing),
                lens_facing: *facing,
                sensor_rotation_degrees: settings.rotation_degrees % 360,
            })
            .collect();
        let rate = if settings.fps == 0 { 30 } else { settings.fps };

        Self {
            cameras,
            sizes: settings
                .sizes
                .iter()
                .map(|s| SupportedSize {
                    size: *s,
                    max_fps: rate,
                })
                .collect(),
            fps: settings.fps,
            injector: FrameInjector::default(),
            generator: None,
            binds: 0,
        }
    }

    pub fn injector(&self) -> FrameInjector {
        self.injector.clone()
    }

    /// Number of successful `bind` calls over the runtime's life.
    pub fn bind_count(&self) -> usize {
        self.binds
    }

    fn stop_generator(&mut self) {
        if let Some(generator) = self.generator.take() {
            generator.stop.store(true, Ordering::Release);
            if generator.worker.join().is_err() {
                warn!("Synthetic generator thread panicked");
            }
        }
    }
}

impl CameraRuntime for SyntheticRuntime {
    fn available_cameras(&self) -> Vec<CameraInfo> {
        self.cameras.clone()
    }

    fn supported_sizes(
        &self,
        camera: &CameraInfo,
        _format: OutputImageFormat,
    ) -> Result<Vec<SupportedSize>> {
        if !self.cameras.iter().any(|c| c.id == camera.id) {
            return Err(CameraError::unavailable(format!("unknown camera {}", camera.id)));
        }
        Ok(self.sizes.clone())
    }

    #[instrument(skip(self, lifecycle, group))]
    fn bind(
        &mut self,
        lifecycle: &Lifecycle,
        selector: CameraSelector,
        group: UseCaseGroup,
    ) -> Result<BoundCamera> {
        ensure_bindable(lifecycle, &group)?;
        let camera = select_camera(self, selector)?;
        let format = group
            .analysis()
            .map(|a| a.output_image_format())
            .unwrap_or_default();
        let supported = self.supported_sizes(&camera, format)?;
        let (preview_resolution, analysis_resolution) = resolve_group(&group, &supported)?;

        self.unbind_all();

        let stream_size = analysis_resolution
            .or(preview_resolution)
            .ok_or_else(|| CameraError::unavailable("no stream resolution"))?;
        let pixel_format = match format {
            OutputImageFormat::Yuv420 => PixelFormat::I420,
            OutputImageFormat::Rgba8888 => PixelFormat::Rgba32,
        };

        self.injector.attach(Target {
            preview: group.preview().cloned(),
            analysis: group.analysis().cloned(),
            size: stream_size,
            format: pixel_format,
            rotation_degrees: camera.sensor_rotation_degrees,
        });

        if self.fps > 0 {
            let stop = Arc::new(AtomicBool::new(false));
            let injector = self.injector.clone();
            let interval = Duration::from_secs_f64(1.0 / self.fps as f64);
            let flag = stop.clone();
            let worker = thread::Builder::new()
                .name("synthetic-camera".into())
                .spawn(move || {
                    while !flag.load(Ordering::Acquire) {
                        injector.inject();
                        thread::sleep(interval);
                    }
                })
                .map_err(|e| CameraError::unavailable(format!("generator thread: {}", e)))?;
            self.generator = Some(Generator { stop, worker });
        }

        self.binds += 1;
        info!("Synthetic camera {} bound at {}", camera.name, stream_size);

        Ok(BoundCamera {
            camera,
            preview_resolution,
            analysis_resolution,
        })
    }

    fn unbind_all(&mut self) {
        self.stop_generator();
        if self.injector.detach() {
            info!("Synthetic camera unbound");
        }
    }

    fn is_bound(&self) -> bool {
        self.injector.is_attached()
    }
}

impl Drop for SyntheticRuntime {
    fn drop(&mut self) {
        self.unbind_all();
    }
}

struct Target {
    preview: Option<Preview>,
    analysis: Option<ImageAnalysis>,
    size: Size,
    format: PixelFormat,
    rotation_degrees: u32,
}

/// Handle that pushes frames into whatever session is currently bound.
#[derive(Clone, Default)]
pub struct FrameInjector {
    target: Arc<Mutex<Option<Target>>>,
    sequence: FrameSequence,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    produced: AtomicUsize,
    released: AtomicUsize,
}

impl FrameInjector {
    fn attach(&self, target: Target) {
        *lock(&self.target) = Some(target);
    }

    fn detach(&self) -> bool {
        lock(&self.target).take().is_some()
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.target).is_some()
    }

    /// Frames handed out so far, one per output they were delivered to.
    pub fn produced(&self) -> usize {
        self.counters.produced.load(Ordering::Acquire)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::Acquire)
    }

    /// Deliver one test-pattern frame. Returns false when nothing is bound.
    pub fn inject(&self) -> bool {
        let (size, format) = match lock(&self.target).as_ref() {
            Some(t) => (t.size, t.format),
            None => return false,
        };
        let data = test_pattern(size, format, self.sequence.peek());
        self.inject_raw(data, size, format, 0)
    }

    /// Deliver caller-supplied bytes, e.g. a deliberately broken buffer.
    pub fn inject_raw(&self, data: Bytes, size: Size, format: PixelFormat, stride: u32) -> bool {
        let guard = lock(&self.target);
        let Some(target) = guard.as_ref() else {
            return false;
        };
        let sequence = self.sequence.next();
        let meta = FrameMetadata {
            sequence,
            width: size.width,
            height: size.height,
            stride,
            format,
            rotation_degrees: target.rotation_degrees,
            device_timestamp: None,
        };
        let preview = target.preview.clone();
        let analysis = target.analysis.clone();
        // Deliver outside the lock so a release hook can never contend with it.
        drop(guard);

        if let Some(analysis) = analysis {
            analysis.deliver(self.frame(data.clone(), meta.clone()));
        }
        if let Some(preview) = preview {
            preview.deliver(self.frame(data, meta));
        }
        true
    }

    fn frame(&self, data: Bytes, meta: FrameMetadata) -> Frame {
        self.counters.produced.fetch_add(1, Ordering::AcqRel);
        let counters = self.counters.clone();
        Frame::new(data, meta).with_release(move |_| {
            counters.released.fetch_add(1, Ordering::AcqRel);
        })
    }
}

/// Moving diagonal gradient so consecutive frames differ.
fn test_pattern(size: Size, format: PixelFormat, sequence: u64) -> Bytes {
    let (w, h) = (size.width as usize, size.height as usize);
    let shift = (sequence * 4) as usize;
    let luma = |x: usize, y: usize| ((x + y + shift) & 0xff) as u8;

    match format {
        PixelFormat::Rgba32 => {
            let mut data = Vec::with_capacity(w * h * 4);
            for y in 0..h {
                for x in 0..w {
                    data.extend_from_slice(&[luma(x, y), (y * 255 / h.max(1)) as u8, 128, 255]);
                }
            }
            Bytes::from(data)
        }
        _ => {
            // I420 with a colour tint that follows the rows
            let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
            let mut data = Vec::with_capacity(w * h + cw * ch * 2);
            for y in 0..h {
                for x in 0..w {
                    data.push(luma(x, y));
                }
            }
            for y in 0..ch {
                data.extend(std::iter::repeat((64 + y * 128 / ch.max(1)) as u8).take(cw));
            }
            for _ in 0..ch {
                data.extend(std::iter::repeat(128u8).take(cw));
            }
            Bytes::from(data)
        }
    }
}
