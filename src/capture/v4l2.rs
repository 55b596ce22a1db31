//! V4L2 camera runtime with memory-mapped streaming

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::resolution::{Size, SupportedSize};
use crate::capture::runtime::{
    ensure_bindable, resolve_group, select_camera, BoundCamera, CameraInfo, CameraRuntime,
    CameraSelector, FrameSequence, LensFacing,
};
use crate::error::{CameraError, Result};
use crate::lifecycle::Lifecycle;
use crate::pipeline::{OutputImageFormat, UseCaseGroup};
use crate::utils::{detect_capture_devices, format_to_fourcc, fourcc_to_format};
use crate::CameraSettings;

/// V4L2 camera control: continuous auto focus.
const V4L2_CID_FOCUS_AUTO: u32 = 0x009a_0900 + 12;

pub struct V4l2Runtime {
    settings: CameraSettings,
    cameras: Vec<CameraInfo>,
    active: Option<ActiveStream>,
    sequence: FrameSequence,
}

struct ActiveStream {
    camera: CameraInfo,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl V4l2Runtime {
    pub fn new(settings: CameraSettings) -> Result<Self> {
        let devices = detect_capture_devices();
        if devices.is_empty() {
            return Err(CameraError::unavailable("no V4L2 capture devices found"));
        }

        let front = settings
            .front_device
            .clone()
            .unwrap_or_else(|| devices[0].path.clone());
        let cameras = devices
            .into_iter()
            .map(|dev| {
                let lens_facing = if dev.path == front {
                    LensFacing::Front
                } else if settings.back_device.as_deref() == Some(dev.path.as_str()) {
                    LensFacing::Back
                } else {
                    LensFacing::External
                };
                CameraInfo {
                    id: dev.path,
                    name: dev.card,
                    lens_facing,
                    sensor_rotation_degrees: settings.sensor_rotation_degrees % 360,
                }
            })
            .collect();

        Ok(Self {
            settings,
            cameras,
            active: None,
            sequence: FrameSequence::new(),
        })
    }

    fn open(camera: &CameraInfo) -> Result<Device> {
        Device::with_path(&camera.id)
            .map_err(|e| CameraError::unavailable(format!("{}: {}", camera.id, e)))
    }
}

/// Pick the stream format for the requested analysis output.
fn choose_fourcc(device: &Device, format: OutputImageFormat) -> Result<(FourCC, PixelFormat)> {
    let offered: Vec<PixelFormat> = device
        .enum_formats()
        .map_err(|e| CameraError::unavailable(format!("enumerating formats: {}", e)))?
        .into_iter()
        .filter_map(|desc| fourcc_to_format(desc.fourcc))
        .collect();

    let preference: &[PixelFormat] = match format {
        OutputImageFormat::Yuv420 => &[
            PixelFormat::I420,
            PixelFormat::Nv12,
            PixelFormat::Yuyv4,
            PixelFormat::Mjpeg,
        ],
        OutputImageFormat::Rgba8888 => &[
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Mjpeg,
            PixelFormat::Yuyv4,
        ],
    };

    preference
        .iter()
        .chain(offered.iter())
        .find(|f| offered.contains(f))
        .and_then(|f| format_to_fourcc(*f).map(|fourcc| (fourcc, *f)))
        .ok_or_else(|| CameraError::unavailable("device offers no decodable format"))
}

fn max_fps(device: &Device, fourcc: FourCC, size: Size) -> u32 {
    let Ok(intervals) = device.enum_frameintervals(fourcc, size.width, size.height) else {
        return 0;
    };
    intervals
        .iter()
        .map(|interval| {
            let fraction = match &interval.interval {
                FrameIntervalEnum::Discrete(fraction) => fraction,
                FrameIntervalEnum::Stepwise(step) => &step.min,
            };
            if fraction.numerator == 0 {
                0
            } else {
                fraction.denominator / fraction.numerator
            }
        })
        .max()
        .unwrap_or(0)
}

impl CameraRuntime for V4l2Runtime {
    fn available_cameras(&self) -> Vec<CameraInfo> {
        self.cameras.clone()
    }

    fn supported_sizes(
        &self,
        camera: &CameraInfo,
        format: OutputImageFormat,
    ) -> Result<Vec<SupportedSize>> {
        let device = Self::open(camera)?;
        let (fourcc, _) = choose_fourcc(&device, format)?;
        let framesizes = device
            .enum_framesizes(fourcc)
            .map_err(|e| CameraError::unavailable(format!("enumerating sizes: {}", e)))?;

        let mut sizes = Vec::new();
        for framesize in framesizes {
            match framesize.size {
                FrameSizeEnum::Discrete(d) => sizes.push(Size::new(d.width, d.height)),
                FrameSizeEnum::Stepwise(s) => {
                    sizes.push(Size::new(s.min_width, s.min_height));
                    sizes.push(Size::new(s.max_width, s.max_height));
                }
            }
        }

        Ok(sizes
            .into_iter()
            .map(|size| SupportedSize {
                size,
                max_fps: max_fps(&device, fourcc, size),
            })
            .collect())
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
        let output_format = group
            .analysis()
            .map(|a| a.output_image_format())
            .unwrap_or_default();

        let supported = self.supported_sizes(&camera, output_format)?;
        let (preview_resolution, analysis_resolution) = resolve_group(&group, &supported)?;

        // One hardware stream feeds both outputs at the analysis size.
        let stream_size = analysis_resolution
            .or(preview_resolution)
            .ok_or_else(|| CameraError::unavailable("no stream resolution"))?;

        self.unbind_all();

        let device = Self::open(&camera)?;
        let (fourcc, pixel_format) = choose_fourcc(&device, output_format)?;
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::unavailable(e.to_string()))?;
        fmt.width = stream_size.width;
        fmt.height = stream_size.height;
        fmt.fourcc = fourcc;
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| CameraError::unavailable(format!("set format: {}", e)))?;
        info!(
            "Device {} streaming {}x{} {:?}",
            camera.id, fmt.width, fmt.height, pixel_format
        );

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = flume::bounded::<std::result::Result<(), String>>(1);
        let buffer_count = self.settings.buffer_count.max(2);
        let rotation = camera.sensor_rotation_degrees;
        let flag = stop.clone();
        let sequence = self.sequence.clone();
        let preview = group.preview().cloned();
        let analysis = group.analysis().cloned();

        let worker = thread::Builder::new()
            .name("camera-capture".into())
            .spawn(move || {
                let mut stream =
                    match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
                        Ok(stream) => {
                            let _ = ready_tx.send(Ok(()));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };

                let mut captured = 0u64;
                while !flag.load(Ordering::Acquire) {
                    let (buf, meta) = match stream.next() {
                        Ok(next) => next,
                        Err(e) => {
                            warn!("Capture error: {}", e);
                            thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    };
                    captured += 1;

                    let used = (meta.bytesused as usize).min(buf.len());
                    let data = Bytes::copy_from_slice(&buf[..used]);
                    let frame_meta = FrameMetadata {
                        sequence: sequence.next(),
                        width: fmt.width,
                        height: fmt.height,
                        stride: fmt.stride,
                        format: pixel_format,
                        rotation_degrees: rotation,
                        device_timestamp: Some(
                            Duration::from_secs(meta.timestamp.sec as u64)
                                + Duration::from_micros(meta.timestamp.usec as u64),
                        ),
                    };

                    if let Some(analysis) = &analysis {
                        analysis.deliver(Frame::new(data.clone(), frame_meta.clone()));
                    }
                    if let Some(preview) = &preview {
                        preview.deliver(Frame::new(data, frame_meta));
                    }
                }
                debug!("Capture thread exiting after {} frames", captured);
            })
            .map_err(|e| CameraError::unavailable(format!("capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(CameraError::unavailable(format!("stream start: {}", e)));
            }
            Err(_) => {
                let _ = worker.join();
                return Err(CameraError::unavailable("capture thread exited during start"));
            }
        }

        info!(
            "Capture stream started on {} with {} buffers",
            camera.id, buffer_count
        );
        self.active = Some(ActiveStream {
            camera: camera.clone(),
            stop,
            worker,
        });

        Ok(BoundCamera {
            camera,
            preview_resolution,
            analysis_resolution,
        })
    }

    fn unbind_all(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop.store(true, Ordering::Release);
            if active.worker.join().is_err() {
                warn!("Capture thread for {} panicked", active.camera.id);
            }
            info!("Unbound {}", active.camera.id);
        }
    }

    fn is_bound(&self) -> bool {
        self.active.is_some()
    }

    fn set_auto_focus(&mut self, enabled: bool) -> Result<()> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        let device = Self::open(&active.camera)?;
        device
            .set_control(Control {
                id: V4L2_CID_FOCUS_AUTO,
                value: Value::Boolean(enabled),
            })
            .map_err(|e| CameraError::unavailable(format!("focus control: {}", e)))
    }
}

impl Drop for V4l2Runtime {
    fn drop(&mut self) {
        self.unbind_all();
    }
}
