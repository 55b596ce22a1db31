//! Camera outputs bound together as one session
//!
//! A [`Preview`] renders frames straight to a display surface; an
//! [`ImageAnalysis`] hands frames to application code on a caller-supplied
//! executor. Both are cheap to clone: clones share the same output, which is
//! how the binder keeps a handle after giving the group to the runtime.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::analysis::Analyzer;
use crate::capture::resolution::{ResolutionSelector, Size};
use crate::capture::Frame;
use crate::executor::ExecutorHandle;
use crate::pipeline::ringbuf::{FrameRingBuffer, RingStats};
use crate::utils::lock;

/// Receives preview frames on the runtime's capture thread.
pub trait SurfaceProvider: Send + Sync {
    fn on_frame(&self, frame: Frame);
}

/// Pixel layout the analysis output asks the runtime for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputImageFormat {
    #[default]
    Yuv420,
    Rgba8888,
}

/// How frames that arrive while the analyzer is busy are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureStrategy {
    /// Capacity one: a new frame replaces an undelivered one.
    #[default]
    KeepOnlyLatest,
    /// Keep up to `capacity` pending frames, evicting the oldest.
    DropOldest { capacity: usize },
}

impl BackpressureStrategy {
    pub fn capacity(&self) -> usize {
        match self {
            Self::KeepOnlyLatest => 1,
            Self::DropOldest { capacity } => (*capacity).max(1),
        }
    }
}

#[derive(Clone)]
pub struct Preview {
    inner: Arc<PreviewInner>,
}

struct PreviewInner {
    selector: ResolutionSelector,
    surface: Mutex<Option<Arc<dyn SurfaceProvider>>>,
    resolution: Mutex<Option<Size>>,
}

impl Preview {
    pub fn builder() -> PreviewBuilder {
        PreviewBuilder::default()
    }

    pub fn resolution_selector(&self) -> &ResolutionSelector {
        &self.inner.selector
    }

    pub fn set_surface_provider(&self, provider: Arc<dyn SurfaceProvider>) {
        *lock(&self.inner.surface) = Some(provider);
    }

    pub fn clear_surface_provider(&self) {
        lock(&self.inner.surface).take();
    }

    pub fn has_surface(&self) -> bool {
        lock(&self.inner.surface).is_some()
    }

    pub fn resolution(&self) -> Option<Size> {
        *lock(&self.inner.resolution)
    }

    pub(crate) fn set_resolution(&self, size: Option<Size>) {
        *lock(&self.inner.resolution) = size;
    }

    /// Frames arriving before a surface is attached are released unseen.
    pub fn deliver(&self, frame: Frame) {
        let surface = lock(&self.inner.surface).clone();
        match surface {
            Some(surface) => surface.on_frame(frame),
            None => frame.close(),
        }
    }
}

#[derive(Default)]
pub struct PreviewBuilder {
    selector: ResolutionSelector,
}

impl PreviewBuilder {
    pub fn resolution_selector(mut self, selector: ResolutionSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn build(self) -> Preview {
        Preview {
            inner: Arc::new(PreviewInner {
                selector: self.selector,
                surface: Mutex::new(None),
                resolution: Mutex::new(None),
            }),
        }
    }
}

#[derive(Clone)]
pub struct ImageAnalysis {
    inner: Arc<AnalysisInner>,
}

struct AnalysisInner {
    selector: ResolutionSelector,
    output_format: OutputImageFormat,
    strategy: BackpressureStrategy,
    pending: Mutex<FrameRingBuffer>,
    draining: AtomicBool,
    analyzer: Mutex<Option<(ExecutorHandle, Arc<dyn Analyzer>)>>,
    resolution: Mutex<Option<Size>>,
}

impl ImageAnalysis {
    pub fn builder() -> ImageAnalysisBuilder {
        ImageAnalysisBuilder::default()
    }

    pub fn resolution_selector(&self) -> &ResolutionSelector {
        &self.inner.selector
    }

    pub fn output_image_format(&self) -> OutputImageFormat {
        self.inner.output_format
    }

    pub fn backpressure_strategy(&self) -> BackpressureStrategy {
        self.inner.strategy
    }

    pub fn set_analyzer(&self, executor: ExecutorHandle, analyzer: Arc<dyn Analyzer>) {
        *lock(&self.inner.analyzer) = Some((executor, analyzer));
    }

    /// Detach the analyzer and release anything still pending.
    pub fn clear_analyzer(&self) {
        lock(&self.inner.analyzer).take();
        let stale = lock(&self.inner.pending).clear();
        drop(stale);
    }

    pub fn resolution_info(&self) -> Option<Size> {
        *lock(&self.inner.resolution)
    }

    pub(crate) fn set_resolution(&self, size: Option<Size>) {
        *lock(&self.inner.resolution) = size;
    }

    pub fn stats(&self) -> RingStats {
        lock(&self.inner.pending).stats()
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Called by the runtime for every captured frame. Never blocks on the
    /// analyzer: the frame is parked in the pending ring and a drain job is
    /// scheduled on the executor if one is not already running.
    pub fn deliver(&self, frame: Frame) {
        metrics::counter!("frames_delivered").increment(1);

        let executor = match lock(&self.inner.analyzer).as_ref() {
            Some((executor, _)) => executor.clone(),
            None => {
                frame.close();
                return;
            }
        };

        let stale = lock(&self.inner.pending).push(frame);
        if let Some(stale) = stale {
            debug!("Dropping undelivered frame {}", stale.sequence());
            metrics::counter!("frames_dropped").increment(1);
            stale.close();
        }

        if !self.inner.draining.swap(true, Ordering::AcqRel) {
            let job = DrainJob(Some(self.inner.clone()));
            if executor.execute(move || job.run()).is_err() {
                warn!("Analysis executor is shut down; pending frames released");
            }
        }
    }
}

impl AnalysisInner {
    /// Runs on the executor thread until the pending ring is empty.
    fn drain(&self) {
        loop {
            let next = lock(&self.pending).pop();
            match next {
                Some(frame) => {
                    let analyzer = lock(&self.analyzer).as_ref().map(|(_, a)| a.clone());
                    match analyzer {
                        Some(analyzer) => {
                            let sequence = frame.sequence();
                            // The frame is dropped, and so released, while unwinding.
                            let result =
                                panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(frame)));
                            if result.is_err() {
                                error!("Analyzer panicked on frame {}", sequence);
                            }
                        }
                        None => frame.close(),
                    }
                }
                None => {
                    self.draining.store(false, Ordering::Release);
                    // A frame may have landed between the empty pop and the store.
                    if lock(&self.pending).is_empty()
                        || self.draining.swap(true, Ordering::AcqRel)
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Give up on pending work whose drain job will never run.
    fn abandon(&self) {
        let stale = lock(&self.pending).clear();
        if !stale.is_empty() {
            debug!("Releasing {} frame(s) of an abandoned drain", stale.len());
        }
        drop(stale);
        self.draining.store(false, Ordering::Release);
    }
}

/// Drain scheduled on the executor. If the executor drops it unrun, the
/// pending frames are released and a later delivery may schedule again.
struct DrainJob(Option<Arc<AnalysisInner>>);

impl DrainJob {
    fn run(mut self) {
        if let Some(inner) = self.0.take() {
            inner.drain();
        }
    }
}

impl Drop for DrainJob {
    fn drop(&mut self) {
        if let Some(inner) = self.0.take() {
            inner.abandon();
        }
    }
}

impl fmt::Debug for ImageAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAnalysis")
            .field("output_format", &self.inner.output_format)
            .field("strategy", &self.inner.strategy)
            .field("resolution", &self.resolution_info())
            .finish()
    }
}

impl fmt::Debug for Preview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preview")
            .field("resolution", &self.resolution())
            .field("has_surface", &self.has_surface())
            .finish()
    }
}

#[derive(Default)]
pub struct ImageAnalysisBuilder {
    selector: ResolutionSelector,
    output_format: OutputImageFormat,
    strategy: BackpressureStrategy,
}

impl ImageAnalysisBuilder {
    pub fn resolution_selector(mut self, selector: ResolutionSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn output_image_format(mut self, format: OutputImageFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn backpressure_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> ImageAnalysis {
        ImageAnalysis {
            inner: Arc::new(AnalysisInner {
                selector: self.selector,
                output_format: self.output_format,
                strategy: self.strategy,
                pending: Mutex::new(FrameRingBuffer::new(self.strategy.capacity())),
                draining: AtomicBool::new(false),
                analyzer: Mutex::new(None),
                resolution: Mutex::new(None),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UseCase {
    Preview(Preview),
    Analysis(ImageAnalysis),
}

impl From<Preview> for UseCase {
    fn from(preview: Preview) -> Self {
        Self::Preview(preview)
    }
}

impl From<ImageAnalysis> for UseCase {
    fn from(analysis: ImageAnalysis) -> Self {
        Self::Analysis(analysis)
    }
}

/// Outputs that are bound, started and stopped together.
#[derive(Debug, Clone, Default)]
pub struct UseCaseGroup {
    use_cases: Vec<UseCase>,
}

impl UseCaseGroup {
    pub fn builder() -> UseCaseGroupBuilder {
        UseCaseGroupBuilder::default()
    }

    pub fn use_cases(&self) -> &[UseCase] {
        &self.use_cases
    }

    pub fn is_empty(&self) -> bool {
        self.use_cases.is_empty()
    }

    pub fn preview(&self) -> Option<&Preview> {
        self.use_cases.iter().find_map(|u| match u {
            UseCase::Preview(p) => Some(p),
            UseCase::Analysis(_) => None,
        })
    }

    pub fn analysis(&self) -> Option<&ImageAnalysis> {
        self.use_cases.iter().find_map(|u| match u {
            UseCase::Analysis(a) => Some(a),
            UseCase::Preview(_) => None,
        })
    }
}

#[derive(Default)]
pub struct UseCaseGroupBuilder {
    use_cases: Vec<UseCase>,
}

impl UseCaseGroupBuilder {
    /// Only one use case of each kind is kept; a later one replaces the earlier.
    pub fn add_use_case(mut self, use_case: impl Into<UseCase>) -> Self {
        let use_case = use_case.into();
        self.use_cases
            .retain(|existing| std::mem::discriminant(existing) != std::mem::discriminant(&use_case));
        self.use_cases.push(use_case);
        self
    }

    pub fn build(self) -> UseCaseGroup {
        UseCaseGroup {
            use_cases: self.use_cases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::executor::CameraExecutor;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn counted_frame(sequence: u64, released: &Arc<AtomicUsize>) -> Frame {
        let released = released.clone();
        Frame::new(
            Bytes::from_static(&[0; 4]),
            FrameMetadata {
                sequence,
                width: 1,
                height: 1,
                stride: 0,
                format: PixelFormat::Rgba32,
                rotation_degrees: 0,
                device_timestamp: None,
            },
        )
        .with_release(move |_| {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Blocks on the first frame until told to continue, records sequences.
    struct GatedAnalyzer {
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        seen: Mutex<Vec<u64>>,
    }

    impl Analyzer for GatedAnalyzer {
        fn analyze(&self, frame: Frame) {
            if let Some(gate) = self.gate.lock().unwrap().take() {
                gate.recv_timeout(Duration::from_secs(5)).unwrap();
            }
            self.seen.lock().unwrap().push(frame.sequence());
            frame.close();
        }
    }

    #[test]
    fn busy_analyzer_sees_only_latest_frame() {
        let mut executor = CameraExecutor::single_thread("test-analysis").unwrap();
        let (open, gate) = mpsc::channel();
        let analyzer = Arc::new(GatedAnalyzer {
            gate: Mutex::new(Some(gate)),
            seen: Mutex::new(Vec::new()),
        });
        let analysis = ImageAnalysis::builder().build();
        analysis.set_analyzer(executor.handle(), analyzer.clone());

        let released = Arc::new(AtomicUsize::new(0));
        analysis.deliver(counted_frame(1, &released));
        // Wait until frame 1 is being analyzed before piling up more
        while analysis.pending() != 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        for seq in 2..=5 {
            analysis.deliver(counted_frame(seq, &released));
        }
        open.send(()).unwrap();
        executor.shutdown();

        assert_eq!(*analyzer.seen.lock().unwrap(), vec![1, 5]);
        assert_eq!(released.load(Ordering::SeqCst), 5);
        assert_eq!(analysis.stats().dropped, 3);
    }

    /// Panics on its first frame, records the rest.
    #[derive(Default)]
    struct FirstFramePanics {
        calls: AtomicUsize,
        seen: Mutex<Vec<u64>>,
    }

    impl Analyzer for FirstFramePanics {
        fn analyze(&self, frame: Frame) {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("analyzer failed on frame {}", frame.sequence());
            }
            self.seen.lock().unwrap().push(frame.sequence());
            frame.close();
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn analysis_resumes_after_analyzer_panic() {
        let mut executor = CameraExecutor::single_thread("test-panic-analysis").unwrap();
        let analyzer = Arc::new(FirstFramePanics::default());
        let analysis = ImageAnalysis::builder().build();
        analysis.set_analyzer(executor.handle(), analyzer.clone());
        let released = Arc::new(AtomicUsize::new(0));

        analysis.deliver(counted_frame(1, &released));
        assert!(wait_for(|| released.load(Ordering::SeqCst) == 1));

        for seq in 2..=10 {
            analysis.deliver(counted_frame(seq, &released));
            assert!(wait_for(|| analyzer.seen.lock().unwrap().contains(&seq)));
        }
        executor.shutdown();

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 10);
        assert_eq!(released.load(Ordering::SeqCst), 10);
        assert_eq!(analysis.pending(), 0);
    }

    #[test]
    fn unrun_drain_releases_pending_and_rearms() {
        let mut executor = CameraExecutor::single_thread("test-unrun-drain").unwrap();
        let analyzer = Arc::new(GatedAnalyzer {
            gate: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        });
        let analysis = ImageAnalysis::builder().build();
        analysis.set_analyzer(executor.handle(), analyzer.clone());
        let released = Arc::new(AtomicUsize::new(0));

        // A drain was scheduled but the executor discarded it
        lock(&analysis.inner.pending).push(counted_frame(1, &released));
        analysis.inner.draining.store(true, Ordering::SeqCst);
        drop(DrainJob(Some(analysis.inner.clone())));

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(analysis.pending(), 0);

        analysis.deliver(counted_frame(2, &released));
        executor.shutdown();
        assert_eq!(*analyzer.seen.lock().unwrap(), vec![2]);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn frames_without_analyzer_are_released() {
        let analysis = ImageAnalysis::builder().build();
        let released = Arc::new(AtomicUsize::new(0));
        analysis.deliver(counted_frame(1, &released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shut_down_executor_releases_frames() {
        let mut executor = CameraExecutor::single_thread("test-closed").unwrap();
        let analysis = ImageAnalysis::builder().build();
        let analyzer = Arc::new(GatedAnalyzer {
            gate: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        });
        analysis.set_analyzer(executor.handle(), analyzer.clone());
        executor.shutdown();

        let released = Arc::new(AtomicUsize::new(0));
        analysis.deliver(counted_frame(1, &released));
        analysis.deliver(counted_frame(2, &released));
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(analyzer.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn preview_without_surface_releases() {
        let preview = Preview::builder().build();
        let released = Arc::new(AtomicUsize::new(0));
        preview.deliver(counted_frame(1, &released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn group_keeps_one_use_case_per_kind() {
        let group = UseCaseGroup::builder()
            .add_use_case(Preview::builder().build())
            .add_use_case(ImageAnalysis::builder().build())
            .add_use_case(
                ImageAnalysis::builder()
                    .output_image_format(OutputImageFormat::Rgba8888)
                    .build(),
            )
            .build();
        assert_eq!(group.use_cases().len(), 2);
        assert_eq!(
            group.analysis().map(|a| a.output_image_format()),
            Some(OutputImageFormat::Rgba8888)
        );
        assert_eq!(
            BackpressureStrategy::KeepOnlyLatest.capacity(),
            1,
        );
    }
}
