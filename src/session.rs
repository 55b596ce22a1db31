//! Camera session binding
//!
//! [`CameraBinder`] owns one camera session: it builds the preview and
//! analysis outputs from a [`SessionConfig`], binds them to the runtime as a
//! single group, and registers a teardown observer so the session and its
//! worker thread go away when the [`Lifecycle`] is destroyed.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::analysis::Analyzer;
use crate::capture::resolution::{analysis_selector, preview_selector, ResolutionSelector};
use crate::capture::runtime::{BoundCamera, CameraRuntime, CameraSelector};
use crate::display::{ImplementationMode, PreviewView};
use crate::error::{CameraError, Result};
use crate::executor::CameraExecutor;
use crate::lifecycle::{Lifecycle, LifecycleObserver, ObserverId};
use crate::pipeline::{
    BackpressureStrategy, ImageAnalysis, OutputImageFormat, Preview, UseCaseGroup,
};
use crate::utils::lock;
use crate::SessionSettings;

/// Name of the thread analyzer callbacks run on.
pub const ANALYSIS_THREAD: &str = "camera-analysis";

/// Immutable per-start configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub preview_resolution_selector: ResolutionSelector,
    pub analyzer_resolution_selector: ResolutionSelector,
    pub enable_tap_to_focus: bool,
    pub analyzer_format: OutputImageFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preview_resolution_selector: preview_selector(),
            analyzer_resolution_selector: analysis_selector(),
            enable_tap_to_focus: true,
            analyzer_format: OutputImageFormat::Yuv420,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            enable_tap_to_focus: settings.enable_tap_to_focus,
            analyzer_format: settings.analyzer_format,
            ..Self::default()
        }
    }
}

struct ActiveSession {
    camera: BoundCamera,
    preview: Preview,
    analysis: ImageAnalysis,
}

/// Binds preview + analysis outputs of one camera to a lifecycle.
///
/// Binding is driven from a single owner through `&mut self`; the runtime and
/// executor are shared only with the teardown observer.
pub struct CameraBinder<R: CameraRuntime> {
    lifecycle: Lifecycle,
    runtime: Arc<Mutex<R>>,
    preview_view: PreviewView,
    analyzer: Arc<dyn Analyzer>,
    selector: CameraSelector,
    executor: Arc<Mutex<Option<CameraExecutor>>>,
    teardown: Arc<SessionTeardown<R>>,
    observer: Option<ObserverId>,
    config: Option<SessionConfig>,
    session: Option<ActiveSession>,
}

impl<R: CameraRuntime> CameraBinder<R> {
    pub fn new(
        lifecycle: Lifecycle,
        runtime: R,
        preview_view: PreviewView,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        let runtime = Arc::new(Mutex::new(runtime));
        let executor = Arc::new(Mutex::new(None));
        let teardown = Arc::new(SessionTeardown {
            runtime: runtime.clone(),
            executor: executor.clone(),
        });

        Self {
            lifecycle,
            runtime,
            preview_view,
            analyzer,
            selector: CameraSelector::DEFAULT_FRONT_CAMERA,
            executor,
            teardown,
            observer: None,
            config: None,
            session: None,
        }
    }

    pub fn with_selector(mut self, selector: CameraSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Bind a fresh session, replacing any existing one.
    ///
    /// `None` uses [`SessionConfig::default`]. Fails with
    /// [`CameraError::CameraUnavailable`] when no camera matches the selector
    /// or the lifecycle is already destroyed.
    pub fn start(&mut self, config: Option<SessionConfig>) -> Result<&BoundCamera> {
        if let Some(id) = self.observer.take() {
            self.lifecycle.remove_observer(id);
        }
        if self.lifecycle.is_destroyed() {
            return Err(CameraError::unavailable("lifecycle already destroyed"));
        }
        self.observer = Some(self.lifecycle.add_observer(self.teardown.clone()));

        let config = config.unwrap_or_default();
        info!("Start camera called with: {:?}", config);
        self.config = Some(config.clone());

        self.unbind();
        self.configure(&config)?;

        self.session
            .as_ref()
            .map(|s| &s.camera)
            .ok_or_else(|| CameraError::unavailable("session missing after bind"))
    }

    fn configure(&mut self, config: &SessionConfig) -> Result<()> {
        let executor = {
            let mut slot = lock(&self.executor);
            if slot.is_none() {
                *slot = Some(CameraExecutor::single_thread(ANALYSIS_THREAD)?);
            }
            match slot.as_ref() {
                Some(executor) => executor.handle(),
                None => return Err(CameraError::ExecutorShutdown),
            }
        };

        let preview = Preview::builder()
            .resolution_selector(config.preview_resolution_selector.clone())
            .build();

        let analysis = ImageAnalysis::builder()
            .output_image_format(config.analyzer_format)
            .backpressure_strategy(BackpressureStrategy::KeepOnlyLatest)
            .resolution_selector(config.analyzer_resolution_selector.clone())
            .build();
        analysis.set_analyzer(executor, self.analyzer.clone());

        let group = UseCaseGroup::builder()
            .add_use_case(preview.clone())
            .add_use_case(analysis.clone())
            .build();

        let bound = {
            let mut runtime = lock(&self.runtime);
            let bound = runtime.bind(&self.lifecycle, self.selector, group);
            if bound.is_ok() {
                if let Err(e) = runtime.set_auto_focus(config.enable_tap_to_focus) {
                    warn!("Auto focus not applied: {}", e);
                }
            }
            bound
        };
        let camera = match bound {
            Ok(camera) => camera,
            Err(e) => {
                analysis.clear_analyzer();
                return Err(e);
            }
        };

        self.preview_view
            .set_implementation_mode(ImplementationMode::Performance);
        self.preview_view.set_tap_to_focus(config.enable_tap_to_focus);
        preview.set_surface_provider(self.preview_view.surface_provider());

        info!(
            "Camera initialized, analyzer resolution: {:?}",
            analysis.resolution_info()
        );

        self.session = Some(ActiveSession {
            camera,
            preview,
            analysis,
        });
        Ok(())
    }

    fn unbind(&mut self) {
        lock(&self.runtime).unbind_all();
        if let Some(session) = self.session.take() {
            session.preview.clear_surface_provider();
            session.analysis.clear_analyzer();
        }
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.runtime).is_bound()
    }

    pub fn bound_camera(&self) -> Option<&BoundCamera> {
        self.session.as_ref().map(|s| &s.camera)
    }

    pub fn analysis(&self) -> Option<&ImageAnalysis> {
        self.session.as_ref().map(|s| &s.analysis)
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn preview_view(&self) -> &PreviewView {
        &self.preview_view
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Access the runtime, e.g. to inspect a synthetic camera in tests.
    pub fn with_runtime<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut lock(&self.runtime))
    }

    pub fn executor_running(&self) -> bool {
        lock(&self.executor)
            .as_ref()
            .is_some_and(|executor| !executor.is_shutdown())
    }
}

/// Lifecycle hook: unbind every output, then stop the worker so frames
/// already queued are analyzed and released.
struct SessionTeardown<R> {
    runtime: Arc<Mutex<R>>,
    executor: Arc<Mutex<Option<CameraExecutor>>>,
}

impl<R: CameraRuntime> LifecycleObserver for SessionTeardown<R> {
    fn on_destroy(&self, _lifecycle: &Lifecycle) {
        lock(&self.runtime).unbind_all();
        let executor = lock(&self.executor).take();
        if let Some(mut executor) = executor {
            executor.shutdown();
        }
        info!("Camera session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, LensFacing, Size, SyntheticRuntime, SyntheticSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Analyzer for Counting {
        fn analyze(&self, frame: Frame) {
            self.0.fetch_add(1, Ordering::SeqCst);
            frame.close();
        }
    }

    fn binder(facing: Vec<LensFacing>) -> (CameraBinder<SyntheticRuntime>, Lifecycle) {
        let settings = SyntheticSettings {
            sizes: vec![Size::new(1280, 720), Size::new(640, 360)],
            fps: 0,
            rotation_degrees: 90,
            lens_facing: facing,
        };
        let lifecycle = Lifecycle::new();
        let binder = CameraBinder::new(
            lifecycle.clone(),
            SyntheticRuntime::new(&settings),
            PreviewView::new(),
            Arc::new(Counting::default()),
        );
        (binder, lifecycle)
    }

    #[test]
    fn default_config_enables_focus_and_yuv() {
        let config = SessionConfig::default();
        assert!(config.enable_tap_to_focus);
        assert_eq!(config.analyzer_format, OutputImageFormat::Yuv420);

        let settings = SessionSettings {
            enable_tap_to_focus: false,
            ..SessionSettings::default()
        };
        assert!(!SessionConfig::from_settings(&settings).enable_tap_to_focus);
    }

    #[test]
    fn restart_keeps_a_single_observer() {
        let (mut binder, lifecycle) = binder(vec![LensFacing::Front]);
        binder.start(None).unwrap();
        binder.start(None).unwrap();
        binder.start(None).unwrap();

        assert_eq!(lifecycle.observer_count(), 1);
        assert_eq!(binder.with_runtime(|r| r.bind_count()), 3);
        assert!(binder.is_bound());
    }

    #[test]
    fn failed_bind_leaves_nothing_bound() {
        let (mut binder, lifecycle) = binder(vec![LensFacing::Back]);
        let err = binder.start(None).unwrap_err();

        assert!(matches!(err, CameraError::CameraUnavailable(_)));
        assert!(!binder.is_bound());
        assert!(binder.bound_camera().is_none());
        // Observer stays registered so a later destroy still stops the worker
        assert_eq!(lifecycle.observer_count(), 1);
        lifecycle.destroy();
        assert!(!binder.executor_running());
    }

    #[test]
    fn destroy_unbinds_and_stops_worker() {
        let (mut binder, lifecycle) = binder(vec![LensFacing::Front]);
        binder.start(None).unwrap();
        assert!(binder.executor_running());

        lifecycle.destroy();
        assert!(!binder.is_bound());
        assert!(!binder.executor_running());

        let err = binder.start(None).unwrap_err();
        assert!(matches!(err, CameraError::CameraUnavailable(_)));
    }

    #[test]
    fn start_applies_preview_and_focus_settings() {
        let (mut binder, _lifecycle) = binder(vec![LensFacing::Front]);
        let config = SessionConfig {
            enable_tap_to_focus: false,
            ..SessionConfig::default()
        };
        binder.start(Some(config)).unwrap();

        let view = binder.preview_view();
        assert_eq!(view.implementation_mode(), ImplementationMode::Performance);
        assert!(!view.is_tap_to_focus_enabled());
        assert!(!binder.config().unwrap().enable_tap_to_focus);
    }
}
