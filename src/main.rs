//! Triview: converted, rotated and native camera views in one window

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use triview::capture::{CameraRuntime, CameraSelector, SyntheticRuntime, V4l2Runtime};
use triview::display::{PreviewView, Sdl2Display};
use triview::{
    load_config, CameraBackend, CameraBinder, ImageAnalyzer, LatestFrame, Lifecycle,
    SessionConfig,
};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "triview=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Triview launching...");

    let config_path = std::env::args().nth(1);
    triview::install_config(load_config(config_path.as_deref())?);
    let config = triview::config();

    let lifecycle = Lifecycle::new();
    lifecycle.start();

    let result = match config.camera.backend {
        CameraBackend::V4l2 => {
            let runtime = V4l2Runtime::new(config.camera.clone())?;
            run(&lifecycle, runtime)
        }
        CameraBackend::Synthetic => run(&lifecycle, SyntheticRuntime::new(&config.synthetic)),
    };

    lifecycle.destroy();
    info!("Triview shutting down");
    result
}

fn run<R: CameraRuntime>(lifecycle: &Lifecycle, runtime: R) -> Result<()> {
    let config = triview::config();
    let latest = LatestFrame::new();
    let preview = PreviewView::new();
    let analyzer = Arc::new(ImageAnalyzer::new(latest.sink()));

    let mut binder = CameraBinder::new(lifecycle.clone(), runtime, preview.clone(), analyzer)
        .with_selector(CameraSelector::new(config.session.lens_facing));

    let bound = binder.start(Some(SessionConfig::from_settings(&config.session)))?;
    info!(
        "Bound {} ({}), preview {:?}, analysis {:?}",
        bound.camera.name, bound.camera.id, bound.preview_resolution, bound.analysis_resolution
    );
    if bound.analysis_resolution.is_none() {
        warn!("Analysis output has no resolution; converted panes stay empty");
    }

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut display = Sdl2Display::new(&sdl_context, config.display.width, config.display.height)?;
    display.run(&sdl_context, &latest, &preview)
}
