pub mod analysis;
pub mod capture;
pub mod display;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use analysis::{Analyzer, AnalyzerOutput, ImageAnalyzer, ImageInfo, LatestFrame};
pub use capture::{CameraRuntime, Frame, LensFacing, SyntheticRuntime, SyntheticSettings, V4l2Runtime};
pub use error::{CameraError, Result};
pub use lifecycle::Lifecycle;
pub use pipeline::OutputImageFormat;
pub use session::{CameraBinder, SessionConfig};

/// Prefix for environment overrides, e.g. `TRIVIEW__CAMERA__BACKEND=synthetic`.
pub const ENV_PREFIX: &str = "TRIVIEW";

/// Config file read from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "triview.toml";

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Snapshot of the active configuration.
pub fn config() -> Arc<Config> {
    CONFIG.load_full()
}

/// Atomically replace the active configuration.
pub fn install_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraSettings,
    pub session: SessionSettings,
    pub display: DisplayConfig,
    pub synthetic: SyntheticSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    #[default]
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub backend: CameraBackend,
    /// Device treated as the front camera; first detected device if unset.
    pub front_device: Option<String>,
    pub back_device: Option<String>,
    pub sensor_rotation_degrees: u32,
    pub buffer_count: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            backend: CameraBackend::V4l2,
            front_device: None,
            back_device: None,
            sensor_rotation_degrees: 0,
            buffer_count: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub enable_tap_to_focus: bool,
    pub analyzer_format: OutputImageFormat,
    pub lens_facing: LensFacing,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enable_tap_to_focus: true,
            analyzer_format: OutputImageFormat::Yuv420,
            lens_facing: LensFacing::Front,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 480,
            height: 960,
        }
    }
}

/// Layer defaults, the config file and `TRIVIEW__*` environment variables.
///
/// A missing file is not an error; a malformed one is.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    let file = path.unwrap_or(DEFAULT_CONFIG_FILE);
    let settings = config::Config::builder()
        .add_source(config::File::with_name(file).required(path.is_some()))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = settings.try_deserialize()?;
    info!("Loaded configuration: {:?}", config);
    Ok(config)
}
