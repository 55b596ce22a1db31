//! Camera runtime abstraction: discovery, binding and frame production

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::resolution::{Size, SupportedSize};
use crate::error::{CameraError, Result};
use crate::lifecycle::Lifecycle;
use crate::pipeline::{OutputImageFormat, UseCaseGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensFacing {
    #[default]
    Front,
    Back,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSelector {
    pub lens_facing: LensFacing,
}

impl CameraSelector {
    pub const DEFAULT_FRONT_CAMERA: Self = Self {
        lens_facing: LensFacing::Front,
    };
    pub const DEFAULT_BACK_CAMERA: Self = Self {
        lens_facing: LensFacing::Back,
    };

    pub fn new(lens_facing: LensFacing) -> Self {
        Self { lens_facing }
    }
}

impl Default for CameraSelector {
    fn default() -> Self {
        Self::DEFAULT_FRONT_CAMERA
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    /// Runtime specific identifier (a device path for V4L2).
    pub id: String,
    pub name: String,
    pub lens_facing: LensFacing,
    /// Clockwise rotation of the sensor relative to the display.
    pub sensor_rotation_degrees: u32,
}

/// Result of a successful bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundCamera {
    pub camera: CameraInfo,
    pub preview_resolution: Option<Size>,
    pub analysis_resolution: Option<Size>,
}

/// Frame numbering owned by a runtime and shared by all of its bindings.
///
/// Numbers keep increasing across rebinds; consumers such as
/// [`LatestFrame`](crate::analysis::LatestFrame) drop anything not newer than
/// what they already hold.
#[derive(Debug, Clone, Default)]
pub struct FrameSequence(Arc<AtomicU64>);

impl FrameSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next number, starting at 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number the next call to [`FrameSequence::next`] will return.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Acquire) + 1
    }

    pub fn last(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// A source of camera frames that outputs can be bound to.
///
/// `bind` must replace any existing binding: a runtime never has two sessions
/// delivering frames at once. Frames are delivered through
/// [`ImageAnalysis::deliver`](crate::pipeline::ImageAnalysis::deliver) and
/// [`Preview::deliver`](crate::pipeline::Preview::deliver) from a thread the
/// runtime owns.
pub trait CameraRuntime: Send + 'static {
    fn available_cameras(&self) -> Vec<CameraInfo>;

    fn supported_sizes(
        &self,
        camera: &CameraInfo,
        format: OutputImageFormat,
    ) -> Result<Vec<SupportedSize>>;

    fn bind(
        &mut self,
        lifecycle: &Lifecycle,
        selector: CameraSelector,
        group: UseCaseGroup,
    ) -> Result<BoundCamera>;

    fn unbind_all(&mut self);

    fn is_bound(&self) -> bool;

    /// Switch continuous auto-focus; runtimes without focus control accept it.
    fn set_auto_focus(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}

/// First camera matching the selector.
pub fn select_camera<R: CameraRuntime + ?Sized>(
    runtime: &R,
    selector: CameraSelector,
) -> Result<CameraInfo> {
    runtime
        .available_cameras()
        .into_iter()
        .find(|camera| camera.lens_facing == selector.lens_facing)
        .ok_or_else(|| {
            CameraError::unavailable(format!("no {:?} camera available", selector.lens_facing))
        })
}

/// Common pre-bind checks shared by runtimes.
pub fn ensure_bindable(lifecycle: &Lifecycle, group: &UseCaseGroup) -> Result<()> {
    if lifecycle.is_destroyed() {
        return Err(CameraError::unavailable("lifecycle already destroyed"));
    }
    if group.is_empty() {
        return Err(CameraError::unavailable("no use cases to bind"));
    }
    Ok(())
}

/// Resolve every use case in the group against the supported sizes and record
/// the chosen resolution on it.
pub fn resolve_group(
    group: &UseCaseGroup,
    supported: &[SupportedSize],
) -> Result<(Option<Size>, Option<Size>)> {
    debug!("Resolving use cases against {} supported sizes", supported.len());

    let preview = match group.preview() {
        Some(preview) => {
            let size = preview
                .resolution_selector()
                .select(supported)
                .ok_or_else(|| CameraError::unavailable("no preview resolution matches selector"))?;
            Some(size)
        }
        None => None,
    };
    let analysis = match group.analysis() {
        Some(analysis) => {
            let size = analysis
                .resolution_selector()
                .select(supported)
                .ok_or_else(|| CameraError::unavailable("no analysis resolution matches selector"))?;
            Some(size)
        }
        None => None,
    };

    if let Some(p) = group.preview() {
        p.set_resolution(preview);
    }
    if let Some(a) = group.analysis() {
        a.set_resolution(analysis);
    }

    info!(
        "Resolved preview {} / analysis {}",
        preview.map_or("-".to_string(), |s| s.to_string()),
        analysis.map_or("-".to_string(), |s| s.to_string())
    );
    Ok((preview, analysis))
}
