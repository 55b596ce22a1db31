//! Resolution negotiation between use cases and the sizes a camera reports

use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const RATIO_16_9: f32 = 16.0 / 9.0;
pub const RATIO_4_3: f32 = 4.0 / 3.0;
pub const UPPER_RESOLUTION_BOUND_1080P: u32 = 1920;

/// Maximum distance between two long/short ratios that still counts as a match.
const ASPECT_TOLERANCE: f32 = 0.1;

/// Frame rate a size must sustain when capture rate is preferred.
const MIN_CAPTURE_RATE: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn long_side(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn short_side(&self) -> u32 {
        self.width.min(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Long side over short side, orientation independent.
    pub fn aspect_ratio(&self) -> f32 {
        self.long_side() as f32 / self.short_side().max(1) as f32
    }

    pub fn matches_ratio(&self, ratio: f32) -> bool {
        (ratio - self.aspect_ratio()).abs() < ASPECT_TOLERANCE
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Output size reported by a camera together with its best frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SupportedSize {
    pub size: Size,
    pub max_fps: u32,
}

impl SupportedSize {
    pub const fn new(width: u32, height: u32, max_fps: u32) -> Self {
        Self {
            size: Size::new(width, height),
            max_fps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    Ratio4By3,
    Ratio16By9,
}

impl AspectRatio {
    pub fn value(&self) -> f32 {
        match self {
            Self::Ratio4By3 => RATIO_4_3,
            Self::Ratio16By9 => RATIO_16_9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatioFallback {
    /// Only sizes matching the preferred ratio are eligible.
    None,
    /// Non-matching sizes are eligible after all matching ones.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatioStrategy {
    pub preferred: AspectRatio,
    pub fallback: AspectRatioFallback,
}

impl AspectRatioStrategy {
    pub const RATIO_16_9_FALLBACK_AUTO: Self = Self {
        preferred: AspectRatio::Ratio16By9,
        fallback: AspectRatioFallback::Auto,
    };

    pub const RATIO_4_3_FALLBACK_AUTO: Self = Self {
        preferred: AspectRatio::Ratio4By3,
        fallback: AspectRatioFallback::Auto,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionMode {
    #[default]
    PreferCaptureRateOverHigherResolution,
    PreferHigherResolutionOverCaptureRate,
}

/// Reorders and/or prunes the candidate list produced by the other policies.
pub type ResolutionFilter = Arc<dyn Fn(&[Size]) -> Vec<Size> + Send + Sync>;

/// Policy used to pick one of the sizes a camera supports.
///
/// Candidates are first restricted by [`ResolutionMode`], then ordered by the
/// aspect ratio strategy (matching ratio first, larger area first), and finally
/// handed to the custom filter if one is set. The first remaining size wins.
#[derive(Clone, Default)]
pub struct ResolutionSelector {
    aspect_ratio_strategy: Option<AspectRatioStrategy>,
    mode: ResolutionMode,
    filter: Option<ResolutionFilter>,
}

impl ResolutionSelector {
    pub fn builder() -> ResolutionSelectorBuilder {
        ResolutionSelectorBuilder::default()
    }

    pub fn aspect_ratio_strategy(&self) -> Option<AspectRatioStrategy> {
        self.aspect_ratio_strategy
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    pub fn select(&self, supported: &[SupportedSize]) -> Option<Size> {
        self.candidates(supported).into_iter().next()
    }

    /// All eligible sizes in preference order.
    pub fn candidates(&self, supported: &[SupportedSize]) -> Vec<Size> {
        let mut eligible: Vec<SupportedSize> = Vec::with_capacity(supported.len());
        for s in supported {
            if !eligible.iter().any(|e| e.size == s.size) {
                eligible.push(*s);
            }
        }

        if self.mode == ResolutionMode::PreferCaptureRateOverHigherResolution {
            let fast: Vec<SupportedSize> = eligible
                .iter()
                .copied()
                .filter(|s| s.max_fps >= MIN_CAPTURE_RATE)
                .collect();
            if !fast.is_empty() {
                eligible = fast;
            }
        }

        if let Some(strategy) = self.aspect_ratio_strategy {
            let ratio = strategy.preferred.value();
            if strategy.fallback == AspectRatioFallback::None {
                eligible.retain(|s| s.size.matches_ratio(ratio));
            }
            eligible.sort_by_key(|s| (!s.size.matches_ratio(ratio), Reverse(s.size.area())));
        } else {
            eligible.sort_by_key(|s| Reverse(s.size.area()));
        }

        let sizes: Vec<Size> = eligible.into_iter().map(|s| s.size).collect();
        match &self.filter {
            Some(filter) => filter(&sizes),
            None => sizes,
        }
    }
}

impl fmt::Debug for ResolutionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionSelector")
            .field("aspect_ratio_strategy", &self.aspect_ratio_strategy)
            .field("mode", &self.mode)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[derive(Default)]
pub struct ResolutionSelectorBuilder {
    selector: ResolutionSelector,
}

impl ResolutionSelectorBuilder {
    pub fn aspect_ratio_strategy(mut self, strategy: AspectRatioStrategy) -> Self {
        self.selector.aspect_ratio_strategy = Some(strategy);
        self
    }

    pub fn allowed_resolution_mode(mut self, mode: ResolutionMode) -> Self {
        self.selector.mode = mode;
        self
    }

    pub fn resolution_filter(
        mut self,
        filter: impl Fn(&[Size]) -> Vec<Size> + Send + Sync + 'static,
    ) -> Self {
        self.selector.filter = Some(Arc::new(filter));
        self
    }

    pub fn build(self) -> ResolutionSelector {
        self.selector
    }
}

/// Preview policy: 16:9 with automatic fallback, resolution over frame rate.
pub fn preview_selector() -> ResolutionSelector {
    ResolutionSelector::builder()
        .aspect_ratio_strategy(AspectRatioStrategy::RATIO_16_9_FALLBACK_AUTO)
        .allowed_resolution_mode(ResolutionMode::PreferHigherResolutionOverCaptureRate)
        .build()
}

/// Analysis policy: see [`analysis_resolution_filter`].
pub fn analysis_selector() -> ResolutionSelector {
    ResolutionSelector::builder()
        .allowed_resolution_mode(ResolutionMode::PreferHigherResolutionOverCaptureRate)
        .resolution_filter(analysis_resolution_filter)
        .build()
}

/// Keep 16:9 sizes (within 0.1) no longer than 1080p, largest first.
pub fn analysis_resolution_filter(supported: &[Size]) -> Vec<Size> {
    debug!("Supported camera resolutions: {}", join(supported));

    let mut requested: Vec<Size> = supported
        .iter()
        .copied()
        .filter(|size| {
            size.matches_ratio(RATIO_16_9) && size.long_side() <= UPPER_RESOLUTION_BOUND_1080P
        })
        .collect();
    requested.sort_by_key(|size| Reverse(size.width + size.height));

    debug!("Requested camera resolutions: {}", join(&requested));
    requested
}

fn join(sizes: &[Size]) -> String {
    sizes
        .iter()
        .map(Size::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
