pub mod decode;
pub mod frame;
pub mod resolution;
pub mod runtime;
pub mod synthetic;
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use resolution::{ResolutionSelector, Size, SupportedSize};
pub use runtime::{BoundCamera, CameraInfo, CameraRuntime, CameraSelector, FrameSequence, LensFacing};
pub use synthetic::{FrameInjector, SyntheticRuntime, SyntheticSettings};
pub use v4l2::V4l2Runtime;
