pub mod ringbuf;
pub mod use_case;

pub use use_case::{
    BackpressureStrategy, ImageAnalysis, OutputImageFormat, Preview, SurfaceProvider, UseCase,
    UseCaseGroup,
};
