pub mod display;
pub mod preview;
pub mod rotate;

pub use display::Sdl2Display;
pub use preview::{ImplementationMode, PreviewView};
pub use rotate::rotate;
