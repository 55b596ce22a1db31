//! SDL2 Window Display Module
//! Renders the three live views stacked vertically: the converted analysis
//! frame, the same frame rotated upright, and the native camera preview.

use color_eyre::{eyre::eyre, Result};
use image::RgbaImage;
use sdl2::event::Event;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::rect::Rect;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{debug, info};

use crate::analysis::LatestFrame;
use crate::display::preview::PreviewView;
use crate::display::rotate::rotate;

/// Relative heights of the raw, rotated and preview panes.
const PANE_WEIGHTS: [f32; 3] = [0.5, 1.0, 1.0];

pub const PANE_TITLES: [&str; 3] = ["YUV to Bitmap", "YUV to Bitmap, rotated", "Camera Preview"];

/// Event loop wait; frames are only redrawn when a source reports a change.
const EVENT_WAIT_MS: u32 = 16;

/// SDL2 Window Display
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    width: u32,
    height: u32,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, width: u32, height: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window(&PANE_TITLES.join(" | "), width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
            width,
            height,
        })
    }

    /// Draw the panes; `None` leaves a pane blank.
    pub fn render_views(&mut self, views: [Option<&RgbaImage>; 3]) -> Result<()> {
        self.canvas.set_draw_color(Color::RGB(0, 0, 0));
        self.canvas.clear();

        for (pane, view) in pane_rects(self.width, self.height).into_iter().zip(views) {
            let Some(image) = view else {
                continue;
            };
            if image.width() == 0 || image.height() == 0 {
                continue;
            }

            // ABGR8888 is RGBA byte order on little-endian hosts
            let mut texture = self
                .texture_creator
                .create_texture_streaming(PixelFormatEnum::ABGR8888, image.width(), image.height())
                .map_err(|e| eyre!(e))?;
            texture
                .update(None, image.as_raw(), (image.width() * 4) as usize)
                .map_err(|e| eyre!(e))?;

            let target = fit_rect(pane, image.width(), image.height());
            self.canvas.copy(&texture, None, target).map_err(|e| eyre!(e))?;

            self.canvas.set_draw_color(Color::RGB(0, 255, 0));
            self.canvas.draw_rect(pane).map_err(|e| eyre!(e))?;
        }

        self.canvas.present();
        Ok(())
    }

    pub fn run(
        &mut self,
        sdl_context: &sdl2::Sdl,
        latest: &LatestFrame,
        preview: &PreviewView,
    ) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        let mut frames = latest.subscribe();
        let mut previews = preview.subscribe();
        let mut dirty = true;

        'running: loop {
            if let Some(event) = event_pump.wait_event_timeout(EVENT_WAIT_MS) {
                for event in std::iter::once(event).chain(event_pump.poll_iter()) {
                    match event {
                        Event::Quit { .. } => {
                            info!("Quit event received");
                            break 'running;
                        }
                        Event::Window { .. } => {
                            let (w, h) = self.canvas.output_size().map_err(|e| eyre!(e))?;
                            self.width = w;
                            self.height = h;
                            dirty = true;
                        }
                        _ => {}
                    }
                }
            }

            if frames.has_changed().unwrap_or(false) || previews.has_changed().unwrap_or(false) {
                dirty = true;
            }
            if !dirty {
                continue;
            }
            dirty = false;

            let output = frames.borrow_and_update().clone();
            previews.borrow_and_update();

            // The raw pane is drawn exactly as converted, without rotation.
            let rotated = match (&output.image, output.info) {
                (Some(image), Some(info)) => Some(rotate(image, info.rotation_degrees as i32)),
                _ => None,
            };
            let preview_image = preview.snapshot();

            self.render_views([
                output.image.as_deref(),
                rotated.as_ref(),
                preview_image.as_deref(),
            ])?;
            if let Some(info) = output.info {
                debug!("Rendered frame {}", info.sequence);
            }
        }

        Ok(())
    }
}

/// Split the window into stacked panes by [`PANE_WEIGHTS`].
pub fn pane_rects(width: u32, height: u32) -> [Rect; 3] {
    let total: f32 = PANE_WEIGHTS.iter().sum();
    let mut top = 0i32;
    let mut rects = [Rect::new(0, 0, 1, 1); 3];
    for (i, weight) in PANE_WEIGHTS.iter().enumerate() {
        let pane_height = if i == PANE_WEIGHTS.len() - 1 {
            (height as i32 - top).max(1) as u32
        } else {
            ((height as f32 * weight / total) as u32).max(1)
        };
        rects[i] = Rect::new(0, top, width.max(1), pane_height);
        top += pane_height as i32;
    }
    rects
}

/// Largest rect with the image's aspect ratio centered inside `pane`.
pub fn fit_rect(pane: Rect, width: u32, height: u32) -> Rect {
    let scale = (pane.width() as f32 / width as f32).min(pane.height() as f32 / height as f32);
    let w = ((width as f32 * scale) as u32).max(1);
    let h = ((height as f32 * scale) as u32).max(1);
    Rect::new(
        pane.x() + pane.width().saturating_sub(w) as i32 / 2,
        pane.y() + pane.height().saturating_sub(h) as i32 / 2,
        w,
        h,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panes_cover_window_by_weight() {
        let panes = pane_rects(800, 1000);
        assert_eq!(panes[0].height(), 200);
        assert_eq!(panes[1].height(), 400);
        assert_eq!(panes[2].height(), 400);
        assert_eq!(panes[2].y(), 600);
    }

    #[test]
    fn fit_keeps_aspect_and_centers() {
        let fitted = fit_rect(Rect::new(0, 0, 800, 400), 1600, 400);
        assert_eq!((fitted.width(), fitted.height()), (800, 200));
        assert_eq!((fitted.x(), fitted.y()), (0, 100));
    }
}
