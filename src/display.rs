//! The sink the viewer renders into.
//!
//! A [`DisplaySurface`] owns the display context. Renderable handles may only
//! be created on the thread that owns the surface; everything else about the
//! loading pipeline is independent of it.

use image::{
    Rgb,
    imageops::{self, FilterType},
};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, trace};

use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("cannot create a renderable from a {width}x{height} frame")]
    EmptyFrame { width: u32, height: u32 },
    #[error("unable to write frame to {path}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Axis aligned rectangle in surface pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle of `size` centred inside `self`, clipped to it.
    pub fn centred(&self, size: (u32, u32)) -> Self {
        let width = size.0.min(self.width);
        let height = size.1.min(self.height);
        Self::new(
            self.x + (self.width - width) / 2,
            self.y + (self.height - height) / 2,
            width,
            height,
        )
    }
}

/// Largest rectangle with the aspect ratio of `content` that fits in `pane`,
/// centred in it.
pub fn fit_rect(content: (u32, u32), pane: Rect) -> Rect {
    let (width, height) = content;
    if width == 0 || height == 0 || pane.width == 0 || pane.height == 0 {
        return Rect::new(pane.x, pane.y, 0, 0);
    }

    let scale = (pane.width as f64 / width as f64).min(pane.height as f64 / height as f64);
    let fitted = |side: u32, limit: u32| ((side as f64 * scale).round() as u32).clamp(1, limit);
    pane.centred((fitted(width, pane.width), fitted(height, pane.height)))
}

/// Size of the box drawn while an entry is still loading.
pub const PLACEHOLDER_SIZE: (u32, u32) = (200, 50);

pub trait DisplaySurface {
    /// A renderable created from a decoded frame. Handles live in the image
    /// cache, which is shared with the loading threads.
    type Handle: Send;

    /// Create a renderable from `frame`. Must be called on the thread that
    /// owns the surface.
    fn create_handle(&mut self, frame: &Frame) -> Result<Self::Handle, SurfaceError>;

    fn handle_size(&self, handle: &Self::Handle) -> (u32, u32);

    fn size(&self) -> (u32, u32);

    fn resize(&mut self, size: (u32, u32));

    fn clear(&mut self);

    /// Draw `handle` scaled to fill `dest`.
    fn draw(&mut self, handle: &Self::Handle, dest: Rect) -> Result<(), SurfaceError>;

    fn draw_placeholder(&mut self, dest: Rect);

    /// Draw a vertical line at column `x`.
    fn draw_divider(&mut self, x: u32);

    fn present(&mut self) -> Result<(), SurfaceError>;
}

/// A renderable owned by a [`CanvasSurface`].
#[derive(Clone, Debug)]
pub struct CanvasTexture {
    id: u64,
    frame: Frame,
}

impl CanvasTexture {
    pub fn id(&self) -> u64 {
        self.id
    }
}

const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const PLACEHOLDER: Rgb<u8> = Rgb([64, 64, 64]);
const DIVIDER: Rgb<u8> = Rgb([255, 255, 255]);

/// Software surface compositing into an RGB canvas.
///
/// When an output path is set, every presented canvas is written there as an
/// image.
#[derive(Debug)]
pub struct CanvasSurface {
    canvas: Frame,
    output: Option<PathBuf>,
    next_id: u64,
    presented: usize,
}

impl CanvasSurface {
    pub fn new(size: (u32, u32)) -> Self {
        Self {
            canvas: Frame::from_pixel(size.0, size.1, BACKGROUND),
            output: None,
            next_id: 0,
            presented: 0,
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn canvas(&self) -> &Frame {
        &self.canvas
    }

    /// Number of frames presented so far.
    pub fn presented(&self) -> usize {
        self.presented
    }

    fn fill(&mut self, rect: Rect, colour: Rgb<u8>) {
        let (width, height) = self.canvas.dimensions();
        for y in rect.y..(rect.y + rect.height).min(height) {
            for x in rect.x..(rect.x + rect.width).min(width) {
                self.canvas.put_pixel(x, y, colour);
            }
        }
    }
}

impl DisplaySurface for CanvasSurface {
    type Handle = CanvasTexture;

    fn create_handle(&mut self, frame: &Frame) -> Result<CanvasTexture, SurfaceError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(SurfaceError::EmptyFrame { width, height });
        }

        self.next_id += 1;
        trace!(id = self.next_id, width, height, "created texture");
        Ok(CanvasTexture {
            id: self.next_id,
            frame: frame.clone(),
        })
    }

    fn handle_size(&self, handle: &CanvasTexture) -> (u32, u32) {
        handle.frame.dimensions()
    }

    fn size(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }

    fn resize(&mut self, size: (u32, u32)) {
        if size != self.canvas.dimensions() {
            self.canvas = Frame::from_pixel(size.0, size.1, BACKGROUND);
        }
    }

    fn clear(&mut self) {
        self.canvas.pixels_mut().for_each(|pixel| *pixel = BACKGROUND);
    }

    fn draw(&mut self, handle: &CanvasTexture, dest: Rect) -> Result<(), SurfaceError> {
        if dest.width == 0 || dest.height == 0 {
            return Ok(());
        }

        let scaled;
        let frame = match handle.frame.dimensions() == (dest.width, dest.height) {
            true => &handle.frame,
            false => {
                scaled = imageops::resize(&handle.frame, dest.width, dest.height, FilterType::Triangle);
                &scaled
            }
        };
        imageops::replace(&mut self.canvas, frame, dest.x as i64, dest.y as i64);
        Ok(())
    }

    fn draw_placeholder(&mut self, dest: Rect) {
        self.fill(dest, PLACEHOLDER);
    }

    fn draw_divider(&mut self, x: u32) {
        let height = self.canvas.height();
        self.fill(Rect::new(x, 0, 1, height), DIVIDER);
    }

    fn present(&mut self) -> Result<(), SurfaceError> {
        self.presented += 1;
        if let Some(path) = &self.output {
            self.canvas.save(path).map_err(|source| SurfaceError::Save {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), frame = self.presented, "presented canvas");
        }
        Ok(())
    }
}
