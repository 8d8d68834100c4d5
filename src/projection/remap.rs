use image::Rgb;
use nalgebra::{Matrix3, Vector2, Vector3};
use rayon::prelude::*;

use super::lens::{Lens, LensKind};
use crate::frame::Frame;

/// Per-output-pixel lookup of source image coordinates.
///
/// Entries without a source coordinate hold NaN and resample to the border
/// colour.
#[derive(Clone, Debug, PartialEq)]
pub struct RectificationMap {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
    lens: LensKind,
}

impl RectificationMap {
    /// Fill a map by tracing every output pixel through `target_inv`, the
    /// lens model and finally the source camera matrix.
    pub(crate) fn trace(
        size: (u32, u32),
        camera: &Matrix3<f64>,
        target_inv: &Matrix3<f64>,
        lens: &dyn Lens,
    ) -> Self {
        let (width, height) = size;
        let coords: Vec<(f32, f32)> = (0..height)
            .into_par_iter()
            .flat_map_iter(|v| {
                (0..width).map(move |u| {
                    let ray = target_inv * Vector3::new(u as f64, v as f64, 1.0);
                    lens.distort(Vector2::new(ray.x / ray.z, ray.y / ray.z))
                        .map(|point| camera * point.push(1.0))
                        .map(|source| (source.x as f32, source.y as f32))
                        .unwrap_or((f32::NAN, f32::NAN))
                })
            })
            .collect();
        let (map_x, map_y) = coords.into_iter().unzip();

        Self {
            width,
            height,
            map_x,
            map_y,
            lens: lens.kind(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The lens model the map was built with.
    pub fn lens(&self) -> LensKind {
        self.lens
    }

    pub fn map_x(&self) -> &[f32] {
        &self.map_x
    }

    pub fn map_y(&self) -> &[f32] {
        &self.map_y
    }

    /// Returns the source coordinate for output pixel `(x, y)`, or `None` if
    /// the pixel is outside the map or has no source.
    pub fn source(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let index = (y * self.width + x) as usize;
        let (sx, sy) = (self.map_x[index], self.map_y[index]);
        (sx.is_finite() && sy.is_finite()).then_some((sx, sy))
    }
}

const BORDER: Rgb<u8> = Rgb([0, 0, 0]);

/// Returns the pixel at `(x, y)` or the border colour outside `frame`.
fn fetch(frame: &Frame, x: i64, y: i64) -> [f32; 3] {
    let (width, height) = frame.dimensions();
    let pixel = if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
        &BORDER
    } else {
        frame.get_pixel(x as u32, y as u32)
    };

    pixel.0.map(f32::from)
}

fn bilinear(frame: &Frame, sx: f32, sy: f32) -> [u8; 3] {
    let (x0, y0) = (sx.floor(), sy.floor());
    let (fx, fy) = (sx - x0, sy - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let top_left = fetch(frame, x0, y0);
    let top_right = fetch(frame, x0 + 1, y0);
    let bottom_left = fetch(frame, x0, y0 + 1);
    let bottom_right = fetch(frame, x0 + 1, y0 + 1);

    std::array::from_fn(|c| {
        let top = top_left[c] + (top_right[c] - top_left[c]) * fx;
        let bottom = bottom_left[c] + (bottom_right[c] - bottom_left[c]) * fx;
        (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8
    })
}

/// Resample `source` through `map` with bilinear interpolation.
///
/// The result always has the map's dimensions. Output pixels whose source
/// coordinate falls outside `source` are black, and pixels near the edge are
/// blended with black.
pub fn apply(map: &RectificationMap, source: &Frame) -> Frame {
    let (width, height) = map.dimensions();
    let (src_w, src_h) = source.dimensions();
    let mut output = Frame::new(width, height);
    if width == 0 || height == 0 {
        return output;
    }

    output
        .par_chunks_mut(width as usize * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
                let index = y * width as usize + x;
                let (sx, sy) = (map.map_x[index], map.map_y[index]);
                if !(sx.is_finite() && sy.is_finite())
                    || sx <= -1.0
                    || sy <= -1.0
                    || sx >= src_w as f32
                    || sy >= src_h as f32
                {
                    continue;
                }

                pixel.copy_from_slice(&bilinear(source, sx, sy));
            }
        });

    output
}
