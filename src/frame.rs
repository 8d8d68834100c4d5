//! Decoded pixel buffers and the loaders that produce them.

use image::{ImageReader, RgbImage};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    dataset::Eye,
    projection::{ProjectionEngine, scale_for_display},
};

/// A decoded RGB frame, row major with three bytes per pixel.
pub type Frame = RgbImage;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unable to open image {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to decode image {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Read and decode the image at `path` into an RGB frame.
pub fn decode(path: impl AsRef<Path>) -> Result<Frame, DecodeError> {
    let path = path.as_ref();
    let image = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|source| DecodeError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .decode()
        .map_err(|source| DecodeError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(image.into_rgb8())
}

/// Turns a file on disk into a frame ready to be cached.
///
/// Implementations are shared by every loading thread, so they must not hold
/// display resources.
pub trait FrameSource: Send + Sync {
    /// Load the image at `path`, captured by camera `eye`.
    fn load(&self, eye: Eye, path: &Path) -> Result<Frame, DecodeError>;
}

/// Decodes frames and, for every eye with a projection engine attached,
/// rectifies and scales them for display.
#[derive(Clone, Default)]
pub struct FramePipeline {
    projections: BTreeMap<Eye, Arc<ProjectionEngine>>,
    display_max: Option<u32>,
}

impl FramePipeline {
    /// A pipeline that shows frames exactly as decoded.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Rectify frames of `eye` with `engine`. Eyes without an engine are
    /// shown as decoded.
    pub fn with_projection(mut self, eye: Eye, engine: Arc<ProjectionEngine>) -> Self {
        self.projections.insert(eye, engine);
        self
    }

    /// Downscale rectified frames so neither side exceeds `max` pixels.
    pub fn with_display_max(mut self, max: u32) -> Self {
        self.display_max = Some(max);
        self
    }

    pub fn projection(&self, eye: Eye) -> Option<&ProjectionEngine> {
        self.projections.get(&eye).map(Arc::as_ref)
    }
}

impl FrameSource for FramePipeline {
    fn load(&self, eye: Eye, path: &Path) -> Result<Frame, DecodeError> {
        let frame = decode(path)?;
        let Some(engine) = self.projection(eye) else {
            return Ok(frame);
        };

        if engine.params().image_size() != frame.dimensions() {
            warn!(
                path = %path.display(),
                camera = engine.params().camera_name(),
                frame = ?frame.dimensions(),
                calibration = ?engine.params().image_size(),
                "image size does not match calibration"
            );
        }

        let rectified = engine.apply(&frame);
        trace!(path = %path.display(), ?eye, "rectified frame");
        Ok(match self.display_max {
            Some(max) => scale_for_display(&rectified, max),
            None => rectified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn decode_png_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let mut image = RgbImage::new(4, 3);
        image.put_pixel(1, 2, Rgb([10, 20, 30]));
        image.save(&path).unwrap();

        let frame = decode(&path).unwrap();
        assert_eq!(frame.dimensions(), (4, 3));
        assert_eq!(frame.get_pixel(1, 2), &Rgb([10, 20, 30]));
    }

    #[test]
    fn decode_missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            decode(dir.path().join("missing.png")),
            Err(DecodeError::Open { .. })
        ));
    }

    #[test]
    fn decode_corrupt_file_fails_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(matches!(decode(&path), Err(DecodeError::Decode { .. })));
    }

    #[test]
    fn passthrough_returns_decoded_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(5, 2, Rgb([1, 2, 3])).save(&path).unwrap();

        let frame = FramePipeline::passthrough().load(Eye::Left, &path).unwrap();
        assert_eq!(frame.dimensions(), (5, 2));
    }

    fn camera(principal: (f64, f64)) -> Arc<ProjectionEngine> {
        use crate::{calibration::FisheyeParams, projection::CameraModel};

        let params = FisheyeParams::new(
            "cam",
            (40, 30),
            0.0,
            [0.0; 4],
            [20.0, 20.0, principal.0, principal.1],
        )
        .unwrap();
        Arc::new(ProjectionEngine::new(params, (100, 45), 2.5, CameraModel::Fisheye).unwrap())
    }

    #[test]
    fn projection_rectifies_and_scales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(40, 30, Rgb([50, 60, 70])).save(&path).unwrap();

        let pipeline = FramePipeline::passthrough()
            .with_projection(Eye::Left, camera((20.0, 15.0)))
            .with_display_max(50);

        let frame = pipeline.load(Eye::Left, &path).unwrap();
        assert_eq!(frame.dimensions(), (50, 23));
        assert!(pipeline.projection(Eye::Left).is_some());
    }

    #[test]
    fn each_eye_uses_its_own_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let source = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8 * 6, y as u8 * 8, 0]));
        source.save(&path).unwrap();

        let (left, right) = (camera((20.0, 15.0)), camera((10.0, 8.0)));
        let pipeline = FramePipeline::passthrough()
            .with_projection(Eye::Left, Arc::clone(&left))
            .with_projection(Eye::Right, Arc::clone(&right));

        let left_frame = pipeline.load(Eye::Left, &path).unwrap();
        let right_frame = pipeline.load(Eye::Right, &path).unwrap();
        assert_eq!(left_frame, left.apply(&source));
        assert_eq!(right_frame, right.apply(&source));
        assert_ne!(left_frame, right_frame);
    }

    #[test]
    fn eyes_without_engine_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(40, 30, Rgb([1, 2, 3])).save(&path).unwrap();

        let pipeline = FramePipeline::passthrough().with_projection(Eye::Left, camera((20.0, 15.0)));
        assert_eq!(pipeline.load(Eye::Right, &path).unwrap().dimensions(), (40, 30));
        assert!(pipeline.projection(Eye::Right).is_none());
    }
}
