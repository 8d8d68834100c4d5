//! Fisheye to flat projection.
//!
//! A [`RectificationMap`] is traced once per set of calibration parameters,
//! output size and focal expansion, then applied to every frame from that
//! camera. Building the map uses the equidistant fisheye model by default and
//! falls back to a plain pinhole model when the fisheye inversion is not
//! valid for the parameters.

mod lens;
mod remap;
mod scale;
mod tuning;

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;
use tracing::{info, warn};

pub use lens::{CameraModel, EquidistantLens, Lens, LensKind, PinholeLens, UnifiedLens};
pub use remap::{RectificationMap, apply};
pub use scale::scale_for_display;
pub use tuning::{ParamDelta, ParseDeltaError, Tuner};

use crate::{calibration::FisheyeParams, config::ViewerConfig, frame::Frame};

#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    #[error("output size {width}x{height} has a zero dimension")]
    EmptyOutput { width: u32, height: u32 },
    #[error("focal expansion {0} must be finite and positive")]
    InvalidExpansion(f64),
    #[error("target camera matrix is singular")]
    SingularCamera,
    #[error("{lens:?} model is not valid for these parameters: {reason}")]
    InvalidModel { lens: LensKind, reason: String },
    #[error("parameter index {index} is out of range")]
    ParameterIndex { index: usize },
}

/// Panoramic output size for a camera, its calibrated image size scaled per
/// axis.
pub fn panoramic_size(image_size: (u32, u32), scale: [f64; 2]) -> (u32, u32) {
    let side = |length: u32, factor: f64| ((length as f64 * factor).round() as u32).max(1);
    (side(image_size.0, scale[0]), side(image_size.1, scale[1]))
}

/// Build a rectification map with the equidistant fisheye model.
pub fn build_map(
    params: &FisheyeParams,
    output_size: (u32, u32),
    focal_expansion: f64,
) -> Result<RectificationMap, ProjectionError> {
    build_map_with(CameraModel::Fisheye, params, output_size, focal_expansion)
}

/// Build a rectification map using `model` as the primary lens model.
///
/// The target camera keeps the calibrated focal lengths scaled by
/// `focal_expansion` and has its principal point in the middle of
/// `output_size`.
pub fn build_map_with(
    model: CameraModel,
    params: &FisheyeParams,
    output_size: (u32, u32),
    focal_expansion: f64,
) -> Result<RectificationMap, ProjectionError> {
    let (width, height) = output_size;
    if width == 0 || height == 0 {
        return Err(ProjectionError::EmptyOutput { width, height });
    }
    if !focal_expansion.is_finite() || focal_expansion <= 0.0 {
        return Err(ProjectionError::InvalidExpansion(focal_expansion));
    }

    let camera = params.camera_matrix();
    let [fx, fy, _, _] = params.projection();
    let target = Matrix3::new(
        fx * focal_expansion,
        0.0,
        width as f64 / 2.0,
        0.0,
        fy * focal_expansion,
        height as f64 / 2.0,
        0.0,
        0.0,
        1.0,
    );
    let target_inv = target
        .try_inverse()
        .filter(|inverse| inverse.iter().all(|value| value.is_finite()))
        .ok_or(ProjectionError::SingularCamera)?;

    let max_radius = [
        (0.0, 0.0),
        (width as f64 - 1.0, 0.0),
        (0.0, height as f64 - 1.0),
        (width as f64 - 1.0, height as f64 - 1.0),
    ]
    .into_iter()
    .map(|(u, v)| {
        let ray = target_inv * Vector3::new(u, v, 1.0);
        (ray.x / ray.z).hypot(ray.y / ray.z)
    })
    .fold(0.0, f64::max);

    let primary = lens::lens_for(model, params);
    let lens: Box<dyn Lens> = match primary.validate(max_radius) {
        Ok(()) => primary,
        Err(reason) => {
            warn!(
                camera = params.camera_name(),
                lens = ?primary.kind(),
                %reason,
                "falling back to the pinhole model"
            );
            let fallback = PinholeLens::new(params.distortion());
            fallback
                .validate(max_radius)
                .map_err(|reason| ProjectionError::InvalidModel {
                    lens: LensKind::Pinhole,
                    reason,
                })?;
            Box::new(fallback)
        }
    };

    let map = RectificationMap::trace(output_size, &camera, &target_inv, lens.as_ref());
    info!(
        camera = params.camera_name(),
        width,
        height,
        focal_expansion,
        lens = ?map.lens(),
        "built rectification map"
    );

    Ok(map)
}

/// Calibration parameters together with the rectification map traced from
/// them.
#[derive(Clone, Debug)]
pub struct ProjectionEngine {
    params: FisheyeParams,
    output_size: (u32, u32),
    focal_expansion: f64,
    model: CameraModel,
    map: RectificationMap,
}

impl ProjectionEngine {
    pub fn new(
        params: FisheyeParams,
        output_size: (u32, u32),
        focal_expansion: f64,
        model: CameraModel,
    ) -> Result<Self, ProjectionError> {
        let map = build_map_with(model, &params, output_size, focal_expansion)?;
        Ok(Self {
            params,
            output_size,
            focal_expansion,
            model,
            map,
        })
    }

    /// Build an engine with the output scale, focal expansion and camera
    /// model from `config`.
    pub fn from_config(
        params: FisheyeParams,
        config: &ViewerConfig,
    ) -> Result<Self, ProjectionError> {
        let output_size = panoramic_size(params.image_size(), config.output_scale);
        Self::new(
            params,
            output_size,
            config.focal_expansion,
            config.camera_model,
        )
    }

    pub fn params(&self) -> &FisheyeParams {
        &self.params
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    pub fn focal_expansion(&self) -> f64 {
        self.focal_expansion
    }

    pub fn model(&self) -> CameraModel {
        self.model
    }

    pub fn map(&self) -> &RectificationMap {
        &self.map
    }

    /// Rectify `frame`. The result always has the engine's output size.
    pub fn apply(&self, frame: &Frame) -> Frame {
        apply(&self.map, frame)
    }
}
