use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::calibration::FisheyeParams;

/// Primary model used to turn calibration parameters into a rectification map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraModel {
    /// Equidistant fisheye model with four radial coefficients.
    #[default]
    Fisheye,
    /// Unified (MEI) omnidirectional model using the mirror parameter.
    Mei,
}

/// The lens model a map was actually built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LensKind {
    Equidistant,
    Unified,
    /// Plain pinhole with radial-tangential distortion, the fallback model.
    Pinhole,
}

/// Maps undistorted normalized image coordinates onto distorted normalized
/// coordinates of the source camera.
pub trait Lens: Sync {
    fn kind(&self) -> LensKind;

    /// Check that the model is well behaved for rays up to `max_radius` away
    /// from the optical axis on the normalized image plane.
    fn validate(&self, max_radius: f64) -> Result<(), String>;

    /// Returns `None` if the ray has no image under this model.
    fn distort(&self, point: Vector2<f64>) -> Option<Vector2<f64>>;
}

pub(crate) fn lens_for(model: CameraModel, params: &FisheyeParams) -> Box<dyn Lens> {
    match model {
        CameraModel::Fisheye => Box::new(EquidistantLens::new(params.distortion())),
        CameraModel::Mei => Box::new(UnifiedLens::new(params.xi(), params.distortion())),
    }
}

fn all_finite(values: &[f64]) -> Result<(), String> {
    match values.iter().find(|value| !value.is_finite()) {
        Some(value) => Err(format!("coefficient {value} is not finite")),
        None => Ok(()),
    }
}

fn finite(point: Vector2<f64>) -> Option<Vector2<f64>> {
    (point.x.is_finite() && point.y.is_finite()).then_some(point)
}

/// Equidistant fisheye, `theta_d = theta (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EquidistantLens {
    k: [f64; 4],
}

impl EquidistantLens {
    /// Number of samples used to check that `theta_d` is monotonic.
    const VALIDATION_STEPS: usize = 512;

    pub fn new(k: [f64; 4]) -> Self {
        Self { k }
    }

    fn theta_d(&self, theta: f64) -> f64 {
        let [k1, k2, k3, k4] = self.k;
        let t2 = theta * theta;
        theta * (1.0 + t2 * (k1 + t2 * (k2 + t2 * (k3 + t2 * k4))))
    }

    fn theta_d_slope(&self, theta: f64) -> f64 {
        let [k1, k2, k3, k4] = self.k;
        let t2 = theta * theta;
        1.0 + t2 * (3.0 * k1 + t2 * (5.0 * k2 + t2 * (7.0 * k3 + t2 * 9.0 * k4)))
    }
}

impl Lens for EquidistantLens {
    fn kind(&self) -> LensKind {
        LensKind::Equidistant
    }

    fn validate(&self, max_radius: f64) -> Result<(), String> {
        all_finite(&self.k)?;

        // Distorted radius must grow with the incidence angle, otherwise the
        // map folds back onto itself.
        let theta_max = max_radius.atan();
        for step in 0..=Self::VALIDATION_STEPS {
            let theta = theta_max * step as f64 / Self::VALIDATION_STEPS as f64;
            let slope = self.theta_d_slope(theta);
            if !slope.is_finite() || slope <= 0.0 {
                return Err(format!(
                    "distorted angle is not increasing at theta = {:.4} rad",
                    theta
                ));
            }
        }

        Ok(())
    }

    fn distort(&self, point: Vector2<f64>) -> Option<Vector2<f64>> {
        let r = point.norm();
        let theta = r.atan();
        let scale = if r > 0.0 { self.theta_d(theta) / r } else { 1.0 };

        finite(point * scale)
    }
}

/// Brown-Conrady radial-tangential distortion `(k1, k2, p1, p2)`.
fn radial_tangential(point: Vector2<f64>, [k1, k2, p1, p2]: [f64; 4]) -> Vector2<f64> {
    let (x, y) = (point.x, point.y);
    let r2 = x * x + y * y;
    let radial = 1.0 + r2 * (k1 + r2 * k2);
    Vector2::new(
        x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
        y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
    )
}

/// Unified camera model: project onto the unit sphere, shift the projection
/// centre by `xi`, then apply radial-tangential distortion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnifiedLens {
    xi: f64,
    coefficients: [f64; 4],
}

impl UnifiedLens {
    pub fn new(xi: f64, coefficients: [f64; 4]) -> Self {
        Self { xi, coefficients }
    }
}

impl Lens for UnifiedLens {
    fn kind(&self) -> LensKind {
        LensKind::Unified
    }

    fn validate(&self, _max_radius: f64) -> Result<(), String> {
        all_finite(&self.coefficients)?;
        all_finite(&[self.xi])?;
        match self.xi < 0.0 {
            true => Err(format!("mirror parameter {} is negative", self.xi)),
            false => Ok(()),
        }
    }

    fn distort(&self, point: Vector2<f64>) -> Option<Vector2<f64>> {
        let norm = (point.norm_squared() + 1.0).sqrt();
        let denom = 1.0 / norm + self.xi;
        if denom <= f64::EPSILON {
            return None;
        }

        let projected = point / norm / denom;
        finite(radial_tangential(projected, self.coefficients))
    }
}

/// Pinhole model with radial-tangential distortion.
///
/// Reads the four calibration coefficients as `(k1, k2, p1, p2)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PinholeLens {
    coefficients: [f64; 4],
}

impl PinholeLens {
    pub fn new(coefficients: [f64; 4]) -> Self {
        Self { coefficients }
    }
}

impl Lens for PinholeLens {
    fn kind(&self) -> LensKind {
        LensKind::Pinhole
    }

    fn validate(&self, _max_radius: f64) -> Result<(), String> {
        all_finite(&self.coefficients)
    }

    fn distort(&self, point: Vector2<f64>) -> Option<Vector2<f64>> {
        finite(radial_tangential(point, self.coefficients))
    }
}
