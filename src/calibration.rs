//! Camera calibration records in the KITTI-360 file formats.
//!
//! Fisheye cameras are described by MEI-style YAML files (`image_02.yaml`,
//! `image_03.yaml`). The remaining rig calibration (camera to pose, rigid
//! sensor transforms and rectified perspective intrinsics) uses a plain text
//! format of `name: v0 v1 ...` lines.

use nalgebra::{Matrix3, Matrix4};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration file {path} does not exist or is unreadable")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed calibration in {origin}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("expected {expected} values for {name} but got {found}")]
    ValueCount {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// Intrinsic calibration of one fisheye camera.
///
/// The distortion coefficients are stored in the order used by the
/// equidistant fisheye model, `[k1, k2, k3, k4]`. MEI calibration files name
/// the last two coefficients `p1` and `p2`; they are carried over as `k3` and
/// `k4` unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FisheyeParams {
    camera_name: String,
    image_width: u32,
    image_height: u32,
    xi: f64,
    distortion: [f64; 4],
    projection: [f64; 4],
}

impl FisheyeParams {
    /// Create a parameter record.
    ///
    /// `projection` is `[fx, fy, cx, cy]`. Returns an error if either image
    /// dimension is zero.
    pub fn new(
        camera_name: impl Into<String>,
        image_size: (u32, u32),
        xi: f64,
        distortion: [f64; 4],
        projection: [f64; 4],
    ) -> Result<Self, CalibrationError> {
        let (image_width, image_height) = image_size;
        if image_width == 0 || image_height == 0 {
            return Err(CalibrationError::InvalidValue {
                field: "image size".into(),
                reason: format!("{image_width}x{image_height} has a zero dimension"),
            });
        }

        Ok(Self {
            camera_name: camera_name.into(),
            image_width,
            image_height,
            xi,
            distortion,
            projection,
        })
    }

    /// Read a MEI-style YAML calibration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| CalibrationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let params = Self::parse(&text, &path.display().to_string())?;
        debug!(path = %path.display(), camera = %params.camera_name, "loaded fisheye calibration");
        Ok(params)
    }

    /// Parse the contents of a MEI-style YAML calibration file.
    pub fn from_yaml_str(text: &str) -> Result<Self, CalibrationError> {
        Self::parse(text, "<string>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self, CalibrationError> {
        let file: MeiFile = serde_yaml::from_str(&strip_directives(text)).map_err(|source| {
            CalibrationError::Parse {
                origin: origin.to_string(),
                source,
            }
        })?;

        if let Some(model_type) = &file.model_type
            && !model_type.eq_ignore_ascii_case("MEI")
        {
            warn!(%model_type, "calibration is not a MEI model, reading it as one anyway");
        }

        let dimension = |field: &str, value: i64| {
            u32::try_from(value)
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| CalibrationError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("expected a positive integer but got {value}"),
                })
        };

        let d = file.distortion_parameters;
        let p = file.projection_parameters;
        Self::new(
            file.camera_name,
            (
                dimension("image_width", file.image_width)?,
                dimension("image_height", file.image_height)?,
            ),
            file.mirror_parameters.xi,
            [d.k1, d.k2, d.p1, d.p2],
            [p.gamma1, p.gamma2, p.u0, p.v0],
        )
    }

    pub fn camera_name(&self) -> &str {
        &self.camera_name
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    /// Mirror parameter of the unified camera model.
    pub fn xi(&self) -> f64 {
        self.xi
    }

    /// Fisheye distortion coefficients `[k1, k2, k3, k4]`.
    pub fn distortion(&self) -> [f64; 4] {
        self.distortion
    }

    /// Projection parameters `[fx, fy, cx, cy]`.
    pub fn projection(&self) -> [f64; 4] {
        self.projection
    }

    /// Camera intrinsic matrix built from the projection parameters.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        let [fx, fy, cx, cy] = self.projection;
        Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
    }

    /// Returns a copy with different distortion coefficients.
    pub fn with_distortion(mut self, distortion: [f64; 4]) -> Self {
        self.distortion = distortion;
        self
    }

    /// Returns a copy with different projection parameters.
    pub fn with_projection(mut self, projection: [f64; 4]) -> Self {
        self.projection = projection;
        self
    }

    /// Returns a copy with a different mirror parameter.
    pub fn with_xi(mut self, xi: f64) -> Self {
        self.xi = xi;
        self
    }
}

#[derive(Deserialize)]
struct MeiFile {
    #[serde(default)]
    model_type: Option<String>,
    camera_name: String,
    image_width: i64,
    image_height: i64,
    mirror_parameters: MirrorParameters,
    distortion_parameters: DistortionParameters,
    projection_parameters: ProjectionParameters,
}

#[derive(Deserialize)]
struct MirrorParameters {
    xi: f64,
}

#[derive(Deserialize)]
struct DistortionParameters {
    k1: f64,
    k2: f64,
    p1: f64,
    p2: f64,
}

#[derive(Deserialize)]
struct ProjectionParameters {
    gamma1: f64,
    gamma2: f64,
    u0: f64,
    v0: f64,
}

/// OpenCV writes a `%YAML:1.0` directive that YAML parsers reject.
fn strip_directives(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('%'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rectified perspective camera intrinsics from `perspective.txt`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerspectiveIntrinsics {
    /// `P_rect_XX` projection matrices padded to homogeneous 4x4.
    pub projections: BTreeMap<String, Matrix4<f64>>,
    /// `R_rect_XX` rectifying rotations.
    pub rectifications: BTreeMap<String, Matrix3<f64>>,
}

/// Find the `name:` line in `text` and parse exactly `rows * cols` values.
///
/// Returns `Ok(None)` if the variable is absent.
pub fn read_variable(
    text: &str,
    name: &str,
    rows: usize,
    cols: usize,
) -> Result<Option<Vec<f64>>, CalibrationError> {
    let prefix = format!("{name}:");
    let Some(line) = text.lines().find(|line| line.starts_with(&prefix)) else {
        return Ok(None);
    };

    let values = parse_values(&line[prefix.len()..], name)?;
    if values.len() != rows * cols {
        return Err(CalibrationError::ValueCount {
            name: name.to_string(),
            expected: rows * cols,
            found: values.len(),
        });
    }

    Ok(Some(values))
}

fn parse_values(text: &str, name: &str) -> Result<Vec<f64>, CalibrationError> {
    text.split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|err| CalibrationError::InvalidValue {
                    field: name.to_string(),
                    reason: format!("{token:?}: {err}"),
                })
        })
        .collect()
}

/// Pad a row-major 3x4 transform with `[0 0 0 1]`.
fn homogeneous(values: &[f64]) -> Matrix4<f64> {
    Matrix4::from_fn(|row, col| match row {
        0..=2 => values[row * 4 + col],
        _ if col == 3 => 1.0,
        _ => 0.0,
    })
}

fn read_text(path: &Path) -> Result<String, CalibrationError> {
    fs::read_to_string(path).map_err(|source| CalibrationError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `calib_cam_to_pose.txt`: one 4x4 transform per camera that is present.
pub fn load_cam_to_pose(
    path: impl AsRef<Path>,
) -> Result<BTreeMap<String, Matrix4<f64>>, CalibrationError> {
    let text = read_text(path.as_ref())?;
    let mut transforms = BTreeMap::new();
    for camera in ["image_00", "image_01", "image_02", "image_03"] {
        if let Some(values) = read_variable(&text, camera, 3, 4)? {
            transforms.insert(camera.to_string(), homogeneous(&values));
        }
    }

    Ok(transforms)
}

/// Load a rigid transform file holding exactly twelve values (a row-major 3x4).
pub fn load_rigid(path: impl AsRef<Path>) -> Result<Matrix4<f64>, CalibrationError> {
    let path = path.as_ref();
    let values = parse_values(&read_text(path)?, &path.display().to_string())?;
    if values.len() != 12 {
        return Err(CalibrationError::ValueCount {
            name: path.display().to_string(),
            expected: 12,
            found: values.len(),
        });
    }

    Ok(homogeneous(&values))
}

/// Load `perspective.txt` for the two perspective cameras.
pub fn load_perspective(path: impl AsRef<Path>) -> Result<PerspectiveIntrinsics, CalibrationError> {
    let text = read_text(path.as_ref())?;
    let mut intrinsics = PerspectiveIntrinsics::default();
    for camera in ["00", "01"] {
        let name = format!("P_rect_{camera}");
        if let Some(values) = read_variable(&text, &name, 3, 4)? {
            intrinsics.projections.insert(name, homogeneous(&values));
        }

        let name = format!("R_rect_{camera}");
        if let Some(values) = read_variable(&text, &name, 3, 3)? {
            intrinsics
                .rectifications
                .insert(name, Matrix3::from_row_slice(&values));
        }
    }

    Ok(intrinsics)
}
