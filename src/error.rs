use thiserror::Error;

use crate::{
    cache::CacheError, calibration::CalibrationError, config::ConfigError, dataset::SetupError,
    display::SurfaceError, frame::DecodeError, projection::ProjectionError,
};

/// Every failure the crate can report, grouped by the component that raised it.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
