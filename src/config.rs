//! Tunables for the viewer and its loading pipeline.

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::{
    dataset::Layout,
    projection::CameraModel,
    scheduler::{LoaderConfig, RetryPolicy},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Entries decoded and promoted before the first frame is shown.
    pub initial_load_count: usize,
    pub num_workers: usize,
    /// Pause between two loads of the same worker, in milliseconds.
    pub worker_delay_ms: u64,
    pub retry: RetryPolicy,

    /// Largest side of a rectified frame after display scaling.
    pub display_max: u32,
    pub focal_expansion: f64,
    /// Panoramic output size relative to the calibrated image size.
    pub output_scale: [f64; 2],
    pub camera_model: CameraModel,

    pub stereo_limit: usize,
    pub mono_limit: usize,

    pub stereo_window: (u32, u32),
    pub mono_window: (u32, u32),
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            initial_load_count: 10,
            num_workers: 4,
            worker_delay_ms: 5,
            retry: RetryPolicy::default(),
            display_max: 1800,
            focal_expansion: 2.5,
            output_scale: [2.5, 1.5],
            camera_model: CameraModel::default(),
            stereo_limit: 1000,
            mono_limit: 2000,
            stereo_window: (1600, 800),
            mono_window: (1280, 720),
        }
    }
}

impl ViewerConfig {
    /// Read a JSON config. Missing fields take their default value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry attempts must be at least 1".into()));
        }
        if self.display_max == 0 {
            return Err(ConfigError::Invalid("display_max must be positive".into()));
        }
        if self.output_scale.iter().any(|scale| !(*scale > 0.0)) {
            return Err(ConfigError::Invalid("output_scale must be positive".into()));
        }
        Ok(())
    }

    /// Dataset size above which the user is asked before loading everything.
    pub fn dataset_limit(&self, layout: Layout) -> usize {
        match layout {
            Layout::Mono => self.mono_limit,
            Layout::Stereo => self.stereo_limit,
        }
    }

    pub fn window_size(&self, layout: Layout) -> (u32, u32) {
        match layout {
            Layout::Mono => self.mono_window,
            Layout::Stereo => self.stereo_window,
        }
    }

    pub fn loader(&self) -> LoaderConfig {
        LoaderConfig {
            initial_load_count: self.initial_load_count,
            num_workers: self.num_workers,
            worker_delay: Duration::from_millis(self.worker_delay_ms),
            retry: self.retry,
        }
    }
}
