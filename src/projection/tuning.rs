//! Live re-tuning of projection parameters.
//!
//! A UI holds the [`Sender`] half and pushes [`ParamDelta`] messages; the
//! [`Tuner`] owns the engine and rebuilds its map when deltas arrive.

use std::{
    str::FromStr,
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
};
use thiserror::Error;
use tracing::{info, warn};

use super::{ProjectionEngine, ProjectionError};

/// A single change to the inputs of a rectification map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamDelta {
    /// Set distortion coefficient `index` (0 to 3, `k1` to `k4`).
    Distortion { index: usize, value: f64 },
    /// Set projection parameter `index` (0 to 3, `fx`, `fy`, `cx`, `cy`).
    Projection { index: usize, value: f64 },
    Xi(f64),
    FocalExpansion(f64),
    OutputSize { width: u32, height: u32 },
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseDeltaError {
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),
    #[error("expected {expected} value(s) for {name}")]
    MissingValue { name: String, expected: usize },
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
}

impl FromStr for ParamDelta {
    type Err = ParseDeltaError;

    /// Parses `<name> <value>` such as `k2 1.6` or `expand 4`, and
    /// `size <width> <height>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let name = tokens.next().unwrap_or_default().to_ascii_lowercase();
        let values: Vec<&str> = tokens.collect();

        let number = |expected: usize| -> Result<Vec<f64>, ParseDeltaError> {
            if values.len() != expected {
                return Err(ParseDeltaError::MissingValue {
                    name: name.clone(),
                    expected,
                });
            }
            values
                .iter()
                .map(|token| {
                    token
                        .parse::<f64>()
                        .map_err(|_| ParseDeltaError::InvalidNumber(token.to_string()))
                })
                .collect()
        };

        let delta = match name.as_str() {
            "k1" | "k2" | "k3" | "k4" => ParamDelta::Distortion {
                index: (name.as_bytes()[1] - b'1') as usize,
                value: number(1)?[0],
            },
            "fx" | "fy" | "cx" | "cy" => ParamDelta::Projection {
                index: ["fx", "fy", "cx", "cy"]
                    .iter()
                    .position(|candidate| *candidate == name)
                    .unwrap_or_default(),
                value: number(1)?[0],
            },
            "xi" => ParamDelta::Xi(number(1)?[0]),
            "expand" | "expansion" => ParamDelta::FocalExpansion(number(1)?[0]),
            "size" => {
                let size = number(2)?;
                let side = |value: f64| {
                    (value >= 1.0 && value.fract() == 0.0 && value <= u32::MAX as f64)
                        .then_some(value as u32)
                        .ok_or_else(|| ParseDeltaError::InvalidNumber(value.to_string()))
                };
                ParamDelta::OutputSize {
                    width: side(size[0])?,
                    height: side(size[1])?,
                }
            }
            _ => return Err(ParseDeltaError::UnknownParameter(name)),
        };

        Ok(delta)
    }
}

/// Owns a [`ProjectionEngine`] and rebuilds it whenever deltas arrive.
pub struct Tuner {
    engine: ProjectionEngine,
    receiver: Receiver<ParamDelta>,
}

impl Tuner {
    /// Returns the tuner and the sender used to submit deltas.
    pub fn new(engine: ProjectionEngine) -> (Self, Sender<ParamDelta>) {
        let (sender, receiver) = mpsc::channel();
        (Self { engine, receiver }, sender)
    }

    pub fn engine(&self) -> &ProjectionEngine {
        &self.engine
    }

    pub fn into_engine(self) -> ProjectionEngine {
        self.engine
    }

    /// Apply every delta already queued and rebuild the map once.
    ///
    /// Returns `Ok(false)` if nothing was queued. If the rebuild fails the
    /// previous engine is kept.
    pub fn poll(&mut self) -> Result<bool, ProjectionError> {
        let mut pending = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(delta) => pending.push(delta),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if pending.is_empty() {
            return Ok(false);
        }
        self.rebuild(&pending)?;
        Ok(true)
    }

    /// Block until a delta arrives, then apply it together with any others
    /// already queued.
    ///
    /// Returns `None` once every sender has been dropped.
    pub fn wait(&mut self) -> Option<Result<(), ProjectionError>> {
        let first = self.receiver.recv().ok()?;
        let mut pending = vec![first];
        pending.extend(self.receiver.try_iter());
        Some(self.rebuild(&pending))
    }

    fn rebuild(&mut self, deltas: &[ParamDelta]) -> Result<(), ProjectionError> {
        let mut params = self.engine.params().clone();
        let mut output_size = self.engine.output_size();
        let mut focal_expansion = self.engine.focal_expansion();

        for delta in deltas {
            match *delta {
                ParamDelta::Distortion { index, value } => {
                    let mut distortion = params.distortion();
                    let slot = distortion
                        .get_mut(index)
                        .ok_or(ProjectionError::ParameterIndex { index })?;
                    *slot = value;
                    params = params.with_distortion(distortion);
                }
                ParamDelta::Projection { index, value } => {
                    let mut projection = params.projection();
                    let slot = projection
                        .get_mut(index)
                        .ok_or(ProjectionError::ParameterIndex { index })?;
                    *slot = value;
                    params = params.with_projection(projection);
                }
                ParamDelta::Xi(xi) => params = params.with_xi(xi),
                ParamDelta::FocalExpansion(value) => focal_expansion = value,
                ParamDelta::OutputSize { width, height } => output_size = (width, height),
            }
        }

        match ProjectionEngine::new(params, output_size, focal_expansion, self.engine.model()) {
            Ok(engine) => {
                info!(
                    deltas = deltas.len(),
                    focal_expansion,
                    ?output_size,
                    "rebuilt rectification map"
                );
                self.engine = engine;
                Ok(())
            }
            Err(err) => {
                warn!(%err, "keeping previous rectification map");
                Err(err)
            }
        }
    }
}
