// #![warn(missing_docs)]

//! Background-loading viewer and rectifier for fisheye camera datasets.
//!
//! A [`dataset::Dataset`] is scanned from one or two directories. A
//! [`scheduler::LoadScheduler`] decodes its images into an
//! [`cache::ImageCache`], optionally rectifying every frame through a
//! [`projection::ProjectionEngine`] built from the camera's
//! [`calibration::FisheyeParams`]. The [`viewer::Viewer`] draws the current
//! entry onto a [`display::DisplaySurface`].

#[allow(missing_docs)]
pub mod error;

pub mod cache;
pub mod calibration;
pub mod config;
pub mod dataset;
pub mod display;
pub mod frame;
pub mod projection;
pub mod scheduler;
pub mod viewer;

pub use error::Error;
