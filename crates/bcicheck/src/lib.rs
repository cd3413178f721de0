//! Checks for the Python base container images
//!
//! [`matrix`] lists the images under test and the lifetime each one gets;
//! [`scenarios`] holds the checks run against them. The integration tests in
//! `tests/` wire the two together against a real container runtime.

pub mod matrix;
pub mod scenarios;

pub use matrix::{base_images, trainer_images, ImageEntry, PythonVariant};
