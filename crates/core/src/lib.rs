//! Core library for container image checks
//!
//! This crate contains the command-verification harness: launching containers
//! from base images (optionally with an overlay built on top), running commands
//! in them with exit-code assertions, probing their state through predicates,
//! and tearing them down. It also carries the runtime integration, logging,
//! configuration and error handling shared by test suites.

pub mod command;
pub mod config;
pub mod container;
pub mod containerfile;
pub mod docker;
pub mod errors;
pub mod harness;
pub mod image;
pub mod logging;
pub mod poll;
pub mod predicate;
pub mod runtime;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
