//! Core types: errors, configuration, mount-point paths.

pub mod config;
pub mod errors;
pub mod paths;
