//! Per-transcript fragment model and the sequencing-error model.

pub mod config;
pub mod error_model;
pub mod transcript;
