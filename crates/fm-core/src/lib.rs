//! Core types and configuration for the foreman pipeline engine.
//!
//! Everything shared across the workspace lives here: the job/pipeline/event
//! data model and the TOML configuration loaded from `~/.foreman/config.toml`.

pub mod config;
pub mod types;

pub use config::{Config, ConfigError};
