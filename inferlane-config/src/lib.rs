//! Configuration loading for inferlane.
//!
//! [`InferlaneConfig`] bundles the scheduler and watcher settings. It can be
//! read from a TOML or JSON file, from inline JSON in the environment, or left
//! at its defaults; [`ConfigSource`] records which one won. The
//! `inferlane-watch` binary in this crate is the reference consumer.

pub mod models;
pub mod validation;

pub use models::{
    CONFIG_JSON_ENV, CONFIG_PATH_ENV, ConfigFormat, ConfigSource, InferlaneConfig,
};
pub use validation::{ConfigGuardRailError, ConfigGuardRails};
