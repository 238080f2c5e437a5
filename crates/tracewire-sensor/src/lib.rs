//! tracewire sensor
//!
//! Turns a [`SensorConfig`] into a [`Registry`] of runnable pipelines.
//! The `tracewire` binary is a thin CLI around this crate.

pub mod logging;
pub mod setup;

pub use setup::{
    build_registry, resolve_image, synthetic_runtime, write_default_config, write_metrics,
    SetupError,
};

pub use tracewire_core::config::SensorConfig;
pub use tracewire_core::Registry;
