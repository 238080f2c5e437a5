//! tracewire core - record layout, operator traits, and pipeline orchestration
//!
//! This crate provides the foundational types and abstractions for tracewire:
//!
//! - **Fields & schemas**: typed accessors over raw kernel records
//! - **Operators**: trait definitions for every pipeline stage
//! - **Streams**: priority-ordered delivery of records to operators
//! - **Pipelines & registry**: concurrent execution with cancellation
//! - **Config**: TOML configuration for the sensor

pub mod config;
pub mod field;
pub mod image;
pub mod metrics;
pub mod operator;
pub mod params;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod stream;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use field::{Field, FieldError, FieldKind, FieldValue};
pub use image::{GadgetImage, ImageError};
pub use metrics::{PipelineStats, StatsSnapshot};
pub use operator::{
    priority, AttachContext, ErrorPolicy, EventAction, EventHandler, ExportSink, Operator,
    OperatorError, OperatorInfo, OperatorResult, SinkError, SinkResult,
};
pub use params::{operator_key, ParamError, Params};
pub use pipeline::{EventFailure, Pipeline, PipelineConfig, PipelineError};
pub use record::Record;
pub use registry::{Registry, RegistryError, RunReport, SharedResource};
pub use runtime::{GadgetInstance, GadgetRuntime, RuntimeError, RuntimeResult, StreamSource};
pub use schema::{EventSchema, SchemaError};
pub use stream::{Delivery, DeliveryError, EventStream};

/// tracewire version
pub const TRACEWIRE_VERSION: &str = env!("CARGO_PKG_VERSION");
