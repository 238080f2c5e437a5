//! Operator traits for every pipeline stage
//!
//! An operator is attached once per event stream. At attach time it may
//! read or extend the stream's schema and returns the handler that will
//! see every record of that stream, in ascending priority order.

use crate::field::FieldError;
use crate::params::{ParamError, Params};
use crate::record::Record;
use crate::schema::{EventSchema, SchemaError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Operator error type
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    #[error("Parameter error: {0}")]
    Param(#[from] ParamError),

    #[error("Decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Export sink {sink} failed: {source}")]
    Sink {
        sink: String,
        fatal: bool,
        #[source]
        source: SinkError,
    },

    #[error("Operator initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl OperatorError {
    /// Errors that must stop the owning pipeline instead of only the record
    pub fn is_fatal(&self) -> bool {
        matches!(self, OperatorError::Sink { fatal: true, .. })
    }
}

pub type OperatorResult<T> = Result<T, OperatorError>;

/// Export sink error type
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("export cancelled")]
    Cancelled,

    #[error("sink is closed")]
    Closed,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Well-known priorities. Lower values are delivered first.
pub mod priority {
    /// Filtering and enrichment that later stages rely on
    pub const ENRICH: i32 = 10;
    /// Protocol decoders
    pub const DECODE: i32 = 100;
    /// Terminal formatting and export
    pub const EXPORT: i32 = i32::MAX;
}

/// What happens to the rest of a delivery when a handler fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop delivering this record and report it as failed
    FailFast,
    /// Log the error and keep delivering to later operators
    BestEffort,
}

/// Outcome of handling one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Keep delivering to later operators
    Pass,
    /// Skip later operators for this record
    Drop,
}

/// Context available to operators while attaching
#[derive(Debug, Clone, Copy)]
pub struct AttachContext<'a> {
    /// Name of the pipeline being assembled
    pub pipeline: &'a str,
    /// Invocation parameters of the pipeline
    pub params: &'a Params,
    /// Cancelled when the pipeline stops
    pub cancel: &'a CancellationToken,
}

/// Basic operator information
pub trait OperatorInfo {
    /// Operator name
    fn name(&self) -> &str;

    /// Operator version
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// Operator description
    fn description(&self) -> &str {
        ""
    }
}

/// A pipeline stage
pub trait Operator: OperatorInfo + Send + Sync {
    /// Delivery rank, lower runs earlier
    fn priority(&self) -> i32;

    /// How handler errors are treated. Every operator must choose.
    fn error_policy(&self) -> ErrorPolicy;

    /// Inspect or extend the schema of one stream and return the handler
    /// for its records, or `None` to stay off this stream.
    ///
    /// Errors here are configuration errors and abort pipeline setup.
    fn attach(
        &self,
        ctx: &AttachContext<'_>,
        schema: &mut EventSchema,
    ) -> OperatorResult<Option<Box<dyn EventHandler>>>;
}

/// Per-stream record handler created by [`Operator::attach`]
#[async_trait]
pub trait EventHandler: Send {
    /// Handle one record. Called sequentially, never concurrently.
    async fn handle(
        &mut self,
        schema: &EventSchema,
        record: &mut Record,
    ) -> OperatorResult<EventAction>;

    /// Called once when the stream drains
    async fn flush(&mut self) -> OperatorResult<()> {
        Ok(())
    }
}

/// Destination for rendered records
#[async_trait]
pub trait ExportSink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one rendered record. Long writes must return
    /// [`SinkError::Cancelled`] once `cancel` fires.
    async fn export(
        &self,
        document: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> SinkResult<()>;

    /// Flush any buffered records
    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }
}
