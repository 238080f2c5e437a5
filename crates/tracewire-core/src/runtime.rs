//! Instrumentation runtime boundary
//!
//! A runtime turns a [`GadgetImage`] plus parameters into one or more
//! streams of raw records. The pipeline owns what happens to them.

use crate::image::GadgetImage;
use crate::params::{ParamError, Params};
use crate::schema::{EventSchema, SchemaError};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Runtime initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Unsupported gadget image: {0}")]
    UnsupportedImage(String),

    #[error("Gadget {gadget} failed: {reason}")]
    GadgetFailed { gadget: String, reason: String },

    #[error("Parameter error: {0}")]
    Param(#[from] ParamError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// One named stream emitted by a running gadget
pub struct StreamSource {
    /// Static layout of the stream's records
    pub schema: EventSchema,
    /// Raw static payloads, one per event
    pub events: mpsc::Receiver<Vec<u8>>,
}

/// A started gadget
pub struct GadgetInstance {
    pub streams: Vec<StreamSource>,
    /// Resolves when the gadget stops emitting. Senders of every stream
    /// are dropped by then.
    pub completion: JoinHandle<RuntimeResult<()>>,
}

/// Collaborator that runs instrumentation programs
#[async_trait]
pub trait GadgetRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Start emitting. The runtime must stop once `cancel` fires.
    async fn start(
        &self,
        image: &GadgetImage,
        params: &Params,
        cancel: CancellationToken,
    ) -> RuntimeResult<GadgetInstance>;
}
