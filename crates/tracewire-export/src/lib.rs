//! Export stage for tracewire
//!
//! Renders every record as a JSON document and hands it to a sink.

pub mod format;
pub mod jsonl;
pub mod operator;
pub mod stdout;

pub use format::render;
pub use jsonl::{JsonlSink, JsonlSinkConfig};
pub use operator::ExportOperator;
pub use stdout::StdoutSink;
