//! Capture layer for tracewire
//!
//! Record layouts of the built-in gadgets and a synthetic runtime that
//! emits records in those layouts without kernel instrumentation.

pub mod layouts;
pub mod synthetic;

pub use layouts::{builtin_image, schema_for, DnsEvent, ExecEvent, TRACE_DNS, TRACE_EXEC};
pub use synthetic::{SyntheticConfig, SyntheticRuntime};
