//! Enrichment operators for tracewire

pub mod host;
pub mod local_manager;

pub use host::HostOperator;
pub use local_manager::{LocalManager, LocalManagerOperator, ProcessMeta};
