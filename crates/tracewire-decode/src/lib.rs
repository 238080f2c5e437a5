//! Record decoders for tracewire
//!
//! - **DnsOperator**: parses the DNS message carried in a captured packet
//! - **ArgsOperator**: turns a NUL-delimited argv buffer into a command line

pub mod args;
pub mod dns;

pub use args::ArgsOperator;
pub use dns::{DecodeError, DnsOperator};
