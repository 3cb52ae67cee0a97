//! Types shared between the Hostblock library and CLI.

pub mod errors;

pub use errors::{HostblockError, HostblockResult};
