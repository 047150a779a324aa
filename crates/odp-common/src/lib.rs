//! Shared types, errors and logging for the ODP import pipeline.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{OdpError, Result};
pub use types::{DatasetVersion, RawFileDescriptor, TableKind};
