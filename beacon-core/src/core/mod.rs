//! Shared building blocks: label sets and the error taxonomy

pub mod errors;
pub mod labels;

pub use errors::{ConfigError, DispatchError, MetricsError};
pub use labels::LabelSet;
