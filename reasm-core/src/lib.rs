#![forbid(unsafe_code)]

pub mod config;
pub mod error;

pub use config::{PipelineConfig, ReasmConfig, ReassemblyConfig, CONFIG_ENV};
pub use error::{ReasmError, ReasmResult};
