//! Core module - Common types, config, process context and error handling

pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use config::Config;
pub use context::EngineContext;
pub use error::{Error, Result};
pub use types::*;
