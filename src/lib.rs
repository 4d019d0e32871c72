//! component-chunks library
//!
//! Chunk graph model and chunk optimization passes for the Component build tool.

pub mod bundler;
pub mod cli;
pub mod config;
pub mod error;
pub mod optimize;
pub mod utils;

pub use bundler::{BuildResult, Bundler, Compilation};
pub use cli::Cli;
pub use config::Config;
pub use error::{Error, Result};
