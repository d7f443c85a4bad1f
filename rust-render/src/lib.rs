//! rust-render: renders timeline projects into encoded video files.
//!
//! Producers enqueue a [`project::ProjectSpec`]; a pool of workers claims
//! jobs from a durable SQLite queue, renders frames on the CPU and streams
//! them to an encoder subprocess through the export bridge. Finished files
//! are handed off as [`artifact::ArtifactReference`]s.

pub mod artifact;
pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod logging;
pub mod pipeline;
pub mod project;
pub mod render;
pub mod runner;
pub mod workspace;

pub use error::{Error, Result};
