//! Repository layer for database access.

pub mod job;

pub use job::*;
