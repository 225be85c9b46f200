//! Centralized configuration distribution
//!
//! Services resolve their configuration once, at startup, from a single
//! backing source. Resolution either produces a complete document or fails
//! hard: running with incorrect settings is worse than refusing to start,
//! so nothing here ever substitutes defaults.

pub mod client;
pub mod document;
pub mod error;
pub mod source;

pub use client::HttpResolver;
pub use document::ConfigDocument;
pub use error::ConfigError;
pub use source::{ConfigSource, FileSource};
