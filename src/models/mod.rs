//! Data models for record-pool.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod schema;

// Re-export commonly used types
pub use query::{QueryParam, QueryResult, RawResult};
pub use schema::{ColumnDefinition, TableMetadata, parse_default_value};
