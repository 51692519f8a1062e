//! record-pool library
//!
//! Connection pooling and asynchronous MySQL/MariaDB integration for an ORM
//! runtime: a pool that leases connections to threads or tokio tasks, a
//! non-blocking adapter, and a schema cache with per-model schema definitions.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod relation;

pub use config::{Config, DatabaseConfig, PoolClass};
pub use db::{ConnectionPool, PoolConfig, PoolRegistry, SchemaCache};
pub use error::{DbError, DbResult};
