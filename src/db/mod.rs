//! Database layer.
//!
//! This module provides:
//! - The `Connection` / `ConnectionFactory` contract and the MySQL adapter
//! - The connection pool, its lease owners and background reaper
//! - Pool configs and the registry used to discard pools after a fork
//! - The schema cache and per-model schema definitions
//! - Row decoding, parameter binding and transaction control

pub mod connection;
pub mod model_schema;
pub mod mysql;
pub mod owner;
pub(crate) mod params;
pub mod pool;
pub mod pool_config;
mod reaper;
pub mod schema;
pub mod transaction;
pub mod types;

pub use connection::{Connection, ConnectionFactory};
pub use model_schema::{
    AttributeType, AttributesBuilder, DefaultAttribute, ModelDescriptor, ModelSchemaDefinition,
    PrimaryKey, RecordId, SchemaSnapshot,
};
pub use mysql::{MySqlAdapter, MySqlConnector};
pub use owner::{LeaseOwner, OwnerScope};
pub use pool::{ConnectionPool, PoolSettings, PoolStat, PooledConnection};
pub use pool_config::{ManagedPool, PoolConfig, PoolRegistry};
pub use schema::{SchemaCache, SchemaSource, StaticSchemaSource};
pub use transaction::{IsolationLevel, begin_transaction, commit, rollback};
