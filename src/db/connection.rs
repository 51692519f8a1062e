//! The adapter contract the pool is generic over.
//!
//! A `Connection` wraps one physical driver handle. Statement methods take
//! `&mut self`, so a connection serves one statement at a time; concurrent work
//! needs more connections from the pool.

use crate::error::DbResult;
use crate::models::{QueryParam, QueryResult, RawResult, TableMetadata};
use async_trait::async_trait;

#[async_trait]
pub trait Connection: Send + 'static {
    /// Send a statement and wait for it to finish.
    async fn execute(&mut self, sql: &str) -> DbResult<RawResult>;

    /// Run a statement with positional binds and collect its rows.
    async fn exec_query(&mut self, sql: &str, binds: &[QueryParam]) -> DbResult<QueryResult>;

    /// AUTO_INCREMENT value generated by the last statement, if any.
    fn last_inserted_id(&self) -> Option<u64>;

    /// Rows changed by the last statement.
    fn affected_rows(&self) -> u64;

    /// True while a statement was sent but its result never fully read, e.g. the
    /// caller dropped the future mid-query. Such a connection is in an unknown state.
    fn statement_in_flight(&self) -> bool;

    /// True once a statement or ping failed at the connection level. Cleared by a
    /// successful `reconnect`. The pool never returns such a connection to idle.
    fn connection_lost(&self) -> bool;

    /// Release hook run by the pool on checkin.
    fn on_checkin(&mut self) {}

    /// Round-trip to the server.
    async fn is_active(&mut self) -> bool;

    /// Clear session state so the connection can be handed to another owner.
    async fn reset(&mut self) -> DbResult<()>;

    /// Replace the physical handle with a new one.
    async fn reconnect(&mut self) -> DbResult<()>;

    /// Close gracefully. Statement methods fail afterwards.
    async fn disconnect(&mut self) -> DbResult<()>;

    /// Columns and primary key of `table`.
    async fn describe_table(&mut self, table: &str) -> DbResult<TableMetadata>;

    /// Server version string.
    async fn server_version(&mut self) -> DbResult<String>;
}

/// Opens new physical connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> DbResult<Self::Connection>;
}
