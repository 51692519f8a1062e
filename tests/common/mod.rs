//! In-memory adapter for exercising the pool without a server.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use record_pool::db::{Connection, ConnectionFactory};
use record_pool::error::{DbError, DbResult};
use record_pool::models::{QueryParam, QueryResult, RawResult, TableMetadata};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Statements containing this marker sleep for `Behaviour::statement_delay`.
pub const SLOW: &str = "SLEEP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Network-level failure; the connection is unusable afterwards.
    Connection,
    /// Server rejected the statement.
    Database,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub resets: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub pings: AtomicUsize,
}

impl Counters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Behaviour {
    pub fail_connect: AtomicBool,
    pub fail_reset: AtomicBool,
    pub alive: AtomicBool,
    pub statement_delay: Mutex<Duration>,
    /// Consumed front to back by the next statements.
    pub failures: Mutex<VecDeque<Failure>>,
    pub tables: Mutex<HashMap<String, TableMetadata>>,
    /// Every statement sent, in order, across all connections.
    pub statements: Mutex<Vec<String>>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            fail_connect: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            statement_delay: Mutex::new(Duration::from_secs(10)),
            failures: Mutex::new(VecDeque::new()),
            tables: Mutex::new(HashMap::new()),
            statements: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    pub counters: Arc<Counters>,
    pub behaviour: Arc<Behaviour>,
    next_id: Arc<AtomicU64>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: TableMetadata) -> Self {
        self.behaviour
            .tables
            .lock()
            .insert(table.table_name.clone(), table);
        self
    }

    pub fn fail_next(&self, failure: Failure) {
        self.behaviour.failures.lock().push_back(failure);
    }

    pub fn statements(&self) -> Vec<String> {
        self.behaviour.statements.lock().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn connect(&self) -> DbResult<MockConnection> {
        if self.behaviour.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection(
                "connection refused",
                "Check that the server is running",
            ));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            counters: Arc::clone(&self.counters),
            behaviour: Arc::clone(&self.behaviour),
            open: true,
            in_flight: false,
            last_insert_id: None,
            affected_rows: 0,
        })
    }
}

#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
    counters: Arc<Counters>,
    behaviour: Arc<Behaviour>,
    open: bool,
    in_flight: bool,
    last_insert_id: Option<u64>,
    affected_rows: u64,
}

impl MockConnection {
    async fn run(&mut self, sql: &str) -> DbResult<()> {
        if !self.open {
            return Err(DbError::connection_closed(self.id));
        }
        self.behaviour.statements.lock().push(sql.to_string());

        let failure = self.behaviour.failures.lock().pop_front();
        match failure {
            Some(Failure::Connection) => {
                self.open = false;
                return Err(DbError::connection(
                    "Lost connection to server during query",
                    "Reconnect to the database",
                ));
            }
            Some(Failure::Database) => {
                return Err(DbError::database(
                    "You have an error in your SQL syntax",
                    Some("42000".to_string()),
                    "Check the SQL syntax",
                ));
            }
            None => {}
        }

        if sql.contains(SLOW) {
            let delay = *self.behaviour.statement_delay.lock();
            self.in_flight = true;
            tokio::time::sleep(delay).await;
            self.in_flight = false;
        }

        if sql.to_ascii_uppercase().starts_with("INSERT") {
            self.last_insert_id = Some(self.last_insert_id.unwrap_or(0) + 1);
            self.affected_rows = 1;
        } else {
            self.affected_rows = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str) -> DbResult<RawResult> {
        self.run(sql).await?;
        Ok(RawResult {
            rows_affected: self.affected_rows,
            last_insert_id: self.last_insert_id.unwrap_or(0),
            row_count: 0,
        })
    }

    async fn exec_query(&mut self, sql: &str, binds: &[QueryParam]) -> DbResult<QueryResult> {
        self.run(sql).await?;
        Ok(QueryResult::new(
            vec!["connection_id".to_string(), "binds".to_string()],
            vec![vec![json!(self.id), json!(binds.len())]],
        ))
    }

    fn last_inserted_id(&self) -> Option<u64> {
        self.last_insert_id
    }

    fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    fn statement_in_flight(&self) -> bool {
        self.in_flight
    }

    fn connection_lost(&self) -> bool {
        !self.open
    }

    async fn is_active(&mut self) -> bool {
        self.counters.pings.fetch_add(1, Ordering::SeqCst);
        self.open && self.behaviour.alive.load(Ordering::SeqCst)
    }

    async fn reset(&mut self) -> DbResult<()> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.fail_reset.load(Ordering::SeqCst) {
            return Err(DbError::connection("reset failed", "Reconnect"));
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> DbResult<()> {
        self.counters.reconnects.fetch_add(1, Ordering::SeqCst);
        self.open = true;
        self.in_flight = false;
        Ok(())
    }

    async fn disconnect(&mut self) -> DbResult<()> {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        self.open = false;
        Ok(())
    }

    async fn describe_table(&mut self, table: &str) -> DbResult<TableMetadata> {
        self.run(&format!("DESCRIBE `{table}`")).await?;
        self.behaviour
            .tables
            .lock()
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::schema(format!("Table '{table}' doesn't exist"), table))
    }

    async fn server_version(&mut self) -> DbResult<String> {
        Ok("8.0.36-mock".to_string())
    }
}
