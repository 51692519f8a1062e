//! Transaction control over any `Connection`.
//!
//! Starting a transaction is the one place a connection-level failure is retried:
//! the adapter reconnects once and replays the isolation level before `BEGIN`.
//! Failures inside a transaction are always returned to the caller.

use crate::db::connection::Connection;
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "read_uncommitted" => Ok(Self::ReadUncommitted),
            "read_committed" => Ok(Self::ReadCommitted),
            "repeatable_read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            other => Err(format!("unknown isolation level '{other}'")),
        }
    }
}

/// Start a transaction, optionally at `isolation`.
///
/// On a connection-level failure the connection is re-established and the start is
/// attempted once more with the same isolation level.
pub async fn begin_transaction<C>(conn: &mut C, isolation: Option<IsolationLevel>) -> DbResult<()>
where
    C: Connection + ?Sized,
{
    match begin_once(conn, isolation).await {
        Err(e @ DbError::Connection { .. }) => {
            warn!(error = %e, "Transaction start failed, reconnecting and retrying once");
            conn.reconnect().await?;
            begin_once(conn, isolation).await
        }
        other => other,
    }
}

async fn begin_once<C>(conn: &mut C, isolation: Option<IsolationLevel>) -> DbResult<()>
where
    C: Connection + ?Sized,
{
    if let Some(level) = isolation {
        conn.execute(&format!("SET TRANSACTION ISOLATION LEVEL {level}"))
            .await?;
    }
    conn.execute("BEGIN").await?;
    debug!(isolation = ?isolation, "Transaction started");
    Ok(())
}

pub async fn commit<C>(conn: &mut C) -> DbResult<()>
where
    C: Connection + ?Sized,
{
    conn.execute("COMMIT").await.map(|_| ())
}

pub async fn rollback<C>(conn: &mut C) -> DbResult<()>
where
    C: Connection + ?Sized,
{
    conn.execute("ROLLBACK").await.map(|_| ())
}
