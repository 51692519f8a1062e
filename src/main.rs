//! record-pool probe.
//!
//! Connects a pool to a MySQL/MariaDB server, optionally runs a statement and
//! describes a table through the schema cache, then prints the server version and
//! the pool statistics as JSON and disconnects.

use record_pool::config::Config;
use record_pool::db::{Connection, MySqlConnector, PoolConfig, PoolRegistry};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    let db_config = Arc::new(config.database_config()?);
    db_config.validate()?;

    info!(
        name = %db_config.name,
        pool_class = %db_config.pool_class,
        "Starting record-pool probe v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry = PoolRegistry::new();
    let connector = MySqlConnector::from_config(&db_config)?;
    let pool_config = PoolConfig::new(&registry, db_config.name.clone(), db_config, connector);
    let pool = pool_config.pool();

    let result = async {
        let version = pool
            .with_connection(|conn| async move {
                let mut guard = conn.lock().await?;
                let version = guard.server_version().await;
                version
            })
            .await?;

        let statement = match &config.sql {
            Some(sql) => {
                let result = pool
                    .with_connection(|conn| async move {
                        let result = conn.exec_query(sql, &[]).await;
                        result
                    })
                    .await?;
                Some(serde_json::json!({
                    "columns": result.columns,
                    "rows": result.rows,
                }))
            }
            None => None,
        };

        let table = match &config.describe {
            Some(table) => {
                let metadata = pool_config.schema_cache().table(table).await?;
                Some(serde_json::to_value(metadata.as_ref())?)
            }
            None => None,
        };

        let report = serde_json::json!({
            "version": version,
            "stat": pool.stat(),
            "statement": statement,
            "table": table,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;

    if let Err(e) = pool_config.disconnect().await {
        error!(error = %e, "Disconnect failed");
    }

    if let Err(e) = result {
        error!(error = %e, "Probe failed");
        return Err(e);
    }

    info!("Probe complete");
    Ok(())
}
