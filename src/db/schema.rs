//! Schema cache.
//!
//! Table metadata is loaded at most once per table through a `SchemaSource` and then
//! served from memory until the table (or the whole cache) is cleared. Concurrent
//! first requests for the same table share one load.
//!
//! The cache also owns one `ModelSchemaDefinition` per model, so clearing the cache
//! reaches every per-model view built on top of it.

use crate::db::connection::{Connection, ConnectionFactory};
use crate::db::model_schema::{ModelDescriptor, ModelSchemaDefinition};
use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnDefinition, TableMetadata};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Where the cache loads table metadata from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Columns and primary key of `table`. Fails with `DbError::Schema` when the
    /// table does not exist.
    async fn table_metadata(&self, table: &str) -> DbResult<TableMetadata>;
}

#[async_trait]
impl<F: ConnectionFactory> SchemaSource for ConnectionPool<F> {
    async fn table_metadata(&self, table: &str) -> DbResult<TableMetadata> {
        self.with_connection(|conn| async move {
            let mut guard = conn.lock().await?;
            let metadata = guard.describe_table(table).await;
            metadata
        })
        .await
    }
}

/// Fixed set of tables held in memory.
#[derive(Debug, Default)]
pub struct StaticSchemaSource {
    tables: HashMap<String, TableMetadata>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableMetadata) -> Self {
        self.tables.insert(table.table_name.clone(), table);
        self
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn table_metadata(&self, table: &str) -> DbResult<TableMetadata> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::schema(format!("Table '{table}' doesn't exist"), table))
    }
}

type TableCell = Arc<OnceCell<Arc<TableMetadata>>>;

/// Memoized table metadata keyed by table name.
pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    tables: RwLock<HashMap<String, TableCell>>,
    models: RwLock<HashMap<String, Arc<ModelSchemaDefinition>>>,
}

impl fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaCache")
            .field("tables", &self.size())
            .field("models", &self.models.read().len())
            .finish_non_exhaustive()
    }
}

impl SchemaCache {
    pub fn new(source: Arc<dyn SchemaSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            tables: RwLock::new(HashMap::new()),
            models: RwLock::new(HashMap::new()),
        })
    }

    /// Metadata for `table`, loading it on first use.
    ///
    /// A failed load is not cached; the next call tries again.
    pub async fn table(&self, table: &str) -> DbResult<Arc<TableMetadata>> {
        let cell = self.cell(table);
        let metadata = cell
            .get_or_try_init(|| async {
                debug!(table, "Loading table metadata");
                self.source.table_metadata(table).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(metadata))
    }

    fn cell(&self, table: &str) -> TableCell {
        if let Some(cell) = self.tables.read().get(table) {
            return Arc::clone(cell);
        }
        let mut tables = self.tables.write();
        Arc::clone(tables.entry(table.to_string()).or_default())
    }

    pub async fn columns(&self, table: &str) -> DbResult<Vec<ColumnDefinition>> {
        Ok(self.table(table).await?.columns.clone())
    }

    pub async fn columns_hash(&self, table: &str) -> DbResult<HashMap<String, ColumnDefinition>> {
        Ok(self.table(table).await?.columns_hash())
    }

    /// Primary key columns in index order; empty when the table has none.
    pub async fn primary_keys(&self, table: &str) -> DbResult<Vec<String>> {
        Ok(self.table(table).await?.primary_key.clone())
    }

    /// Whether `table` exists. Only a missing table yields `false`; other
    /// failures are returned.
    pub async fn data_source_exists(&self, table: &str) -> DbResult<bool> {
        match self.table(table).await {
            Ok(_) => Ok(true),
            Err(DbError::Schema { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Load `table` now instead of on first use.
    pub async fn add(&self, table: &str) -> DbResult<()> {
        self.table(table).await.map(|_| ())
    }

    /// Whether metadata for `table` is currently held.
    pub fn is_cached(&self, table: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .is_some_and(|cell| cell.initialized())
    }

    /// Number of tables with loaded metadata.
    pub fn size(&self) -> usize {
        self.tables
            .read()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Forget `table` and reload every model view mapped onto it.
    pub fn clear_data_source_cache(&self, table: &str) {
        self.tables.write().remove(table);
        for model in self.models.read().values() {
            if model.table_name() == table {
                model.reload();
            }
        }
        debug!(table, "Cleared table metadata");
    }

    /// Forget every table and reload every model view.
    pub fn clear(&self) {
        self.tables.write().clear();
        for model in self.models.read().values() {
            model.reload();
        }
        debug!("Cleared schema cache");
    }

    /// The schema definition for `descriptor`, created on first request.
    ///
    /// A descriptor that differs from the registered one for the same model
    /// replaces it.
    pub fn model_schema(self: &Arc<Self>, descriptor: ModelDescriptor) -> Arc<ModelSchemaDefinition> {
        if let Some(existing) = self.models.read().get(&descriptor.name) {
            if existing.descriptor() == &descriptor {
                return Arc::clone(existing);
            }
        }
        let mut models = self.models.write();
        match models.get(&descriptor.name) {
            Some(existing) if existing.descriptor() == &descriptor => Arc::clone(existing),
            _ => {
                let name = descriptor.name.clone();
                let definition = Arc::new(ModelSchemaDefinition::new(descriptor, self));
                models.insert(name, Arc::clone(&definition));
                definition
            }
        }
    }

    /// Drop the cached metadata behind `model` and reset its definition.
    /// Returns `false` when the model was never registered.
    pub fn clear_model_schema(&self, model: &str) -> bool {
        let definition = self.models.read().get(model).cloned();
        match definition {
            Some(definition) => {
                self.tables.write().remove(definition.table_name());
                definition.reload();
                true
            }
            None => false,
        }
    }
}
