//! Pool configs and their registry.
//!
//! A `PoolConfig` ties one owner (a model hierarchy, usually the application's
//! primary one) to one `DatabaseConfig` and holds at most one pool, created on first
//! use. The schema cache belongs to the config, not the pool, so it survives a
//! discarded pool being recreated.
//!
//! A `PoolRegistry` tracks every live config through weak handles. It is used to
//! discard all pools at once, e.g. in a forked child process where the parent's
//! sockets must never be reused.

use crate::config::DatabaseConfig;
use crate::db::connection::ConnectionFactory;
use crate::db::model_schema::{ModelDescriptor, ModelSchemaDefinition};
use crate::db::pool::ConnectionPool;
use crate::db::schema::{SchemaCache, SchemaSource};
use crate::error::{DbError, DbResult};
use crate::models::TableMetadata;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// What the registry can do with a config without knowing its factory type.
pub trait ManagedPool: Send + Sync {
    fn connection_specification_name(&self) -> &str;

    /// Whether a pool has been created and not discarded.
    fn has_pool(&self) -> bool;

    /// Tear down the pool without closing connections gracefully. No-op without a pool.
    fn discard_pool(&self);
}

/// Registry of live pool configs.
pub struct PoolRegistry {
    pid: AtomicU32,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Weak<dyn ManagedPool>>>,
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pid", &self.pid.load(Ordering::Relaxed))
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl PoolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pid: AtomicU32::new(std::process::id()),
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Track `config`. Returns the id used to unregister it.
    pub fn register(&self, config: Weak<dyn ManagedPool>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, config);
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Number of live configs. Entries whose config was dropped are pruned.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, config| config.strong_count() > 0);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard the pool of every live config. Returns how many pools were torn down.
    pub fn discard_pools(&self) -> usize {
        let configs: Vec<Arc<dyn ManagedPool>> = {
            let mut entries = self.entries.lock();
            entries.retain(|_, config| config.strong_count() > 0);
            entries.values().filter_map(Weak::upgrade).collect()
        };

        let mut discarded = 0;
        for config in configs {
            if config.has_pool() {
                debug!(
                    name = config.connection_specification_name(),
                    "Discarding pool"
                );
                config.discard_pool();
                discarded += 1;
            }
        }
        discarded
    }

    /// Discard every pool if the process id changed since the last check, i.e. this
    /// is a forked child. Returns `true` when pools were discarded.
    pub fn check_fork(&self) -> bool {
        let current = std::process::id();
        let previous = self.pid.swap(current, Ordering::AcqRel);
        if previous == current {
            return false;
        }
        warn!(previous, current, "Process id changed, discarding inherited pools");
        self.discard_pools();
        true
    }

    #[doc(hidden)]
    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }
}

/// One owner's connection settings and its lazily created pool.
pub struct PoolConfig<F: ConnectionFactory + Clone> {
    id: u64,
    owner: String,
    db_config: Arc<DatabaseConfig>,
    factory: F,
    pool: RwLock<Option<Arc<ConnectionPool<F>>>>,
    schema_cache: Arc<SchemaCache>,
    registry: Arc<PoolRegistry>,
}

impl<F: ConnectionFactory + Clone> fmt::Debug for PoolConfig<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("db_config", &self.db_config)
            .field("has_pool", &self.pool.read().is_some())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory + Clone> PoolConfig<F> {
    /// Create a config and register it with `registry`.
    pub fn new(
        registry: &Arc<PoolRegistry>,
        owner: impl Into<String>,
        db_config: Arc<DatabaseConfig>,
        factory: F,
    ) -> Arc<Self> {
        let owner = owner.into();
        let config = Arc::new_cyclic(|weak: &Weak<Self>| {
            let source: Arc<dyn SchemaSource> = Arc::new(PoolSource(weak.clone()));
            let managed: Weak<dyn ManagedPool> = weak.clone();
            Self {
                id: registry.register(managed),
                owner,
                db_config,
                factory,
                pool: RwLock::new(None),
                schema_cache: SchemaCache::new(source),
                registry: Arc::clone(registry),
            }
        });
        debug!(id = config.id, owner = %config.owner, "Pool config registered");
        config
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn db_config(&self) -> &Arc<DatabaseConfig> {
        &self.db_config
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    /// The schema definition of a model using this config.
    pub fn model_schema(&self, descriptor: ModelDescriptor) -> Arc<ModelSchemaDefinition> {
        self.schema_cache.model_schema(descriptor)
    }

    /// The pool, created on first use.
    pub fn pool(&self) -> Arc<ConnectionPool<F>> {
        self.registry.check_fork();

        if let Some(pool) = self.pool.read().as_ref() {
            return Arc::clone(pool);
        }
        let mut slot = self.pool.write();
        if let Some(pool) = slot.as_ref() {
            return Arc::clone(pool);
        }
        let pool = ConnectionPool::from_config(self.factory.clone(), &self.db_config);
        info!(
            name = %self.owner,
            pool_class = %self.db_config.pool_class,
            size = self.db_config.pool_size,
            "Connection pool created"
        );
        *slot = Some(Arc::clone(&pool));
        pool
    }

    /// The pool if one exists, without creating it.
    pub fn existing_pool(&self) -> Option<Arc<ConnectionPool<F>>> {
        self.pool.read().clone()
    }

    /// Close every connection and stop the pool from opening new ones.
    /// No-op when no pool exists.
    pub async fn disconnect(&self) -> DbResult<()> {
        self.registry.check_fork();

        let Some(pool) = self.existing_pool() else {
            return Ok(());
        };
        pool.set_automatic_reconnect(false);
        pool.disconnect(true).await
    }
}

impl<F: ConnectionFactory + Clone> ManagedPool for PoolConfig<F> {
    fn connection_specification_name(&self) -> &str {
        &self.owner
    }

    fn has_pool(&self) -> bool {
        self.pool.read().is_some()
    }

    fn discard_pool(&self) {
        let Some(pool) = self.pool.write().take() else {
            return;
        };
        pool.discard();
        info!(name = %self.owner, "Connection pool discarded");
    }
}

impl<F: ConnectionFactory + Clone> Drop for PoolConfig<F> {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Loads table metadata through whichever pool the config currently has.
struct PoolSource<F: ConnectionFactory + Clone>(Weak<PoolConfig<F>>);

#[async_trait]
impl<F: ConnectionFactory + Clone> SchemaSource for PoolSource<F> {
    async fn table_metadata(&self, table: &str) -> DbResult<TableMetadata> {
        let config = self
            .0
            .upgrade()
            .ok_or_else(|| DbError::internal("pool config was dropped"))?;
        let pool = config.pool();
        pool.table_metadata(table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct FakeConfig {
        pool: AtomicBool,
        discards: AtomicU64,
    }

    impl ManagedPool for FakeConfig {
        fn connection_specification_name(&self) -> &str {
            "fake"
        }

        fn has_pool(&self) -> bool {
            self.pool.load(Ordering::SeqCst)
        }

        fn discard_pool(&self) {
            self.pool.store(false, Ordering::SeqCst);
            self.discards.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn managed(config: &Arc<FakeConfig>) -> Weak<dyn ManagedPool> {
        let weak: Weak<FakeConfig> = Arc::downgrade(config);
        weak
    }

    #[test]
    fn test_register_and_prune() {
        let registry = PoolRegistry::new();
        let kept = Arc::new(FakeConfig::default());
        let dropped = Arc::new(FakeConfig::default());
        registry.register(managed(&kept));
        registry.register(managed(&dropped));
        assert_eq!(registry.len(), 2);

        drop(dropped);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = PoolRegistry::new();
        let config = Arc::new(FakeConfig::default());
        let id = registry.register(managed(&config));
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_discard_pools_skips_configs_without_pool() {
        let registry = PoolRegistry::new();
        let with_pool = Arc::new(FakeConfig::default());
        with_pool.pool.store(true, Ordering::SeqCst);
        let without_pool = Arc::new(FakeConfig::default());
        registry.register(managed(&with_pool));
        registry.register(managed(&without_pool));

        assert_eq!(registry.discard_pools(), 1);
        assert_eq!(with_pool.discards.load(Ordering::SeqCst), 1);
        assert_eq!(without_pool.discards.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_check_fork() {
        let registry = PoolRegistry::new();
        let config = Arc::new(FakeConfig::default());
        config.pool.store(true, Ordering::SeqCst);
        registry.register(managed(&config));

        assert!(!registry.check_fork());
        assert!(config.has_pool());

        registry.set_pid(0);
        assert!(registry.check_fork());
        assert!(!config.has_pool());
        assert!(!registry.check_fork());
    }
}
