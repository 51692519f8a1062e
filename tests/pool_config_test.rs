//! Integration tests for pool configs and the pool registry.

mod common;

use common::MockFactory;
use record_pool::config::DatabaseConfig;
use record_pool::db::{ManagedPool, ModelDescriptor, PoolConfig, PoolRegistry, PrimaryKey};
use record_pool::error::DbError;
use record_pool::models::{ColumnDefinition, TableMetadata};
use std::sync::Arc;

fn db_config() -> Arc<DatabaseConfig> {
    Arc::new(DatabaseConfig::parse("mysql://app@localhost/app?pool=2&checkout_timeout=1").unwrap())
}

fn users() -> TableMetadata {
    TableMetadata::new("users")
        .with_column(ColumnDefinition::new("id", "bigint", false).with_extra("auto_increment"))
        .with_column(ColumnDefinition::new("name", "varchar(255)", true))
        .with_primary_key(["id"])
}

#[tokio::test]
async fn test_pool_is_created_lazily() {
    let factory = MockFactory::new();
    let registry = PoolRegistry::new();
    let config = PoolConfig::new(&registry, "primary", db_config(), factory.clone());

    assert_eq!(registry.len(), 1);
    assert!(!config.has_pool());
    assert!(config.existing_pool().is_none());

    let pool = config.pool();
    assert!(Arc::ptr_eq(&pool, &config.pool()));
    assert_eq!(pool.size(), 2);
    assert!(config.has_pool());
    // Connections are only opened on checkout.
    assert_eq!(factory.counters.connects(), 0);
}

#[tokio::test]
async fn test_schema_cache_loads_through_the_pool() {
    let factory = MockFactory::new().with_table(users());
    let registry = PoolRegistry::new();
    let config = PoolConfig::new(&registry, "primary", db_config(), factory.clone());

    let columns = config.schema_cache().columns("users").await.unwrap();
    assert_eq!(columns.len(), 2);
    assert_eq!(factory.statements(), vec!["DESCRIBE `users`"]);
    assert_eq!(config.pool().stat().idle, 1);

    let user = config.model_schema(ModelDescriptor::new("User", "users"));
    assert_eq!(
        user.primary_key().await.unwrap(),
        Some(PrimaryKey::Single("id".into()))
    );
    // Served from the cache.
    assert_eq!(factory.statements().len(), 1);
}

#[tokio::test]
async fn test_discarded_pool_is_recreated() {
    let factory = MockFactory::new().with_table(users());
    let registry = PoolRegistry::new();
    let config = PoolConfig::new(&registry, "primary", db_config(), factory.clone());

    let old = config.pool();
    config.schema_cache().add("users").await.unwrap();
    let conn = old.checkout(None).await.unwrap();

    assert_eq!(registry.discard_pools(), 1);
    assert!(old.is_discarded());
    assert!(!config.has_pool());
    assert!(!old.checkin(&conn));
    // The schema cache belongs to the config.
    assert!(config.schema_cache().is_cached("users"));

    let new = config.pool();
    assert!(!Arc::ptr_eq(&old, &new));
    new.checkout(None).await.unwrap();
    assert_eq!(registry.discard_pools(), 1);
    assert_eq!(registry.discard_pools(), 0);
}

#[tokio::test]
async fn test_fork_discards_inherited_pools() {
    let factory = MockFactory::new();
    let registry = PoolRegistry::new();
    let config = PoolConfig::new(&registry, "primary", db_config(), factory.clone());

    let inherited = config.pool();
    inherited.checkout(None).await.unwrap();

    registry.set_pid(0);
    let fresh = config.pool();
    assert!(inherited.is_discarded());
    assert!(!Arc::ptr_eq(&inherited, &fresh));
    assert_eq!(factory.counters.disconnects(), 0);
}

#[tokio::test]
async fn test_disconnect_without_pool_is_a_noop() {
    let registry = PoolRegistry::new();
    let config = PoolConfig::new(&registry, "primary", db_config(), MockFactory::new());

    config.disconnect().await.unwrap();
    assert!(!config.has_pool());
}

#[tokio::test]
async fn test_disconnect_closes_connections_and_stops_reconnecting() {
    let factory = MockFactory::new();
    let registry = PoolRegistry::new();
    let config = PoolConfig::new(&registry, "primary", db_config(), factory.clone());

    let pool = config.pool();
    let conn = pool.checkout(None).await.unwrap();
    pool.checkin(&conn);

    config.disconnect().await.unwrap();
    assert!(!pool.connected());
    assert!(!pool.automatic_reconnect());
    assert_eq!(factory.counters.disconnects(), 1);
    assert!(matches!(
        pool.checkout(None).await,
        Err(DbError::ConnectionNotEstablished { .. })
    ));
}

#[tokio::test]
async fn test_dropped_config_leaves_the_registry() {
    let registry = PoolRegistry::new();
    let primary = PoolConfig::new(&registry, "primary", db_config(), MockFactory::new());
    let replica = PoolConfig::new(&registry, "replica", db_config(), MockFactory::new());
    assert_ne!(primary.id(), replica.id());
    assert_eq!(registry.len(), 2);

    drop(replica);
    assert_eq!(registry.len(), 1);
    assert_eq!(primary.connection_specification_name(), "primary");
}
