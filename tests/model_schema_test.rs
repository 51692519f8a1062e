//! Integration tests for per-model schema definitions.

use async_trait::async_trait;
use parking_lot::Mutex;
use record_pool::db::{ModelDescriptor, PrimaryKey, RecordId, SchemaCache, SchemaSource};
use record_pool::error::{DbError, DbResult};
use record_pool::models::{ColumnDefinition, TableMetadata};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Tables that can be altered between loads.
#[derive(Default)]
struct MutableSource {
    tables: Mutex<HashMap<String, TableMetadata>>,
}

impl MutableSource {
    fn set(&self, table: TableMetadata) {
        self.tables.lock().insert(table.table_name.clone(), table);
    }
}

#[async_trait]
impl SchemaSource for MutableSource {
    async fn table_metadata(&self, table: &str) -> DbResult<TableMetadata> {
        tokio::task::yield_now().await;
        self.tables
            .lock()
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::schema(format!("Table '{table}' doesn't exist"), table))
    }
}

fn users() -> TableMetadata {
    TableMetadata::new("users")
        .with_column(ColumnDefinition::new("id", "bigint", false).with_extra("auto_increment"))
        .with_column(ColumnDefinition::new("name", "varchar(255)", true))
        .with_column(ColumnDefinition::new("active", "tinyint(1)", false).with_default_str("1"))
        .with_primary_key(["id"])
}

fn users_with_email() -> TableMetadata {
    users().with_column(ColumnDefinition::new("email", "varchar(255)", true))
}

fn memberships() -> TableMetadata {
    TableMetadata::new("memberships")
        .with_column(ColumnDefinition::new("shop_id", "int", false))
        .with_column(ColumnDefinition::new("user_id", "int", false))
        .with_column(
            ColumnDefinition::new("joined_at", "datetime", false)
                .with_default_function("CURRENT_TIMESTAMP")
                .with_extra("DEFAULT_GENERATED"),
        )
        .with_primary_key(["shop_id", "user_id"])
}

fn events() -> TableMetadata {
    TableMetadata::new("events")
        .with_column(ColumnDefinition::new("payload", "json", true))
        .with_column(ColumnDefinition::new("kind", "varchar(20)", false))
}

fn setup() -> (Arc<MutableSource>, Arc<SchemaCache>) {
    let source = Arc::new(MutableSource::default());
    source.set(users());
    source.set(memberships());
    source.set(events());
    let cache = SchemaCache::new(source.clone());
    (source, cache)
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_columns_and_primary_key() {
    let (_, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));

    assert_eq!(user.column_names().await.unwrap(), vec!["id", "name", "active"]);
    assert!(user.columns_hash().await.unwrap().contains_key("active"));
    assert_eq!(
        user.primary_key().await.unwrap(),
        Some(PrimaryKey::Single("id".into()))
    );
    assert!(!user.composite_primary_key().await.unwrap());
}

#[tokio::test]
async fn test_composite_and_missing_primary_key() {
    let (_, cache) = setup();
    let membership = cache.model_schema(ModelDescriptor::new("Membership", "memberships"));
    let event = cache.model_schema(ModelDescriptor::new("Event", "events"));

    assert!(membership.composite_primary_key().await.unwrap());
    let attrs = object(json!({"shop_id": 3, "user_id": 9}));
    assert_eq!(
        membership.id_of(&attrs).await.unwrap(),
        Some(RecordId::Composite(vec![json!(3), json!(9)]))
    );

    assert_eq!(event.primary_key().await.unwrap(), None);
    assert_eq!(event.id_of(&attrs).await.unwrap(), None);
}

#[tokio::test]
async fn test_ignored_and_only_columns() {
    let (_, cache) = setup();
    let ignoring = cache.model_schema(ModelDescriptor::new("User", "users").ignored_columns(["name"]));
    assert_eq!(ignoring.column_names().await.unwrap(), vec!["id", "active"]);

    let only = cache.model_schema(ModelDescriptor::new("Login", "users").only_columns(["id", "name"]));
    assert_eq!(only.column_names().await.unwrap(), vec!["id", "name"]);

    let attrs = only
        .attributes_builder()
        .await
        .unwrap()
        .build(Map::new())
        .unwrap();
    assert_eq!(attrs.keys().collect::<Vec<_>>(), vec!["id", "name"]);

    // Unmapped columns are rejected.
    let err = only
        .attributes_builder()
        .await
        .unwrap()
        .build(object(json!({"active": true})))
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_attributes_builder_defaults() {
    let (_, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));
    let builder = user.attributes_builder().await.unwrap();

    let attrs = builder.build(object(json!({"name": "ada"}))).unwrap();
    assert_eq!(attrs["id"], Value::Null);
    assert_eq!(attrs["name"], json!("ada"));
    assert_eq!(attrs["active"], json!(true));

    let membership = cache.model_schema(ModelDescriptor::new("Membership", "memberships"));
    let joined_at = membership
        .attributes_builder()
        .await
        .unwrap()
        .default_for("joined_at")
        .cloned()
        .unwrap();
    assert!(joined_at.server_generated);
    assert_eq!(joined_at.value(), Value::Null);
}

#[tokio::test]
async fn test_returning_columns_for_insert() {
    let (_, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));
    let membership = cache.model_schema(ModelDescriptor::new("Membership", "memberships"));
    let event = cache.model_schema(ModelDescriptor::new("Event", "events"));

    assert_eq!(*user.returning_columns_for_insert().await.unwrap(), vec!["id"]);
    assert_eq!(
        *membership.returning_columns_for_insert().await.unwrap(),
        vec!["joined_at"]
    );
    assert!(event.returning_columns_for_insert().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_clearing_the_table_reloads_the_model() {
    let (source, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));
    assert_eq!(user.column_names().await.unwrap().len(), 3);
    let before = user.generation();

    source.set(users_with_email());
    // Still served from the cache.
    assert_eq!(user.column_names().await.unwrap().len(), 3);

    cache.clear_data_source_cache("users");
    assert!(user.generation() > before);
    assert_eq!(user.column_names().await.unwrap().len(), 4);
    assert!(
        user.attributes_builder()
            .await
            .unwrap()
            .attribute_type("email")
            .is_some()
    );
}

#[tokio::test]
async fn test_snapshot_is_unaffected_by_reload() {
    let (source, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));
    let snapshot = user.snapshot().unwrap();
    assert_eq!(snapshot.column_names().await.unwrap().len(), 3);

    source.set(users_with_email());
    cache.clear_model_schema("User");

    // The old generation keeps answering from the columns it already read.
    assert_eq!(snapshot.column_names().await.unwrap().len(), 3);
    let built = snapshot
        .attributes_builder()
        .await
        .unwrap()
        .build(Map::new())
        .unwrap();
    assert_eq!(built.len(), 3);

    assert_eq!(user.column_names().await.unwrap().len(), 4);
    assert!(user.generation() > snapshot.generation());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_see_whole_generations() {
    let (source, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));

    let mut readers = Vec::new();
    for _ in 0..6 {
        let user = Arc::clone(&user);
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let snapshot = user.snapshot()?;
                let columns = snapshot.column_names().await?;
                let built = snapshot.attributes_builder().await?.build(Map::new())?;
                assert_eq!(columns.len(), built.len());
                assert!(columns.len() == 3 || columns.len() == 4);
            }
            Ok::<_, DbError>(())
        }));
    }

    for round in 0..20 {
        let table = if round % 2 == 0 { users_with_email() } else { users() };
        source.set(table);
        cache.clear_data_source_cache("users");
        tokio::task::yield_now().await;
    }

    for reader in readers {
        reader.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_primary_key_override() {
    let (_, cache) = setup();
    let event = cache.model_schema(ModelDescriptor::new("Event", "events"));

    event.set_primary_key("kind");
    assert_eq!(
        event.primary_key().await.unwrap(),
        Some(PrimaryKey::Single("kind".into()))
    );
    assert_eq!(*event.returning_columns_for_insert().await.unwrap(), vec!["kind"]);

    event.set_primary_key(["kind", "payload"]);
    assert!(event.composite_primary_key().await.unwrap());
}

#[tokio::test]
async fn test_reload_restores_schema_primary_key() {
    let (_, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));

    user.set_primary_key(["id", "name"]);
    assert_eq!(
        user.primary_key().await.unwrap(),
        Some(PrimaryKey::Composite(vec!["id".into(), "name".into()]))
    );

    user.reload();
    assert_eq!(
        user.primary_key().await.unwrap(),
        Some(PrimaryKey::Single("id".into()))
    );
    assert!(!user.composite_primary_key().await.unwrap());
    assert_eq!(*user.returning_columns_for_insert().await.unwrap(), vec!["id"]);

    // Clearing the table reloads the model as well.
    user.set_primary_key("name");
    cache.clear_data_source_cache("users");
    assert_eq!(
        user.primary_key().await.unwrap(),
        Some(PrimaryKey::Single("id".into()))
    );
}

#[tokio::test]
async fn test_missing_table_is_reported() {
    let (_, cache) = setup();
    let ghost = cache.model_schema(ModelDescriptor::new("Ghost", "ghosts"));

    assert!(matches!(
        ghost.columns().await,
        Err(DbError::Schema { .. })
    ));
    assert!(!cache.data_source_exists("ghosts").await.unwrap());
}

#[tokio::test]
async fn test_definition_outliving_its_cache() {
    let (_, cache) = setup();
    let user = cache.model_schema(ModelDescriptor::new("User", "users"));
    drop(cache);

    assert!(matches!(user.columns().await, Err(DbError::Internal { .. })));
}
