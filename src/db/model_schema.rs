//! Per-model schema definitions.
//!
//! A `ModelSchemaDefinition` is a model's view of one table in a `SchemaCache`: the
//! columns the model maps (after its allow/deny lists), its primary key, the default
//! attribute set and the columns read back after an insert.
//!
//! Every derived value lives in a `Generation`. Invalidation swaps in a new generation
//! in one step, so a reader working from one `SchemaSnapshot` never mixes values from
//! before and after a reload.

use crate::db::schema::SchemaCache;
use crate::error::{DbError, DbResult};
use crate::models::ColumnDefinition;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::debug;

/// Static description of a model: the table it maps and which columns it uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub table_name: String,
    /// Allow-list. Takes precedence over `ignored_columns` when both are set.
    #[serde(default)]
    pub only_columns: Vec<String>,
    /// Deny-list.
    #[serde(default)]
    pub ignored_columns: Vec<String>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            only_columns: Vec::new(),
            ignored_columns: Vec::new(),
        }
    }

    pub fn only_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn ignored_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the model maps `column`.
    pub fn includes_column(&self, column: &str) -> bool {
        if !self.only_columns.is_empty() {
            self.only_columns.iter().any(|c| c == column)
        } else {
            !self.ignored_columns.iter().any(|c| c == column)
        }
    }
}

/// A primary key. Composite keys keep their column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    /// Key for the primary key columns reported by the server, in index order.
    pub fn from_columns(mut columns: Vec<String>) -> Option<Self> {
        match columns.len() {
            0 => None,
            1 => columns.pop().map(Self::Single),
            _ => Some(Self::Composite(columns)),
        }
    }

    pub fn columns(&self) -> &[String] {
        match self {
            Self::Single(column) => std::slice::from_ref(column),
            Self::Composite(columns) => columns,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns().iter().any(|c| c == column)
    }

    /// The record id held in `attributes`. Missing values read as null.
    pub fn id_of(&self, attributes: &Map<String, Value>) -> RecordId {
        let value = |column: &String| attributes.get(column).cloned().unwrap_or(Value::Null);
        match self {
            Self::Single(column) => RecordId::Single(value(column)),
            Self::Composite(columns) => RecordId::Composite(columns.iter().map(value).collect()),
        }
    }

    /// True when every key column has a non-null value in `attributes`.
    pub fn values_present(&self, attributes: &Map<String, Value>) -> bool {
        self.columns()
            .iter()
            .all(|c| attributes.get(c).is_some_and(|v| !v.is_null()))
    }
}

impl From<&str> for PrimaryKey {
    fn from(column: &str) -> Self {
        Self::Single(column.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(column: String) -> Self {
        Self::Single(column)
    }
}

// A list is always composite, even with one element.
impl From<Vec<String>> for PrimaryKey {
    fn from(columns: Vec<String>) -> Self {
        Self::Composite(columns)
    }
}

impl From<Vec<&str>> for PrimaryKey {
    fn from(columns: Vec<&str>) -> Self {
        Self::Composite(columns.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for PrimaryKey {
    fn from(columns: [&str; N]) -> Self {
        Self::Composite(columns.into_iter().map(str::to_string).collect())
    }
}

/// Identity of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordId {
    Single(Value),
    Composite(Vec<Value>),
}

/// Attribute type derived from a column's SQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Boolean,
    Integer,
    Float,
    Decimal,
    String,
    Json,
    Date,
    DateTime,
    Time,
    Binary,
}

impl AttributeType {
    pub fn for_sql_type(data_type: &str) -> Self {
        let dt = data_type.to_ascii_lowercase();
        let base = dt.split(['(', ' ']).next().unwrap_or_default();
        match base {
            "tinyint" if dt.starts_with("tinyint(1)") => Self::Boolean,
            "bool" | "boolean" => Self::Boolean,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
                Self::Integer
            }
            "float" | "double" | "real" => Self::Float,
            "decimal" | "numeric" => Self::Decimal,
            "json" => Self::Json,
            "date" => Self::Date,
            "datetime" | "timestamp" => Self::DateTime,
            "time" => Self::Time,
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "bit" => {
                Self::Binary
            }
            _ => Self::String,
        }
    }

    /// Cast a value read from the database. Values that do not parse are kept as-is.
    pub fn cast(self, value: &Value) -> Value {
        let Value::String(s) = value else {
            return value.clone();
        };
        let trimmed = s.trim();
        match self {
            Self::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "t" => Value::Bool(true),
                "0" | "false" | "f" => Value::Bool(false),
                _ => value.clone(),
            },
            Self::Integer => trimmed
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| value.clone()),
            Self::Float => trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| value.clone()),
            Self::Json => serde_json::from_str(trimmed).unwrap_or_else(|_| value.clone()),
            _ => value.clone(),
        }
    }
}

/// A database default for one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefaultAttribute {
    pub name: String,
    pub value_before_type_cast: Value,
    pub attribute_type: AttributeType,
    /// Set when the server computes the default; the client has no value until insert.
    pub server_generated: bool,
}

impl DefaultAttribute {
    pub fn value(&self) -> Value {
        if self.server_generated {
            Value::Null
        } else {
            self.attribute_type.cast(&self.value_before_type_cast)
        }
    }
}

/// Builds attribute sets for new records of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributesBuilder {
    types: BTreeMap<String, AttributeType>,
    defaults: BTreeMap<String, DefaultAttribute>,
}

impl AttributesBuilder {
    fn new(columns: &[ColumnDefinition], primary_key: Option<&PrimaryKey>) -> Self {
        let mut types = BTreeMap::new();
        let mut defaults = BTreeMap::new();
        for column in columns {
            let attribute_type = AttributeType::for_sql_type(&column.data_type);
            types.insert(column.name.clone(), attribute_type);

            if primary_key.is_some_and(|pk| pk.contains(&column.name)) {
                continue;
            }
            if let Some(default) = &column.default_value {
                defaults.insert(
                    column.name.clone(),
                    DefaultAttribute {
                        name: column.name.clone(),
                        value_before_type_cast: default.clone(),
                        attribute_type,
                        server_generated: column.default_function,
                    },
                );
            }
        }
        Self { types, defaults }
    }

    pub fn attribute_type(&self, name: &str) -> Option<AttributeType> {
        self.types.get(name).copied()
    }

    pub fn defaults(&self) -> &BTreeMap<String, DefaultAttribute> {
        &self.defaults
    }

    pub fn default_for(&self, name: &str) -> Option<&DefaultAttribute> {
        self.defaults.get(name)
    }

    /// Attributes for a new record: every mapped column, set from `values`, else its
    /// default, else null.
    pub fn build(&self, values: Map<String, Value>) -> DbResult<Map<String, Value>> {
        if let Some(unknown) = values.keys().find(|k| !self.types.contains_key(*k)) {
            return Err(DbError::invalid_input(format!("unknown attribute '{unknown}'")));
        }
        let mut values = values;
        let attributes = self
            .types
            .iter()
            .map(|(name, attribute_type)| {
                let value = match values.remove(name) {
                    Some(value) => attribute_type.cast(&value),
                    None => self
                        .defaults
                        .get(name)
                        .map(DefaultAttribute::value)
                        .unwrap_or(Value::Null),
                };
                (name.clone(), value)
            })
            .collect();
        Ok(attributes)
    }
}

type Cell<T> = Arc<OnceCell<T>>;

#[derive(Debug, Default)]
struct Generation {
    number: u64,
    /// Set by `set_primary_key`; dropped by a reload like every other field.
    primary_key_override: Option<PrimaryKey>,
    columns: Cell<Arc<Vec<ColumnDefinition>>>,
    columns_hash: Cell<Arc<HashMap<String, ColumnDefinition>>>,
    primary_key: Cell<Option<PrimaryKey>>,
    attributes_builder: Cell<Arc<AttributesBuilder>>,
    returning_columns_for_insert: Cell<Arc<Vec<String>>>,
}

impl Generation {
    fn reloaded(&self) -> Self {
        Self {
            number: self.number + 1,
            ..Self::default()
        }
    }

    // Column data stays valid; only values that depend on the key are dropped.
    fn with_primary_key(&self, primary_key: PrimaryKey) -> Self {
        Self {
            number: self.number + 1,
            primary_key_override: Some(primary_key),
            columns: Arc::clone(&self.columns),
            columns_hash: Arc::clone(&self.columns_hash),
            primary_key: Arc::clone(&self.primary_key),
            ..Self::default()
        }
    }
}

/// Schema information for one model over one schema cache.
#[derive(Debug)]
pub struct ModelSchemaDefinition {
    descriptor: Arc<ModelDescriptor>,
    cache: Weak<SchemaCache>,
    generation: RwLock<Arc<Generation>>,
}

impl ModelSchemaDefinition {
    pub(crate) fn new(descriptor: ModelDescriptor, cache: &Arc<SchemaCache>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            cache: Arc::downgrade(cache),
            generation: RwLock::new(Arc::new(Generation::default())),
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn table_name(&self) -> &str {
        &self.descriptor.table_name
    }

    /// Incremented by every invalidation.
    pub fn generation(&self) -> u64 {
        self.generation.read().number
    }

    /// A consistent view of the current generation.
    pub fn snapshot(&self) -> DbResult<SchemaSnapshot> {
        let cache = self
            .cache
            .upgrade()
            .ok_or_else(|| DbError::internal("schema cache was dropped"))?;
        Ok(SchemaSnapshot {
            descriptor: Arc::clone(&self.descriptor),
            cache,
            generation: self.generation.read().clone(),
        })
    }

    pub async fn columns(&self) -> DbResult<Arc<Vec<ColumnDefinition>>> {
        self.snapshot()?.columns().await
    }

    pub async fn columns_hash(&self) -> DbResult<Arc<HashMap<String, ColumnDefinition>>> {
        self.snapshot()?.columns_hash().await
    }

    pub async fn column_names(&self) -> DbResult<Vec<String>> {
        self.snapshot()?.column_names().await
    }

    pub async fn primary_key(&self) -> DbResult<Option<PrimaryKey>> {
        self.snapshot()?.primary_key().await
    }

    pub async fn composite_primary_key(&self) -> DbResult<bool> {
        self.snapshot()?.composite_primary_key().await
    }

    pub async fn attributes_builder(&self) -> DbResult<Arc<AttributesBuilder>> {
        self.snapshot()?.attributes_builder().await
    }

    pub async fn returning_columns_for_insert(&self) -> DbResult<Arc<Vec<String>>> {
        self.snapshot()?.returning_columns_for_insert().await
    }

    /// Record id held in `attributes`; `None` when the model has no primary key.
    pub async fn id_of(&self, attributes: &Map<String, Value>) -> DbResult<Option<RecordId>> {
        Ok(self
            .primary_key()
            .await?
            .map(|pk| pk.id_of(attributes)))
    }

    /// Override the primary key. Drops the cached attribute builder and returning
    /// columns.
    pub fn set_primary_key(&self, primary_key: impl Into<PrimaryKey>) {
        let primary_key = primary_key.into();
        let mut generation = self.generation.write();
        let next = Arc::new(generation.with_primary_key(primary_key));
        *generation = next;
        debug!(model = %self.descriptor.name, generation = generation.number, "Primary key set");
    }

    /// Drop every cached value, including a primary key set with `set_primary_key`.
    pub fn reload(&self) {
        let mut generation = self.generation.write();
        let next = Arc::new(generation.reloaded());
        *generation = next;
        debug!(model = %self.descriptor.name, generation = generation.number, "Model schema reloaded");
    }
}

/// One generation of a model's schema. All reads through the same snapshot agree
/// with each other.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    descriptor: Arc<ModelDescriptor>,
    cache: Arc<SchemaCache>,
    generation: Arc<Generation>,
}

impl SchemaSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation.number
    }

    pub async fn columns(&self) -> DbResult<Arc<Vec<ColumnDefinition>>> {
        let columns = self
            .generation
            .columns
            .get_or_try_init(|| async {
                let columns = self.cache.columns(&self.descriptor.table_name).await?;
                Ok::<_, DbError>(Arc::new(
                    columns
                        .into_iter()
                        .filter(|c| self.descriptor.includes_column(&c.name))
                        .collect(),
                ))
            })
            .await?;
        Ok(Arc::clone(columns))
    }

    pub async fn columns_hash(&self) -> DbResult<Arc<HashMap<String, ColumnDefinition>>> {
        let hash = self
            .generation
            .columns_hash
            .get_or_try_init(|| async {
                let columns = self.columns().await?;
                Ok::<_, DbError>(Arc::new(
                    columns
                        .iter()
                        .map(|c| (c.name.clone(), c.clone()))
                        .collect(),
                ))
            })
            .await?;
        Ok(Arc::clone(hash))
    }

    pub async fn column_names(&self) -> DbResult<Vec<String>> {
        Ok(self.columns().await?.iter().map(|c| c.name.clone()).collect())
    }

    pub async fn primary_key(&self) -> DbResult<Option<PrimaryKey>> {
        if let Some(primary_key) = &self.generation.primary_key_override {
            return Ok(Some(primary_key.clone()));
        }
        let primary_key = self
            .generation
            .primary_key
            .get_or_try_init(|| async {
                let columns = self.cache.primary_keys(&self.descriptor.table_name).await?;
                Ok::<_, DbError>(PrimaryKey::from_columns(columns))
            })
            .await?;
        Ok(primary_key.clone())
    }

    pub async fn composite_primary_key(&self) -> DbResult<bool> {
        Ok(self
            .primary_key()
            .await?
            .is_some_and(|pk| pk.is_composite()))
    }

    pub async fn attributes_builder(&self) -> DbResult<Arc<AttributesBuilder>> {
        let builder = self
            .generation
            .attributes_builder
            .get_or_try_init(|| async {
                let columns = self.columns().await?;
                let primary_key = self.primary_key().await?;
                Ok::<_, DbError>(Arc::new(AttributesBuilder::new(
                    &columns,
                    primary_key.as_ref(),
                )))
            })
            .await?;
        Ok(Arc::clone(builder))
    }

    /// Columns the server fills on insert; the primary key when there are none.
    pub async fn returning_columns_for_insert(&self) -> DbResult<Arc<Vec<String>>> {
        let returning = self
            .generation
            .returning_columns_for_insert
            .get_or_try_init(|| async {
                let columns = self.columns().await?;
                let auto_populated: Vec<String> = columns
                    .iter()
                    .filter(|c| c.is_auto_populated())
                    .map(|c| c.name.clone())
                    .collect();
                if !auto_populated.is_empty() {
                    return Ok::<_, DbError>(Arc::new(auto_populated));
                }
                let primary_key = self.primary_key().await?;
                Ok(Arc::new(
                    primary_key
                        .map(|pk| pk.columns().to_vec())
                        .unwrap_or_default(),
                ))
            })
            .await?;
        Ok(Arc::clone(returning))
    }
}
