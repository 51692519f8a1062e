//! Table metadata models.
//!
//! `TableMetadata` is what the schema cache stores per table: the ordered column
//! list and the ordered primary key columns reported by the server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Columns and primary key of one physical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_name: String,
    pub columns: Vec<ColumnDefinition>,
    /// Primary key columns in index order. Empty when the table has none.
    pub primary_key: Vec<String>,
}

impl TableMetadata {
    /// Create new, empty table metadata.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Add a column definition.
    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    /// Set the primary key columns.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn columns_hash(&self) -> HashMap<String, ColumnDefinition> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Full type (e.g., `varchar(30)`, `bigint unsigned`)
    pub data_type: String,
    pub nullable: bool,
    /// Default value with appropriate JSON type based on column data type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    /// Default is an expression evaluated by the server (e.g. `CURRENT_TIMESTAMP`)
    pub default_function: bool,
    /// e.g. `auto_increment`, `DEFAULT_GENERATED`, `VIRTUAL GENERATED`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnDefinition {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            default_value: None,
            default_function: false,
            extra: None,
            comment: None,
        }
    }

    /// Set the default value (as JSON value).
    pub fn with_default(mut self, default_value: serde_json::Value) -> Self {
        self.default_value = Some(default_value);
        self
    }

    /// Set the default value from a string, converting to appropriate JSON type
    /// based on the column's data_type.
    pub fn with_default_str(mut self, default_str: &str) -> Self {
        self.default_value = Some(parse_default_value(default_str, &self.data_type));
        self
    }

    /// Mark the default as a server-side expression.
    pub fn with_default_function(mut self, expression: impl Into<String>) -> Self {
        self.default_value = Some(serde_json::Value::String(expression.into()));
        self.default_function = true;
        self
    }

    /// Set the extra attributes.
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// Set the column comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn has_default(&self) -> bool {
        self.default_value.is_some()
    }

    pub fn is_auto_increment(&self) -> bool {
        self.extra_contains("auto_increment")
    }

    /// True when the server fills this column on insert without a value from the client.
    pub fn is_auto_populated(&self) -> bool {
        self.is_auto_increment() || self.default_function || self.extra_contains("default_generated")
    }

    fn extra_contains(&self, needle: &str) -> bool {
        self.extra
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().contains(needle))
    }
}

/// Parse a default value string into the appropriate JSON type based on column data type.
///
/// - `tinyint(1)` / `bool` / `boolean` → JSON Boolean
/// - Integer types (int, bigint, smallint, tinyint) → JSON Number
/// - Float types (float, double, real) → JSON Number
/// - JSON types → Parsed JSON value
/// - Decimal/numeric → JSON String (preserve precision)
/// - String types (varchar, text, char) → JSON String
pub fn parse_default_value(default_str: &str, data_type: &str) -> serde_json::Value {
    let dt_lower = data_type.to_lowercase();

    if dt_lower.starts_with("tinyint(1)") || dt_lower.starts_with("bool") {
        match default_str.to_lowercase().as_str() {
            "true" | "1" => return serde_json::Value::Bool(true),
            "false" | "0" => return serde_json::Value::Bool(false),
            _ => {}
        }
    }

    if dt_lower.contains("int") {
        if let Ok(n) = default_str.parse::<i64>() {
            return serde_json::Value::Number(n.into());
        }
    }

    if dt_lower.starts_with("float") || dt_lower.starts_with("double") || dt_lower == "real" {
        if let Ok(n) = default_str.parse::<f64>() {
            if let Some(num) = serde_json::Number::from_f64(n) {
                return serde_json::Value::Number(num);
            }
        }
    }

    if dt_lower == "json" {
        if let Ok(parsed) = serde_json::from_str(default_str) {
            return parsed;
        }
    }

    // Everything else: decimal, varchar, text, dates, etc.
    serde_json::Value::String(default_str.to_string())
}
