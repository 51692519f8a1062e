//! Minimal relation values and the `IN (subquery)` predicate handler.
//!
//! A `Relation` is a SELECT over one table: projection, eager-loaded associations,
//! optimizer hints, conditions, order and limit. It renders to MySQL SQL with `?`
//! placeholders plus the values to bind, ready for `Connection::exec_query`.

use crate::db::model_schema::PrimaryKey;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use serde::Serialize;

/// Quote an identifier with backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// SQL text and the values bound to its placeholders, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub binds: Vec<QueryParam>,
}

/// A column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Attribute {
    pub table: String,
    pub name: String,
}

impl Attribute {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn to_sql(&self) -> String {
        format!("{}.{}", quote_identifier(&self.table), quote_identifier(&self.name))
    }

    pub fn equals(&self, value: impl Into<QueryParam>) -> Predicate {
        Predicate::Eq {
            attribute: self.clone(),
            value: value.into(),
        }
    }

    pub fn in_values<I, V>(&self, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<QueryParam>,
    {
        Predicate::InValues {
            attribute: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `self IN (relation)`, with the relation prepared by `RelationHandler`.
    pub fn in_relation(&self, relation: Relation) -> DbResult<Predicate> {
        RelationHandler.call(self.clone(), relation)
    }
}

/// A boolean condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq {
        attribute: Attribute,
        value: QueryParam,
    },
    InValues {
        attribute: Attribute,
        values: Vec<QueryParam>,
    },
    In {
        attribute: Attribute,
        subquery: Box<Relation>,
    },
}

impl Predicate {
    pub fn to_sql(&self) -> SqlFragment {
        match self {
            Self::Eq { attribute, value } if value.is_null() => SqlFragment {
                sql: format!("{} IS NULL", attribute.to_sql()),
                binds: Vec::new(),
            },
            Self::Eq { attribute, value } => SqlFragment {
                sql: format!("{} = ?", attribute.to_sql()),
                binds: vec![value.clone()],
            },
            // An empty list matches nothing
            Self::InValues { values, .. } if values.is_empty() => SqlFragment {
                sql: "1=0".to_string(),
                binds: Vec::new(),
            },
            Self::InValues { attribute, values } => SqlFragment {
                sql: format!(
                    "{} IN ({})",
                    attribute.to_sql(),
                    vec!["?"; values.len()].join(", ")
                ),
                binds: values.clone(),
            },
            Self::In { attribute, subquery } => {
                let inner = subquery.to_sql();
                SqlFragment {
                    sql: format!("{} IN ({})", attribute.to_sql(), inner.sql),
                    binds: inner.binds,
                }
            }
        }
    }
}

/// An association loaded together with the base table through a LEFT OUTER JOIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EagerLoad {
    pub association: String,
    pub table: String,
    /// Column of `table` pointing at the base table's primary key.
    pub foreign_key: String,
}

/// A SELECT over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    table: String,
    primary_key: Option<PrimaryKey>,
    select_values: Vec<String>,
    eager_load: Vec<EagerLoad>,
    optimizer_hints: Vec<String>,
    conditions: Vec<Predicate>,
    order: Vec<(String, bool)>,
    limit: Option<u64>,
}

impl Relation {
    pub fn new(table: impl Into<String>, primary_key: Option<PrimaryKey>) -> Self {
        Self {
            table: table.into(),
            primary_key,
            select_values: Vec::new(),
            eager_load: Vec::new(),
            optimizer_hints: Vec::new(),
            conditions: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        self.primary_key.as_ref()
    }

    pub fn arel_attribute(&self, name: impl Into<String>) -> Attribute {
        Attribute::new(self.table.clone(), name)
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select_values.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn select_values(&self) -> &[String] {
        &self.select_values
    }

    pub fn eager_load(mut self, association: EagerLoad) -> Self {
        self.eager_load.push(association);
        self
    }

    pub fn is_eager_loading(&self) -> bool {
        !self.eager_load.is_empty()
    }

    pub fn optimizer_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optimizer_hints.extend(hints.into_iter().map(Into::into));
        self
    }

    pub fn optimizer_hints_values(&self) -> &[String] {
        &self.optimizer_hints
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.conditions.push(predicate);
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Drop eager-loaded associations.
    pub fn without_eager_loading(mut self) -> Self {
        self.eager_load.clear();
        self
    }

    /// Drop optimizer hints.
    pub fn unscope_optimizer_hints(mut self) -> Self {
        self.optimizer_hints.clear();
        self
    }

    pub fn to_sql(&self) -> SqlFragment {
        let table = quote_identifier(&self.table);
        let mut sql = String::from("SELECT ");
        let mut binds = Vec::new();

        if !self.optimizer_hints.is_empty() {
            sql.push_str(&format!("/*+ {} */ ", self.optimizer_hints.join(" ")));
        }

        if self.select_values.is_empty() {
            sql.push_str(&format!("{table}.*"));
        } else {
            let columns: Vec<String> = self
                .select_values
                .iter()
                .map(|c| self.arel_attribute(c.clone()).to_sql())
                .collect();
            sql.push_str(&columns.join(", "));
        }
        sql.push_str(&format!(" FROM {table}"));

        let base_key = self
            .primary_key
            .as_ref()
            .and_then(|pk| pk.columns().first().cloned())
            .unwrap_or_else(|| "id".to_string());
        for join in &self.eager_load {
            sql.push_str(&format!(
                " LEFT OUTER JOIN {} ON {} = {}",
                quote_identifier(&join.table),
                Attribute::new(join.table.clone(), join.foreign_key.clone()).to_sql(),
                self.arel_attribute(base_key.clone()).to_sql(),
            ));
        }

        if !self.conditions.is_empty() {
            let parts: Vec<String> = self
                .conditions
                .iter()
                .map(|predicate| {
                    let fragment = predicate.to_sql();
                    binds.extend(fragment.binds);
                    fragment.sql
                })
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&parts.join(" AND "));
        }

        if !self.order.is_empty() {
            let parts: Vec<String> = self
                .order
                .iter()
                .map(|(column, ascending)| {
                    let direction = if *ascending { "ASC" } else { "DESC" };
                    format!("{} {direction}", self.arel_attribute(column.clone()).to_sql())
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        SqlFragment { sql, binds }
    }
}

/// Turns a relation on the right-hand side of `IN` into a subquery predicate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelationHandler;

impl RelationHandler {
    /// Build `attribute IN (value)`.
    ///
    /// Eager loading and optimizer hints are stripped from the subquery. Without an
    /// explicit projection the subquery selects the relation's primary key, which
    /// must then be a single column.
    pub fn call(&self, attribute: Attribute, value: Relation) -> DbResult<Predicate> {
        let mut value = value;
        if value.is_eager_loading() {
            value = value.without_eager_loading();
        }
        if !value.optimizer_hints_values().is_empty() {
            value = value.unscope_optimizer_hints();
        }
        if value.select_values().is_empty() {
            let column = match value.primary_key() {
                Some(PrimaryKey::Single(column)) => column.clone(),
                Some(PrimaryKey::Composite(_)) => {
                    return Err(DbError::invalid_input(format!(
                        "cannot compare {} with `{}`: its primary key has several columns",
                        attribute.to_sql(),
                        value.table()
                    )));
                }
                None => {
                    return Err(DbError::invalid_input(format!(
                        "`{}` has no primary key to select",
                        value.table()
                    )));
                }
            };
            value = value.select([column]);
        }
        Ok(Predicate::In {
            attribute,
            subquery: Box::new(value),
        })
    }
}
