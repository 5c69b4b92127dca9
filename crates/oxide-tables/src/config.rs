//! JSON schema descriptions.
//!
//! A configuration file lists the tables to keep in the database, their
//! default records and the relationships between them:
//!
//! ```json
//! {
//!   "tables": [
//!     { "name": "x", "fields": [{ "name": "label", "not_null": true }],
//!       "default_records": [{ "label": "first" }] },
//!     { "name": "y", "fields": [{ "name": "tag", "default": "none" }] }
//!   ],
//!   "relationships": [
//!     { "kind": "m:n", "policy": "link-all", "first_table": "x", "second_table": "y" }
//!   ]
//! }
//! ```
//!
//! [`DatabaseConfig::into_schema`] validates the description and turns it into
//! the [`Schema`] the reconciler works from.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TablesError};
use crate::model::{Field, TableModel};
use crate::registry::is_reserved_table;
use crate::relation::{Policy, RelationKind, Relationship};
use crate::store::Record;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Declared tables.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
    /// Declared relationships.
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
}

/// One declared table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name.
    pub name: String,
    /// Declared fields.
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Records inserted when the table is created.
    #[serde(default)]
    pub default_records: Vec<Record>,
}

/// One declared relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipConfig {
    /// Relationship kind; only `m:n` is accepted.
    pub kind: String,
    /// Population policy.
    #[serde(default)]
    pub policy: Policy,
    /// First participant.
    pub first_table: String,
    /// Second participant.
    pub second_table: String,
}

/// A table the database should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    /// Wanted shape.
    pub model: TableModel,
    /// Records inserted when the table is created.
    pub default_records: Vec<Record>,
}

impl TableDefinition {
    /// Defines a table without default records.
    #[must_use]
    pub fn new(model: TableModel) -> Self {
        Self {
            model,
            default_records: Vec::new(),
        }
    }

    /// Sets the default records.
    #[must_use]
    pub fn with_default_records(mut self, records: Vec<Record>) -> Self {
        self.default_records = records;
        self
    }
}

/// Everything a migration pass needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    /// Wanted tables.
    pub tables: Vec<TableDefinition>,
    /// Wanted relationships.
    pub relationships: Vec<Relationship>,
}

impl Schema {
    /// Gets a table definition by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.model.name == name)
    }
}

impl DatabaseConfig {
    /// Parses a configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validates the configuration and builds the schema.
    ///
    /// Tables taking part in a relationship come out referenced.
    pub fn into_schema(self) -> Result<Schema> {
        let mut names = BTreeSet::new();
        let mut tables = Vec::with_capacity(self.tables.len());

        for table in self.tables {
            if table.name.is_empty() {
                return Err(TablesError::Config("table without a name".to_string()));
            }
            if is_reserved_table(&table.name) {
                return Err(TablesError::Config(format!(
                    "table name '{}' is reserved",
                    table.name
                )));
            }
            if !names.insert(table.name.clone()) {
                return Err(TablesError::Config(format!(
                    "table '{}' is declared twice",
                    table.name
                )));
            }

            let mut model = TableModel::new(&table.name);
            for field in table.fields {
                model
                    .add_field(field)
                    .map_err(|e| TablesError::Config(e.to_string()))?;
            }
            tables.push(
                TableDefinition::new(model).with_default_records(table.default_records),
            );
        }

        let mut relationships = Vec::with_capacity(self.relationships.len());
        for rel in self.relationships {
            let kind: RelationKind = rel.kind.parse()?;
            for name in [&rel.first_table, &rel.second_table] {
                if !names.contains(name) {
                    return Err(TablesError::Config(format!(
                        "relationship names undeclared table '{name}'"
                    )));
                }
            }
            if rel.first_table == rel.second_table {
                return Err(TablesError::SelfRelation(rel.first_table));
            }
            relationships.push(Relationship {
                kind,
                policy: rel.policy,
                first_table: rel.first_table,
                second_table: rel.second_table,
            });
        }

        for definition in &mut tables {
            let name = definition.model.name.as_str();
            definition.model.referenced = relationships
                .iter()
                .any(|r| r.first_table == name || r.second_table == name);
        }

        if let Some(empty) = tables
            .iter()
            .find(|t| !t.model.referenced && t.model.fields.is_empty())
        {
            return Err(TablesError::Config(format!(
                "table '{}' has no fields",
                empty.model.name
            )));
        }

        debug!(
            tables = tables.len(),
            relationships = relationships.len(),
            "Loaded schema"
        );
        Ok(Schema {
            tables,
            relationships,
        })
    }
}

/// Reads and validates a configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<Schema> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Reading configuration");
    let json = std::fs::read_to_string(path)?;
    DatabaseConfig::from_json(&json)?.into_schema()
}
