//! Table model types.
//!
//! A [`TableModel`] describes one table: what the configuration wants the
//! database to look like, or what the database currently looks like when
//! produced by the introspector. The reconciler compares the two.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TablesError};

/// Name of the surrogate primary key carried by referenced tables.
pub const SURROGATE_KEY: &str = "id";

/// Definition of one declared field.
///
/// Every declared field is stored as `TEXT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Default value, if any.
    #[serde(default, alias = "default")]
    pub default_value: Option<String>,
    /// Whether the field is NOT NULL.
    #[serde(default)]
    pub not_null: bool,
    /// Whether the field is UNIQUE.
    #[serde(default)]
    pub unique: bool,
}

impl Field {
    /// Creates a nullable, non-unique field without a default.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: None,
            not_null: false,
            unique: false,
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Sets the field as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Sets the field as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Target of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referenced table.
    pub table: String,
    /// Referenced field.
    pub field: String,
}

/// Description of one table.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct TableModel {
    /// Table name.
    pub name: String,
    /// Declared fields, in column order.
    pub fields: Vec<Field>,
    /// Whether the table carries the surrogate key.
    pub referenced: bool,
    /// Foreign keys by local field name.
    pub foreign_keys: BTreeMap<String, ForeignKey>,
}

impl TableModel {
    /// Creates an empty, non-referenced table model.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            referenced: false,
            foreign_keys: BTreeMap::new(),
        }
    }

    /// Adds a field, builder style.
    ///
    /// Meant for literal models written in code; anything built from outside
    /// data (such as [`config`](crate::config)) goes through
    /// [`add_field`](Self::add_field).
    ///
    /// # Panics
    ///
    /// Panics on a duplicate field name or on the surrogate key name.
    #[must_use]
    pub fn with_field(mut self, field: Field) -> Self {
        if let Err(e) = self.add_field(field) {
            panic!("{e}");
        }
        self
    }

    /// Sets whether the table is referenced.
    #[must_use]
    pub fn with_referenced(mut self, referenced: bool) -> Self {
        self.referenced = referenced;
        self
    }

    /// Appends a field.
    ///
    /// Fails if a field of the same name exists or if the name is the
    /// surrogate key.
    pub fn add_field(&mut self, field: Field) -> Result<()> {
        if field.name == SURROGATE_KEY {
            return Err(TablesError::ReservedField {
                table: self.name.clone(),
                field: field.name,
            });
        }
        if self.has_column(&field.name) {
            return Err(TablesError::DuplicateField {
                table: self.name.clone(),
                field: field.name,
            });
        }
        self.fields.push(field);
        Ok(())
    }

    /// Removes the first field with the given name. No-op if absent.
    pub fn remove_field(&mut self, name: &str) {
        if let Some(idx) = self.fields.iter().position(|f| f.name == name) {
            self.fields.remove(idx);
            self.foreign_keys.remove(name);
        }
    }

    /// Declares `field` as referring to `table.referenced_field`.
    pub fn add_foreign_key(
        &mut self,
        field: impl Into<String>,
        table: impl Into<String>,
        referenced_field: impl Into<String>,
    ) {
        self.foreign_keys.insert(
            field.into(),
            ForeignKey {
                table: table.into(),
                field: referenced_field.into(),
            },
        );
    }

    /// Returns whether a declared field has this name.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Gets a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns the declared field names.
    #[must_use]
    pub fn field_names(&self) -> BTreeSet<&str> {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .filter(|name| *name != SURROGATE_KEY)
            .collect()
    }

    /// Compares name, referenced flag and field-name set.
    ///
    /// Field properties are not compared; they only matter when a table is
    /// created.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self.name == other.name
            && self.referenced == other.referenced
            && self.field_names() == other.field_names()
    }

    /// Returns the fields of `self` that `other` lacks (by name).
    ///
    /// `model.diff(&live)` gives the fields to add, `live.diff(&model)` the
    /// fields to remove. The surrogate key never shows up.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<Field> {
        let theirs = other.field_names();
        self.fields
            .iter()
            .filter(|f| f.name != SURROGATE_KEY && !theirs.contains(f.name.as_str()))
            .cloned()
            .collect()
    }
}

impl PartialEq for TableModel {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}
