//! Declarative SQLite tables that keep themselves in shape.
//!
//! `oxide-tables` layers a small table abstraction over SQLite:
//! - Records are plain `field name -> text` maps, whatever the column types
//! - Table definitions are declared (in code or JSON) and the live database is
//!   reconciled against them, creating and rebuilding tables while keeping data
//! - Many-to-many relationships are materialized as join tables, with
//!   policy-driven auto-linking
//!
//! # Architecture
//!
//! - **Model** - [`TableModel`] describes a table; equality and diffing drive
//!   reconciliation
//! - **Introspect** - reads the live structure of a table
//! - **Store** - generic CRUD over named tables
//! - **Registry** - persisted list of join tables
//! - **Reconcile** - migration pass and the table rebuild state machine
//! - **Relation** - join tables, policies, link and unlink
//! - **Config** - JSON descriptions turned into a [`Schema`]
//! - **Database** - lock + transaction façade, [`Session`] for composition
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_tables::prelude::*;
//!
//! let schema = config::load("tables.json")?;
//! let db = Database::open_with_schema("sqlite:app.db", &schema).await?;
//!
//! db.insert("x", &[record! { "label" => "a" }]).await?;
//! db.link("x", &record! { "label" => "a" }, "y", &record! { "tag" => "b" }).await?;
//!
//! let linked = db.get_linked_records("x", &record! { "label" => "a" }).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Bring the database in line with a description
//! oxide-tables migrate --config tables.json
//!
//! # Show table contents
//! oxide-tables dump --table x
//!
//! # List tables
//! oxide-tables tables
//! ```

pub mod config;
pub mod database;
pub mod dump;
pub mod error;
pub mod introspect;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod relation;
pub mod sql;
pub mod store;

pub use config::{DatabaseConfig, Schema, TableDefinition};
pub use database::{Database, DatabaseFactory, Session};
pub use error::{Result, TablesError};
pub use model::{Field, TableModel};
pub use reconcile::MigrationReport;
pub use relation::{Policy, RelationKind, Relationship};
pub use store::Record;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{self, DatabaseConfig, Schema, TableDefinition};
    pub use crate::database::{Database, DatabaseFactory, Session};
    pub use crate::error::{Result, TablesError};
    pub use crate::introspect::Introspector;
    pub use crate::model::{Field, ForeignKey, TableModel, SURROGATE_KEY};
    pub use crate::reconcile::{MigrationReport, Rebuild, RebuildStep, Reconciler, TableChange};
    pub use crate::record;
    pub use crate::registry::{JoinTable, Registry};
    pub use crate::relation::{Policy, RelationKind, Relations, Relationship};
    pub use crate::store::{Record, RecordStore};
}
