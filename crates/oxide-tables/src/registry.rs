//! Relation registry.
//!
//! This module manages the `oxide_relations` table that records which join
//! tables exist and which two tables each one links. Join tables are looked
//! up here, never by matching table names.

use sqlx::{Row, SqliteConnection};

use crate::error::{Result, TablesError};
use crate::sql::{join_table_name, quote_value};
use crate::store::{execute, fetch};

/// Name of the registry table.
pub const REGISTRY_TABLE: &str = "oxide_relations";

/// SQL to create the registry table.
pub const CREATE_REGISTRY_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS oxide_relations (
    join_table TEXT PRIMARY KEY,
    first_table TEXT NOT NULL,
    second_table TEXT NOT NULL,
    UNIQUE(first_table, second_table)
)
"#;

/// Returns whether a table belongs to the engine or to this crate.
#[must_use]
pub fn is_reserved_table(name: &str) -> bool {
    name == REGISTRY_TABLE || name.starts_with("sqlite_")
}

/// A registered join table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct JoinTable {
    /// Join table name.
    pub name: String,
    /// Table whose ids fill the first column.
    pub first: String,
    /// Table whose ids fill the second column.
    pub second: String,
}

impl JoinTable {
    /// Describes the join table of `first` and `second`.
    #[must_use]
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        let first = first.into();
        let second = second.into();
        Self {
            name: join_table_name(&first, &second),
            first,
            second,
        }
    }

    /// Returns whether `table` is one of the two linked tables.
    #[must_use]
    pub fn involves(&self, table: &str) -> bool {
        self.first == table || self.second == table
    }

    /// Returns whether this join table links `a` and `b`, in either order.
    #[must_use]
    pub fn links(&self, a: &str, b: &str) -> bool {
        (self.first == a && self.second == b) || (self.first == b && self.second == a)
    }

    /// Returns the table on the other side of `table`.
    #[must_use]
    pub fn other(&self, table: &str) -> Option<&str> {
        if self.first == table {
            Some(&self.second)
        } else if self.second == table {
            Some(&self.first)
        } else {
            None
        }
    }
}

/// Reads and writes the relation registry.
pub struct Registry<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> Registry<'c> {
    /// Creates a registry handle over a connection the caller already holds.
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Ensures the registry table exists.
    pub async fn ensure_table(&mut self) -> Result<()> {
        execute(&mut *self.conn, CREATE_REGISTRY_TABLE_SQL).await?;
        Ok(())
    }

    /// Records a join table.
    pub async fn register(&mut self, join: &JoinTable) -> Result<()> {
        let sql = format!(
            "INSERT INTO oxide_relations (join_table, first_table, second_table) VALUES ({}, {}, {})",
            quote_value(&join.name),
            quote_value(&join.first),
            quote_value(&join.second)
        );
        execute(&mut *self.conn, &sql).await?;
        Ok(())
    }

    /// Forgets a join table.
    pub async fn unregister(&mut self, join_table: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM oxide_relations WHERE join_table = {}",
            quote_value(join_table)
        );
        execute(&mut *self.conn, &sql).await?;
        Ok(())
    }

    /// Gets every registered join table.
    pub async fn all(&mut self) -> Result<Vec<JoinTable>> {
        let rows = fetch(
            &mut *self.conn,
            "SELECT join_table, first_table, second_table FROM oxide_relations ORDER BY join_table",
        )
        .await?;
        rows.iter()
            .map(|row| {
                Ok(JoinTable {
                    name: row.try_get("join_table")?,
                    first: row.try_get("first_table")?,
                    second: row.try_get("second_table")?,
                })
            })
            .collect::<std::result::Result<_, sqlx::Error>>()
            .map_err(TablesError::from)
    }

    /// Finds the join table linking `a` and `b`, in either order.
    pub async fn find(&mut self, a: &str, b: &str) -> Result<Option<JoinTable>> {
        Ok(self.all().await?.into_iter().find(|j| j.links(a, b)))
    }

    /// Gets the join tables that involve `table`.
    pub async fn involving(&mut self, table: &str) -> Result<Vec<JoinTable>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|j| j.involves(table))
            .collect())
    }

    /// Returns whether `name` is a registered join table.
    pub async fn is_join_table(&mut self, name: &str) -> Result<bool> {
        Ok(self.all().await?.iter().any(|j| j.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::ConnectOptions;
    use std::str::FromStr;

    async fn connect() -> SqliteConnection {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .expect("Failed to open in-memory SQLite database")
    }

    #[test]
    fn test_join_table_naming() {
        let join = JoinTable::new("x", "y");

        assert_eq!(join.name, "x_y");
        assert!(join.links("y", "x"));
        assert!(join.involves("x"));
        assert!(!join.involves("x_y"));
        assert_eq!(join.other("y"), Some("x"));
        assert_eq!(join.other("z"), None);
    }

    #[test]
    fn test_reserved_tables() {
        assert!(is_reserved_table("sqlite_sequence"));
        assert!(is_reserved_table(REGISTRY_TABLE));
        assert!(!is_reserved_table("users"));
    }

    #[tokio::test]
    async fn test_ensure_table() {
        let mut conn = connect().await;
        let mut registry = Registry::new(&mut conn);

        // Should not fail
        registry.ensure_table().await.unwrap();
        // Should be idempotent
        registry.ensure_table().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_and_find() {
        let mut conn = connect().await;
        let mut registry = Registry::new(&mut conn);
        registry.ensure_table().await.unwrap();

        assert!(registry.find("a", "b").await.unwrap().is_none());

        registry.register(&JoinTable::new("a", "b")).await.unwrap();
        registry.register(&JoinTable::new("a_b", "c")).await.unwrap();

        assert_eq!(registry.find("b", "a").await.unwrap().unwrap().name, "a_b");
        assert_eq!(registry.involving("a").await.unwrap().len(), 1);
        assert_eq!(registry.involving("c").await.unwrap()[0].name, "a_b_c");
        assert!(registry.is_join_table("a_b_c").await.unwrap());
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let mut conn = connect().await;
        let mut registry = Registry::new(&mut conn);
        registry.ensure_table().await.unwrap();

        registry.register(&JoinTable::new("a", "b")).await.unwrap();
        assert!(registry.register(&JoinTable::new("a", "b")).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister() {
        let mut conn = connect().await;
        let mut registry = Registry::new(&mut conn);
        registry.ensure_table().await.unwrap();

        registry.register(&JoinTable::new("a", "b")).await.unwrap();
        registry.unregister("a_b").await.unwrap();

        assert!(registry.all().await.unwrap().is_empty());
    }
}
