//! Live schema introspection.
//!
//! Reads what a table looks like right now. Nothing is cached: another
//! operation may change the schema between two calls.
//!
//! Introspection never fails loudly. A missing table or unreadable metadata
//! is logged and reported as "nothing there", so presence checks are safe to
//! call speculatively and the reconciler falls back to creating fresh tables.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use crate::error::{Result, TablesError};
use crate::model::{Field, TableModel, SURROGATE_KEY};
use crate::sql::{quote_identifier, unquote_default};

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Declaration index.
    pub cid: i64,
    /// Column name.
    pub name: String,
    /// Declared type (may be empty).
    pub declared_type: String,
    /// Whether the column is NOT NULL.
    pub not_null: bool,
    /// Default value, unquoted.
    pub default_value: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it.
    pub pk: i64,
}

/// Reads the structure of the live database.
pub struct Introspector<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> Introspector<'c> {
    /// Creates an introspector over a connection the caller already holds.
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Returns the names of all tables, system tables included.
    pub async fn list_tables(&mut self) -> BTreeSet<String> {
        match self.try_list_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                warn!(error = %e, "Could not list tables");
                BTreeSet::new()
            }
        }
    }

    async fn try_list_tables(&mut self) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&mut *self.conn)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(TablesError::from))
            .collect()
    }

    /// Returns whether the table exists.
    pub async fn table_exists(&mut self, table: &str) -> bool {
        self.list_tables().await.contains(table)
    }

    /// Returns the table's columns in declaration order.
    pub async fn columns(&mut self, table: &str) -> Vec<ColumnInfo> {
        match self.try_columns(table).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not read table_info");
                Vec::new()
            }
        }
    }

    async fn try_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(table));
        debug!(sql = %sql, "Introspecting");
        let rows = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let default: Option<String> = row.try_get("dflt_value")?;
            columns.push(ColumnInfo {
                cid: row.try_get("cid")?,
                name: row.try_get("name")?,
                declared_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                default_value: default.as_deref().map(unquote_default),
                pk: row.try_get("pk")?,
            });
        }
        Ok(columns)
    }

    /// Returns the columns covered by a single-column unique index.
    async fn unique_columns(&mut self, table: &str) -> BTreeSet<String> {
        match self.try_unique_columns(table).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not read index metadata");
                BTreeSet::new()
            }
        }
    }

    async fn try_unique_columns(&mut self, table: &str) -> Result<BTreeSet<String>> {
        let sql = format!("PRAGMA index_list({})", quote_identifier(table));
        let indexes = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;

        let mut unique = BTreeSet::new();
        for index in indexes {
            if index.try_get::<i64, _>("unique")? == 0 {
                continue;
            }
            // The primary key index of a join table is unique too, but it
            // spans two columns and is skipped below.
            let name: String = index.try_get("name")?;
            let sql = format!("PRAGMA index_info({})", quote_identifier(&name));
            let info = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;
            if info.len() != 1 {
                continue;
            }
            if let Some(column) = info[0].try_get::<Option<String>, _>("name")? {
                unique.insert(column);
            }
        }
        Ok(unique)
    }

    /// Returns whether the table carries a surrogate key: exactly one primary
    /// key column, declared first.
    pub async fn is_referenced(&mut self, table: &str) -> bool {
        is_referenced(&self.columns(table).await)
    }

    /// Returns the field names, without the surrogate key of a referenced
    /// table.
    pub async fn get_field_names(&mut self, table: &str) -> BTreeSet<String> {
        let columns = self.columns(table).await;
        let referenced = is_referenced(&columns);
        columns
            .into_iter()
            .filter(|c| !(referenced && c.name == SURROGATE_KEY))
            .map(|c| c.name)
            .collect()
    }

    /// Returns the default value of every column that has one.
    pub async fn get_default_values(&mut self, table: &str) -> BTreeMap<String, String> {
        self.columns(table)
            .await
            .into_iter()
            .filter_map(|c| c.default_value.map(|d| (c.name, d)))
            .collect()
    }

    /// Returns the NOT NULL flag of every column.
    pub async fn get_not_null_flags(&mut self, table: &str) -> BTreeMap<String, bool> {
        self.columns(table)
            .await
            .into_iter()
            .map(|c| (c.name, c.not_null))
            .collect()
    }

    /// Returns whether each column is unique.
    pub async fn get_uniqueness(&mut self, table: &str) -> BTreeMap<String, bool> {
        let columns = self.columns(table).await;
        let unique = self.unique_columns(table).await;
        columns
            .into_iter()
            .map(|c| {
                let is_unique = unique.contains(&c.name);
                (c.name, is_unique)
            })
            .collect()
    }

    /// Returns the primary key columns.
    pub async fn get_primary_keys(&mut self, table: &str) -> BTreeSet<String> {
        self.columns(table)
            .await
            .into_iter()
            .filter(|c| c.pk > 0)
            .map(|c| c.name)
            .collect()
    }

    /// Builds a model snapshot of the live table.
    ///
    /// A missing table yields a model with no fields.
    pub async fn materialize(&mut self, table: &str) -> TableModel {
        let columns = self.columns(table).await;
        let unique = self.unique_columns(table).await;
        let referenced = is_referenced(&columns);

        let mut model = TableModel::new(table).with_referenced(referenced);
        model.fields = columns
            .into_iter()
            .filter(|c| !(referenced && c.name == SURROGATE_KEY))
            .map(|c| Field {
                unique: unique.contains(&c.name),
                name: c.name,
                default_value: c.default_value,
                not_null: c.not_null,
            })
            .collect();
        model
    }
}

/// Surrogate key detection on `table_info` rows: a single integer primary
/// key column whose key position is its declaration index + 1.
pub(crate) fn is_referenced(columns: &[ColumnInfo]) -> bool {
    let mut keys = columns.iter().filter(|c| c.pk > 0);
    match (keys.next(), keys.next()) {
        (Some(key), None) => {
            key.pk == key.cid + 1 && key.declared_type.eq_ignore_ascii_case("INTEGER")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{ConnectOptions, Connection};
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;

    async fn connect() -> SqliteConnection {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid url")
            .connect()
            .await
            .expect("Failed to open in-memory SQLite database")
    }

    async fn run(conn: &mut SqliteConnection, sql: &str) {
        sqlx::query(sql).execute(&mut *conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_table() {
        let mut conn = connect().await;
        run(
            &mut conn,
            "CREATE TABLE t (f1 TEXT NOT NULL DEFAULT 'x', f2 TEXT UNIQUE, f3 TEXT)",
        )
        .await;
        let mut inspect = Introspector::new(&mut conn);

        assert!(inspect.table_exists("t").await);
        assert!(!inspect.is_referenced("t").await);
        assert_eq!(
            inspect.get_field_names("t").await,
            ["f1", "f2", "f3"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>()
        );
        assert_eq!(inspect.get_default_values("t").await["f1"], "x");
        assert!(inspect.get_not_null_flags("t").await["f1"]);
        let uniqueness = inspect.get_uniqueness("t").await;
        assert!(uniqueness["f2"]);
        assert!(!uniqueness["f3"]);
        assert!(inspect.get_primary_keys("t").await.is_empty());

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_referenced_table() {
        let mut conn = connect().await;
        run(
            &mut conn,
            "CREATE TABLE r (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)",
        )
        .await;
        let mut inspect = Introspector::new(&mut conn);

        assert!(inspect.is_referenced("r").await);
        assert_eq!(
            inspect.get_field_names("r").await,
            BTreeSet::from(["name".to_string()])
        );
        let model = inspect.materialize("r").await;
        assert!(model.referenced);
        assert_eq!(model.fields.len(), 1);
        assert_eq!(
            inspect.get_primary_keys("r").await,
            BTreeSet::from(["id".to_string()])
        );
    }

    #[tokio::test]
    async fn test_composite_key_is_not_referenced() {
        let mut conn = connect().await;
        run(
            &mut conn,
            "CREATE TABLE j (a INTEGER, b INTEGER, PRIMARY KEY (a, b))",
        )
        .await;
        let mut inspect = Introspector::new(&mut conn);

        assert!(!inspect.is_referenced("j").await);
        assert_eq!(inspect.get_primary_keys("j").await.len(), 2);
        assert!(!inspect.get_uniqueness("j").await["a"]);
    }

    #[tokio::test]
    async fn test_missing_table_is_empty() {
        let mut conn = connect().await;
        let mut inspect = Introspector::new(&mut conn);

        assert!(!inspect.table_exists("nope").await);
        assert!(inspect.columns("nope").await.is_empty());
        let model = inspect.materialize("nope").await;
        assert!(model.fields.is_empty());
        assert!(!model.referenced);
    }

    #[test]
    fn test_is_referenced_rule() {
        let column = |cid, name: &str, pk| ColumnInfo {
            cid,
            name: name.to_string(),
            declared_type: "INTEGER".to_string(),
            not_null: false,
            default_value: None,
            pk,
        };

        assert!(is_referenced(&[column(0, "id", 1), column(1, "x", 0)]));
        assert!(!is_referenced(&[column(0, "x", 0), column(1, "id", 1)]));
        assert!(!is_referenced(&[column(0, "a", 1), column(1, "b", 2)]));
        assert!(!is_referenced(&[]));
    }
}
