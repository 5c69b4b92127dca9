//! Generic record access.
//!
//! Records are maps from field name to text. Whatever the declared SQL type
//! of a column, callers hand in strings and get strings back. A NULL cell
//! reads back as the empty string: this layer does not tell "no value" and
//! "empty value" apart. The rebuild machinery works on [`RawRecord`] instead,
//! which keeps NULLs intact.

use std::collections::BTreeMap;

use sqlx::sqlite::{SqliteQueryResult, SqliteRow};
use sqlx::{Column, Row, SqliteConnection};
use tracing::{debug, error};

use crate::error::{Result, TablesError};
use crate::introspect::Introspector;
use crate::sql;

/// A row as field name → text value.
pub type Record = BTreeMap<String, String>;

/// A row whose cells may be NULL.
pub type RawRecord = BTreeMap<String, Option<String>>;

/// Builds a [`Record`] from `key => value` pairs.
///
/// ```
/// let r = oxide_tables::record! { "f1" => "a", "f2" => "b" };
/// assert_eq!(r["f2"], "b");
/// ```
#[macro_export]
macro_rules! record {
    () => {
        $crate::store::Record::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::store::Record::new();
        $(
            record.insert(::std::string::String::from($key), ::std::string::String::from($value));
        )+
        record
    }};
}

/// Executes one statement, logging its text at debug level and again on
/// failure.
pub(crate) async fn execute(conn: &mut SqliteConnection, sql: &str) -> Result<SqliteQueryResult> {
    debug!(sql = %sql, "Executing SQL");
    sqlx::query(sql).execute(conn).await.map_err(|e| {
        error!(sql = %sql, error = %e, "Statement failed");
        TablesError::from(e)
    })
}

/// Runs one query, logging like [`execute`].
pub(crate) async fn fetch(conn: &mut SqliteConnection, sql: &str) -> Result<Vec<SqliteRow>> {
    debug!(sql = %sql, "Running query");
    sqlx::query(sql).fetch_all(conn).await.map_err(|e| {
        error!(sql = %sql, error = %e, "Query failed");
        TablesError::from(e)
    })
}

fn decode_row(row: &SqliteRow) -> Result<RawRecord> {
    let mut record = RawRecord::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value: Option<String> = row.try_get(idx)?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

/// Collapses NULL cells to empty strings.
pub(crate) fn flatten(raw: RawRecord) -> Record {
    raw.into_iter()
        .map(|(k, v)| (k, v.unwrap_or_default()))
        .collect()
}

/// CRUD over named tables.
pub struct RecordStore<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> RecordStore<'c> {
    /// Creates a record store over a connection the caller already holds.
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Expands an empty or `*` projection into the table's columns.
    async fn resolve_columns(&mut self, table: &str, columns: &[&str]) -> Result<Vec<String>> {
        if !columns.is_empty() && columns != ["*"] {
            return Ok(columns.iter().map(|c| (*c).to_string()).collect());
        }
        let all: Vec<String> = Introspector::new(&mut *self.conn)
            .columns(table)
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        if all.is_empty() {
            return Err(TablesError::UnknownTable(table.to_string()));
        }
        Ok(all)
    }

    /// Selects rows of `table`.
    ///
    /// An empty `columns` slice or `["*"]` selects every column. Records are
    /// always keyed by column name.
    pub async fn select(
        &mut self,
        table: &str,
        columns: &[&str],
        distinct: bool,
    ) -> Result<Vec<Record>> {
        let columns = self.resolve_columns(table, columns).await?;
        let rows = self
            .select_raw(table, &columns, distinct, &Record::new())
            .await?;
        Ok(rows.into_iter().map(flatten).collect())
    }

    /// Selects every column of the rows equal to `criteria` on each of its
    /// fields.
    pub async fn select_matching(&mut self, table: &str, criteria: &Record) -> Result<Vec<Record>> {
        let columns = self.resolve_columns(table, &[]).await?;
        let rows = self.select_raw(table, &columns, false, criteria).await?;
        Ok(rows.into_iter().map(flatten).collect())
    }

    /// Selects rows keeping NULL cells.
    pub(crate) async fn select_raw(
        &mut self,
        table: &str,
        columns: &[String],
        distinct: bool,
        criteria: &Record,
    ) -> Result<Vec<RawRecord>> {
        let sql = sql::select_sql(table, columns, distinct, criteria);
        let rows = fetch(&mut *self.conn, &sql).await?;
        rows.iter().map(decode_row).collect()
    }

    /// Inserts records. Each record brings its own column list; an empty
    /// record inserts a row of defaults.
    ///
    /// Stops at the first failing record. Records inserted before it stay
    /// unless the caller rolls back the surrounding transaction.
    pub async fn insert(&mut self, table: &str, records: &[Record]) -> Result<()> {
        for record in records {
            self.insert_one(table, record).await?;
        }
        Ok(())
    }

    /// Inserts one record and returns its rowid.
    pub async fn insert_one(&mut self, table: &str, record: &Record) -> Result<i64> {
        let sql = sql::insert_sql(
            table,
            record.iter().map(|(k, v)| (k.as_str(), Some(v.as_str()))),
        );
        Ok(execute(&mut *self.conn, &sql).await?.last_insert_rowid())
    }

    /// Inserts one record that may carry NULL cells.
    pub(crate) async fn insert_raw(&mut self, table: &str, record: &RawRecord) -> Result<i64> {
        let sql = sql::insert_sql(
            table,
            record.iter().map(|(k, v)| (k.as_str(), v.as_deref())),
        );
        Ok(execute(&mut *self.conn, &sql).await?.last_insert_rowid())
    }

    /// Updates the rows matching `criteria` with `values`.
    ///
    /// An empty `criteria` updates every row. When nothing matches and
    /// `insert_if_absent` is set, inserts `criteria` overlaid with `values`
    /// so the new row satisfies the criteria it was looked up by.
    pub async fn modify(
        &mut self,
        table: &str,
        criteria: &Record,
        values: &Record,
        insert_if_absent: bool,
    ) -> Result<()> {
        if values.is_empty() {
            return Err(TablesError::EmptyUpdate(table.to_string()));
        }

        let sql = sql::update_sql(table, values, criteria);
        let affected = execute(&mut *self.conn, &sql).await?.rows_affected();
        if affected > 0 {
            return Ok(());
        }

        if !insert_if_absent {
            return Err(TablesError::NoMatch(table.to_string()));
        }

        let mut row = criteria.clone();
        row.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.insert_one(table, &row).await?;
        Ok(())
    }

    /// Deletes the rows matching `criteria`; an empty `criteria` empties the
    /// table. Returns the number of deleted rows, which may be zero.
    pub async fn remove(&mut self, table: &str, criteria: &Record) -> Result<u64> {
        let sql = sql::delete_sql(table, criteria);
        Ok(execute(&mut *self.conn, &sql).await?.rows_affected())
    }

    /// Counts the rows matching `criteria`.
    pub async fn count(&mut self, table: &str, criteria: &Record) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {}{}",
            sql::quote_identifier(table),
            sql::where_clause(criteria)
        );
        let rows = fetch(&mut *self.conn, &sql).await?;
        let count: i64 = match rows.first() {
            Some(row) => row.try_get("n")?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::ConnectOptions;
    use std::str::FromStr;

    async fn connect_with(ddl: &str) -> SqliteConnection {
        let mut conn = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .expect("Failed to open in-memory SQLite database");
        sqlx::query(ddl).execute(&mut conn).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_insert_select_modify_remove() {
        let mut conn = connect_with("CREATE TABLE t (f1 TEXT NOT NULL, f2 TEXT NOT NULL)").await;
        let mut store = RecordStore::new(&mut conn);

        store
            .insert("t", &[record! { "f1" => "a", "f2" => "b" }])
            .await
            .unwrap();
        assert_eq!(
            store.select("t", &[], false).await.unwrap(),
            vec![record! { "f1" => "a", "f2" => "b" }]
        );

        store
            .modify("t", &record! { "f1" => "a" }, &record! { "f2" => "c" }, true)
            .await
            .unwrap();
        assert_eq!(
            store.select("t", &["*"], false).await.unwrap(),
            vec![record! { "f1" => "a", "f2" => "c" }]
        );

        store.remove("t", &record! { "f1" => "a" }).await.unwrap();
        assert!(store.select("t", &[], false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_projection_and_distinct() {
        let mut conn = connect_with("CREATE TABLE t (a TEXT, b TEXT)").await;
        let mut store = RecordStore::new(&mut conn);
        store
            .insert(
                "t",
                &[
                    record! { "a" => "1", "b" => "x" },
                    record! { "a" => "1", "b" => "y" },
                ],
            )
            .await
            .unwrap();

        let rows = store.select("t", &["a"], true).await.unwrap();
        assert_eq!(rows, vec![record! { "a" => "1" }]);
        assert_eq!(store.select("t", &["a"], false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_null_reads_as_empty_string() {
        let mut conn = connect_with("CREATE TABLE t (a TEXT, b TEXT)").await;
        let mut store = RecordStore::new(&mut conn);
        store.insert("t", &[record! { "a" => "1" }]).await.unwrap();

        let rows = store.select("t", &[], false).await.unwrap();
        assert_eq!(rows, vec![record! { "a" => "1", "b" => "" }]);

        let raw = store
            .select_raw("t", &["b".to_string()], false, &Record::new())
            .await
            .unwrap();
        assert_eq!(raw[0]["b"], None);
    }

    #[tokio::test]
    async fn test_heterogeneous_and_default_inserts() {
        let mut conn = connect_with("CREATE TABLE t (a TEXT DEFAULT 'da', b TEXT DEFAULT 'db')").await;
        let mut store = RecordStore::new(&mut conn);
        store
            .insert(
                "t",
                &[record! { "a" => "1" }, record! { "b" => "2" }, record! {}],
            )
            .await
            .unwrap();

        let rows = store.select("t", &[], false).await.unwrap();
        assert_eq!(
            rows,
            vec![
                record! { "a" => "1", "b" => "db" },
                record! { "a" => "da", "b" => "2" },
                record! { "a" => "da", "b" => "db" },
            ]
        );
    }

    #[tokio::test]
    async fn test_insert_stops_at_first_failure() {
        let mut conn = connect_with("CREATE TABLE t (a TEXT NOT NULL)").await;
        let mut store = RecordStore::new(&mut conn);

        let result = store
            .insert(
                "t",
                &[record! { "a" => "1" }, record! {}, record! { "a" => "3" }],
            )
            .await;
        assert!(matches!(result, Err(TablesError::Database(_))));
        assert_eq!(store.count("t", &Record::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_modify_upserts_with_criteria() {
        let mut conn = connect_with("CREATE TABLE t (f1 TEXT, f2 TEXT, f3 TEXT)").await;
        let mut store = RecordStore::new(&mut conn);

        store
            .modify(
                "t",
                &record! { "f1" => "a", "f2" => "old" },
                &record! { "f2" => "new", "f3" => "z" },
                true,
            )
            .await
            .unwrap();

        let rows = store.select("t", &[], false).await.unwrap();
        assert_eq!(rows, vec![record! { "f1" => "a", "f2" => "new", "f3" => "z" }]);
    }

    #[tokio::test]
    async fn test_modify_rejects_empty_values_and_missing_rows() {
        let mut conn = connect_with("CREATE TABLE t (f1 TEXT)").await;
        let mut store = RecordStore::new(&mut conn);

        let empty = store
            .modify("t", &record! { "f1" => "a" }, &Record::new(), true)
            .await;
        assert!(matches!(empty, Err(TablesError::EmptyUpdate(_))));

        let missing = store
            .modify("t", &record! { "f1" => "a" }, &record! { "f1" => "b" }, false)
            .await;
        assert!(matches!(missing, Err(TablesError::NoMatch(_))));
        assert_eq!(store.count("t", &Record::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_modify_without_criteria_updates_all() {
        let mut conn = connect_with("CREATE TABLE t (f1 TEXT)").await;
        let mut store = RecordStore::new(&mut conn);
        store
            .insert("t", &[record! { "f1" => "a" }, record! { "f1" => "b" }])
            .await
            .unwrap();

        store
            .modify("t", &Record::new(), &record! { "f1" => "z" }, false)
            .await
            .unwrap();
        assert_eq!(store.count("t", &record! { "f1" => "z" }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_semantics() {
        let mut conn = connect_with("CREATE TABLE t (f1 TEXT)").await;
        let mut store = RecordStore::new(&mut conn);
        store
            .insert("t", &[record! { "f1" => "a" }, record! { "f1" => "b" }])
            .await
            .unwrap();

        assert_eq!(store.remove("t", &record! { "f1" => "zz" }).await.unwrap(), 0);
        assert_eq!(store.remove("t", &Record::new()).await.unwrap(), 2);
        assert_eq!(store.remove("t", &Record::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_values_are_escaped() {
        let mut conn = connect_with("CREATE TABLE t (f1 TEXT)").await;
        let mut store = RecordStore::new(&mut conn);
        let tricky = "x'); DROP TABLE t; --";
        store.insert("t", &[record! { "f1" => tricky }]).await.unwrap();

        let rows = store.select_matching("t", &record! { "f1" => tricky }).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["f1"], tricky);
    }

    #[tokio::test]
    async fn test_select_unknown_table() {
        let mut conn = connect_with("CREATE TABLE t (f1 TEXT)").await;
        let mut store = RecordStore::new(&mut conn);

        let result = store.select("nope", &[], false).await;
        assert!(matches!(result, Err(TablesError::UnknownTable(_))));
    }
}
