//! Database façade.
//!
//! [`Database`] owns one SQLite connection behind an async mutex. Each of its
//! methods takes the lock, opens a transaction, does its work and commits;
//! any error drops the transaction, which rolls it back. A failed call leaves
//! no partial change behind.
//!
//! To run several operations as one unit, take the lock yourself, open a
//! transaction on it and work through a [`Session`]:
//!
//! ```rust,ignore
//! use sqlx::Connection;
//!
//! let mut conn = db.lock().await;
//! let mut tx = conn.begin().await?;
//! let mut session = Session::new(&mut tx);
//! session.records().insert("x", &[record! { "label" => "a" }]).await?;
//! session.relations().link("x", &record! { "label" => "a" }, "y", &record! { "tag" => "b" }).await?;
//! tx.commit().await?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::{Arc, Weak};

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::config::Schema;
use crate::dump;
use crate::error::Result;
use crate::introspect::Introspector;
use crate::model::TableModel;
use crate::reconcile::{MigrationReport, Reconciler, TableChange};
use crate::registry::{JoinTable, Registry};
use crate::relation::{Policy, RelationKind, Relations};
use crate::store::{Record, RecordStore};

/// Runs `$body` against a [`Session`] inside one transaction.
macro_rules! atomically {
    ($db:expr, |$session:ident| $body:expr) => {{
        let mut conn = $db.conn.lock().await;
        let mut tx = conn.begin().await?;
        let mut $session = Session::new(&mut *tx);
        let value = $body;
        tx.commit().await?;
        Ok(value)
    }};
}

/// Unsynchronized access to a connection the caller already holds.
///
/// Nothing here locks. Build a session from a [`Database::lock`] guard or a
/// transaction opened on it.
pub struct Session<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> Session<'c> {
    /// Wraps a held connection.
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Schema introspection.
    pub fn introspect(&mut self) -> Introspector<'_> {
        Introspector::new(&mut *self.conn)
    }

    /// Record access.
    pub fn records(&mut self) -> RecordStore<'_> {
        RecordStore::new(&mut *self.conn)
    }

    /// The relation registry.
    pub fn registry(&mut self) -> Registry<'_> {
        Registry::new(&mut *self.conn)
    }

    /// Schema reconciliation.
    pub fn reconciler(&mut self) -> Reconciler<'_> {
        Reconciler::new(&mut *self.conn)
    }

    /// Relationships and links.
    pub fn relations(&mut self) -> Relations<'_> {
        Relations::new(&mut *self.conn)
    }

    /// The raw connection.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut *self.conn
    }
}

/// A SQLite database with a self-reconciling schema.
pub struct Database {
    conn: Mutex<SqliteConnection>,
    location: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (creating if needed) the database at `location`, a sqlx SQLite
    /// URL such as `sqlite:app.db` or `sqlite::memory:`.
    pub async fn open(location: &str) -> Result<Self> {
        let mut conn = SqliteConnectOptions::from_str(location)?
            .create_if_missing(true)
            .foreign_keys(true)
            .connect()
            .await?;
        Registry::new(&mut conn).ensure_table().await?;
        info!(location = %location, "Opened database");

        Ok(Self {
            conn: Mutex::new(conn),
            location: location.to_string(),
        })
    }

    /// Opens the database and migrates it to `schema`.
    ///
    /// Fails if the migration fails; the database is then left as it was.
    pub async fn open_with_schema(location: &str, schema: &Schema) -> Result<Self> {
        let db = Self::open(location).await?;
        let report = db.migrate(schema).await?;
        info!(
            location = %location,
            created = report.created.len(),
            rebuilt = report.rebuilt.len(),
            dropped = report.dropped.len(),
            "Schema up to date"
        );
        Ok(db)
    }

    /// Returns the location the database was opened from.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Takes the connection lock.
    ///
    /// The lock is not reentrant: calling another method of this `Database`
    /// while holding the guard deadlocks. Work through a [`Session`] instead.
    pub async fn lock(&self) -> MutexGuard<'_, SqliteConnection> {
        self.conn.lock().await
    }

    /// Runs a migration pass. See [`Reconciler::migrate`].
    pub async fn migrate(&self, schema: &Schema) -> Result<MigrationReport> {
        atomically!(self, |session| session.reconciler().migrate(schema).await?)
    }

    /// Creates or rebuilds one table.
    pub async fn reconcile_table(
        &self,
        model: &TableModel,
        default_records: &[Record],
    ) -> Result<TableChange> {
        atomically!(self, |session| session
            .reconciler()
            .reconcile_table(model, default_records)
            .await?)
    }

    /// Drops a table and its join tables.
    pub async fn drop_table(&self, table: &str) -> Result<Vec<String>> {
        atomically!(self, |session| session.reconciler().drop_table(table).await?)
    }

    /// Lists every table, system tables included.
    pub async fn tables(&self) -> BTreeSet<String> {
        let mut conn = self.conn.lock().await;
        Introspector::new(&mut conn).list_tables().await
    }

    /// Returns whether a table exists.
    pub async fn table_exists(&self, table: &str) -> bool {
        let mut conn = self.conn.lock().await;
        Introspector::new(&mut conn).table_exists(table).await
    }

    /// Returns a model of the live table.
    pub async fn materialize(&self, table: &str) -> TableModel {
        let mut conn = self.conn.lock().await;
        Introspector::new(&mut conn).materialize(table).await
    }

    /// Lists the registered join tables.
    pub async fn join_tables(&self) -> Result<Vec<JoinTable>> {
        let mut conn = self.conn.lock().await;
        Registry::new(&mut conn).all().await
    }

    /// See [`RecordStore::select`].
    pub async fn select(
        &self,
        table: &str,
        columns: &[&str],
        distinct: bool,
    ) -> Result<Vec<Record>> {
        atomically!(self, |session| session
            .records()
            .select(table, columns, distinct)
            .await?)
    }

    /// See [`RecordStore::select_matching`].
    pub async fn select_matching(&self, table: &str, criteria: &Record) -> Result<Vec<Record>> {
        atomically!(self, |session| session
            .records()
            .select_matching(table, criteria)
            .await?)
    }

    /// Inserts records; all of them or none.
    pub async fn insert(&self, table: &str, records: &[Record]) -> Result<()> {
        atomically!(self, |session| session.records().insert(table, records).await?)
    }

    /// See [`RecordStore::insert_one`].
    pub async fn insert_one(&self, table: &str, record: &Record) -> Result<i64> {
        atomically!(self, |session| session.records().insert_one(table, record).await?)
    }

    /// See [`RecordStore::modify`].
    pub async fn modify(
        &self,
        table: &str,
        criteria: &Record,
        values: &Record,
        insert_if_absent: bool,
    ) -> Result<()> {
        atomically!(self, |session| session
            .records()
            .modify(table, criteria, values, insert_if_absent)
            .await?)
    }

    /// See [`RecordStore::remove`].
    pub async fn remove(&self, table: &str, criteria: &Record) -> Result<u64> {
        atomically!(self, |session| session.records().remove(table, criteria).await?)
    }

    /// See [`RecordStore::count`].
    pub async fn count(&self, table: &str, criteria: &Record) -> Result<u64> {
        atomically!(self, |session| session.records().count(table, criteria).await?)
    }

    /// See [`Relations::create_relation`].
    pub async fn create_relation(&self, kind: RelationKind, a: &str, b: &str) -> Result<String> {
        atomically!(self, |session| session
            .relations()
            .create_relation(kind, a, b)
            .await?)
    }

    /// See [`Relations::apply_policy`].
    pub async fn apply_policy(&self, join: &str, policy: Policy, a: &str, b: &str) -> Result<u64> {
        atomically!(self, |session| session
            .relations()
            .apply_policy(join, policy, a, b)
            .await?)
    }

    /// See [`Relations::link`].
    pub async fn link(
        &self,
        a: &str,
        record_a: &Record,
        b: &str,
        record_b: &Record,
    ) -> Result<u64> {
        atomically!(self, |session| session
            .relations()
            .link(a, record_a, b, record_b)
            .await?)
    }

    /// See [`Relations::unlink`].
    pub async fn unlink(
        &self,
        a: &str,
        record_a: &Record,
        b: &str,
        record_b: &Record,
    ) -> Result<u64> {
        atomically!(self, |session| session
            .relations()
            .unlink(a, record_a, b, record_b)
            .await?)
    }

    /// See [`Relations::get_linked_records`].
    pub async fn get_linked_records(
        &self,
        table: &str,
        record: &Record,
    ) -> Result<BTreeMap<String, Vec<Record>>> {
        atomically!(self, |session| session
            .relations()
            .get_linked_records(table, record)
            .await?)
    }

    /// Renders one table, or all user tables, as text.
    pub async fn dump_text(&self, table: Option<&str>) -> Result<String> {
        atomically!(self, |session| dump::render_text(&mut session, table).await?)
    }

    /// Renders one table, or all user tables, as HTML.
    pub async fn dump_html(&self, table: Option<&str>) -> Result<String> {
        atomically!(self, |session| dump::render_html(&mut session, table).await?)
    }
}

/// Shares one [`Database`] per location.
///
/// Handles are reference counted: the connection closes when the last
/// [`Arc`] is dropped, and the next request opens it again.
#[derive(Debug, Default)]
pub struct DatabaseFactory {
    open: Mutex<BTreeMap<String, Weak<Database>>>,
}

impl DatabaseFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the database at `location`, opening it if no handle is alive.
    pub async fn get(&self, location: &str) -> Result<Arc<Database>> {
        let mut open = self.open.lock().await;
        if let Some(db) = open.get(location).and_then(Weak::upgrade) {
            return Ok(db);
        }

        let db = Arc::new(Database::open(location).await?);
        open.retain(|_, weak| weak.strong_count() > 0);
        open.insert(location.to_string(), Arc::downgrade(&db));
        Ok(db)
    }

    /// Returns the database at `location` migrated to `schema`.
    pub async fn get_with_schema(&self, location: &str, schema: &Schema) -> Result<Arc<Database>> {
        let db = self.get(location).await?;
        db.migrate(schema).await?;
        Ok(db)
    }

    /// Returns how many databases have live handles.
    pub async fn open_count(&self) -> usize {
        self.open
            .lock()
            .await
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
