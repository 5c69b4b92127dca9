//! Schema reconciliation.
//!
//! Brings the live database in line with a [`Schema`]. Missing tables are
//! created. Tables whose field set or referenced flag changed are rebuilt:
//! SQLite cannot reliably drop columns of a table other tables point at, so
//! every change goes through the same snapshot, drop, recreate, repopulate
//! script (see [`Rebuild`]).
//!
//! None of this locks or opens a transaction. Run it through
//! [`Database::migrate`](crate::Database::migrate) to get an all-or-nothing
//! pass.

use std::collections::BTreeSet;
use std::fmt;

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::config::Schema;
use crate::error::{Result, TablesError};
use crate::introspect::Introspector;
use crate::model::{TableModel, SURROGATE_KEY};
use crate::registry::{is_reserved_table, JoinTable, Registry};
use crate::relation::Relations;
use crate::sql;
use crate::store::{execute, RawRecord, Record, RecordStore};

/// Steps of a table rebuild, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStep {
    /// Save the table's rows and the rows of its join tables.
    Snapshot,
    /// Drop the join tables pointing at the table.
    DropJoinTables,
    /// Drop the table.
    DropTable,
    /// Create the table with its new definition.
    CreateTable,
    /// Put the saved rows back.
    Repopulate,
    /// Recreate and refill the join tables.
    RestoreJoinTables,
    /// Nothing left to do.
    Done,
}

impl RebuildStep {
    const fn next(self) -> Self {
        match self {
            Self::Snapshot => Self::DropJoinTables,
            Self::DropJoinTables => Self::DropTable,
            Self::DropTable => Self::CreateTable,
            Self::CreateTable => Self::Repopulate,
            Self::Repopulate => Self::RestoreJoinTables,
            Self::RestoreJoinTables | Self::Done => Self::Done,
        }
    }
}

impl fmt::Display for RebuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snapshot => "snapshot",
            Self::DropJoinTables => "drop-join-tables",
            Self::DropTable => "drop-table",
            Self::CreateTable => "create-table",
            Self::Repopulate => "repopulate",
            Self::RestoreJoinTables => "restore-join-tables",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Rebuild of one table from its live definition to a new one.
///
/// Kept fields keep their live definition, added fields take the model's.
/// When the table is referenced before and after, surrogate ids are carried
/// over so join rows stay valid. A table that becomes referenced gets fresh
/// ids; a table that stops being referenced loses its id column.
///
/// Each call to [`advance`](Self::advance) runs one step. A failed step
/// leaves the rebuild at that step; earlier steps are only undone by rolling
/// back the surrounding transaction.
#[derive(Debug)]
pub struct Rebuild {
    live: TableModel,
    target: TableModel,
    step: RebuildStep,
    rows: Vec<RawRecord>,
    joins: Vec<(JoinTable, Vec<RawRecord>)>,
}

impl Rebuild {
    /// Plans the rebuild of `live` into `model`.
    #[must_use]
    pub fn new(live: &TableModel, model: &TableModel) -> Self {
        let removed: BTreeSet<String> = live.diff(model).into_iter().map(|f| f.name).collect();

        let mut target = TableModel::new(&model.name).with_referenced(model.referenced);
        target.fields = live
            .fields
            .iter()
            .filter(|f| !removed.contains(&f.name))
            .cloned()
            .chain(model.diff(live))
            .collect();
        target.foreign_keys = model.foreign_keys.clone();

        Self {
            live: live.clone(),
            target,
            step: RebuildStep::Snapshot,
            rows: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Returns the step that runs next.
    #[must_use]
    pub fn step(&self) -> RebuildStep {
        self.step
    }

    /// Returns the definition the table is rebuilt with.
    #[must_use]
    pub fn target(&self) -> &TableModel {
        &self.target
    }

    /// Returns the saved rows (filled by the snapshot step).
    #[must_use]
    pub fn saved_rows(&self) -> &[RawRecord] {
        &self.rows
    }

    fn keeps_ids(&self) -> bool {
        self.live.referenced && self.target.referenced
    }

    /// Runs the current step and moves to the next one.
    pub async fn advance(&mut self, conn: &mut SqliteConnection) -> Result<RebuildStep> {
        let step = self.step;
        debug!(table = %self.target.name, step = %step, "Rebuild step");

        let outcome = match step {
            RebuildStep::Snapshot => self.snapshot(conn).await,
            RebuildStep::DropJoinTables => self.drop_join_tables(conn).await,
            RebuildStep::DropTable => execute(conn, &sql::drop_table_sql(&self.target.name))
                .await
                .map(|_| ()),
            RebuildStep::CreateTable => execute(conn, &sql::create_table_sql(&self.target))
                .await
                .map(|_| ()),
            RebuildStep::Repopulate => self.repopulate(conn).await,
            RebuildStep::RestoreJoinTables => self.restore_join_tables(conn).await,
            RebuildStep::Done => Ok(()),
        };

        outcome.map_err(|source| TablesError::Rebuild {
            table: self.target.name.clone(),
            step,
            source: Box::new(source),
        })?;

        self.step = step.next();
        Ok(self.step)
    }

    /// Runs every remaining step.
    pub async fn run(mut self, conn: &mut SqliteConnection) -> Result<()> {
        while self.step != RebuildStep::Done {
            self.advance(conn).await?;
        }
        Ok(())
    }

    async fn snapshot(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        let mut columns: Vec<String> = self.live.fields.iter().map(|f| f.name.clone()).collect();
        if self.live.referenced {
            columns.insert(0, SURROGATE_KEY.to_string());
        }
        if !columns.is_empty() {
            self.rows = RecordStore::new(&mut *conn)
                .select_raw(&self.target.name, &columns, false, &Record::new())
                .await?;
        }

        let joins = Registry::new(&mut *conn).involving(&self.target.name).await?;
        let existing = Introspector::new(&mut *conn).list_tables().await;
        for join in joins {
            if !existing.contains(&join.name) {
                warn!(join_table = %join.name, "Registered join table is missing");
                continue;
            }
            let columns = [sql::join_column(&join.first), sql::join_column(&join.second)];
            let rows = RecordStore::new(&mut *conn)
                .select_raw(&join.name, &columns, false, &Record::new())
                .await?;
            self.joins.push((join, rows));
        }
        Ok(())
    }

    async fn drop_join_tables(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        for (join, _) in &self.joins {
            execute(conn, &sql::drop_table_sql(&join.name)).await?;
        }
        Ok(())
    }

    async fn repopulate(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        let keep_ids = self.keeps_ids();
        let target = &self.target;
        let mut store = RecordStore::new(conn);
        for row in &self.rows {
            let kept: RawRecord = row
                .iter()
                .filter(|(column, _)| {
                    target.has_column(column) || (keep_ids && column.as_str() == SURROGATE_KEY)
                })
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            store.insert_raw(&target.name, &kept).await?;
        }
        Ok(())
    }

    async fn restore_join_tables(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        if !self.target.referenced {
            // Without a surrogate key there is nothing left to join on.
            for (join, _) in &self.joins {
                warn!(join_table = %join.name, "Dropping relation of unreferenced table");
                Registry::new(&mut *conn).unregister(&join.name).await?;
            }
            return Ok(());
        }

        for (join, rows) in &self.joins {
            execute(
                &mut *conn,
                &sql::create_join_table_sql(&join.name, &join.first, &join.second),
            )
            .await?;
            let mut store = RecordStore::new(&mut *conn);
            for row in rows {
                store.insert_raw(&join.name, row).await?;
            }
        }
        Ok(())
    }
}

/// What reconciling one table did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    /// Live table already matched.
    Unchanged,
    /// Table was missing and got created.
    Created,
    /// Table was rebuilt.
    Rebuilt,
}

/// Summary of a migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Tables created.
    pub created: Vec<String>,
    /// Tables rebuilt.
    pub rebuilt: Vec<String>,
    /// Tables dropped (join tables included).
    pub dropped: Vec<String>,
    /// Join tables created.
    pub relations: Vec<String>,
    /// Rows inserted into join tables by policies.
    pub linked: u64,
}

impl MigrationReport {
    /// Returns whether the pass changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.rebuilt.is_empty()
            && self.dropped.is_empty()
            && self.relations.is_empty()
            && self.linked == 0
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes.");
        }
        for name in &self.created {
            writeln!(f, " + {name}")?;
        }
        for name in &self.rebuilt {
            writeln!(f, " ~ {name}")?;
        }
        for name in &self.dropped {
            writeln!(f, " - {name}")?;
        }
        for name in &self.relations {
            writeln!(f, " = {name}")?;
        }
        if self.linked > 0 {
            writeln!(f, " {} link(s) added", self.linked)?;
        }
        Ok(())
    }
}

/// Reconciles live tables against models.
pub struct Reconciler<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> Reconciler<'c> {
    /// Creates a reconciler over a connection the caller already holds.
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Creates `model`'s table and, if it is empty, fills in
    /// `default_records`.
    pub async fn create_table(
        &mut self,
        model: &TableModel,
        default_records: &[Record],
    ) -> Result<()> {
        info!(table = %model.name, referenced = model.referenced, "Creating table");
        execute(&mut *self.conn, &sql::create_table_sql(model)).await?;

        if default_records.is_empty() {
            return Ok(());
        }
        let mut store = RecordStore::new(&mut *self.conn);
        if store.count(&model.name, &Record::new()).await? == 0 {
            store.insert(&model.name, default_records).await?;
        }
        Ok(())
    }

    /// Rebuilds the live table described by `live` into `model`.
    pub async fn rebuild(&mut self, live: &TableModel, model: &TableModel) -> Result<()> {
        let added: Vec<String> = model.diff(live).into_iter().map(|f| f.name).collect();
        let removed: Vec<String> = live.diff(model).into_iter().map(|f| f.name).collect();
        info!(
            table = %model.name,
            added = ?added,
            removed = ?removed,
            referenced = model.referenced,
            "Rebuilding table"
        );
        Rebuild::new(live, model).run(&mut *self.conn).await
    }

    /// Creates or rebuilds one table as needed.
    pub async fn reconcile_table(
        &mut self,
        model: &TableModel,
        default_records: &[Record],
    ) -> Result<TableChange> {
        let mut inspect = Introspector::new(&mut *self.conn);
        if !inspect.table_exists(&model.name).await {
            self.create_table(model, default_records).await?;
            return Ok(TableChange::Created);
        }

        let live = inspect.materialize(&model.name).await;
        if live == *model {
            debug!(table = %model.name, "Table up to date");
            return Ok(TableChange::Unchanged);
        }

        self.rebuild(&live, model).await?;
        Ok(TableChange::Rebuilt)
    }

    /// Marks a live table as referenced, rebuilding it if needed.
    pub async fn mark_referenced(&mut self, table: &str) -> Result<bool> {
        let mut inspect = Introspector::new(&mut *self.conn);
        if !inspect.table_exists(table).await {
            return Err(TablesError::UnknownTable(table.to_string()));
        }
        let live = inspect.materialize(table).await;
        if live.referenced {
            return Ok(false);
        }
        let model = live.clone().with_referenced(true);
        self.rebuild(&live, &model).await?;
        Ok(true)
    }

    /// Drops a table, dropping and forgetting its join tables first.
    pub async fn drop_table(&mut self, table: &str) -> Result<Vec<String>> {
        let mut dropped = Vec::new();
        let joins = Registry::new(&mut *self.conn).involving(table).await?;
        for join in joins {
            self.drop_join_table(&join).await?;
            dropped.push(join.name);
        }

        info!(table = %table, "Dropping table");
        execute(&mut *self.conn, &sql::drop_table_sql(table)).await?;
        dropped.push(table.to_string());
        Ok(dropped)
    }

    async fn drop_join_table(&mut self, join: &JoinTable) -> Result<()> {
        info!(join_table = %join.name, "Dropping join table");
        if Introspector::new(&mut *self.conn)
            .table_exists(&join.name)
            .await
        {
            execute(&mut *self.conn, &sql::drop_table_sql(&join.name)).await?;
        }
        Registry::new(&mut *self.conn).unregister(&join.name).await
    }

    /// Runs a full migration pass.
    ///
    /// 1. Join tables of relationships no longer declared are dropped.
    /// 2. Every declared table is created or rebuilt. Tables taking part in
    ///    a declared relationship are treated as referenced.
    /// 3. Declared relationships are created and their policies applied.
    /// 4. Tables that are neither declared, reserved, nor join tables are
    ///    dropped.
    ///
    /// Steps 2 and 3 keep going after a failure so every problem is
    /// reported; the pass fails if anything failed.
    pub async fn migrate(&mut self, schema: &Schema) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let mut errors = Vec::new();

        Registry::new(&mut *self.conn).ensure_table().await?;

        let registered = Registry::new(&mut *self.conn).all().await?;
        for join in registered {
            let declared = schema
                .relationships
                .iter()
                .any(|r| join.links(&r.first_table, &r.second_table));
            if !declared {
                self.drop_join_table(&join).await?;
                report.dropped.push(join.name);
            }
        }

        for definition in &schema.tables {
            // Relationship participants always keep their surrogate key.
            let mut model = definition.model.clone();
            model.referenced |= schema
                .relationships
                .iter()
                .any(|r| r.involves(&model.name));
            match self
                .reconcile_table(&model, &definition.default_records)
                .await
            {
                Ok(TableChange::Created) => report.created.push(definition.model.name.clone()),
                Ok(TableChange::Rebuilt) => report.rebuilt.push(definition.model.name.clone()),
                Ok(TableChange::Unchanged) => {}
                Err(e) => errors.push(e),
            }
        }

        for relationship in &schema.relationships {
            let mut relations = Relations::new(&mut *self.conn);
            let existing = relations
                .find(&relationship.first_table, &relationship.second_table)
                .await?;
            let join = match relations
                .create_relation(
                    relationship.kind,
                    &relationship.first_table,
                    &relationship.second_table,
                )
                .await
            {
                Ok(join) => join,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if existing.is_none() {
                report.relations.push(join.clone());
            }
            match relations
                .apply_policy(
                    &join,
                    relationship.policy,
                    &relationship.first_table,
                    &relationship.second_table,
                )
                .await
            {
                Ok(linked) => report.linked += linked,
                Err(e) => errors.push(e),
            }
        }

        let declared: BTreeSet<&str> = schema
            .tables
            .iter()
            .map(|t| t.model.name.as_str())
            .collect();
        let joins: BTreeSet<String> = Registry::new(&mut *self.conn)
            .all()
            .await?
            .into_iter()
            .map(|j| j.name)
            .collect();
        let leftovers: Vec<String> = Introspector::new(&mut *self.conn)
            .list_tables()
            .await
            .into_iter()
            .filter(|t| {
                !is_reserved_table(t) && !declared.contains(t.as_str()) && !joins.contains(t)
            })
            .collect();
        for table in leftovers {
            match self.drop_table(&table).await {
                Ok(dropped) => report.dropped.extend(dropped),
                Err(e) => errors.push(e),
            }
        }

        match errors.len() {
            0 => Ok(report),
            1 => Err(errors.remove(0)),
            _ => Err(TablesError::Multiple(errors)),
        }
    }
}
