//! Many-to-many relationships.
//!
//! A relationship between two tables materializes as a join table named
//! `first_second`, holding pairs of surrogate ids. Both participants are
//! referenced tables. Join tables are found through the
//! [`Registry`](crate::registry::Registry), never by name.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::error::{Result, TablesError};
use crate::introspect::Introspector;
use crate::model::SURROGATE_KEY;
use crate::reconcile::Reconciler;
use crate::registry::{JoinTable, Registry};
use crate::sql::{self, quote_identifier};
use crate::store::{execute, Record, RecordStore};

/// Kind of relationship. Only many-to-many is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelationKind {
    /// `m:n`
    #[default]
    ManyToMany,
}

impl RelationKind {
    /// Returns the textual form used in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManyToMany => "m:n",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationKind {
    type Err = TablesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "m:n" => Ok(Self::ManyToMany),
            other => Err(TablesError::UnsupportedRelation(other.to_string())),
        }
    }
}

/// What to put in a freshly created join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Link every record of one table to every record of the other.
    LinkAll,
    /// Leave the join table empty. Unknown policy names mean this too.
    #[default]
    #[serde(other)]
    None,
}

impl FromStr for Policy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "link-all" => Self::LinkAll,
            _ => Self::None,
        })
    }
}

/// A declared relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Relationship kind.
    pub kind: RelationKind,
    /// Population policy.
    pub policy: Policy,
    /// First participant.
    pub first_table: String,
    /// Second participant.
    pub second_table: String,
}

impl Relationship {
    /// Declares a many-to-many relationship without a policy.
    #[must_use]
    pub fn many_to_many(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self {
            kind: RelationKind::ManyToMany,
            policy: Policy::None,
            first_table: first.into(),
            second_table: second.into(),
        }
    }

    /// Sets the population policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns whether `table` takes part in the relationship.
    #[must_use]
    pub fn involves(&self, table: &str) -> bool {
        self.first_table == table || self.second_table == table
    }
}

/// Creates relationships and links records through join tables.
pub struct Relations<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> Relations<'c> {
    /// Creates a relationship manager over a connection the caller already
    /// holds.
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Finds the join table of `a` and `b`, in either order.
    pub async fn find(&mut self, a: &str, b: &str) -> Result<Option<JoinTable>> {
        Registry::new(&mut *self.conn).find(a, b).await
    }

    async fn require_join(&mut self, a: &str, b: &str) -> Result<JoinTable> {
        self.find(a, b).await?.ok_or_else(|| TablesError::NoJoinTable {
            first: a.to_string(),
            second: b.to_string(),
        })
    }

    /// Creates the relationship between `a` and `b` and returns its join
    /// table.
    ///
    /// If the pair is already related, in either order, the existing join
    /// table is returned and nothing changes. Otherwise both tables are made
    /// referenced (rebuilding them when needed) before the join table is
    /// created and registered.
    pub async fn create_relation(
        &mut self,
        kind: RelationKind,
        a: &str,
        b: &str,
    ) -> Result<String> {
        if a == b {
            return Err(TablesError::SelfRelation(a.to_string()));
        }
        if let Some(existing) = self.find(a, b).await? {
            debug!(join_table = %existing.name, "Relation already exists");
            return Ok(existing.name);
        }

        let tables = Introspector::new(&mut *self.conn).list_tables().await;
        for table in [a, b] {
            if !tables.contains(table) {
                return Err(TablesError::UnknownTable(table.to_string()));
            }
        }

        let join = JoinTable::new(a, b);
        if tables.contains(&join.name) {
            return Err(TablesError::Config(format!(
                "cannot relate '{a}' and '{b}': table '{}' already exists",
                join.name
            )));
        }

        let mut reconciler = Reconciler::new(&mut *self.conn);
        reconciler.mark_referenced(a).await?;
        reconciler.mark_referenced(b).await?;

        info!(join_table = %join.name, kind = %kind, "Creating relation");
        execute(
            &mut *self.conn,
            &sql::create_join_table_sql(&join.name, &join.first, &join.second),
        )
        .await?;
        Registry::new(&mut *self.conn).register(&join).await?;
        Ok(join.name)
    }

    /// Populates `join` according to `policy`.
    ///
    /// Only an empty join table is touched. Returns the number of links
    /// added.
    pub async fn apply_policy(
        &mut self,
        join: &str,
        policy: Policy,
        a: &str,
        b: &str,
    ) -> Result<u64> {
        if policy == Policy::None {
            return Ok(0);
        }

        let existing = RecordStore::new(&mut *self.conn)
            .count(join, &Record::new())
            .await?;
        if existing > 0 {
            debug!(join_table = %join, rows = existing, "Join table not empty, policy skipped");
            return Ok(0);
        }

        let key = quote_identifier(SURROGATE_KEY);
        let sql = format!(
            "INSERT INTO {} ({}, {}) SELECT {a_table}.{key}, {b_table}.{key} FROM {a_table}, {b_table}",
            quote_identifier(join),
            quote_identifier(&sql::join_column(a)),
            quote_identifier(&sql::join_column(b)),
            a_table = quote_identifier(a),
            b_table = quote_identifier(b),
        );
        let linked = execute(&mut *self.conn, &sql).await?.rows_affected();
        info!(join_table = %join, linked, "Applied link-all policy");
        Ok(linked)
    }

    async fn ids(&mut self, table: &str, record: &Record) -> Result<Vec<String>> {
        let rows = RecordStore::new(&mut *self.conn)
            .select_raw(table, &[SURROGATE_KEY.to_string()], false, record)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|mut row| row.remove(SURROGATE_KEY).flatten())
            .collect())
    }

    /// Returns ids of the rows matching `record`, inserting it first if no
    /// row matches.
    async fn ids_or_insert(&mut self, table: &str, record: &Record) -> Result<Vec<String>> {
        let ids = self.ids(table, record).await?;
        if !ids.is_empty() {
            return Ok(ids);
        }
        let id = RecordStore::new(&mut *self.conn)
            .insert_one(table, record)
            .await?;
        Ok(vec![id.to_string()])
    }

    fn pair(a: &str, id_a: &str, b: &str, id_b: &str) -> Record {
        let mut pair = Record::new();
        pair.insert(sql::join_column(a), id_a.to_string());
        pair.insert(sql::join_column(b), id_b.to_string());
        pair
    }

    /// Links the records of `a` matching `record_a` to the records of `b`
    /// matching `record_b`.
    ///
    /// A record with no match is inserted first. Returns the number of links
    /// added; fails with [`TablesError::AlreadyLinked`] if every pair was
    /// already linked.
    pub async fn link(
        &mut self,
        a: &str,
        record_a: &Record,
        b: &str,
        record_b: &Record,
    ) -> Result<u64> {
        let join = self.require_join(a, b).await?;
        let ids_a = self.ids_or_insert(a, record_a).await?;
        let ids_b = self.ids_or_insert(b, record_b).await?;

        let mut linked = 0;
        let mut store = RecordStore::new(&mut *self.conn);
        for id_a in &ids_a {
            for id_b in &ids_b {
                let pair = Self::pair(a, id_a, b, id_b);
                if store.count(&join.name, &pair).await? > 0 {
                    continue;
                }
                store.insert_one(&join.name, &pair).await?;
                linked += 1;
            }
        }

        if linked == 0 {
            return Err(TablesError::AlreadyLinked {
                first: a.to_string(),
                second: b.to_string(),
            });
        }
        debug!(join_table = %join.name, linked, "Linked records");
        Ok(linked)
    }

    /// Removes the links between the records of `a` matching `record_a` and
    /// the records of `b` matching `record_b`. Returns the number removed.
    pub async fn unlink(
        &mut self,
        a: &str,
        record_a: &Record,
        b: &str,
        record_b: &Record,
    ) -> Result<u64> {
        let join = self.require_join(a, b).await?;
        let ids_a = self.ids(a, record_a).await?;
        if ids_a.is_empty() {
            return Err(TablesError::RecordNotFound(a.to_string()));
        }
        let ids_b = self.ids(b, record_b).await?;
        if ids_b.is_empty() {
            return Err(TablesError::RecordNotFound(b.to_string()));
        }

        let mut removed = 0;
        let mut store = RecordStore::new(&mut *self.conn);
        for id_a in &ids_a {
            for id_b in &ids_b {
                removed += store.remove(&join.name, &Self::pair(a, id_a, b, id_b)).await?;
            }
        }

        if removed == 0 {
            return Err(TablesError::NotLinked {
                first: a.to_string(),
                second: b.to_string(),
            });
        }
        debug!(join_table = %join.name, removed, "Unlinked records");
        Ok(removed)
    }

    /// Gets the records linked to the rows of `table` matching `record`,
    /// grouped by related table.
    ///
    /// Every table related to `table` gets an entry, empty if nothing is
    /// linked. Linked records come without their surrogate key.
    pub async fn get_linked_records(
        &mut self,
        table: &str,
        record: &Record,
    ) -> Result<BTreeMap<String, Vec<Record>>> {
        if !Introspector::new(&mut *self.conn).table_exists(table).await {
            return Err(TablesError::UnknownTable(table.to_string()));
        }

        let joins = Registry::new(&mut *self.conn).involving(table).await?;
        let mut linked = BTreeMap::new();
        if joins.is_empty() {
            return Ok(linked);
        }

        let ids = self.ids(table, record).await?;
        for join in joins {
            let Some(other) = join.other(table).map(str::to_string) else {
                continue;
            };
            let own_column = sql::join_column(table);
            let other_column = sql::join_column(&other);

            let mut seen = BTreeSet::new();
            let mut other_ids = Vec::new();
            for id in &ids {
                let mut criteria = Record::new();
                criteria.insert(own_column.clone(), id.clone());
                let rows = RecordStore::new(&mut *self.conn)
                    .select_raw(&join.name, &[other_column.clone()], false, &criteria)
                    .await?;
                for other_id in rows.into_iter().filter_map(|mut r| r.remove(&other_column).flatten()) {
                    if seen.insert(other_id.clone()) {
                        other_ids.push(other_id);
                    }
                }
            }

            let mut records = Vec::with_capacity(other_ids.len());
            let mut store = RecordStore::new(&mut *self.conn);
            for other_id in other_ids {
                let mut criteria = Record::new();
                criteria.insert(SURROGATE_KEY.to_string(), other_id);
                for mut row in store.select_matching(&other, &criteria).await? {
                    row.remove(SURROGATE_KEY);
                    records.push(row);
                }
            }
            linked.insert(other, records);
        }
        Ok(linked)
    }
}
