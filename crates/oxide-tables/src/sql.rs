//! SQL text generation for SQLite.
//!
//! Every statement this crate runs is built here. Identifiers are always
//! double-quoted and values are always inlined as escaped string literals, so
//! the text logged on failure is exactly the text that ran.

use std::collections::BTreeMap;

use crate::model::{Field, TableModel, SURROGATE_KEY};

/// Quotes an identifier (table or column name).
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a value as a string literal.
#[must_use]
pub fn quote_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quotes an optional value, mapping `None` to `NULL`.
#[must_use]
pub fn quote_nullable(value: Option<&str>) -> String {
    value.map_or_else(|| "NULL".to_string(), quote_value)
}

/// Turns a default-value literal reported by `PRAGMA table_info` back into
/// the plain value.
#[must_use]
pub fn unquote_default(literal: &str) -> String {
    let trimmed = literal.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        trimmed[1..trimmed.len() - 1].replace("''", "'")
    } else {
        trimmed.to_string()
    }
}

/// Name of the join table materializing a relation between two tables.
#[must_use]
pub fn join_table_name(first: &str, second: &str) -> String {
    format!("{first}_{second}")
}

/// Name of the join-table column pointing at `table`'s surrogate key.
#[must_use]
pub fn join_column(table: &str) -> String {
    format!("{table}#{SURROGATE_KEY}")
}

/// Column definition for a declared field.
#[must_use]
pub fn column_definition(field: &Field) -> String {
    let mut parts = vec![quote_identifier(&field.name), "TEXT".to_string()];

    if field.not_null {
        parts.push("NOT NULL".to_string());
    }

    if field.unique {
        parts.push("UNIQUE".to_string());
    }

    if let Some(default) = &field.default_value {
        parts.push(format!("DEFAULT {}", quote_value(default)));
    }

    parts.join(" ")
}

/// Generates `CREATE TABLE` for a model.
///
/// Referenced tables get the surrogate key as their first column.
#[must_use]
pub fn create_table_sql(model: &TableModel) -> String {
    let mut defs = Vec::new();

    if model.referenced {
        defs.push(format!(
            "{} INTEGER PRIMARY KEY AUTOINCREMENT",
            quote_identifier(SURROGATE_KEY)
        ));
    }

    defs.extend(model.fields.iter().map(column_definition));

    for (field, target) in &model.foreign_keys {
        defs.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            quote_identifier(field),
            quote_identifier(&target.table),
            quote_identifier(&target.field)
        ));
    }

    format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_identifier(&model.name),
        defs.join(",\n  ")
    )
}

/// Generates `CREATE TABLE` for the join table of `first` and `second`.
#[must_use]
pub fn create_join_table_sql(join_table: &str, first: &str, second: &str) -> String {
    let first_col = quote_identifier(&join_column(first));
    let second_col = quote_identifier(&join_column(second));
    let key = quote_identifier(SURROGATE_KEY);

    format!(
        "CREATE TABLE {} (\n  {first_col} INTEGER NOT NULL,\n  {second_col} INTEGER NOT NULL,\n  \
         PRIMARY KEY ({first_col}, {second_col}),\n  \
         FOREIGN KEY ({first_col}) REFERENCES {} ({key}),\n  \
         FOREIGN KEY ({second_col}) REFERENCES {} ({key})\n)",
        quote_identifier(join_table),
        quote_identifier(first),
        quote_identifier(second),
    )
}

/// Generates `DROP TABLE`.
#[must_use]
pub fn drop_table_sql(name: &str) -> String {
    format!("DROP TABLE {}", quote_identifier(name))
}

/// Builds ` WHERE a = 'x' AND b = 'y'`, or an empty string for no criteria.
#[must_use]
pub fn where_clause(criteria: &BTreeMap<String, String>) -> String {
    if criteria.is_empty() {
        return String::new();
    }
    let conditions: Vec<String> = criteria
        .iter()
        .map(|(column, value)| format!("{} = {}", quote_identifier(column), quote_value(value)))
        .collect();
    format!(" WHERE {}", conditions.join(" AND "))
}

/// Generates `SELECT` returning every listed column as text, aliased to its
/// own name.
#[must_use]
pub fn select_sql(
    table: &str,
    columns: &[String],
    distinct: bool,
    criteria: &BTreeMap<String, String>,
) -> String {
    let projection: Vec<String> = columns
        .iter()
        .map(|c| {
            let quoted = quote_identifier(c);
            format!("CAST({quoted} AS TEXT) AS {quoted}")
        })
        .collect();
    format!(
        "SELECT {}{} FROM {}{}",
        if distinct { "DISTINCT " } else { "" },
        projection.join(", "),
        quote_identifier(table),
        where_clause(criteria)
    )
}

/// Generates `INSERT` for one row. An empty row inserts defaults.
#[must_use]
pub fn insert_sql<'a, I>(table: &str, values: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let (columns, literals): (Vec<String>, Vec<String>) = values
        .into_iter()
        .map(|(column, value)| (quote_identifier(column), quote_nullable(value)))
        .unzip();

    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_identifier(table));
    }

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table),
        columns.join(", "),
        literals.join(", ")
    )
}

/// Generates `UPDATE`.
#[must_use]
pub fn update_sql(
    table: &str,
    values: &BTreeMap<String, String>,
    criteria: &BTreeMap<String, String>,
) -> String {
    let assignments: Vec<String> = values
        .iter()
        .map(|(column, value)| format!("{} = {}", quote_identifier(column), quote_value(value)))
        .collect();
    format!(
        "UPDATE {} SET {}{}",
        quote_identifier(table),
        assignments.join(", "),
        where_clause(criteria)
    )
}

/// Generates `DELETE`.
#[must_use]
pub fn delete_sql(table: &str, criteria: &BTreeMap<String, String>) -> String {
    format!(
        "DELETE FROM {}{}",
        quote_identifier(table),
        where_clause(criteria)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_value("O'Brien"), "'O''Brien'");
        assert_eq!(quote_nullable(None), "NULL");
        assert_eq!(quote_nullable(Some("x")), "'x'");
    }

    #[test]
    fn test_unquote_default() {
        assert_eq!(unquote_default("'O''Brien'"), "O'Brien");
        assert_eq!(unquote_default("''"), "");
        assert_eq!(unquote_default("42"), "42");
    }

    #[test]
    fn test_column_definition() {
        let field = Field::new("status").default_value("new").not_null().unique();
        assert_eq!(
            column_definition(&field),
            "\"status\" TEXT NOT NULL UNIQUE DEFAULT 'new'"
        );
        assert_eq!(column_definition(&Field::new("note")), "\"note\" TEXT");
    }

    #[test]
    fn test_create_table_plain() {
        let model = TableModel::new("t").with_field(Field::new("f1").not_null());
        let sql = create_table_sql(&model);

        assert_eq!(sql, "CREATE TABLE \"t\" (\n  \"f1\" TEXT NOT NULL\n)");
    }

    #[test]
    fn test_create_table_referenced() {
        let mut model = TableModel::new("posts")
            .with_field(Field::new("title"))
            .with_field(Field::new("author"))
            .with_referenced(true);
        model.add_foreign_key("author", "users", "id");
        let sql = create_table_sql(&model);

        assert!(sql.starts_with("CREATE TABLE \"posts\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,"));
        assert!(sql.contains("FOREIGN KEY (\"author\") REFERENCES \"users\" (\"id\")"));
    }

    #[test]
    fn test_create_join_table() {
        let sql = create_join_table_sql("x_y", "x", "y");

        assert!(sql.contains("\"x#id\" INTEGER NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (\"x#id\", \"y#id\")"));
        assert!(sql.contains("REFERENCES \"y\" (\"id\")"));
    }

    #[test]
    fn test_select_sql() {
        let sql = select_sql("t", &["a".to_string()], true, &criteria(&[("b", "1")]));
        assert_eq!(
            sql,
            "SELECT DISTINCT CAST(\"a\" AS TEXT) AS \"a\" FROM \"t\" WHERE \"b\" = '1'"
        );
    }

    #[test]
    fn test_insert_sql() {
        let sql = insert_sql("t", [("a", Some("x")), ("b", None)]);
        assert_eq!(sql, "INSERT INTO \"t\" (\"a\", \"b\") VALUES ('x', NULL)");
        assert_eq!(
            insert_sql("t", std::iter::empty()),
            "INSERT INTO \"t\" DEFAULT VALUES"
        );
    }

    #[test]
    fn test_update_and_delete_sql() {
        let values = criteria(&[("f2", "c")]);
        let matching = criteria(&[("f1", "a")]);

        assert_eq!(
            update_sql("t", &values, &matching),
            "UPDATE \"t\" SET \"f2\" = 'c' WHERE \"f1\" = 'a'"
        );
        assert_eq!(delete_sql("t", &BTreeMap::new()), "DELETE FROM \"t\"");
    }
}
