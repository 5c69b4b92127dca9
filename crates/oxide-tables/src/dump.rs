//! Human-readable table dumps.

use std::fmt::Write;

use crate::database::Session;
use crate::error::{Result, TablesError};
use crate::registry::is_reserved_table;
use crate::store::Record;

/// Escapes HTML special characters.
#[must_use]
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Contents of one table, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDump {
    /// Table name.
    pub name: String,
    /// Column names in engine order.
    pub columns: Vec<String>,
    /// Column labels: the name plus ` [PK]` / ` [U]` markers.
    pub labels: Vec<String>,
    /// Rows in scan order.
    pub rows: Vec<Record>,
}

impl TableDump {
    /// Returns the rendered width of each column.
    #[must_use]
    pub fn widths(&self) -> Vec<usize> {
        self.columns
            .iter()
            .zip(&self.labels)
            .map(|(column, label)| {
                self.rows
                    .iter()
                    .filter_map(|row| row.get(column))
                    .map(|cell| cell.chars().count())
                    .chain(std::iter::once(label.chars().count()))
                    .max()
                    .unwrap_or_default()
            })
            .collect()
    }

    fn cells<'a>(&'a self, row: &'a Record) -> impl Iterator<Item = &'a str> + 'a {
        self.columns
            .iter()
            .map(move |c| row.get(c).map_or("", String::as_str))
    }
}

/// Reads one table for dumping.
pub async fn collect_table(session: &mut Session<'_>, table: &str) -> Result<TableDump> {
    let columns = session.introspect().columns(table).await;
    if columns.is_empty() {
        return Err(TablesError::UnknownTable(table.to_string()));
    }
    let uniqueness = session.introspect().get_uniqueness(table).await;

    let labels = columns
        .iter()
        .map(|c| {
            let mut label = c.name.clone();
            if c.pk > 0 {
                label.push_str(" [PK]");
            }
            if uniqueness.get(&c.name).copied().unwrap_or(false) {
                label.push_str(" [U]");
            }
            label
        })
        .collect();
    let rows = session.records().select(table, &[], false).await?;

    Ok(TableDump {
        name: table.to_string(),
        columns: columns.into_iter().map(|c| c.name).collect(),
        labels,
        rows,
    })
}

async fn collect(session: &mut Session<'_>, table: Option<&str>) -> Result<Vec<TableDump>> {
    let names: Vec<String> = match table {
        Some(table) => vec![table.to_string()],
        None => session
            .introspect()
            .list_tables()
            .await
            .into_iter()
            .filter(|t| !is_reserved_table(t))
            .collect(),
    };

    let mut dumps = Vec::with_capacity(names.len());
    for name in &names {
        dumps.push(collect_table(session, name).await?);
    }
    Ok(dumps)
}

/// Renders a table as aligned text.
#[must_use]
pub fn format_text(dump: &TableDump) -> String {
    let widths = dump.widths();
    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}", width = *width))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", dump.name);
    let _ = writeln!(out, "{}", line(dump.labels.iter().map(String::as_str).collect()));
    let _ = writeln!(
        out,
        "{}",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-")
    );
    for row in &dump.rows {
        let _ = writeln!(out, "{}", line(dump.cells(row).collect()));
    }
    out
}

/// Renders a table as an HTML `<table>`.
#[must_use]
pub fn format_html(dump: &TableDump) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<h2>{}</h2>", html_escape(&dump.name));
    out.push_str("<table>\n<thead>\n<tr>");
    for label in &dump.labels {
        let _ = write!(out, "<th>{}</th>", html_escape(label));
    }
    out.push_str("</tr>\n</thead>\n<tbody>\n");
    for row in &dump.rows {
        out.push_str("<tr>");
        for cell in dump.cells(row) {
            let _ = write!(out, "<td>{}</td>", html_escape(cell));
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody>\n</table>\n");
    out
}

/// Renders `table`, or every user table, as text.
pub async fn render_text(session: &mut Session<'_>, table: Option<&str>) -> Result<String> {
    let dumps = collect(session, table).await?;
    Ok(dumps
        .iter()
        .map(format_text)
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Renders `table`, or every user table, as HTML.
pub async fn render_html(session: &mut Session<'_>, table: Option<&str>) -> Result<String> {
    let dumps = collect(session, table).await?;
    Ok(dumps.iter().map(format_html).collect())
}
