//! oxide-tables CLI
//!
//! Command-line tool for reconciling and inspecting table databases.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use oxide_tables::prelude::*;
use oxide_tables::registry::is_reserved_table;

/// Declarative SQLite tables.
#[derive(Parser)]
#[command(name = "oxide-tables")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:tables.sqlite3")]
    database: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the database in line with a JSON description.
    Migrate {
        /// Path to the description.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print table contents.
    Dump {
        /// Table to print (all user tables if not specified).
        #[arg(short, long)]
        table: Option<String>,

        /// Print HTML instead of text.
        #[arg(long)]
        html: bool,
    },

    /// List user tables.
    Tables,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Database::open(&cli.database).await?;

    match cli.command {
        Commands::Migrate { config: path } => {
            let schema = config::load(&path)?;
            info!(
                "Migrating {} to {} table(s), {} relationship(s)",
                db.location(),
                schema.tables.len(),
                schema.relationships.len()
            );
            let report = db.migrate(&schema).await?;
            print!("{report}");
        }

        Commands::Dump { table, html } => {
            let output = if html {
                db.dump_html(table.as_deref()).await?
            } else {
                db.dump_text(table.as_deref()).await?
            };
            print!("{output}");
        }

        Commands::Tables => {
            let joins = db.join_tables().await?;
            let tables: Vec<String> = db
                .tables()
                .await
                .into_iter()
                .filter(|t| !is_reserved_table(t))
                .collect();

            if tables.is_empty() {
                info!("No tables.");
            }
            for table in &tables {
                let mut markers = Vec::new();
                if let Some(join) = joins.iter().find(|j| &j.name == table) {
                    markers.push(format!("join {} <-> {}", join.first, join.second));
                } else if db.materialize(table).await.referenced {
                    markers.push("referenced".to_string());
                }
                if markers.is_empty() {
                    println!(" {table}");
                } else {
                    println!(" {table} ({})", markers.join(", "));
                }
            }
        }
    }

    Ok(())
}
