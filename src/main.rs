//! # Insight Sync CLI (`isync`)
//!
//! The `isync` binary drives the sync-and-search pipeline from the command
//! line and hosts the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! isync --config ./config/isync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `isync serve` | Start the HTTP server (and scheduled resync, if configured) |
//! | `isync sync` | Full reconciliation of the index against the source |
//! | `isync sync --since <ts>` | Incremental sync of recently modified records |
//! | `isync sync --id <id>` | Reconcile a single record |
//! | `isync search "<query>"` | Semantic search over the index |
//! | `isync fetch <id>` | Print one record from the source |
//! | `isync delete <id>` | Tombstone a record and converge the index |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use insight_sync::config::{self, Config};
use insight_sync::models::{MetadataValue, RecordId, SearchQuery, SummaryOutcome, SyncScope};
use insight_sync::server;
use insight_sync::service::Orchestrator;

/// Insight Sync — keeps a vector index convergent with a source-of-truth
/// record store and serves semantic search over it.
#[derive(Parser)]
#[command(
    name = "isync",
    about = "Sync a source-of-truth record store into a vector index and search it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the file does not exist, built-in defaults are used
    /// (in-memory backends, embedding disabled).
    #[arg(long, global = true, default_value = "./config/isync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and exposes fetch, search, delete, and
    /// background sync endpoints. When `[sync].auto_interval_secs` is set,
    /// a periodic full resync runs alongside the server.
    Serve,

    /// Reconcile the vector index against the source of truth.
    ///
    /// Without flags this is a full sync: every record is checked and
    /// orphaned index documents are removed. `--since` restricts the scan
    /// to recently modified records; `--id` reconciles one record.
    Sync {
        /// Only reconcile records modified at or after this instant
        /// (RFC 3339, e.g. `2025-05-01T00:00:00Z`).
        #[arg(long, conflicts_with = "id")]
        since: Option<DateTime<Utc>>,

        /// Reconcile a single record by id.
        #[arg(long)]
        id: Option<RecordId>,
    },

    /// Search the index.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of hits.
        #[arg(short, long, default_value_t = 10)]
        k: usize,

        /// Metadata equality filter as `key=value`; repeatable, all must
        /// match. Values parse as bool, integer, or float before falling
        /// back to text.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, MetadataValue)>,

        /// Ask the configured LLM for a summary of the top hits.
        #[arg(long)]
        summarize: bool,
    },

    /// Print one record from the source of truth as JSON.
    Fetch {
        /// Record id.
        id: RecordId,
    },

    /// Tombstone a record in the source and remove it from the index.
    Delete {
        /// Record id.
        id: RecordId,
    },
}

/// Parse a `key=value` filter argument.
fn parse_filter(s: &str) -> Result<(String, MetadataValue), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{s}'"))?;
    let key = s[..pos].to_string();
    let raw = &s[pos + 1..];
    let value = if let Ok(b) = raw.parse::<bool>() {
        MetadataValue::Bool(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        MetadataValue::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        MetadataValue::Float(f)
    } else {
        MetadataValue::Text(raw.to_string())
    };
    Ok((key, value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    let service = Orchestrator::from_config(&cfg).await?;

    match cli.command {
        Commands::Serve => {
            service.spawn_scheduler();
            server::run(service, &cfg.server.bind).await?;
        }
        Commands::Sync { since, id } => {
            let scope = match (since, id) {
                (_, Some(id)) => SyncScope::One(id),
                (Some(since), None) => SyncScope::Since(since),
                (None, None) => SyncScope::All,
            };
            let report = service.sync(scope).await.context("sync failed")?;
            println!(
                "Sync finished: {} upserted, {} deleted, {} unchanged, {} failed.",
                report.upserted, report.deleted, report.unchanged, report.failed
            );
        }
        Commands::Search {
            query,
            k,
            filters,
            summarize,
        } => {
            let request = SearchQuery {
                text: query,
                filters: filters.into_iter().collect(),
                k,
                summarize,
            };
            let response = service.search(&request).await.context("search failed")?;
            if response.hits.is_empty() {
                println!("No results.");
            }
            for (rank, hit) in response.hits.iter().enumerate() {
                println!("{}. [{:.4}] #{} {}", rank + 1, hit.score, hit.id, hit.title);
                if !hit.snippet.is_empty() {
                    println!("   {}", hit.snippet);
                }
            }
            match response.summary {
                SummaryOutcome::Ready(text) => println!("\nSummary: {text}"),
                SummaryOutcome::Unavailable => println!("\nSummary unavailable."),
                SummaryOutcome::Skipped => {}
            }
        }
        Commands::Fetch { id } => {
            let record = service.fetch(id).await.context("fetch failed")?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Delete { id } => {
            let report = service.delete(id).await.context("delete failed")?;
            println!(
                "Record {id} deleted ({} removed from index).",
                report.deleted
            );
        }
    }

    Ok(())
}
