use anyhow::Result;
use clap::{Parser, Subcommand};
use prettytable::{Cell, Row, Table};
use std::sync::Arc;
use tracing::Level;

use pressforward::config::RetrievalConfig;
use pressforward::db::Database;
use pressforward::logging::configure_cli_logging;
use pressforward::metas::UseContext;
use pressforward::retrieval::{add_feed, feed_list, ModuleRegistry, NewFeed, Scheduler};
use pressforward::store::Ports;

#[derive(Parser)]
#[clap(name = "retrieval-ctl", about = "Inspect and drive feed retrieval")]
struct Cli {
    /// Log at debug level
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cursor, heartbeat and cycle counters
    Status,

    /// Reset every retrieval flag to idle
    Reset {
        /// Also zero the cycle counters
        #[clap(long)]
        stats: bool,
    },

    /// Run one timer tick, continuing the cycle in-process
    Tick,

    /// Run a single chunk
    Step,

    /// Fetch one feed now
    Retrieve {
        #[clap(required = true)]
        id: i64,
    },

    /// Register a feed
    AddFeed {
        #[clap(required = true)]
        url: String,

        #[clap(short, long, default_value = "")]
        title: String,

        /// Fetch module kind
        #[clap(short, long)]
        kind: Option<String>,

        #[clap(long)]
        html_url: Option<String>,

        #[clap(long)]
        default_author: Option<String>,
    },

    /// List the feeds in retrieval order
    Feeds,

    /// List registered metadata fields
    Fields {
        /// Only fields visible in this context (admin or api)
        #[clap(short, long)]
        context: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_cli_logging(if cli.verbose { Level::DEBUG } else { Level::WARN });

    let config = RetrievalConfig::from_env();
    let db = Arc::new(Database::new(&config.database_path).await?);
    let scheduler = Arc::new(Scheduler::new(
        config,
        Ports::from_backend(db.clone()),
        ModuleRegistry::with_defaults(),
    ));

    match cli.command {
        Commands::Status => {
            let report = scheduler.status().await?;
            let mut table = Table::new();
            table.add_row(Row::new(vec![Cell::new("Field"), Cell::new("Value")]));
            let cursor = &report.cursor;
            let stats = &report.cycle_stats;
            let rows = [
                ("iteration index", cursor.iteration_index.to_string()),
                ("previous index", cursor.previous_iteration_index.to_string()),
                ("fetch in progress", cursor.fetch_in_progress.to_string()),
                ("iteration active", cursor.iteration_active.to_string()),
                ("chunk ready", cursor.chunk_ready.to_string()),
                (
                    "watchdog",
                    cursor
                        .stall_watchdog
                        .map(|w| format!("since {}, retrigger {}", w.created_at, w.retrigger_at))
                        .unwrap_or_else(|| "-".to_string()),
                ),
                (
                    "current feed",
                    report
                        .heartbeat
                        .as_ref()
                        .map(|h| format!("{} ({}/{})", h.feed_title, h.feeds_iteration, h.last_key))
                        .unwrap_or_else(|| "-".to_string()),
                ),
                ("chunks begun", stats.retrieval_chunks_begun.to_string()),
                ("cycles begun", stats.retrieval_cycles_begun.to_string()),
                ("cycles ended", stats.retrieval_cycles_ended.to_string()),
                ("interval (minutes)", report.interval_minutes.to_string()),
                ("stats (feeds:items:metas:options)", db.collect_stats().await?),
                ("build", format!("{} {}", report.build.version, report.build.git_hash)),
            ];
            for (name, value) in rows {
                table.add_row(Row::new(vec![Cell::new(name), Cell::new(&value)]));
            }
            table.printstd();
        }

        Commands::Reset { stats } => {
            scheduler.feed_retrieval_reset().await?;
            if stats {
                scheduler.reset_cycle_stats().await?;
            }
            println!("Retrieval reset");
        }

        Commands::Tick => {
            let outcome = scheduler.tick().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Step => {
            let outcome = scheduler.step_through_feedlist().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Retrieve { id } => {
            let outcome = scheduler.retrieve_feed(id).await?;
            println!(
                "Feed {}: {} new items, {} repeats",
                id, outcome.new_items, outcome.repeats
            );
        }

        Commands::AddFeed {
            url,
            title,
            kind,
            html_url,
            default_author,
        } => {
            let id = add_feed(
                scheduler.metas(),
                NewFeed {
                    url,
                    title,
                    kind,
                    html_url,
                    default_author,
                    module_added: Some("retrieval_ctl".to_string()),
                    ..NewFeed::default()
                },
            )
            .await?;
            println!("Feed {}", id);
        }

        Commands::Feeds => {
            let feeds = feed_list(scheduler.metas(), &[]).await?;
            let mut table = Table::new();
            table.add_row(Row::new(vec![
                Cell::new("#"),
                Cell::new("ID"),
                Cell::new("Title"),
                Cell::new("Kind"),
                Cell::new("URL"),
                Cell::new("Errors"),
                Cell::new("Last retrieved"),
            ]));
            for (index, feed) in feeds.iter().enumerate() {
                table.add_row(Row::new(vec![
                    Cell::new(&index.to_string()),
                    Cell::new(&feed.id.to_string()),
                    Cell::new(&feed.title),
                    Cell::new(&feed.kind),
                    Cell::new(&feed.url),
                    Cell::new(&feed.error_count.to_string()),
                    Cell::new(feed.last_retrieved.as_deref().unwrap_or("-")),
                ]));
            }
            table.printstd();
        }

        Commands::Fields { context } => {
            let registry = scheduler.metas().registry();
            let visible = match context.as_deref() {
                Some("api") => Some(registry.keys_visible_in(UseContext::Api)),
                Some("admin") => Some(registry.keys_visible_in(UseContext::Admin)),
                Some(other) => anyhow::bail!("unknown context {}", other),
                None => None,
            };

            let mut table = Table::new();
            table.add_row(Row::new(vec![
                Cell::new("Name"),
                Cell::new("Storage"),
                Cell::new("Levels"),
                Cell::new("Replaced by"),
            ]));
            for descriptor in registry.describe_all() {
                if visible.as_ref().is_some_and(|v| !v.contains(&descriptor.name)) {
                    continue;
                }
                table.add_row(Row::new(vec![
                    Cell::new(&descriptor.name),
                    Cell::new(&format!("{:?}", descriptor.storage_kind)),
                    Cell::new(&format!("{:?}", descriptor.levels)),
                    Cell::new(descriptor.replacement_name.unwrap_or("")),
                ]));
            }
            table.printstd();
        }
    }

    Ok(())
}
