//! Operator command line for the films data service.
//!
//! Usage:
//!     filmdata [--config filmdata.toml] <command>
//!
//! `serve` runs the HTTP API, the queue worker and the scheduler timer in one
//! process; the other commands perform a single operation and exit.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filmdata::config::Settings;
use filmdata::crawler::SchedulerOutcome;
use filmdata::logging::init_logging;
use filmdata::worker::run_scheduler;
use filmdata::{server, CallerIdentity, FilmStore, QueryRequest};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG: &str = "filmdata.toml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ./filmdata.toml when present)
    #[arg(short, long, env = "FILMDATA_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the API and run the crawl worker and scheduler
    Serve {
        /// Listen address (overrides api.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Run one year-scheduler step
    GetYear,
    /// Enqueue the first window of a year directly
    CrawlYear {
        year: i32,
    },
    /// Run queued crawl tasks until none is due
    Work,
    /// Print the API payload for a query
    Search {
        query: String,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Pretty-print
        #[arg(long)]
        debug: bool,
    },
    /// Print the film stored under an id
    Lookup {
        id: String,
    },
    /// Clear the crawl cursor
    ResetCursor,
    /// Show crawl cursor, queue and index sizes
    Status,
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let default = Path::new(DEFAULT_CONFIG);
    let path = match path {
        Some(path) => Some(path),
        None if default.exists() => Some(default),
        None => None,
    };
    Settings::load(path).context("Failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let settings = load_settings(args.config.as_deref())?;
    let store = FilmStore::open(settings).context("Failed to open film store")?;

    match args.command {
        Command::Serve { bind } => serve(store, bind).await?,
        Command::GetYear => match store.get_year()? {
            SchedulerOutcome::Enqueued { year } => println!("Enqueued {}", year),
            SchedulerOutcome::Exhausted => println!("Back-fill complete, cursor cleared"),
        },
        Command::CrawlYear { year } => {
            store.enqueue_year(year)?;
            println!("Enqueued {}", year);
        }
        Command::Work => {
            let ran = store.worker().drain().await?;
            println!("Ran {} task(s)", ran);
        }
        Command::Search { query, limit, debug } => {
            let request = QueryRequest { limit, debug, ..QueryRequest::search(query) };
            println!("{}", store.query(&CallerIdentity::admin(), &request).body);
        }
        Command::Lookup { id } => {
            println!("{}", store.query(&CallerIdentity::admin(), &QueryRequest::lookup(id)).body);
        }
        Command::ResetCursor => {
            store.reset_cursor()?;
            println!("Crawl cursor cleared");
        }
        Command::Status => {
            let status = store.status()?;
            match status.cursor_year {
                Some(year) => println!("Cursor:    {}", year),
                None => println!("Cursor:    (none, next step starts at the current year)"),
            }
            println!("Pending:   {}", status.pending_tasks);
            for target in status.pending_targets.iter().take(10) {
                println!("  {}", target);
            }
            println!("Documents: {}", status.indexed_documents);
        }
    }

    Ok(())
}

async fn serve(store: FilmStore, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| store.settings().api.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let router = store.router()?;
    let shutdown = CancellationToken::new();

    let worker = store.worker();
    let worker_shutdown = shutdown.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });

    let interval = store.settings().crawler.scheduler_interval_secs;
    let scheduler_task = (interval > 0).then(|| {
        tokio::spawn(run_scheduler(
            store.scheduler().clone(),
            Duration::from_secs(interval),
            shutdown.clone(),
        ))
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        signal_shutdown.cancel();
    });

    server::serve(listener, router, shutdown.clone()).await?;

    shutdown.cancel();
    worker_task.await.context("Worker task failed")?;
    if let Some(task) = scheduler_task {
        task.await.context("Scheduler task failed")?;
    }
    Ok(())
}
