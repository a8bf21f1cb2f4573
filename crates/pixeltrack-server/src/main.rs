//! pixeltrack server binary.
//!
//! Reads `pixeltrack.toml` (or the path given with `--config`) overlaid with
//! `PIXELTRACK_*` environment variables, opens the SQLite store, and runs one
//! of the subcommands below. `serve` is the default.
//!
//! ```
//! cargo run -p pixeltrack-server -- serve
//! cargo run -p pixeltrack-server -- reconcile
//! cargo run -p pixeltrack-server -- export-events --since 1700000000 > events.jsonl
//! cargo run -p pixeltrack-server -- dead-letters --replay
//! ```

use std::{
  io::Write as _,
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use chrono::DateTime;
use clap::{Parser, Subcommand};
use pixeltrack_core::{aggregator::Aggregator, identity::SubjectId, store::AggregateStore};
use pixeltrack_server::{
  AppState, ServerConfig,
  queue::{self, Delivery},
};
use pixeltrack_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Email open/send tracking server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "pixeltrack.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the pixel and the JSON API.
  Serve,

  /// Recompute subject counters from their pairs.
  Reconcile {
    /// Only this subject id; every subject if omitted.
    #[arg(long)]
    subject: Option<String>,
  },

  /// Write the raw event log to stdout as JSON lines.
  ExportEvents {
    /// Only events at or after this unix timestamp (seconds).
    #[arg(long)]
    since: Option<i64>,
    #[arg(long)]
    limit: Option<usize>,
  },

  /// List events the workers gave up on.
  DeadLetters {
    /// Redeliver each one, removing those that now succeed.
    #[arg(long)]
    replay: bool,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Logs go to stderr so `export-events` output stays clean.
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let server_cfg = ServerConfig::load(&cli.config)
    .with_context(|| format!("failed to load config from {:?}", cli.config))?;

  // Expand `~` in store path.
  let store_path = expand_tilde(&server_cfg.store_path);

  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  match cli.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(store.clone(), &server_cfg).await?,
    Command::Reconcile { subject } => reconcile(&store, subject.as_deref()).await?,
    Command::ExportEvents { since, limit } => export_events(&store, since, limit).await?,
    Command::DeadLetters { replay } => dead_letters(store.clone(), &server_cfg, replay).await?,
  }

  store.close().await.context("failed to close store")?;
  Ok(())
}

async fn serve(store: SqliteStore, cfg: &ServerConfig) -> anyhow::Result<()> {
  let store = Arc::new(store);
  let (work_queue, pool) = queue::start(
    Aggregator::new(store.clone()),
    cfg.workers,
    cfg.queue_capacity,
    cfg.retry_policy(),
  );

  let state = AppState { store, queue: work_queue };
  let app = pixeltrack_server::router(state);
  let address = cfg.address();

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
      }
    })
    .await
    .context("server error")?;

  // The router (and with it every queue handle) is gone; wait for the
  // backlog to be aggregated before the store closes.
  tracing::info!("draining ingestion queue");
  pool.join().await;
  Ok(())
}

async fn reconcile(store: &SqliteStore, subject: Option<&str>) -> anyhow::Result<()> {
  let ids = match subject {
    Some(raw) => vec![SubjectId::parse(raw)?],
    None => store.list_subject_ids().await?,
  };

  let mut changed = 0;
  for id in ids {
    match store.reconcile_subject(id.clone()).await? {
      Some(report) if report.changed() => changed += 1,
      Some(_) => {}
      None => tracing::warn!(subject_id = %id, "unknown subject"),
    }
  }
  tracing::info!(changed, "reconciliation finished");
  Ok(())
}

async fn export_events(
  store: &SqliteStore,
  since: Option<i64>,
  limit: Option<usize>,
) -> anyhow::Result<()> {
  let since = since
    .map(|secs| {
      DateTime::from_timestamp(secs, 0)
        .with_context(|| format!("timestamp {secs} out of range"))
    })
    .transpose()?;

  let events = store.list_events(since, limit).await?;
  let mut out = std::io::stdout().lock();
  for event in &events {
    serde_json::to_writer(&mut out, event)?;
    out.write_all(b"\n")?;
  }
  out.flush()?;
  tracing::info!(count = events.len(), "exported events");
  Ok(())
}

async fn dead_letters(
  store: SqliteStore,
  cfg: &ServerConfig,
  replay: bool,
) -> anyhow::Result<()> {
  let letters = store.list_dead_letters().await?;
  if !replay {
    for letter in &letters {
      println!(
        "{}\t{}\t{} attempts\t{}",
        letter.event.event_id,
        letter.failed_at.to_rfc3339(),
        letter.attempts,
        letter.last_error,
      );
    }
    return Ok(());
  }

  let store = Arc::new(store);
  let aggregator = Aggregator::new(store.clone());
  let policy = cfg.retry_policy();
  let mut recovered = 0;
  for letter in letters {
    let event_id = letter.event.event_id;
    match queue::redeliver(&aggregator, letter.event, &policy).await {
      Delivery::Delivered { .. } => {
        store.remove_dead_letter(event_id).await?;
        recovered += 1;
      }
      Delivery::DeadLettered { error, .. } => {
        tracing::warn!(%event_id, %error, "replay failed");
      }
    }
  }
  tracing::info!(recovered, "dead-letter replay finished");
  Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
  if let Ok(rest) = path.strip_prefix("~")
    && let Some(home) = std::env::var_os("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
