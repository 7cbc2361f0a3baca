mod commands;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use schoolsync::app::App;
use schoolsync::config::Config;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "schoolsync")]
#[command(about = "Offline-first sync for school administration data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/schoolsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connectivity, queue and table snapshot status
  Status,
  /// Read rows, from the remote when reachable or the local snapshot
  Read {
    table: String,
    /// Comma-separated columns
    #[arg(long)]
    select: Option<String>,
    /// Equality filter, column=value (repeatable)
    #[arg(long = "where")]
    filters: Vec<String>,
    /// Membership filter, column=a,b,c (repeatable)
    #[arg(long = "in")]
    in_filters: Vec<String>,
    /// Sort column, optionally suffixed with .desc (repeatable)
    #[arg(long)]
    order: Vec<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    offset: Option<usize>,
  },
  /// Insert, update or delete a row; queued when offline
  Write {
    table: String,
    /// insert, update or delete
    kind: String,
    /// Row as a JSON object
    json: String,
    /// Attach a file, field=path (repeatable)
    #[arg(long = "file")]
    files: Vec<String>,
  },
  /// List queued mutations
  Pending,
  /// Replay queued mutations now
  Sync {
    /// Also replay mutations parked after repeated failures
    #[arg(long)]
    retry_failed: bool,
  },
  /// Run the background sync tasks and print events until Ctrl-C
  Watch,
}

fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("schoolsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "schoolsync.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let mut app = App::new(config)?;

  match args.command {
    Command::Status => commands::status(&app).await,
    Command::Read {
      table,
      select,
      filters,
      in_filters,
      order,
      limit,
      offset,
    } => {
      let read = commands::ReadArgs {
        select,
        filters,
        in_filters,
        order,
        limit,
        offset,
      };
      commands::read(&app, &table, &read).await
    }
    Command::Write {
      table,
      kind,
      json,
      files,
    } => commands::write(&app, &table, &kind, &json, &files).await,
    Command::Pending => commands::pending(&app),
    Command::Sync { retry_failed } => commands::sync(&app, retry_failed).await,
    Command::Watch => commands::watch(&mut app).await,
  }
}
