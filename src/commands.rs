/// Handlers for the operator CLI
use color_eyre::{eyre::eyre, Result};
use schoolsync::accessor::{ReadSource, WriteError, WriteOutcome};
use schoolsync::app::App;
use schoolsync::query::TableQuery;
use schoolsync::queue::{Mutation, MutationKind, WritePayload};
use schoolsync::row::{row_from_value, Row};
use schoolsync::store::Blob;
use schoolsync::sync::DrainOutcome;
use serde_json::Value;
use std::path::Path;

/// Options of the `read` subcommand
#[derive(Debug, Default)]
pub struct ReadArgs {
  pub select: Option<String>,
  pub filters: Vec<String>,
  pub in_filters: Vec<String>,
  pub order: Vec<String>,
  pub limit: Option<usize>,
  pub offset: Option<usize>,
}

pub async fn status(app: &App) -> Result<()> {
  let online = app.connect().await;
  let accessor = app.accessor();

  println!("online:        {}", online);
  println!("authenticated: {}", accessor.is_authenticated());
  println!("pending:       {}", accessor.pending_count()?);
  println!("failed:        {}", accessor.failed_mutations()?.len());
  println!();

  for table in app.store().collections()? {
    match app.store().table_meta(&table)? {
      Some(meta) => println!(
        "{:<14} {:>6} rows  synced {}",
        table,
        meta.row_count,
        meta.synced_at.format("%Y-%m-%d %H:%M:%S")
      ),
      None => println!("{:<14}      - never synced", table),
    }
  }
  Ok(())
}

pub async fn read(app: &App, table: &str, args: &ReadArgs) -> Result<()> {
  let query = build_query(args)?;
  app.connect().await;

  let result = app.accessor().read(table, &query).await?;
  let source = match result.source {
    ReadSource::Remote => "remote",
    ReadSource::Local => "local snapshot",
  };
  eprintln!("{} rows from {}", result.rows.len(), source);
  println!(
    "{}",
    serde_json::to_string_pretty(&result.rows).map_err(|e| eyre!("Failed to render rows: {}", e))?
  );
  Ok(())
}

pub async fn write(
  app: &App,
  table: &str,
  kind: &str,
  json: &str,
  files: &[String],
) -> Result<()> {
  let kind: MutationKind = kind.parse()?;
  let data = parse_row(json)?;
  let mut payload = WritePayload::new(data);
  for arg in files {
    let (field, path) = parse_assignment(arg)?;
    payload = payload.with_file(field, load_blob(Path::new(path))?);
  }

  app.connect().await;
  match app.accessor().write(table, kind, payload).await {
    Ok(WriteOutcome::Confirmed(row)) => {
      println!("confirmed");
      if let Some(row) = row {
        println!(
          "{}",
          serde_json::to_string_pretty(&row).map_err(|e| eyre!("Failed to render row: {}", e))?
        );
      }
      Ok(())
    }
    Ok(WriteOutcome::Queued(handle)) => {
      match handle.row_id {
        Some(id) => println!("queued as mutation {} (row {})", handle.mutation_id, id),
        None => println!("queued as mutation {}", handle.mutation_id),
      }
      Ok(())
    }
    Err(WriteError::Rejected { status, message }) => {
      Err(eyre!("Remote rejected the write ({}): {}", status, message))
    }
    Err(WriteError::Queue(e)) => Err(e.wrap_err("Failed to queue the write")),
  }
}

pub fn pending(app: &App) -> Result<()> {
  let mutations = app.queue().list()?;
  if mutations.is_empty() {
    println!("no pending mutations");
    return Ok(());
  }
  for mutation in &mutations {
    println!("{}", describe(mutation));
  }
  Ok(())
}

pub async fn sync(app: &App, retry_failed: bool) -> Result<()> {
  match app.engine().force_drain(retry_failed).await? {
    DrainOutcome::Completed(report) => {
      println!(
        "confirmed {}, failed {}, skipped {}",
        report.confirmed, report.failed, report.skipped
      );
      let remaining = app.queue().pending_count()?;
      if remaining > 0 {
        println!("{} mutations still pending", remaining);
      }
    }
    DrainOutcome::AlreadyRunning => println!("a sync is already running"),
    DrainOutcome::Offline => println!("offline: nothing was sent"),
  }
  Ok(())
}

/// Run the background tasks and print every event until Ctrl-C.
pub async fn watch(app: &mut App) -> Result<()> {
  let mut events = app.subscribe(&[]);
  app.start();
  println!("watching (Ctrl-C to stop)");

  loop {
    tokio::select! {
      event = events.next() => match event {
        Some(event) => println!("{:<22} {:?}", event.topic().as_str(), event),
        None => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  app.shutdown();
  Ok(())
}

fn describe(mutation: &Mutation) -> String {
  let target = mutation
    .target_id()
    .map(|id| id.to_string())
    .unwrap_or_else(|| "-".to_string());
  let mut line = format!(
    "#{:<5} {} {:<7} {:<14} {}",
    mutation.id,
    mutation.created_at.format("%Y-%m-%d %H:%M:%S"),
    mutation.kind.as_str(),
    mutation.table,
    target
  );
  if mutation.has_failed() {
    line.push_str(&format!(
      "  attempts={} error={}",
      mutation.attempts,
      mutation.last_error.as_deref().unwrap_or("")
    ));
  }
  line
}

pub fn build_query(args: &ReadArgs) -> Result<TableQuery> {
  let mut query = TableQuery::all();

  if let Some(select) = &args.select {
    query = query.select(
      select
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty()),
    );
  }
  for arg in &args.filters {
    let (column, value) = parse_assignment(arg)?;
    query = query.eq(column, parse_value(value));
  }
  for arg in &args.in_filters {
    let (column, values) = parse_assignment(arg)?;
    query = query.is_in(column, values.split(',').map(|v| parse_value(v.trim())));
  }
  for arg in &args.order {
    let (column, descending) = match arg.rsplit_once('.') {
      Some((column, "desc")) => (column, true),
      Some((column, "asc")) => (column, false),
      _ => (arg.as_str(), false),
    };
    query = query.order(column, descending);
  }
  match (args.limit, args.offset) {
    (Some(limit), offset) => query = query.range(offset.unwrap_or(0), limit),
    (None, Some(_)) => return Err(eyre!("--offset requires --limit")),
    (None, None) => {}
  }
  Ok(query)
}

/// Split `field=value`.
fn parse_assignment(arg: &str) -> Result<(&str, &str)> {
  arg
    .split_once('=')
    .map(|(k, v)| (k.trim(), v.trim()))
    .filter(|(k, _)| !k.is_empty())
    .ok_or_else(|| eyre!("Expected field=value, got '{}'", arg))
}

/// JSON scalars as JSON, anything else as a string.
fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_row(json: &str) -> Result<Row> {
  match serde_json::from_str::<Value>(json).map_err(|e| eyre!("Invalid row JSON: {}", e))? {
    value @ Value::Object(_) => Ok(row_from_value(value)),
    _ => Err(eyre!("Row JSON must be an object")),
  }
}

fn load_blob(path: &Path) -> Result<Blob> {
  let bytes =
    std::fs::read(path).map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .ok_or_else(|| eyre!("Not a file: {}", path.display()))?;
  Ok(Blob {
    content_type: mime_guess::from_path(path)
      .first_or_octet_stream()
      .to_string(),
    file_name,
    bytes,
  })
}
