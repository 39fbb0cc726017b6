use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offsync::store::RequestMeta;
use offsync::{Config, OfflineClient};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first cache and mutation queue for a remote JSON API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL (overrides the config file)
  #[arg(long)]
  base_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Probe connectivity and show queue and auth state
  Status,
  /// Read a resource, falling back to the cache
  Get {
    resource: String,
    /// Cache key (default: the resource path)
    #[arg(short, long)]
    key: Option<String>,
  },
  /// Write a resource, queueing the write if the server is unreachable
  Put {
    resource: String,
    /// JSON payload
    #[arg(short, long)]
    data: String,
    #[arg(short, long)]
    key: Option<String>,
    #[arg(short, long, default_value = "PUT")]
    method: String,
  },
  /// List queued mutations
  Queue,
  /// Replay queued mutations now
  Drain,
  /// Keep running: poll connectivity and drain on reconnect until Ctrl-C
  Watch,
  /// Show whether the current caller is authenticated
  Whoami,
  /// Cache an identity from a successful sign-in
  Login {
    /// User JSON
    #[arg(short, long)]
    user: String,
    #[arg(short, long)]
    token: Option<String>,
  },
  /// Forget the cached identity
  Logout,
  /// Delete every cached value and queued mutation
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = load_config(args.config.as_deref(), args.base_url)?;
  let _log_guard = init_logging(&config)?;

  let client = OfflineClient::from_config(&config)?;
  run(&client, args.command).await
}

fn load_config(explicit: Option<&Path>, base_url: Option<String>) -> Result<Config> {
  let config = match (Config::locate(explicit)?, base_url.as_ref()) {
    (Some(path), _) => Config::load_from_path(&path)?,
    (None, Some(url)) => Config::for_base_url(url.clone()),
    (None, None) => Config::load(None)?,
  };

  // Override base URL if specified on command line
  Ok(match base_url {
    Some(url) => {
      let mut config = config;
      config.remote.base_url = url;
      config
    }
    None => config,
  })
}

/// Log to a daily file next to the store so output stays clean.
fn init_logging(config: &Config) -> Result<WorkerGuard> {
  let log_dir = config
    .cache
    .store_path()
    .and_then(|p| p.parent().map(|dir| dir.join("logs")))
    .unwrap_or_else(|| std::env::temp_dir().join("offsync"));
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "offsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("OFFSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn parse_json(s: &str) -> Result<Value> {
  serde_json::from_str(s).map_err(|e| eyre!("Invalid JSON '{}': {}", s, e))
}

async fn run(client: &OfflineClient, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      let connectivity = client.monitor().check_now().await;
      print_json(&json!({
        "connectivity": connectivity,
        "backend": client.store().active_backend(),
        "queued": client.store().queue_len()?,
        "auth": client.is_authenticated(),
      }))
    }
    Command::Get { resource, key } => {
      client.monitor().check_now().await;
      let key = key.unwrap_or_else(|| resource.clone());
      print_json(&client.fetch_with_cache(&resource, &key).await?)
    }
    Command::Put {
      resource,
      data,
      key,
      method,
    } => {
      client.monitor().check_now().await;
      let key = key.unwrap_or_else(|| resource.clone());
      let payload = parse_json(&data)?;
      let outcome = client
        .accessor()
        .update_with_method(RequestMeta::new(method), &resource, &key, &payload)
        .await?;
      print_json(&outcome)
    }
    Command::Queue => print_json(&client.store().list_queue()?),
    Command::Drain => {
      client.monitor().check_now().await;
      print_json(&client.drain_queue().await?)
    }
    Command::Watch => {
      let mut changes = client.monitor().subscribe();
      client.start();
      println!("watching connectivity (Ctrl-C to stop)");
      loop {
        tokio::select! {
          change = changes.recv() => match change {
            Ok(change) => print_json(&change)?,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
      }
      client.shutdown();
      Ok(())
    }
    Command::Whoami => print_json(&client.is_authenticated()),
    Command::Login { user, token } => {
      client.sign_in(&parse_json(&user)?, token.as_deref())?;
      print_json(&client.is_authenticated())
    }
    Command::Logout => {
      client.sign_out()?;
      println!("signed out");
      Ok(())
    }
    Command::Clear => {
      client.store().clear_all()?;
      println!("cleared cache and queue");
      Ok(())
    }
  }
}
