use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use weatherproof::coherency::{
  self, ControlPlane, ControlPlaneClient, InvalidationAction, VersionSource, VersionStore,
};
use weatherproof::config::Config;
use weatherproof::http::{FetchRequest, SERVED_FROM_HEADER};
use weatherproof::network::{Connectivity, GatedNetwork, HttpNetwork, Network};
use weatherproof::queue::OfflineQueue;
use weatherproof::stack::ClientStack;

#[derive(Parser, Debug)]
#[command(name = "weatherproof")]
#[command(about = "Offline-tolerant caching, mutation queueing and request guarding")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/weatherproof/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the cache control-plane HTTP server
  Serve {
    #[arg(long)]
    bind: Option<SocketAddr>,
  },
  /// Inspect or move the server-held cache version
  Version {
    #[command(subcommand)]
    action: VersionCommand,
  },
  /// Send one request through the guard, worker and caches
  Fetch {
    /// Path on the origin, or an absolute URL
    path: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body (sent as JSON)
    #[arg(short, long)]
    data: Option<String>,
    /// Pretend the network is down
    #[arg(long)]
    offline: bool,
  },
  /// Inspect or drain the local offline queue
  Queue {
    #[command(subcommand)]
    action: QueueCommand,
  },
  /// Run a client and report purge and reload decisions until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum VersionCommand {
  Status,
  ClearAll {
    #[arg(long)]
    reason: Option<String>,
  },
  SoftClear {
    #[arg(long)]
    reason: Option<String>,
  },
  ResetForce {
    #[arg(long)]
    reason: Option<String>,
  },
  History {
    #[arg(long, default_value_t = 20)]
    limit: usize,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  List,
  Replay,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Serve { bind } => serve(&config, bind).await,
    Command::Version { action } => version(&config, action).await,
    Command::Fetch {
      path,
      method,
      data,
      offline,
    } => fetch(&config, &path, &method, data, offline).await,
    Command::Queue { action } => queue(&config, action).await,
    Command::Watch => watch(&config).await,
  }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let default = if verbose {
    "weatherproof=debug"
  } else {
    "weatherproof=info"
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  match log_file {
    Some(path) => {
      let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| eyre!("Failed to open log file {}: {}", path.display(), e))?;
      let (writer, guard) = tracing_appender::non_blocking(file);
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn control_plane_client(config: &Config) -> Result<ControlPlaneClient> {
  ControlPlaneClient::new(config.coherency_endpoint()?, Config::operator_token())
}

async fn serve(config: &Config, bind: Option<SocketAddr>) -> Result<()> {
  let store = VersionStore::open(&config.control_plane_db_path()?)?;
  let token = Config::operator_token();
  let plane = ControlPlane::new(store, token.as_deref());
  coherency::serve(bind.unwrap_or(config.control_plane.bind), Arc::new(plane)).await
}

async fn version(config: &Config, command: VersionCommand) -> Result<()> {
  let client = control_plane_client(config)?;

  let (action, reason) = match command {
    VersionCommand::Status => return print_json(&client.status().await?),
    VersionCommand::History { limit } => return print_json(&client.history(limit).await?),
    VersionCommand::ClearAll { reason } => (InvalidationAction::ClearAll, reason),
    VersionCommand::SoftClear { reason } => (InvalidationAction::SoftClear, reason),
    VersionCommand::ResetForce { reason } => (InvalidationAction::ResetForce, reason),
  };

  print_json(&client.invalidate(action, reason.as_deref()).await?)
}

async fn start_stack(config: &Config, online: bool) -> Result<ClientStack> {
  let connectivity = Connectivity::new(online);
  let network: Arc<dyn Network> = Arc::new(GatedNetwork::new(
    Arc::new(HttpNetwork::new()?),
    connectivity.clone(),
  ));
  let source: Arc<dyn VersionSource> = Arc::new(control_plane_client(config)?);
  ClientStack::from_config(config, network, source, connectivity).await
}

async fn fetch(
  config: &Config,
  path: &str,
  method: &str,
  data: Option<String>,
  offline: bool,
) -> Result<()> {
  let stack = start_stack(config, !offline).await?;

  let url = config.resolve(path)?;
  let mut request = FetchRequest::new(&method.to_uppercase(), url);
  if let Some(body) = data {
    request = request
      .with_header("content-type", "application/json")
      .with_body(body);
  }

  let response = stack.fetch(&request).await?;
  println!("{} {}", response.status, request.url);
  if let Some(from) = response.header(SERVED_FROM_HEADER) {
    println!("served from: {}", from);
  }
  if let Some(id) = response.queued_request_id() {
    println!("queued as: {}", id);
  }
  println!("{}", response.text());
  Ok(())
}

async fn queue(config: &Config, command: QueueCommand) -> Result<()> {
  let queue = OfflineQueue::open(&config.queue_db_path()?)?.with_lease_ttl(config.lease_ttl());

  match command {
    QueueCommand::List => print_json(&queue.entries()?),
    QueueCommand::Replay => {
      let network = HttpNetwork::new()?;
      let report = queue
        .replay(&network, |outcome| {
          let status = outcome
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "no response".to_string());
          println!("{} {}", outcome.id, status);
        })
        .await?;
      print_json(&report)
    }
  }
}

async fn watch(config: &Config) -> Result<()> {
  let mut stack = start_stack(config, true).await?;
  let mut reloads = stack.watch_coherency(config.poll_interval());
  let mut events = stack.worker().subscribe();

  println!(
    "watching {} every {:?} (Ctrl-C to stop)",
    config.coherency_endpoint()?,
    config.poll_interval()
  );

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      reload = reloads.recv() => {
        if let Ok(reload) = reload {
          println!("reload requested for cache version {}", reload.version);
        }
      }
      event = events.recv() => {
        if let Ok(event) = event {
          print_json(&event)?;
        }
      }
    }
  }

  Ok(())
}
