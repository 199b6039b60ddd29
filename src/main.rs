use clap::Parser;
use hat::{Config, Environment, MemoryStore, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Forward HTTP(S) proxy with TLS interception and request policy
#[derive(Parser, Debug)]
#[command(name = "hat")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Configuration file (default: <config dir>/hat/config.toml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Listen on this address instead of the configured one
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  /// Relay CONNECT tunnels without intercepting them
  #[arg(long)]
  no_mitm: bool,

  /// Increase log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,
}

fn init_tracing(verbose: u8) -> hat::Result<()> {
  use tracing_subscriber::{fmt, prelude::*, EnvFilter};

  let filter = match verbose {
    0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    1 => EnvFilter::new("info"),
    2 => EnvFilter::new("debug"),
    _ => EnvFilter::new("trace"),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(filter)
    .try_init()
    .map_err(|e| hat::Error::Config(format!("initialize tracing subscriber: {}", e)))
}

async fn run(cli: Cli) -> hat::Result<()> {
  let path = match cli.config {
    Some(path) => path,
    None => Config::default_path()?,
  };
  let mut config = Config::load(&path)?;
  if let Some(addr) = cli.listen {
    config.addr = addr;
  }
  if cli.no_mitm {
    config.mitm.enabled = false;
  }
  info!(config = %path.display(), "configuration initialized");

  let store: Arc<dyn Store> = match &config.store.file {
    Some(file) => Arc::new(MemoryStore::load(file).await?),
    None => Arc::new(MemoryStore::new()),
  };

  let env = Environment::initialize(&config).await?;
  env
    .serve(store, async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        error!("waiting for ctrl-c: {}", e);
        std::future::pending::<()>().await;
      }
    })
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();
  if let Err(e) = init_tracing(cli.verbose) {
    eprintln!("{}", e);
    return ExitCode::FAILURE;
  }
  match run(cli).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("run proxy: {}", e);
      ExitCode::FAILURE
    }
  }
}
