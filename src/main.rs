use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use billsync::cache::{BillStore, EventBus, FavoritesCache};
use billsync::config::Config;

#[derive(Parser, Debug)]
#[command(name = "billsync")]
#[command(about = "Diagnostics for the bill tracker's local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/billsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print cache size, freshness and expected totals
  Stats,
  /// Wipe the bills store and the favorites side-cache
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  // Keep the appender guard alive for the rest of main.
  let _log_guard = init_tracing(&config)?;

  match args.command {
    Command::Stats => {
      let store = BillStore::open(&config)?;

      println!("cached rows:  {}", store.count()?);
      match store.get_metadata()? {
        Some(meta) => {
          println!("last updated: {}", meta.last_updated);
          println!("expected:     {}", meta.total_count);
          println!("schema:       v{}", meta.version);
        }
        None => println!("no cache metadata (cold or invalidated)"),
      }
    }
    Command::Clear => {
      let store = BillStore::open(&config)?;
      store.clear()?;

      let favorites = FavoritesCache::open(&config, EventBus::new())?;
      favorites.clear()?;

      println!("cleared bills store and favorites side-cache");
    }
  }

  Ok(())
}

fn init_tracing(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = config.data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "billsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
