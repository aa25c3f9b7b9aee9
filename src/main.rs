use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use lifevault::store::RecordId;
use lifevault::{commands, config, logging};

#[derive(Parser, Debug)]
#[command(name = "lifevault")]
#[command(about = "Offline record storage and response cache for a personal tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lifevault/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read and write tracker records
  #[command(subcommand)]
  Records(RecordsCommand),
  /// Manage the offline response cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum RecordsCommand {
  /// Print every record of a collection
  List { collection: String },
  /// Insert a record given as a JSON object
  Add { collection: String, json: String },
  /// Insert or replace a record; the JSON must carry an id
  Put { collection: String, json: String },
  /// Delete a record by id
  Del { collection: String, id: RecordId },
  /// Remove every record of a collection
  Clear { collection: String },
  /// Dump all collections as JSON
  Export {
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Load a snapshot written by `export`
  Import {
    input: PathBuf,
    /// Clear each collection in the snapshot first
    #[arg(long)]
    wipe: bool,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Precache the shell and activate the configured version
  Install,
  /// Delete partitions from other versions
  Prune,
  /// Route one request through the cache
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// List partitions and their entry counts
  Partitions,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  logging::init(&config.log)?;

  match args.command {
    Command::Records(cmd) => match cmd {
      RecordsCommand::List { collection } => commands::records_list(&config, &collection).await,
      RecordsCommand::Add { collection, json } => {
        commands::records_add(&config, &collection, &json).await
      }
      RecordsCommand::Put { collection, json } => {
        commands::records_put(&config, &collection, &json).await
      }
      RecordsCommand::Del { collection, id } => {
        commands::records_del(&config, &collection, id).await
      }
      RecordsCommand::Clear { collection } => commands::records_clear(&config, &collection).await,
      RecordsCommand::Export { output } => {
        commands::records_export(&config, output.as_deref()).await
      }
      RecordsCommand::Import { input, wipe } => {
        commands::records_import(&config, &input, wipe).await
      }
    },
    Command::Cache(cmd) => match cmd {
      CacheCommand::Install => commands::cache_install(&config).await,
      CacheCommand::Prune => commands::cache_prune(&config),
      CacheCommand::Fetch { url, navigate } => commands::cache_fetch(&config, &url, navigate).await,
      CacheCommand::Partitions => commands::cache_partitions(&config),
    },
  }
}
