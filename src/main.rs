use std::str::FromStr;
use std::sync::Arc;

use bitcoin::Txid;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use tapestry::Error;
use tapestry::chain::replay::ReplayFeed;
use tapestry::search::{self, Combinator, SearchCfg};
use tapestry::storage::{RocksStore, Store};
use tapestry::{shutdown, sync};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Cli::parse();
    let config = Config::new(&args.config)?;

    match args.command {
        Command::Run(run_args) => run(config, run_args).await,
        Command::Query(query_args) => query(config, query_args).await,
        Command::Rollback(rollback_args) => rollback(config, rollback_args).await,
    }
}

async fn run(config: Config, args: RunArgs) -> Result<(), Error> {
    let store = open_store(&config, false)?;

    let replay_path = args
        .replay
        .or_else(|| config.sync.replay.clone())
        .ok_or_else(|| Error::Config("no feed source configured; set sync.replay".to_string()))?;

    let feed = Arc::new(ReplayFeed::load(&replay_path).await?);

    info!(topic = %config.sync.topic, "starting pipeline");

    let daemon = sync::pipeline::pipeline(&config.sync, store, feed.clone(), feed).await?;

    shutdown::ShutdownManager::new()
        .run_until_shutdown(tokio::task::spawn_blocking(move || daemon.block()))
        .await;

    Ok(())
}

async fn query(config: Config, args: QueryArgs) -> Result<(), Error> {
    let store = open_store(&config, true)?;

    let comb = if args.intersect {
        Combinator::Intersect
    } else {
        Combinator::Union
    };

    let cfg = SearchCfg::keys(args.keys)
        .range(args.from, args.to)
        .reverse(args.reverse)
        .limit(args.limit)
        .comb(comb)
        .filter_spent(args.unspent);

    if args.balance {
        println!("{}", search::search_balance(&store, cfg.keys).await?);
    } else if args.txos {
        for txo in search::search_txos(&store, &cfg).await? {
            println!("{}", serde_json::to_string(&txo)?);
        }
    } else {
        for entry in search::search(&store, &cfg).await? {
            println!("{} {}", entry.member, entry.score);
        }
    }

    Ok(())
}

async fn rollback(config: Config, args: RollbackArgs) -> Result<(), Error> {
    let store = open_store(&config, false)?;

    let txid =
        Txid::from_str(&args.txid).map_err(|err| Error::Config(format!("bad txid: {err}")))?;

    store.rollback(&txid).await?;
    info!(%txid, "rolled back");

    Ok(())
}

fn open_store(config: &Config, read_only: bool) -> Result<Store, Error> {
    let backend = RocksStore::open(
        config.sync.storage.path.clone(),
        read_only,
        config.sync.storage.memory_budget_bytes(),
    )?;

    Ok(Store::new(Arc::new(backend)))
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the indexing pipeline.
    Run(RunArgs),
    /// Search the event log.
    Query(QueryArgs),
    /// Reverse all derived state for one transaction.
    Rollback(RollbackArgs),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Replay file overriding the configured feed source.
    #[clap(long)]
    replay: Option<std::path::PathBuf>,
}

#[derive(Debug, clap::Args)]
struct QueryArgs {
    /// Search keys, e.g. `own:<address>` or `evt:origin:outpoint:<outpoint>`.
    keys: Vec<String>,

    #[clap(long)]
    from: Option<u64>,
    #[clap(long)]
    to: Option<u64>,
    #[clap(long)]
    reverse: bool,
    #[clap(long, default_value_t = 100)]
    limit: usize,
    /// Intersect the keys instead of merging them.
    #[clap(long)]
    intersect: bool,
    /// Drop spent outputs.
    #[clap(long)]
    unspent: bool,
    /// Print hydrated outputs instead of members.
    #[clap(long)]
    txos: bool,
    /// Print the unspent satoshi sum instead of members.
    #[clap(long)]
    balance: bool,
}

#[derive(Debug, clap::Args)]
struct RollbackArgs {
    txid: String,
}

#[derive(Debug, Parser)]
#[clap(name = "tapestry")]
#[clap(bin_name = "tapestry")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    config: Option<std::path::PathBuf>,
}

#[derive(Deserialize, Debug)]
struct Config {
    sync: sync::Config,
}

impl Config {
    fn new(config_path: &Option<std::path::PathBuf>) -> Result<Self, Error> {
        let mut s = config::Config::builder();

        s = s.add_source(config::File::with_name("tapestry.toml").required(false));

        if let Some(explicit) = config_path.as_ref().and_then(|path| path.to_str()) {
            s = s.add_source(config::File::with_name(explicit).required(true));
        }

        s = s.add_source(config::Environment::with_prefix("TAPESTRY").separator("_"));

        s.build()
            .and_then(|c| c.try_deserialize())
            .map_err(|err| Error::Config(err.to_string()))
    }
}
