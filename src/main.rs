use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hivefarm::config::{Config, LoggingConfig};
use hivefarm::farm::{
    self, partition_accounts, partition_proxies, worker_count, FarmContext, FarmScheduler,
    WorkerDispatcher,
};
use hivefarm::proxy::{load_proxy_file, ProxyPool};
use hivefarm::store::Store;
use hivefarm::utils::shutdown;

#[derive(Parser)]
#[command(
    name = "hivefarm",
    version,
    about = "Multiprocess device-farm orchestrator for a remote task service",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides logging.format from the config
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start farming: partition accounts/proxies and supervise the workers
    Farm {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Accounts file (one email per line)
        #[arg(short, long)]
        accounts: PathBuf,

        /// Proxy list file (one URI per line)
        #[arg(short, long)]
        proxies: PathBuf,
    },

    /// Internal: run one worker's partition (spawned by `farm`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        accounts: PathBuf,

        #[arg(long)]
        proxies: PathBuf,

        #[arg(long)]
        worker_index: usize,

        #[arg(long)]
        worker_count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Farm {
            config,
            accounts,
            proxies,
        } => {
            let loaded = Config::load(&config).context("Failed to load configuration")?;
            setup_tracing(&loaded.logging, cli.log_format.as_deref(), cli.verbose)?;
            run_dispatcher(loaded, config, accounts, proxies).await?;
        }

        Commands::Worker {
            config,
            accounts,
            proxies,
            worker_index,
            worker_count,
        } => {
            let loaded = Config::load(&config).context("Failed to load configuration")?;
            setup_tracing(&loaded.logging, cli.log_format.as_deref(), cli.verbose)?;
            run_worker(loaded, accounts, proxies, worker_index, worker_count).await?;
        }
    }

    Ok(())
}

async fn run_dispatcher(
    config: Config,
    config_path: PathBuf,
    accounts_path: PathBuf,
    proxies_path: PathBuf,
) -> Result<()> {
    let accounts = farm::load_account_file(&accounts_path)
        .await
        .context("Failed to load accounts file")?;
    if accounts.is_empty() {
        anyhow::bail!("No accounts provided for farming");
    }

    let proxies = load_proxy_file(&proxies_path)
        .await
        .context("Failed to load proxy file")?;

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = worker_count(config.workers.max_processes, cpus, accounts.len());

    tracing::info!(
        workers,
        accounts = accounts.len(),
        proxies = proxies.len(),
        "Starting farming"
    );

    let (controller, signal) = shutdown::shutdown_channel();
    shutdown::spawn_signal_listener(controller);

    let mut dispatcher = WorkerDispatcher::new(
        config_path,
        accounts_path,
        proxies_path,
        config.workers.fail_fast,
    );
    dispatcher.start(workers)?;
    dispatcher.supervise(&signal).await?;

    Ok(())
}

async fn run_worker(
    config: Config,
    accounts_path: PathBuf,
    proxies_path: PathBuf,
    worker_index: usize,
    workers: usize,
) -> Result<()> {
    // Re-derive this worker's partition from the same inputs the dispatcher
    // used; both sides compute identical slices.
    let accounts = farm::load_account_file(&accounts_path).await?;
    let proxies = load_proxy_file(&proxies_path).await?;

    let account_partition = partition_accounts(&accounts, workers)
        .into_iter()
        .nth(worker_index)
        .unwrap_or_default();
    let proxy_partition = partition_proxies(&proxies, workers)
        .into_iter()
        .nth(worker_index)
        .unwrap_or_default();

    tracing::info!(
        worker = worker_index,
        accounts = account_partition.len(),
        proxies = proxy_partition.len(),
        "Worker starting"
    );

    let store = Store::open(&config.store.path).context("Failed to open store")?;
    let pool = ProxyPool::new();
    pool.load(proxy_partition).await;

    let ctx = Arc::new(FarmContext {
        worker_id: worker_index,
        config,
        store: Arc::new(store),
        pool: Arc::new(pool),
    });

    let (controller, signal) = shutdown::shutdown_channel();
    shutdown::spawn_signal_listener(controller.clone());
    shutdown::spawn_stdin_watch(controller);

    let scheduler = FarmScheduler::new(ctx, account_partition);
    scheduler.run(signal).await?;

    tracing::info!(worker = worker_index, "Worker finished");
    Ok(())
}

/// Crate-scoped filter at the configured level; `--verbose` forces debug.
fn filter_directives(logging: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "hivefarm=debug,info".to_string()
    } else {
        format!("hivefarm={},warn", logging.level)
    }
}

/// Output format: an explicit `--log-format` wins over the config.
fn effective_format<'a>(cli_format: Option<&'a str>, logging: &'a LoggingConfig) -> &'a str {
    cli_format.unwrap_or(&logging.format)
}

fn setup_tracing(logging: &LoggingConfig, cli_format: Option<&str>, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(filter_directives(logging, verbose));

    match effective_format(cli_format, logging) {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_uses_config_level() {
        let mut logging = LoggingConfig::default();
        logging.level = "trace".to_string();

        assert_eq!(filter_directives(&logging, false), "hivefarm=trace,warn");
        // Verbose flag wins over the configured level
        assert_eq!(filter_directives(&logging, true), "hivefarm=debug,info");
    }

    #[test]
    fn test_cli_format_overrides_config() {
        let mut logging = LoggingConfig::default();
        logging.format = "json".to_string();

        assert_eq!(effective_format(None, &logging), "json");
        assert_eq!(effective_format(Some("text"), &logging), "text");
    }
}
