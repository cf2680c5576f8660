pub mod collect;
pub mod config;
pub mod guard;
pub mod model;
pub mod remote;
pub mod resolve;
pub mod transfer;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use collect::{CollectOptions, Collector, DEFAULT_DEST_DIR};
use config::{HostGroups, LogCatalog};
use guard::UnverifiedPolicy;
use model::{BackendKind, LogSpec};
use remote::{ClusterClient, RemoteContext};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "log-collect",
    version,
    about = "Collect log files from pods and hosts into one archive per log"
)]
pub struct Cli {
    /// Connection document with the host groups
    #[arg(long, env = "LOG_COLLECT_HOSTS", default_value = "conf/hosts.yml")]
    pub hosts: PathBuf,

    /// Log-spec document
    #[arg(long, env = "LOG_COLLECT_LOGS", default_value = "conf/logs.yml")]
    pub logs: PathBuf,

    /// Log remote commands and their output
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the name of every configured log
    List,
    /// Collect the named logs into <dest>/<name>.tar.gz
    Get {
        /// Comma-separated log names
        #[arg(short, long, value_delimiter = ',', required = true)]
        name: Vec<String>,

        /// Destination directory
        #[arg(short, long, default_value = DEFAULT_DEST_DIR)]
        dest: PathBuf,

        /// Transfer cap in MB/s (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        limit: u64,

        /// What to do when the free-space check cannot run
        #[arg(long, value_enum, default_value_t = UnverifiedPolicy::Skip)]
        on_unverified: UnverifiedPolicy,

        /// Targets of one log processed at once
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        parallel: u16,

        /// Pause after the last byte before closing each local file
        #[arg(long, default_value_t = 1000)]
        settle_ms: u64,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        built = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        "starting"
    );

    match cli.command {
        Commands::List => {
            let catalog = LogCatalog::load(&cli.logs)?;
            for name in catalog.names() {
                println!("{name}");
            }
            println!();
            println!("usage: log-collect get -n <name>[,<name>...] [-d <dest>] [--limit <MB/s>]");
            Ok(())
        }
        Commands::Get {
            name,
            dest,
            limit,
            on_unverified,
            parallel,
            settle_ms,
        } => {
            let options = CollectOptions {
                dest_dir: dest,
                limit_mb: limit,
                policy: on_unverified,
                parallelism: usize::from(parallel),
                settle_delay: Duration::from_millis(settle_ms),
            };
            run_get(&cli.hosts, &cli.logs, &name, options).await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "log-collect", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run_get(
    hosts_path: &std::path::Path,
    logs_path: &std::path::Path,
    names: &[String],
    options: CollectOptions,
) -> Result<()> {
    let catalog = LogCatalog::load(logs_path)?;
    let wanted: Vec<&LogSpec> = names.iter().filter_map(|n| catalog.find(n)).collect();

    let hosts = if wanted.iter().any(|s| s.backend == BackendKind::Shell) {
        HostGroups::load(hosts_path)?
    } else {
        HostGroups::default()
    };
    let mut context = RemoteContext::new(hosts);
    if wanted.iter().any(|s| s.backend.needs_cluster()) {
        let cluster = ClusterClient::try_default()
            .await
            .context("cluster client setup failed")?;
        context = context.with_cluster(cluster);
    }

    let collector = Collector::new(context, options);
    for name in names {
        let Some(spec) = catalog.find(name) else {
            println!("not found: {name}");
            continue;
        };

        match collector.collect(spec).await {
            Ok(report) => {
                println!("{}", report.archive.display());
                println!("  {}", report.summary());
                for line in report.problems() {
                    println!("  {line}");
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => println!("failed: {name}: {e}"),
        }
    }
    Ok(())
}
