use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use pbft_bench::{bench, config, Completion, RetryPolicy, Settings};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// Host list, one IP address per line, client last. Defaults to
    /// `$HOME/hosts`.
    #[clap(long)]
    hosts: Option<PathBuf>,
    #[clap(long, default_value = "keys")]
    key_dir: PathBuf,
    /// Reuse the key pairs already in the key directory.
    #[clap(long)]
    no_generate_keys: bool,
    #[clap(long, default_value_t = config::DEFAULT_NUM_REQUESTS)]
    num_requests: u32,
    #[clap(long, default_value_t = config::BASE_PORT)]
    base_port: u16,
    #[clap(long, default_value_t = config::RPC_BASE_PORT)]
    rpc_base_port: u16,

    #[clap(long, default_value_t = 10000)]
    barrier_timeout_ms: u64,
    #[clap(long, default_value_t = 0)]
    settle_delay_ms: u64,

    #[clap(long, default_value_t = 1)]
    max_attempts: u32,
    #[clap(long, default_value_t = 100)]
    initial_backoff_ms: u64,
    #[clap(long, default_value_t = 2000)]
    max_backoff_ms: u64,

    #[clap(long, value_enum, default_value_t = CompletionArg::First)]
    completion: CompletionArg,
    /// Submit requests unsigned when signing fails instead of aborting.
    #[clap(long)]
    allow_unsigned: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompletionArg {
    First,
    All,
}

impl From<CompletionArg> for Completion {
    fn from(value: CompletionArg) -> Self {
        match value {
            CompletionArg::First => Completion::First,
            CompletionArg::All => Completion::All,
        }
    }
}

impl From<Cli> for Settings {
    fn from(cli: Cli) -> Self {
        let mut settings = Settings {
            hosts_file: cli.hosts,
            key_dir: cli.key_dir,
            num_requests: cli.num_requests,
            base_port: cli.base_port,
            rpc_base_port: cli.rpc_base_port,
            generate_keys: !cli.no_generate_keys,
            allow_unsigned: cli.allow_unsigned,
            retry: RetryPolicy {
                max_attempts: cli.max_attempts.max(1),
                initial_backoff: Duration::from_millis(cli.initial_backoff_ms),
                max_backoff: Duration::from_millis(cli.max_backoff_ms),
            },
            completion: cli.completion.into(),
            ..Default::default()
        };
        settings.barrier.timeout = Duration::from_millis(cli.barrier_timeout_ms);
        settings.barrier.settle_delay = Duration::from_millis(cli.settle_delay_ms);
        settings
    }
}

#[tokio::main]
async fn main() -> pbft_bench::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let settings = Settings::from(Cli::parse());

    let report = bench::run(&settings).await?;
    println!(
        "{} requests in {:?}, {:.2} req/s",
        report.submitted,
        report.elapsed,
        report.throughput()
    );
    let start = report.barrier.completed;
    for (replica, at) in &report.completion.finished {
        println!(
            "replica {replica} processed all requests {:?} after start-up",
            at.saturating_duration_since(start)
        )
    }
    Ok(())
}
