//! `tripwire` command line: drive a synthetic workload through a breaker and
//! inspect breaker config files.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tripwire_core::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker, PoolConfig};

#[derive(Parser)]
#[command(name = "tripwire")]
#[command(about = "Circuit breaker with a bounded execution pool and call timeouts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload and print the final metrics as JSON
    Simulate(SimulateArgs),

    /// Load and validate a config file, then print it normalized as YAML
    CheckConfig {
        /// YAML or JSON config file
        path: PathBuf,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// Breaker config file (YAML or JSON); overrides the breaker flags below
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "simulated")]
    name: String,

    #[arg(long, default_value_t = 3)]
    max_failures: u32,

    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    call_timeout: Duration,

    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    reset_timeout: Duration,

    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    #[arg(long, default_value_t = 4)]
    queue_capacity: usize,

    /// Number of calls to attempt
    #[arg(long, default_value_t = 40)]
    calls: usize,

    /// Pause between calls
    #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Time a normal call takes
    #[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
    latency: Duration,

    /// Every Nth call never completes on its own
    #[arg(long)]
    hang_every: Option<usize>,

    /// Every Nth call returns an error
    #[arg(long)]
    fail_every: Option<usize>,
}

#[derive(Debug, Error)]
#[error("downstream call {0} failed")]
struct DownstreamFailure(usize);

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => simulate(args).await,
        Commands::CheckConfig { path } => check_config(path),
    }
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = BreakerConfig::from_file(&path)
        .with_context(|| format!("Invalid breaker config {}", path.display()))?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn breaker_config(args: &SimulateArgs) -> anyhow::Result<BreakerConfig> {
    if let Some(path) = &args.config {
        return BreakerConfig::from_file(path)
            .with_context(|| format!("Failed to load breaker config {}", path.display()));
    }

    let config = BreakerConfig::new(args.max_failures, args.call_timeout, args.reset_timeout)
        .with_name(args.name.clone())
        .with_pool(PoolConfig::new(
            args.max_workers.min(PoolConfig::default().idle_workers),
            args.max_workers,
            args.queue_capacity,
        ));
    config.validate()?;
    Ok(config)
}

fn every(n: Option<usize>, call: usize) -> bool {
    n.is_some_and(|n| n > 0 && call % n == 0)
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config = breaker_config(&args)?;
    let breaker = CircuitBreaker::new(config).context("Failed to start circuit breaker")?;

    tracing::info!(
        breaker = %breaker.config().name,
        calls = args.calls,
        call_timeout = ?breaker.call_timeout(),
        "Starting simulation"
    );

    let mut tally = Tally::default();
    let mut retrievals = Vec::with_capacity(args.calls);
    let mut last_state = breaker.state();

    for call in 1..=args.calls {
        let hangs = every(args.hang_every, call);
        let fails = every(args.fail_every, call);
        let latency = args.latency;

        let operation = async move {
            if hangs {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(latency).await;
            if fails {
                return Err(DownstreamFailure(call));
            }
            Ok(call)
        };

        match breaker.call(operation) {
            Ok(handle) => retrievals.push(tokio::spawn(handle.get())),
            Err(err) => {
                tracing::debug!(call, error = %err, "Call not attempted");
                tally.rejected += 1;
            }
        }

        let state = breaker.state();
        if state != last_state {
            tracing::info!(call, from = %last_state, to = %state, "Breaker changed state");
            last_state = state;
        }

        tokio::time::sleep(args.interval).await;
    }

    for retrieval in futures::future::join_all(retrievals).await {
        match retrieval.context("Result retrieval task failed")? {
            Ok(_) => tally.succeeded += 1,
            Err(BreakerError::Cancelled) | Err(BreakerError::TimedOut(_)) => tally.cancelled += 1,
            Err(_) => tally.failed += 1,
        }
    }

    tracing::info!(
        succeeded = tally.succeeded,
        failed = tally.failed,
        cancelled = tally.cancelled,
        rejected = tally.rejected,
        open_at_end = breaker.state() == BreakerState::Open,
        "Simulation finished"
    );

    println!("{}", serde_json::to_string_pretty(&breaker.metrics())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_handles_missing_and_zero() {
        assert!(!every(None, 4));
        assert!(!every(Some(0), 4));
        assert!(every(Some(2), 4));
        assert!(!every(Some(3), 4));
    }

    #[test]
    fn test_cli_parses_humantime_durations() {
        let cli = Cli::parse_from([
            "tripwire",
            "simulate",
            "--call-timeout",
            "1s 500ms",
            "--hang-every",
            "5",
        ]);
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.call_timeout, Duration::from_millis(1500));
        assert_eq!(args.hang_every, Some(5));

        let config = breaker_config(&args).unwrap();
        assert_eq!(config.name, "simulated");
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.idle_workers, 3);
    }
}
