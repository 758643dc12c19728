//! # MaDRPC CLI Entry Point
//!
//! Main binary for the MaDRPC dispatch layer.
//!
//! ## Usage
//!
//! ```bash
//! # 1000 requests over 3 businesses with 4 providers each
//! madrpc simulate --businesses 3 --providers 4 --requests 1000 --threads 4
//!
//! # Same workload with retries enabled for the "sim" strategy
//! madrpc simulate --flow-config '{"retry_enabled": true, "retry_count_limit": 50}'
//! ```
//!
//! The report is printed to stdout as pretty JSON; logs go to stderr.

use anyhow::Result;
use argh::FromArgs;
use madrpc_cli::simulate::{run_simulation, SimulationOptions};

#[derive(FromArgs)]
/// MaDRPC - fan-out dispatch tools
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Simulate(SimulateArgs),
}

/// Arguments for a simulation run.
///
/// # Example
///
/// ```bash
/// madrpc simulate --requests 500 --silent-rate 0.1 --strategy sim \
///     --flow-config '{"early_termination_enabled": true}'
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
/// run a simulated fan-out workload and print its metrics
struct SimulateArgs {
    /// number of backend businesses each request fans out to
    #[argh(option, default = "3")]
    businesses: usize,

    /// providers per business
    #[argh(option, default = "4")]
    providers: usize,

    /// total number of requests
    #[argh(option, default = "1000")]
    requests: usize,

    /// number of caller threads
    #[argh(option, default = "4")]
    threads: usize,

    /// per-request timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "200")]
    timeout_ms: u64,

    /// flow-control config (JSON) for the strategy
    #[argh(option, long = "flow-config")]
    flow_config: Option<String>,

    /// flow-control strategy used by every generator
    #[argh(option, default = "\"sim\".into()")]
    strategy: String,

    /// lower bound of simulated provider latency in milliseconds
    #[argh(option, long = "min-latency-ms", default = "1")]
    min_latency_ms: u64,

    /// upper bound of simulated provider latency in milliseconds
    #[argh(option, long = "max-latency-ms", default = "20")]
    max_latency_ms: u64,

    /// share of provider calls that never answer (0.0 - 1.0)
    #[argh(option, long = "silent-rate", default = "0.05")]
    silent_rate: f64,

    /// share of provider calls refused when issued (0.0 - 1.0)
    #[argh(option, long = "reject-rate", default = "0.0")]
    reject_rate: f64,
}

impl From<SimulateArgs> for SimulationOptions {
    fn from(args: SimulateArgs) -> Self {
        SimulationOptions {
            businesses: args.businesses,
            providers: args.providers,
            requests: args.requests,
            threads: args.threads,
            timeout_ms: args.timeout_ms,
            strategy: args.strategy,
            flow_config: args.flow_config,
            min_latency_ms: args.min_latency_ms,
            max_latency_ms: args.max_latency_ms,
            silent_rate: args.silent_rate,
            reject_rate: args.reject_rate,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Set default log level to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate(args) => {
            let report = run_simulation(args.into()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_simulate_defaults() {
        let cli = Cli::from_args(&["madrpc"], &["simulate"]).unwrap();
        let Commands::Simulate(args) = cli.command;
        assert_eq!(args.businesses, 3);
        assert_eq!(args.providers, 4);
        assert_eq!(args.requests, 1000);
        assert_eq!(args.strategy, "sim");
        assert!(args.flow_config.is_none());
    }

    #[test]
    fn test_cli_parse_simulate_options() {
        let cli = Cli::from_args(
            &["madrpc"],
            &[
                "simulate",
                "--businesses",
                "2",
                "--threads",
                "8",
                "--flow-config",
                r#"{"retry_enabled": true}"#,
                "--strategy",
                "s1",
                "--reject-rate",
                "0.25",
            ],
        )
        .unwrap();
        let Commands::Simulate(args) = cli.command;
        let options = SimulationOptions::from(args);
        assert_eq!(options.businesses, 2);
        assert_eq!(options.threads, 8);
        assert_eq!(options.strategy, "s1");
        assert_eq!(options.reject_rate, 0.25);
        assert_eq!(options.flow_config.as_deref(), Some(r#"{"retry_enabled": true}"#));
    }

    #[test]
    fn test_cli_rejects_unknown_subcommand() {
        assert!(Cli::from_args(&["madrpc"], &["serve"]).is_err());
    }
}
