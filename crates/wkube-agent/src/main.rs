//! wkube-agent: workload-container job agent.
//!
//! Invoked by the orchestrator as the container's top process with a single
//! positional argument: the shell command to supervise. Everything else comes
//! from the environment. The exit code is the contract: zero on clean
//! completion, non-zero on any unrecovered failure.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wkube_core::config::{AgentConfig, LOCAL_LOG_PATH};
use wkube_core::job::JobController;
use wkube_core::logsink::{MultiWriter, RemoteLogSink};
use wkube_core::GatewayClient;

/// wkube job agent - supervises one user command inside a workload container
#[derive(Parser, Debug)]
#[command(name = "wkube-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Shell command to execute with `/bin/sh -c`
    command: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        },
    };

    let exit_code = runtime.block_on(async {
        match run(args).await {
            Ok(code) => code,
            Err(err) => {
                eprintln!("Error: {err:#}");
                1
            },
        }
    });

    // Runtime dropped before exit so background tasks cannot outlive us.
    drop(runtime);
    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<i32> {
    let config = AgentConfig::from_env().context("invalid agent configuration")?;

    let gateway = Arc::new(GatewayClient::new(&config).context("failed to build gateway client")?);

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOCAL_LOG_PATH)
        .with_context(|| format!("failed to open log file {LOCAL_LOG_PATH}"))?;

    let cancel = CancellationToken::new();
    let health_kill = CancellationToken::new();

    let sink = RemoteLogSink::spawn(Arc::clone(&gateway), health_kill.clone());
    let writer = MultiWriter::new(sink.clone(), log_file);

    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer.clone()),
        )
        .init();

    let controller = JobController::new(config, gateway, sink, writer, cancel, health_kill);
    Ok(controller.run(args.command).await)
}
