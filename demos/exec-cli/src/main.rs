//! Run shell commands on an interactive compute worker.
//!
//! Run with: cargo run -p exec-cli -- --compute local "ls -la" "python train.py"
//!
//! All commands are submitted at once and run one after another on the
//! worker. Output is printed line by line as it streams in.

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::future::join_all;
use interactive_compute_core::{Kind, LineCollector, WorkerSpec};
use interactive_compute_session::{
    ClientConfig, Commands, InteractiveSession, QueuedSession, QueuedSpawn, Settled,
    commands::exit_code,
};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run commands on an interactive compute worker.
#[derive(Parser, Debug)]
#[command(name = "exec-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Compute backend the broker should start the worker on
    #[arg(long, default_value = "local")]
    compute: String,

    /// Broker address (overrides INTERACTIVE_COMPUTE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Worker configuration entry; VALUE is parsed as JSON when possible
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_pair)]
    config: Vec<(String, String)>,

    /// Environment variable to set on the worker before running
    #[arg(long = "env", value_name = "NAME=VALUE", value_parser = parse_pair)]
    env: Vec<(String, String)>,

    /// Do not wait for the broker to acknowledge the handshake
    #[arg(long)]
    no_ack: bool,

    /// Commands to run, in order
    #[arg(required = true)]
    commands: Vec<String>,
}

fn parse_pair(input: &str) -> Result<(String, String), String> {
    input
        .split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {input:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env().context("Invalid environment configuration")?;
    if let Some(host) = cli.host {
        config.host = Some(host);
    }
    if cli.no_ack {
        config.await_handshake_ack = false;
    }

    let mut worker = WorkerSpec::new(cli.compute);
    for (key, value) in cli.config {
        let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
        worker.set_config(key, value);
    }

    tracing::info!("Connecting to {}", config.broker_address());
    let session = InteractiveSession::connect(&config, worker)
        .await
        .context("Failed to start session")?;
    let queue = QueuedSession::from_config(session, &config);

    for (name, value) in &cli.env {
        queue
            .set_env_var(name, value)
            .await
            .with_context(|| format!("Failed to set {name}"))?;
    }

    let mut runs = Vec::with_capacity(cli.commands.len());
    for (index, command) in cli.commands.iter().enumerate() {
        let spawned = queue.spawn(command.as_str())?;
        runs.push(print_output(index, command.clone(), spawned));
    }
    let results = join_all(runs).await;
    queue.session().close();

    let failed = results.iter().filter(|ok| !**ok).count();
    if failed > 0 {
        bail!("{failed} of {} commands failed", results.len());
    }
    Ok(())
}

/// Print a command's output as lines. Returns whether it succeeded.
async fn print_output(index: usize, command: String, spawned: QueuedSpawn) -> bool {
    let mut stdout = LineCollector::new();
    stdout.on(move |line| println!("[{index}] {line}"));
    let mut stderr = LineCollector::new();
    stderr.on(move |line| eprintln!("[{index}] {line}"));

    let QueuedSpawn {
        mut events, ticket, ..
    } = spawned;

    while let Some(msg) = events.recv().await {
        match msg.kind {
            Kind::Stdout => stdout.receive(msg.data_text()),
            Kind::Stderr => stderr.receive(msg.data_text()),
            _ => {}
        }
    }
    stdout.flush();
    stderr.flush();

    match ticket.await {
        Settled::Completed(data) => match exit_code(&data) {
            0 => true,
            code => {
                tracing::warn!("[{index}] {command} exited with {code}");
                false
            }
        },
        Settled::Failed(e) => {
            tracing::error!("[{index}] {command}: {e}");
            false
        }
        Settled::Cancelled => {
            tracing::warn!("[{index}] {command} was cancelled");
            false
        }
    }
}
