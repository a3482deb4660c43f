//! dealbatch CLI
//!
//! Replays edit scripts through the batched mutation queue against an
//! in-memory backend, printing the reconciled aggregate and queue counters.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dealbatch_core::logging::{LogFormat, init_logging};
use dealbatch_core::{DealbatchConfig, FlushReport, MutationQueue, QueueStats, load_config, shared};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

mod backend;
mod script;

use backend::SimulatedBackend;
use script::{Script, Step, descriptor_for};

/// dealbatch: debounced, single-flight mutation batching.
#[derive(Parser)]
#[command(name = "dealbatch", version, about, long_about = None)]
struct Cli {
    /// Path to a dealbatch.toml config file.
    #[arg(long, global = true, env = "DEALBATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON edit script and print the resulting aggregate.
    Replay {
        /// Path to the replay script.
        script: PathBuf,

        /// Make the Nth persist call fail (1-based, repeatable).
        #[arg(long = "fail-batch", value_name = "N")]
        fail_batch: Vec<u64>,

        /// Simulated backend latency in milliseconds.
        #[arg(long, default_value = "0")]
        latency_ms: u64,
    },

    /// Print the effective configuration as TOML.
    Config,
}

/// Outcome of one `flush` step; step 0 is the final drain.
#[derive(Debug, Serialize)]
struct FlushRecord {
    step: usize,
    lock: bool,
    report: Option<FlushReport>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    aggregate: Value,
    stats: QueueStats,
    flushes: Vec<FlushRecord>,
    backend_calls: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<dealbatch_core::Error>()
                .and_then(dealbatch_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref()).map_err(dealbatch_core::Error::from)?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.json_logs {
        config.log.format = LogFormat::Json;
    }

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string().map_err(dealbatch_core::Error::from)?);
            Ok(())
        }
        Commands::Replay {
            script,
            fail_batch,
            latency_ms,
        } => {
            init_logging(&config.log).map_err(dealbatch_core::Error::from)?;
            let text = std::fs::read_to_string(&script)
                .with_context(|| format!("failed to read script {}", script.display()))?;
            let script = Script::parse(&text)?;
            let backend = SimulatedBackend::new(Duration::from_millis(latency_ms), fail_batch);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start tokio runtime")?;
            let output = runtime.block_on(replay(&config, script, backend))?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

async fn replay(
    config: &DealbatchConfig,
    script: Script,
    backend: SimulatedBackend,
) -> anyhow::Result<ReplayOutput> {
    let queue = MutationQueue::builder(shared(script.aggregate), backend.clone())
        .config(config.queue.clone())
        .build()
        .map_err(dealbatch_core::Error::from)?;
    info!(queue = %config.queue.name, steps = script.steps.len(), "Replaying script");

    let mut flushes = Vec::new();
    for (index, step) in script.steps.into_iter().enumerate() {
        let step_no = index + 1;
        match step {
            Step::Add {
                key,
                kind,
                property,
                payload,
                remove,
                match_on,
            } => {
                let (key, descriptor) =
                    descriptor_for(key.as_deref(), kind, &property, payload, remove, match_on.as_ref())
                        .with_context(|| format!("step {step_no}"))?;
                let outcome = queue.add(key.as_str(), descriptor);
                debug!(step = step_no, key = %key, outcome = ?outcome, "Added mutation");
            }
            Step::Flush { lock } => {
                flushes.push(flush_step(&queue, step_no, lock).await);
            }
            Step::Unlock => queue.unlock(),
            Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }

    // Drain whatever the script left behind so the output is settled.
    if queue.is_queued() || queue.is_saving() {
        flushes.push(flush_step(&queue, 0, false).await);
    }

    Ok(ReplayOutput {
        aggregate: queue.snapshot(),
        stats: queue.stats(),
        flushes,
        backend_calls: backend.calls(),
    })
}

async fn flush_step(queue: &MutationQueue, step: usize, lock: bool) -> FlushRecord {
    match queue.flush(lock).await {
        Ok(report) => FlushRecord {
            step,
            lock,
            report: Some(report),
            error: None,
        },
        Err(err) => {
            warn!(step, error = %err, "Flush reported a failed batch");
            FlushRecord {
                step,
                lock,
                report: None,
                error: Some(err.to_string()),
            }
        }
    }
}
