//! WebAssembly task driver CLI entry point.
//!
//! Runs the driver in-process: load the plugin configuration, then run a
//! single task, warm the module cache, or print the driver's identity.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasm_driver_common::{PluginConfig, TaskConfig, TaskDescriptor};
use wasm_driver_plugin::WasmDriver;

#[derive(Debug, Parser)]
#[command(name = "wasm-task-driver", version, about)]
struct Cli {
    /// Plugin configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short, global = true, env = "WASM_DRIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one task to completion and print its exit result.
    Run {
        /// Task configuration file (TOML).
        #[arg(long)]
        task: PathBuf,

        /// Task identifier. A random one is generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },

    /// Validate the configuration, pre-cache modules, and print cache stats.
    Warm,

    /// Print plugin info, capabilities, and a fingerprint sample.
    Info,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for results
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,wasm_task_driver=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }

    let config = match &cli.config {
        Some(path) => PluginConfig::from_file(path)
            .with_context(|| format!("Invalid plugin configuration {}", path.display()))?,
        None => PluginConfig::default(),
    };

    info!(
        backend = %config.engine.backend,
        cache_type = %config.cache.kind,
        cache_size = config.cache.size,
        "Configuration loaded"
    );

    // Warm-up compiles modules; keep it off the async workers
    let driver = tokio::task::spawn_blocking(move || WasmDriver::new(config))
        .await
        .context("Driver initialization aborted")?
        .context("Failed to initialize driver")?;

    let code = match cli.command {
        Command::Run { task, id } => run(&driver, task, id).await?,
        Command::Warm => {
            print_json(&driver.cache_stats())?;
            ExitCode::SUCCESS
        }
        Command::Info => {
            let cancel = CancellationToken::new();
            let fingerprint = driver.fingerprint(cancel.clone()).recv().await;
            cancel.cancel();

            print_json(&serde_json::json!({
                "plugin": driver.plugin_info(),
                "capabilities": driver.capabilities(),
                "fingerprint": fingerprint,
                "cache": driver.cache_stats(),
            }))?;
            ExitCode::SUCCESS
        }
    };

    driver.shutdown();

    Ok(code)
}

/// Start a task, wait for it, and report its exit code.
///
/// Ctrl-C stops the task; the stopped result is still printed.
async fn run(driver: &WasmDriver, task: PathBuf, id: Option<String>) -> anyhow::Result<ExitCode> {
    let config = TaskConfig::from_file(&task)
        .with_context(|| format!("Invalid task configuration {}", task.display()))?;
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let handle = driver
        .start_task(TaskDescriptor::new(id.clone(), config))
        .await
        .with_context(|| format!("Failed to start task {id}"))?;
    info!(task_id = %handle.task_id, "Task started");

    let mut exit = driver.wait_task(&id, CancellationToken::new())?;
    let result = loop {
        tokio::select! {
            result = exit.recv() => break result,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                warn!(task_id = %id, "Interrupted, stopping task");
                driver.stop_task(&id, Some("SIGINT"))?;
            }
        }
    };

    let result = result.with_context(|| format!("Task {id} exited without a result"))?;
    print_json(&result)?;
    driver.destroy_task(&id, true)?;

    Ok(ExitCode::from(u8::try_from(result.exit_code).unwrap_or(1)))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{json}");
    Ok(())
}
