//! Batch resolution of commands listed in a TOML file.
//!
//! Every command goes through the same coordinator and store as the HTTP
//! server, so duplicate `(id, cmd)` pairs in a batch execute once and results
//! already stored by earlier runs are reused.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::{
    coordinator::Coordinator,
    error::ResolveError,
    executor::{Executor, SimulatedExecutor},
    key::CommandKey,
    server::open_store,
    settings::Settings,
};

/// Batch file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,

    #[serde(default)]
    pub settings: BatchSettings,

    pub commands: Vec<BatchCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCommand {
    pub id: i64,
    pub cmd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Maximum commands resolved at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Extra attempts after an execution failure
    #[serde(default)]
    pub retries: u32,

    /// Output file for results
    pub output_file: Option<PathBuf>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retries: 0,
            output_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Executed,
    Cached,
    Failed,
}

/// Result of resolving one batch entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub id: i64,
    pub cmd: String,
    pub status: CommandStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Complete batch execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub status: BatchStatus,
    pub total: usize,
    pub executed: usize,
    pub cached: usize,
    pub failed: usize,
    pub total_duration_ms: u64,
    pub outcomes: Vec<CommandOutcome>,
}

/// Execute a batch file against the configured store
#[instrument(skip(settings))]
pub async fn run(batch_path: PathBuf, settings: Settings) -> Result<()> {
    info!("Starting batch execution from {:?}", batch_path);

    let config = load_batch_config(&batch_path).context("Failed to load batch file")?;
    info!("Loaded batch job '{}' with {} commands", config.job.name, config.commands.len());

    let store = open_store(&settings).await?;
    let coordinator = Arc::new(Coordinator::new(store));
    let executor: Arc<dyn Executor> = Arc::new(SimulatedExecutor::new(settings.executor.clone()));

    let output_file = config.settings.output_file.clone();
    let result = execute_batch(coordinator, executor, config).await?;

    print_batch_summary(&result);

    if let Some(ref path) = output_file {
        save_batch_results(&result, path).context("Failed to save batch results")?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Batch completed with some failures");
            Ok(())
        }
        BatchStatus::Failed => {
            error!("Batch execution failed");
            Err(anyhow!("All {} commands in batch '{}' failed", result.total, result.job_name))
        }
    }
}

/// Load batch configuration from TOML file
pub fn load_batch_config(path: &Path) -> Result<BatchConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file: {:?}", path))?;

    let config: BatchConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse batch file: {:?}", path))?;

    validate_batch_config(&config)?;
    Ok(config)
}

/// Validate batch configuration
pub fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.commands.is_empty() {
        return Err(anyhow!("Batch must contain at least one command"));
    }
    if config.settings.max_concurrent == 0 {
        return Err(anyhow!("max_concurrent must be at least 1"));
    }

    for (index, command) in config.commands.iter().enumerate() {
        if command.cmd.is_empty() || command.id == 0 {
            return Err(anyhow!(
                "Command #{} is invalid: 'cmd' and 'id' are required",
                index + 1
            ));
        }
    }

    Ok(())
}

/// Resolve every command with bounded concurrency
pub async fn execute_batch(
    coordinator: Arc<Coordinator>,
    executor: Arc<dyn Executor>,
    config: BatchConfig,
) -> Result<BatchResult> {
    let start_time = Instant::now();
    let semaphore = Arc::new(Semaphore::new(config.settings.max_concurrent));
    let retries = config.settings.retries;

    let unique: HashSet<(i64, &str)> = config
        .commands
        .iter()
        .map(|c| (c.id, c.cmd.as_str()))
        .collect();
    if unique.len() < config.commands.len() {
        info!(
            "{} duplicate commands will share a single execution",
            config.commands.len() - unique.len()
        );
    }

    let mut handles = Vec::with_capacity(config.commands.len());
    for command in config.commands.iter().cloned() {
        let permit = semaphore.clone().acquire_owned().await?;
        let coordinator = coordinator.clone();
        let executor = executor.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            resolve_command(&coordinator, executor, command, retries).await
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for outcome in futures::future::join_all(handles).await {
        outcomes.push(outcome?);
    }

    let executed = outcomes.iter().filter(|o| o.status == CommandStatus::Executed).count();
    let cached = outcomes.iter().filter(|o| o.status == CommandStatus::Cached).count();
    let failed = outcomes.iter().filter(|o| o.status == CommandStatus::Failed).count();

    let status = if failed == 0 {
        BatchStatus::Success
    } else if failed < outcomes.len() {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    };

    Ok(BatchResult {
        job_name: config.job.name,
        status,
        total: outcomes.len(),
        executed,
        cached,
        failed,
        total_duration_ms: start_time.elapsed().as_millis() as u64,
        outcomes,
    })
}

/// Resolve one command, retrying execution failures only
async fn resolve_command(
    coordinator: &Coordinator,
    executor: Arc<dyn Executor>,
    command: BatchCommand,
    retries: u32,
) -> CommandOutcome {
    let start_time = Instant::now();
    let key = CommandKey::new(command.id, &command.cmd);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let executor = executor.clone();
        let cmd = command.cmd.clone();
        let outcome = coordinator
            .resolve(&key, move || async move { executor.execute(&cmd).await })
            .await;

        let (status, result, error) = match outcome {
            Ok(resolved) if resolved.cached => (CommandStatus::Cached, Some(resolved.result), None),
            Ok(resolved) => (CommandStatus::Executed, Some(resolved.result), None),
            Err(ResolveError::Execution(e)) if attempts <= retries => {
                warn!("Command {} failed, retrying (attempt {}): {:#}", key, attempts + 1, e);
                continue;
            }
            Err(e) => {
                warn!("Command {} failed: {}", key, e);
                (CommandStatus::Failed, None, Some(e.to_string()))
            }
        };

        return CommandOutcome {
            id: command.id,
            cmd: command.cmd,
            status,
            result,
            error,
            duration_ms: start_time.elapsed().as_millis() as u64,
            attempts,
        };
    }
}

/// Print batch execution summary
fn print_batch_summary(result: &BatchResult) {
    println!("\n=== Batch Execution Summary ===");
    println!("Job: {}", result.job_name);
    println!("Status: {:?}", result.status);
    println!("Total: {}", result.total);
    println!("Executed: {}", result.executed);
    println!("Cached: {}", result.cached);
    println!("Failed: {}", result.failed);
    println!("Duration: {}ms", result.total_duration_ms);

    if result.failed > 0 {
        println!("\nFailed Commands:");
        for outcome in result.outcomes.iter().filter(|o| o.status == CommandStatus::Failed) {
            println!(
                "  - {}+{}: {}",
                outcome.id,
                outcome.cmd,
                outcome.error.as_deref().unwrap_or("Unknown error")
            );
        }
    }
    println!("===============================\n");
}

/// Save batch results to JSON file
fn save_batch_results(result: &BatchResult, output_file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize batch results")?;

    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write results to: {:?}", output_file))?;

    info!("Batch results saved to: {:?}", output_file);
    Ok(())
}

fn default_max_concurrent() -> usize {
    4
}
