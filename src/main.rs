use anyhow::{Context, Result};
use pipewright::cli::commands::{RunCommand, ValidateCommand};
use pipewright::cli::output::*;
use pipewright::cli::{Cli, Command};
use pipewright::core::{EngineConfig, PipelineConfig, PipelineDefinition};
use pipewright::execution::{ExecutionEngine, ExecutionEvent, RunOptions};
use pipewright::persistence::{CheckpointStore, InMemoryCheckpointStore};
use pipewright::provider::{CommandProvider, ProviderClientConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins when set
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
    }

    Ok(())
}

async fn open_store(cmd: &RunCommand) -> Result<Arc<dyn CheckpointStore>> {
    if cmd.no_checkpoints {
        return Ok(Arc::new(InMemoryCheckpointStore::new()));
    }
    sqlite_store(cmd.db.as_deref()).await
}

#[cfg(feature = "sqlite")]
async fn sqlite_store(db: Option<&str>) -> Result<Arc<dyn CheckpointStore>> {
    use pipewright::persistence::SqliteCheckpointStore;

    let store = match db {
        Some(path) => SqliteCheckpointStore::new(path).await?,
        None => SqliteCheckpointStore::with_default_path().await?,
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn sqlite_store(_db: Option<&str>) -> Result<Arc<dyn CheckpointStore>> {
    tracing::warn!("Built without sqlite support; checkpoints are kept in memory");
    Ok(Arc::new(InMemoryCheckpointStore::new()))
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;

    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let pipeline = PipelineDefinition::from_config(&config, Path::new(&cmd.file).parent());
    let engine_config = cmd.apply_overrides(EngineConfig::from_defaults(&config.defaults));

    let provider_config = match &cmd.provider_cmd {
        Some(line) => ProviderClientConfig::from_command_line(line)
            .context("Provider command is empty")?,
        None => ProviderClientConfig::default(),
    }
    .with_timeout(engine_config.default_timeout_secs);
    let provider = CommandProvider::new(provider_config);

    let store = open_store(cmd).await?;
    let engine = ExecutionEngine::with_config(provider, engine_config).with_store(store);

    let mut options = RunOptions::new();
    for (key, value) in cmd.variables() {
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(&key).cyan(),
            style(&value).dim()
        );
        options = options.with_variable(key, value);
    }

    // Progress over root-level steps; nested events are printed indented
    let progress = create_progress_bar(pipeline.steps.len());
    let bar = progress.clone();
    engine.add_event_handler(move |event| {
        bar.println(format_execution_event(&event));
        match &event {
            ExecutionEvent::StepCompleted { depth: 0, .. }
            | ExecutionEvent::StepFailed { depth: 0, .. }
            | ExecutionEvent::StepSkipped { depth: 0, .. } => bar.inc(1),
            ExecutionEvent::StepStarted {
                depth: 0, step_name, ..
            } => bar.set_message(step_name.clone()),
            _ => {}
        }
    });

    println!();
    let report = engine.run(&pipeline, options).await;
    progress.finish_and_clear();

    println!("\n{} Steps:", INFO);
    for result in &report.results {
        println!("{}", format_step_result(result));
    }
    for skipped in &report.skipped {
        println!("  {} {}", SKIP, style(skipped).dim());
    }

    if report.is_success() {
        if let Some(last) = report.results.last() {
            let text = match &last.output {
                serde_json::Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other)?,
            };
            println!("\n{}", format_output(&text, 20));
        }
        println!(
            "\n{} {} completed {} ({} steps, {}ms)",
            CHECK,
            style(&report.pipeline_id).bold(),
            style("successfully").green(),
            report.steps_executed,
            report.duration_ms
        );
        return Ok(());
    }

    println!(
        "\n{} {} {}",
        CROSS,
        style(&report.pipeline_id).bold(),
        format_status(report.status)
    );
    if let Some(failure) = &report.failure {
        println!("{}", format_failure(failure));
        error!("{}", failure);
    }
    std::process::exit(1);
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Steps: {}", style(config.steps.len()).cyan());
            println!("  Variables: {}", style(config.variables.len()).cyan());
            for step in &config.steps {
                println!("    {} {}", style(&step.name).cyan(), style(step.kind.label()).dim());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}
