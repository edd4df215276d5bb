use anyhow::{Context, Result};
use localci_engine::{Build, EngineConfig, Executor, InstanceFactory, RunReport, TaskStatus};
use std::path::Path;

use crate::cli::Commands;
use crate::config::{load_task_file, parse_env_pair};

/// Returns whether the command fully succeeded.
pub async fn execute_command(cmd: Commands, mut config: EngineConfig) -> Result<bool> {
    match cmd {
        Commands::Run {
            file,
            project_dir,
            dirty,
            artifacts_dir,
            logs_dir,
            env,
            agent_version,
        } => {
            config.dirty_mode |= dirty;
            if artifacts_dir.is_some() {
                config.artifacts_dir = artifacts_dir;
            }
            if logs_dir.is_some() {
                config.logs_dir = logs_dir;
            }
            if let Some(version) = agent_version {
                config.agent.version = version;
            }
            for pair in &env {
                let (key, value) = parse_env_pair(pair)?;
                config.environment.insert(key, value);
            }

            let definitions = load_task_file(&file)?;
            tracing::info!("Loaded {} tasks from {}", definitions.len(), file.display());

            let executor = Executor::from_definitions(&config, &project_dir, definitions)
                .await
                .context("Failed to prepare the build")?;
            let report = executor.run().await.context("Build aborted")?;

            print_report(&report);
            Ok(report.succeeded())
        }

        Commands::Validate { file, project_dir } => {
            let definitions = load_task_file(&file)?;
            let count = definitions.len();
            validate(&config, &project_dir, definitions).await?;

            println!("{}: {} tasks OK", file.display(), count);
            Ok(true)
        }
    }
}

async fn validate(
    config: &EngineConfig,
    project_dir: &Path,
    definitions: Vec<localci_engine::TaskDefinition>,
) -> Result<Build> {
    let factory = InstanceFactory::new(config);
    Build::new(project_dir, definitions, &factory, &config.cache_dir)
        .await
        .context("Invalid task file")
}

fn print_report(report: &RunReport) {
    println!("\nBuild {}", report.build_id);
    for outcome in &report.outcomes {
        let marker = match outcome.status {
            TaskStatus::Succeeded => "✓",
            TaskStatus::TimedOut => "⏱",
            _ => "✗",
        };
        println!(
            "  {} {} (#{}) {} in {:.1}s",
            marker,
            outcome.name,
            outcome.id,
            outcome.status,
            outcome.duration.as_secs_f64()
        );
    }
    if !report.pending.is_empty() {
        println!("  not run: {:?}", report.pending);
    }
}
