mod common;

use async_trait::async_trait;
use common::{connect, definition, scripts, test_options};
use localci_engine::build::{Build, TaskDefinition, TaskId, TaskStatus};
use localci_engine::executor::{Executor, ExecutorOptions};
use localci_engine::instance::{Instance, RunConfig};
use localci_proto::agent::{InitialCommandsRequest, ReportSingleCommandRequest, TaskIdentification};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Plays the agent: fetches the commands over RPC and reports each of them,
/// failing the one named in `fail_at`.
struct FakeAgentInstance {
    fail_at: Option<String>,
    journal: Arc<Mutex<Vec<(TaskId, String)>>>,
    environments: Arc<Mutex<HashMap<TaskId, HashMap<String, String>>>>,
}

#[async_trait]
impl Instance for FakeAgentInstance {
    async fn run(&self, config: &RunConfig) -> anyhow::Result<()> {
        let mut client = connect(&config.direct_endpoint).await;
        let identification = TaskIdentification {
            task_id: config.task_id,
            secret: config.client_secret.clone(),
        };

        let response = client
            .initial_commands(InitialCommandsRequest {
                task_identification: Some(identification.clone()),
            })
            .await?
            .into_inner();
        anyhow::ensure!(response.server_secret == config.server_secret);
        self.environments
            .lock()
            .unwrap()
            .insert(config.task_id, response.environment);

        let mut next = response
            .commands
            .first()
            .map(|command| command.name.clone())
            .unwrap_or_default();
        while !next.is_empty() {
            self.journal
                .lock()
                .unwrap()
                .push((config.task_id, next.clone()));
            let succeeded = self.fail_at.as_deref() != Some(next.as_str());
            next = client
                .report_single_command(ReportSingleCommandRequest {
                    task_identification: Some(identification.clone()),
                    command_name: next.clone(),
                    succeeded,
                    duration_seconds: 0,
                })
                .await?
                .into_inner()
                .next_command_name;
        }
        Ok(())
    }

    fn working_directory(&self, project_dir: &Path, _dirty_mode: bool) -> PathBuf {
        project_dir.to_path_buf()
    }

    fn kind(&self) -> &'static str {
        "fake_agent"
    }
}

/// Connects, then never finishes.
struct SleepyInstance;

#[async_trait]
impl Instance for SleepyInstance {
    async fn run(&self, config: &RunConfig) -> anyhow::Result<()> {
        let _client = connect(&config.direct_endpoint).await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    fn working_directory(&self, project_dir: &Path, _dirty_mode: bool) -> PathBuf {
        project_dir.to_path_buf()
    }

    fn kind(&self) -> &'static str {
        "sleepy"
    }
}

struct Fixture {
    _temp_dir: TempDir,
    executor: Executor,
    journal: Arc<Mutex<Vec<(TaskId, String)>>>,
    environments: Arc<Mutex<HashMap<TaskId, HashMap<String, String>>>>,
}

async fn fixture(tasks: Vec<(TaskDefinition, Option<&str>)>) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let project_dir = temp_dir.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let journal = Arc::new(Mutex::new(Vec::new()));
    let environments = Arc::new(Mutex::new(HashMap::new()));
    let tasks = tasks
        .into_iter()
        .map(|(definition, fail_at)| {
            let instance: Arc<dyn Instance> = Arc::new(FakeAgentInstance {
                fail_at: fail_at.map(str::to_string),
                journal: journal.clone(),
                environments: environments.clone(),
            });
            (definition, instance)
        })
        .collect();

    let build = Build::with_instances(&project_dir, tasks, &temp_dir.path().join("cache"))
        .await
        .unwrap();

    let mut options = ExecutorOptions::default();
    options.rpc = test_options(&temp_dir);
    options
        .rpc
        .environment
        .insert("DEPLOY".to_string(), "no".to_string());
    let executor = Executor::new(build, options).await.unwrap();

    Fixture {
        _temp_dir: temp_dir,
        executor,
        journal,
        environments,
    }
}

#[tokio::test]
async fn test_dependent_task_runs_after_dependency() {
    let fixture = fixture(vec![
        (definition(2, scripts(&["package"]), vec![1]), None),
        (definition(1, scripts(&["build", "test"]), vec![]), None),
    ])
    .await;
    let build = fixture.executor.build().clone();

    let report = fixture.executor.run().await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.status_of(1), Some(TaskStatus::Succeeded));
    assert_eq!(report.status_of(2), Some(TaskStatus::Succeeded));
    assert_eq!(
        *fixture.journal.lock().unwrap(),
        vec![
            (1, "build".to_string()),
            (1, "test".to_string()),
            (2, "package".to_string()),
        ]
    );
    assert!(build.get_next_task().is_none());

    let environments = fixture.environments.lock().unwrap();
    assert_eq!(environments[&2]["CIRRUS_TASK_NAME"], "task-2");
    assert_eq!(environments[&2]["DEPLOY"], "no");
}

#[tokio::test]
async fn test_failed_task_halts_build() {
    let fixture = fixture(vec![
        (definition(1, scripts(&["build", "test", "lint"]), vec![]), Some("test")),
        (definition(2, scripts(&["package"]), vec![]), None),
    ])
    .await;

    let report = fixture.executor.run().await.unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.status_of(1), Some(TaskStatus::Failed));
    assert_eq!(report.halted_by, Some(1));
    assert_eq!(report.pending, vec![2]);
    assert_eq!(
        *fixture.journal.lock().unwrap(),
        vec![(1, "build".to_string()), (1, "test".to_string())]
    );
}

#[tokio::test]
async fn test_timed_out_task_does_not_hang() {
    let temp_dir = TempDir::new().unwrap();
    let project_dir = temp_dir.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let mut slow = definition(1, scripts(&["build"]), vec![]);
    slow.metadata
        .insert("timeout_in".to_string(), "1".to_string());
    let follower = definition(2, scripts(&["package"]), vec![1]);

    let sleepy: Arc<dyn Instance> = Arc::new(SleepyInstance);
    let build = Build::with_instances(
        &project_dir,
        vec![(slow, sleepy.clone()), (follower, sleepy)],
        &temp_dir.path().join("cache"),
    )
    .await
    .unwrap();

    let mut options = ExecutorOptions::default();
    options.rpc = test_options(&temp_dir);
    let executor = Executor::new(build, options).await.unwrap();

    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(30), executor.run())
        .await
        .expect("executor did not return")
        .unwrap();

    assert_eq!(report.status_of(1), Some(TaskStatus::TimedOut));
    assert_eq!(report.halted_by, Some(1));
    assert_eq!(report.pending, vec![2]);
    assert!(started.elapsed() < Duration::from_secs(30));
}
