mod common;

use common::{definition, scripts, RpcHarness};
use localci_engine::build::{CommandStatus, TaskStatus};
use localci_engine::rpc::{CLIENT_SECRET_METADATA, TASK_ID_METADATA};
use localci_proto::agent::{
    artifact_entry, cache_entry, command::Instruction, log_entry, ArtifactChunk, ArtifactEntry,
    ArtifactsUpload, CacheEntry, CacheInfoRequest, CacheKey, DataChunk, DownloadCacheRequest,
    HeartbeatRequest, InitialCommandsRequest, LogEntry, LogKey, ReportAgentProblemRequest,
    ReportAgentSignalRequest, ReportSingleCommandRequest, TaskIdentification,
};
use tonic::{Code, Request};

fn report(
    harness: &RpcHarness,
    task_id: i64,
    command_name: &str,
    succeeded: bool,
) -> ReportSingleCommandRequest {
    ReportSingleCommandRequest {
        task_identification: harness.identification(task_id),
        command_name: command_name.to_string(),
        succeeded,
        duration_seconds: 1,
    }
}

#[tokio::test]
async fn test_initial_commands() {
    let mut task = definition(1, scripts(&["build", "test"]), vec![]);
    task.environment
        .insert("RUST_LOG".to_string(), "debug".to_string());
    let harness = RpcHarness::start(vec![task]).await;
    let mut client = harness.client().await;

    let response = client
        .initial_commands(InitialCommandsRequest {
            task_identification: harness.identification(1),
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(
        response.commands.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["build", "test"]
    );
    assert!(matches!(
        response.commands[0].instruction,
        Some(Instruction::ScriptInstruction(_))
    ));
    assert_eq!(response.server_secret, harness.server.server_secret());
    assert!(response.timeout_seconds > 0 && response.timeout_seconds <= 3600);
    assert_eq!(response.environment["CI"], "true");
    assert_eq!(response.environment["CIRRUS_TASK_ID"], "1");
    assert_eq!(response.environment["CIRRUS_BUILD_ID"], harness.build.id());
    assert_eq!(response.environment["RUST_LOG"], "debug");
}

#[tokio::test]
async fn test_authentication() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["main"]), vec![])]).await;
    let mut client = harness.client().await;

    let status = client
        .initial_commands(InitialCommandsRequest {
            task_identification: Some(TaskIdentification {
                task_id: 1,
                secret: "guessed".to_string(),
            }),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    let status = client
        .initial_commands(InitialCommandsRequest {
            task_identification: None,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    let status = client
        .initial_commands(InitialCommandsRequest {
            task_identification: harness.identification(99),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // A rejected report leaves the task untouched.
    let mut forged = report(&harness, 1, "main", false);
    forged.task_identification = Some(TaskIdentification {
        task_id: 1,
        secret: harness.server.server_secret().to_string(),
    });
    let status = client.report_single_command(forged).await.unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
    assert_eq!(harness.build.get_task(1).unwrap().status(), TaskStatus::New);
}

#[tokio::test]
async fn test_command_sequencing_to_success() {
    let harness =
        RpcHarness::start(vec![definition(1, scripts(&["clone", "build", "test"]), vec![])]).await;
    let mut client = harness.client().await;
    let task = harness.build.get_task(1).unwrap();

    let next = client
        .report_single_command(report(&harness, 1, "clone", true))
        .await
        .unwrap()
        .into_inner()
        .next_command_name;
    assert_eq!(next, "build");
    assert_eq!(task.status(), TaskStatus::New);

    let next = client
        .report_single_command(report(&harness, 1, "build", true))
        .await
        .unwrap()
        .into_inner()
        .next_command_name;
    assert_eq!(next, "test");

    let next = client
        .report_single_command(report(&harness, 1, "test", true))
        .await
        .unwrap()
        .into_inner()
        .next_command_name;
    assert_eq!(next, "");
    assert_eq!(task.status(), TaskStatus::Succeeded);
    assert_eq!(task.command_status("test"), Some(CommandStatus::Success));
}

#[tokio::test]
async fn test_command_failure_fails_task() {
    let harness =
        RpcHarness::start(vec![definition(1, scripts(&["clone", "build", "test"]), vec![])]).await;
    let mut client = harness.client().await;

    let next = client
        .report_single_command(report(&harness, 1, "build", false))
        .await
        .unwrap()
        .into_inner()
        .next_command_name;

    assert_eq!(next, "");
    let task = harness.build.get_task(1).unwrap();
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.command_status("build"), Some(CommandStatus::Failure));

    // Terminal states are final.
    client
        .report_single_command(report(&harness, 1, "test", true))
        .await
        .unwrap();
    assert_eq!(task.status(), TaskStatus::Failed);
}

#[tokio::test]
async fn test_unknown_command_is_rejected() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["main"]), vec![])]).await;
    let mut client = harness.client().await;

    let status = client
        .report_single_command(report(&harness, 1, "deploy", true))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(harness.build.get_task(1).unwrap().status(), TaskStatus::New);
}

#[tokio::test]
async fn test_stream_logs() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let entries = vec![
        LogEntry {
            value: Some(log_entry::Value::Key(LogKey {
                task_identification: harness.identification(1),
                command_name: "build".to_string(),
            })),
        },
        LogEntry {
            value: Some(log_entry::Value::Chunk(DataChunk {
                data: b"Compiling localci\n".to_vec(),
            })),
        },
        LogEntry {
            value: Some(log_entry::Value::Chunk(DataChunk {
                data: b"Finished\n".to_vec(),
            })),
        },
    ];

    let response = client
        .stream_logs(tokio_stream::iter(entries))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.bytes_received, 27);

    let log = std::fs::read_to_string(harness.logs_dir().join("1-build.log")).unwrap();
    assert_eq!(log, "Compiling localci\nFinished\n");
}

#[tokio::test]
async fn test_log_chunk_before_key_is_rejected() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let entries = vec![LogEntry {
        value: Some(log_entry::Value::Chunk(DataChunk {
            data: b"sneaky".to_vec(),
        })),
    }];

    let status = client
        .stream_logs(tokio_stream::iter(entries))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn test_log_key_with_wrong_secret_is_rejected() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let entries = vec![LogEntry {
        value: Some(log_entry::Value::Key(LogKey {
            task_identification: Some(TaskIdentification {
                task_id: 1,
                secret: "wrong".to_string(),
            }),
            command_name: "build".to_string(),
        })),
    }];

    let status = client
        .stream_logs(tokio_stream::iter(entries))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn test_save_logs_is_acknowledged() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let entries = vec![LogEntry {
        value: Some(log_entry::Value::Chunk(DataChunk {
            data: b"legacy".to_vec(),
        })),
    }];

    let response = client
        .save_logs(tokio_stream::iter(entries))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.bytes_received, 6);
}

fn artifact_chunk(path: &str, data: &[u8]) -> ArtifactEntry {
    ArtifactEntry {
        value: Some(artifact_entry::Value::Chunk(ArtifactChunk {
            artifact_path: path.to_string(),
            data: data.to_vec(),
        })),
    }
}

#[tokio::test]
async fn test_upload_artifacts() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let entries = vec![
        ArtifactEntry {
            value: Some(artifact_entry::Value::ArtifactsUpload(ArtifactsUpload {
                name: "binaries".to_string(),
            })),
        },
        artifact_chunk("target/release/app", b"\x7fELF"),
        artifact_chunk("target/release/app", b"rest"),
        artifact_chunk("../../escape", b"nope"),
        artifact_chunk("notes.txt", b"hello"),
    ];

    let mut request = Request::new(tokio_stream::iter(entries));
    request
        .metadata_mut()
        .insert(TASK_ID_METADATA, "1".parse().unwrap());
    request.metadata_mut().insert(
        CLIENT_SECRET_METADATA,
        harness.server.client_secret().parse().unwrap(),
    );
    client.upload_artifacts(request).await.unwrap();

    let root = harness.artifacts_dir().join("binaries");
    assert_eq!(std::fs::read(root.join("target/release/app")).unwrap(), b"\x7fELFrest");
    assert_eq!(std::fs::read_to_string(root.join("notes.txt")).unwrap(), "hello");
    assert!(!harness.temp_dir.path().join("escape").exists());
}

#[tokio::test]
async fn test_upload_artifacts_requires_metadata() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let entries = vec![artifact_chunk("notes.txt", b"hello")];
    let status = client
        .upload_artifacts(tokio_stream::iter(entries))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    let mut request = Request::new(tokio_stream::iter(vec![artifact_chunk("notes.txt", b"x")]));
    request
        .metadata_mut()
        .insert(TASK_ID_METADATA, "1".parse().unwrap());
    request
        .metadata_mut()
        .insert(CLIENT_SECRET_METADATA, "wrong".parse().unwrap());
    let status = client.upload_artifacts(request).await.unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
}

async fn upload_cache(harness: &RpcHarness, key: &str, data: &[u8]) -> i64 {
    let mut client = harness.client().await;
    let mut entries = vec![CacheEntry {
        value: Some(cache_entry::Value::Key(CacheKey {
            task_identification: harness.identification(1),
            cache_key: key.to_string(),
        })),
    }];
    for chunk in data.chunks(64 * 1024) {
        entries.push(CacheEntry {
            value: Some(cache_entry::Value::Chunk(DataChunk {
                data: chunk.to_vec(),
            })),
        });
    }

    client
        .upload_cache(tokio_stream::iter(entries))
        .await
        .unwrap()
        .into_inner()
        .bytes_received
}

#[tokio::test]
async fn test_cache_round_trip() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let status = client
        .cache_info(CacheInfoRequest {
            task_identification: harness.identification(1),
            cache_key: "cargo-abc".to_string(),
            cache_key_prefixes: vec!["cargo-".to_string()],
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let data: Vec<u8> = (0..(3 * 1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
    assert_eq!(upload_cache(&harness, "cargo-abc", &data).await, data.len() as i64);

    let info = client
        .cache_info(CacheInfoRequest {
            task_identification: harness.identification(1),
            cache_key: "cargo-abc".to_string(),
            cache_key_prefixes: vec![],
        })
        .await
        .unwrap()
        .into_inner()
        .info
        .unwrap();
    assert_eq!(info.key, "cargo-abc");
    assert_eq!(info.size_bytes, data.len() as i64);
    assert!(info.creation_time > 0);

    let mut stream = client
        .download_cache(DownloadCacheRequest {
            task_identification: harness.identification(1),
            cache_key: "cargo-abc".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let mut downloaded = Vec::new();
    let mut chunks = 0;
    while let Some(chunk) = stream.message().await.unwrap() {
        assert!(chunk.data.len() <= 1024 * 1024);
        downloaded.extend_from_slice(&chunk.data);
        chunks += 1;
    }
    assert_eq!(downloaded, data);
    assert!(chunks >= 4);
}

#[tokio::test]
async fn test_cache_info_falls_back_to_prefix() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    upload_cache(&harness, "cargo-old", b"old").await;

    let info = client
        .cache_info(CacheInfoRequest {
            task_identification: harness.identification(1),
            cache_key: "cargo-new".to_string(),
            cache_key_prefixes: vec!["npm-".to_string(), "cargo-".to_string()],
        })
        .await
        .unwrap()
        .into_inner()
        .info
        .unwrap();
    assert_eq!(info.key, "cargo-old");
    assert_eq!(info.size_bytes, 3);
}

#[tokio::test]
async fn test_download_missing_cache() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let status = client
        .download_cache(DownloadCacheRequest {
            task_identification: harness.identification(1),
            cache_key: "missing".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn test_cache_chunk_before_key_is_rejected() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    let entries = vec![CacheEntry {
        value: Some(cache_entry::Value::Chunk(DataChunk {
            data: b"data".to_vec(),
        })),
    }];
    let status = client
        .upload_cache(tokio_stream::iter(entries))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn test_diagnostic_reports_do_not_change_status() {
    let harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let mut client = harness.client().await;

    client
        .heartbeat(HeartbeatRequest {
            task_identification: harness.identification(1),
        })
        .await
        .unwrap();
    client
        .report_agent_error(ReportAgentProblemRequest {
            task_identification: harness.identification(1),
            message: "disk is full".to_string(),
            stack: "main.go:42".to_string(),
        })
        .await
        .unwrap();
    client
        .report_agent_warning(ReportAgentProblemRequest {
            task_identification: harness.identification(1),
            message: "slow clone".to_string(),
            stack: String::new(),
        })
        .await
        .unwrap();
    client
        .report_agent_signal(ReportAgentSignalRequest {
            task_identification: harness.identification(1),
            signal: "SIGTERM".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(harness.build.get_task(1).unwrap().status(), TaskStatus::New);
}

#[tokio::test]
async fn test_secrets_differ_between_servers() {
    let first = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let second = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;

    assert_ne!(first.server.client_secret(), second.server.client_secret());
    assert_ne!(first.server.client_secret(), first.server.server_secret());

    // A secret from one build is worthless against another.
    let mut client = second.client().await;
    let status = client
        .initial_commands(InitialCommandsRequest {
            task_identification: first.identification(1),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn test_stop_refuses_new_calls() {
    let mut harness = RpcHarness::start(vec![definition(1, scripts(&["build"]), vec![])]).await;
    let endpoint = harness.server.direct_endpoint();

    harness.server.stop().await.unwrap();
    harness.server.stop().await.unwrap();

    let connected = localci_proto::agent::agent_service_client::AgentServiceClient::connect(
        format!("http://{}", endpoint),
    )
    .await;
    assert!(connected.is_err());
}
