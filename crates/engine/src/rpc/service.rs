use localci_proto::agent::{
    agent_service_server::AgentService, artifact_entry, cache_entry, log_entry, Acknowledgement,
    ArtifactEntry, CacheEntry, CacheInfo, CacheInfoRequest, CacheInfoResponse, CommandsResponse,
    DataChunk, DownloadCacheRequest, HeartbeatRequest, HeartbeatResponse, InitialCommandsRequest,
    LogEntry, ReportAgentProblemRequest, ReportAgentSignalRequest, ReportSingleCommandRequest,
    ReportSingleCommandResponse, TaskIdentification, UploadArtifactsResponse, UploadCacheResponse,
    UploadLogsResponse,
};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tonic::{Request, Response, Status, Streaming};

use super::artifacts::ArtifactWriter;
use super::convert::to_proto_command;
use super::logs::LogSink;
use super::RpcOptions;
use crate::build::{Build, CommandStatus, Task, TaskId, TaskStatus};
use crate::environment::task_environment;
use crate::error::EngineError;
use crate::storage::CacheBlob;

const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Metadata carrying the task id on streaming calls.
pub const TASK_ID_METADATA: &str = "org.cirruslabs.task-id";
/// Metadata carrying the client secret on streaming calls.
pub const CLIENT_SECRET_METADATA: &str = "org.cirruslabs.client-secret";

pub struct AgentRpcService {
    build: Arc<Build>,
    server_secret: String,
    client_secret: String,
    options: Arc<RpcOptions>,
}

enum LogStreamState {
    AwaitingKey,
    Streaming(LogSink),
}

impl AgentRpcService {
    pub fn new(
        build: Arc<Build>,
        server_secret: String,
        client_secret: String,
        options: Arc<RpcOptions>,
    ) -> Self {
        Self {
            build,
            server_secret,
            client_secret,
            options,
        }
    }

    fn identify(&self, identification: Option<TaskIdentification>) -> Result<Arc<Task>, Status> {
        let identification = identification
            .ok_or_else(|| Status::unauthenticated("Missing task identification"))?;
        Ok(self.build.get_task_from_identification(
            identification.task_id,
            &identification.secret,
            &self.client_secret,
        )?)
    }

    fn identify_from_metadata<T>(&self, request: &Request<T>) -> Result<Arc<Task>, Status> {
        let metadata = request.metadata();
        let task_id = metadata
            .get(TASK_ID_METADATA)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<TaskId>().ok())
            .ok_or_else(|| Status::unauthenticated("Missing or malformed task id metadata"))?;
        let secret = metadata
            .get(CLIENT_SECRET_METADATA)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        Ok(self
            .build
            .get_task_from_identification(task_id, secret, &self.client_secret)?)
    }

    fn report_command(
        &self,
        request: ReportSingleCommandRequest,
    ) -> Result<ReportSingleCommandResponse, Status> {
        let _guard = self.build.lock();
        let task = self.identify(request.task_identification)?;
        let name = request.command_name;

        if !request.succeeded {
            task.set_command_status(&name, CommandStatus::Failure);
            task.set_status(TaskStatus::Failed);
            tracing::info!(
                "Task {} command {:?} failed after {}s",
                task.id,
                name,
                request.duration_seconds
            );
            return Ok(ReportSingleCommandResponse {
                next_command_name: String::new(),
            });
        }

        if task.command_index(&name).is_none() {
            return Err(EngineError::Protocol(format!(
                "task {} has no command named {:?}",
                task.id, name
            ))
            .into());
        }
        task.set_command_status(&name, CommandStatus::Success);

        let next_command_name = match task.next_command_after(&name) {
            Some(next) => next.name.clone(),
            None => {
                task.set_status(TaskStatus::Succeeded);
                String::new()
            }
        };

        tracing::info!(
            "Task {} command {:?} succeeded after {}s",
            task.id,
            name,
            request.duration_seconds
        );
        Ok(ReportSingleCommandResponse { next_command_name })
    }

    async fn lookup_cache(
        &self,
        key: &str,
        prefixes: &[String],
    ) -> Result<Option<CacheBlob>, EngineError> {
        let cache = self.build.cache();
        if !key.is_empty() {
            if let Some(blob) = cache.get(key).await? {
                return Ok(Some(blob));
            }
        }
        for prefix in prefixes {
            if let Some(blob) = cache.find_by_prefix(prefix).await? {
                return Ok(Some(blob));
            }
        }
        Ok(None)
    }
}

#[tonic::async_trait]
impl AgentService for AgentRpcService {
    async fn initial_commands(
        &self,
        request: Request<InitialCommandsRequest>,
    ) -> Result<Response<CommandsResponse>, Status> {
        let req = request.into_inner();
        let task = self.identify(req.task_identification)?;

        let environment = task_environment(
            self.build.id(),
            &task,
            self.build.project_dir(),
            self.options.dirty_mode,
            &self.options.environment,
        );
        let commands = task.commands().iter().map(to_proto_command).collect();

        tracing::info!("Task {} ({}) requested its commands", task.id, task.name);

        Ok(Response::new(CommandsResponse {
            environment,
            commands,
            server_secret: self.server_secret.clone(),
            timeout_seconds: task.remaining_timeout().as_secs() as i64,
        }))
    }

    async fn report_single_command(
        &self,
        request: Request<ReportSingleCommandRequest>,
    ) -> Result<Response<ReportSingleCommandResponse>, Status> {
        let response = self.report_command(request.into_inner())?;
        Ok(Response::new(response))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let task = self.identify(request.into_inner().task_identification)?;
        tracing::debug!("Heartbeat from task {}", task.id);
        Ok(Response::new(HeartbeatResponse {}))
    }

    async fn stream_logs(
        &self,
        request: Request<Streaming<LogEntry>>,
    ) -> Result<Response<UploadLogsResponse>, Status> {
        let mut stream = request.into_inner();
        let mut state = LogStreamState::AwaitingKey;
        let mut bytes_received = 0i64;

        while let Some(entry) = stream.message().await? {
            match entry.value {
                Some(log_entry::Value::Key(key)) => {
                    let task = self.identify(key.task_identification)?;
                    if let LogStreamState::Streaming(previous) =
                        std::mem::replace(&mut state, LogStreamState::AwaitingKey)
                    {
                        previous.finish().await?;
                    }
                    let sink =
                        LogSink::open(self.options.logs_dir.as_deref(), task.id, &key.command_name)
                            .await?;
                    state = LogStreamState::Streaming(sink);
                }
                Some(log_entry::Value::Chunk(chunk)) => match &mut state {
                    LogStreamState::AwaitingKey => {
                        return Err(Status::unauthenticated(
                            "Log chunk received before a log key",
                        ));
                    }
                    LogStreamState::Streaming(sink) => {
                        sink.write(&chunk.data).await?;
                        bytes_received += chunk.data.len() as i64;
                    }
                },
                None => {}
            }
        }

        if let LogStreamState::Streaming(sink) = state {
            sink.finish().await?;
        }

        Ok(Response::new(UploadLogsResponse { bytes_received }))
    }

    async fn save_logs(
        &self,
        request: Request<Streaming<LogEntry>>,
    ) -> Result<Response<UploadLogsResponse>, Status> {
        let mut stream = request.into_inner();
        let mut bytes_received = 0i64;

        while let Some(entry) = stream.message().await? {
            if let Some(log_entry::Value::Chunk(chunk)) = entry.value {
                bytes_received += chunk.data.len() as i64;
            }
        }

        tracing::debug!("Discarded {} bytes of legacy logs", bytes_received);
        Ok(Response::new(UploadLogsResponse { bytes_received }))
    }

    async fn upload_artifacts(
        &self,
        request: Request<Streaming<ArtifactEntry>>,
    ) -> Result<Response<UploadArtifactsResponse>, Status> {
        let task = self.identify_from_metadata(&request)?;
        let mut stream = request.into_inner();
        let mut writer = ArtifactWriter::new(self.options.artifacts_dir.clone());
        let mut artifact_name: Option<String> = None;

        while let Some(entry) = stream.message().await? {
            match entry.value {
                Some(artifact_entry::Value::ArtifactsUpload(upload)) => {
                    artifact_name = Some(upload.name);
                }
                Some(artifact_entry::Value::Chunk(chunk)) => {
                    let name = artifact_name.as_deref().ok_or_else(|| {
                        Status::from(EngineError::Protocol(
                            "artifact chunk received before the artifact name".to_string(),
                        ))
                    })?;
                    writer
                        .write(name, &chunk.artifact_path, &chunk.data)
                        .await?;
                }
                None => {}
            }
        }

        tracing::info!(
            "Task {} uploaded {} bytes of artifacts",
            task.id,
            writer.bytes_written()
        );
        Ok(Response::new(UploadArtifactsResponse {}))
    }

    async fn cache_info(
        &self,
        request: Request<CacheInfoRequest>,
    ) -> Result<Response<CacheInfoResponse>, Status> {
        let req = request.into_inner();
        let task = self.identify(req.task_identification)?;

        let blob = self
            .lookup_cache(&req.cache_key, &req.cache_key_prefixes)
            .await?
            .ok_or_else(|| EngineError::CacheEntryNotFound(req.cache_key.clone()))?;

        tracing::debug!("Task {} cache hit {:?} for {:?}", task.id, blob.key, req.cache_key);

        Ok(Response::new(CacheInfoResponse {
            info: Some(CacheInfo {
                key: blob.key.clone(),
                size_bytes: blob.size_bytes as i64,
                creation_time: blob.creation_time(),
            }),
        }))
    }

    async fn upload_cache(
        &self,
        request: Request<Streaming<CacheEntry>>,
    ) -> Result<Response<UploadCacheResponse>, Status> {
        let mut stream = request.into_inner();
        let mut writer = None;

        while let Some(entry) = stream.message().await? {
            match entry.value {
                Some(cache_entry::Value::Key(key)) => {
                    if writer.is_some() {
                        return Err(EngineError::Protocol(
                            "cache key sent twice on one upload".to_string(),
                        )
                        .into());
                    }
                    let task = self.identify(key.task_identification)?;
                    tracing::debug!("Task {} uploading cache {:?}", task.id, key.cache_key);
                    writer = Some(self.build.cache().put(&key.cache_key).await?);
                }
                Some(cache_entry::Value::Chunk(chunk)) => match writer.as_mut() {
                    Some(writer) => writer.write(&chunk.data).await?,
                    None => {
                        return Err(Status::unauthenticated(
                            "Cache chunk received before a cache key",
                        ));
                    }
                },
                None => {}
            }
        }

        let writer = writer.ok_or_else(|| {
            Status::from(EngineError::Protocol("cache upload without a key".to_string()))
        })?;
        let blob = writer.finalize().await?;

        Ok(Response::new(UploadCacheResponse {
            bytes_received: blob.size_bytes as i64,
        }))
    }

    type DownloadCacheStream = tokio_stream::wrappers::ReceiverStream<Result<DataChunk, Status>>;

    async fn download_cache(
        &self,
        request: Request<DownloadCacheRequest>,
    ) -> Result<Response<Self::DownloadCacheStream>, Status> {
        let req = request.into_inner();
        let task = self.identify(req.task_identification)?;

        let blob = self
            .build
            .cache()
            .get(&req.cache_key)
            .await?
            .ok_or_else(|| EngineError::CacheEntryNotFound(req.cache_key.clone()))?;
        let mut file = blob.open().await?;

        tracing::debug!("Task {} downloading cache {:?}", task.id, req.cache_key);

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_CHUNK_SIZE];
            loop {
                match file.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = DataChunk {
                            data: buffer[..n].to_vec(),
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Status::internal(format!("Read error: {}", e))))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn report_agent_error(
        &self,
        request: Request<ReportAgentProblemRequest>,
    ) -> Result<Response<Acknowledgement>, Status> {
        let req = request.into_inner();
        let task = self.identify(req.task_identification)?;
        tracing::error!("Agent error in task {}: {}", task.id, req.message);
        if !req.stack.is_empty() {
            tracing::debug!("Agent stack for task {}:\n{}", task.id, req.stack);
        }
        Ok(Response::new(Acknowledgement {}))
    }

    async fn report_agent_warning(
        &self,
        request: Request<ReportAgentProblemRequest>,
    ) -> Result<Response<Acknowledgement>, Status> {
        let req = request.into_inner();
        let task = self.identify(req.task_identification)?;
        tracing::warn!("Agent warning in task {}: {}", task.id, req.message);
        Ok(Response::new(Acknowledgement {}))
    }

    async fn report_agent_signal(
        &self,
        request: Request<ReportAgentSignalRequest>,
    ) -> Result<Response<Acknowledgement>, Status> {
        let req = request.into_inner();
        let task = self.identify(req.task_identification)?;
        tracing::info!("Agent in task {} received signal {}", task.id, req.signal);
        Ok(Response::new(Acknowledgement {}))
    }
}
