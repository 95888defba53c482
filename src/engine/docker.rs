use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::StreamReader;

use super::{
    ContainerEngine, ContainerRecord, EngineError, EngineEvent, EventFilter, EventStream,
    LogStream, LogStreamOptions,
};

/// Production engine backed by the local docker daemon. Connection settings
/// come from the environment (`DOCKER_HOST` etc.), like the docker CLI.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(map_error)?;
        Ok(())
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<String>, EngineError> {
        let mut filters = HashMap::new();
        if !labels.is_empty() {
            filters.insert("label".to_string(), labels.to_vec());
        }
        // Stopped containers are listed too: a composed service that was
        // brought down may still hold logs worth printing.
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerRecord, EngineError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;

        let state = response.state.unwrap_or_default();
        let config = response.config.unwrap_or_default();
        Ok(ContainerRecord {
            id: response.id.unwrap_or_else(|| id.to_string()),
            name: response.name.unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            tty: config.tty.unwrap_or(false),
            status: state.status.map(map_status).unwrap_or(super::ContainerStatus::Other),
            started_at: state.started_at.unwrap_or_default(),
            finished_at: state.finished_at.unwrap_or_default(),
        })
    }

    async fn container_logs(
        &self,
        id: &str,
        options: &LogStreamOptions,
    ) -> Result<LogStream, EngineError> {
        let logs_options = LogsOptions::<String> {
            stdout: options.stdout,
            stderr: options.stderr,
            follow: options.follow,
            timestamps: options.timestamps,
            since: options.since.map(|t| t.timestamp()).unwrap_or(0),
            tail: options.tail.clone(),
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(id, Some(logs_options))
            .map_ok(reframe)
            .map_err(|e| io::Error::other(map_error(e)));
        Ok(Box::pin(StreamReader::new(Box::pin(stream))))
    }

    async fn events(&self, filter: &EventFilter) -> Result<EventStream, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "die".to_string(), "destroy".to_string()],
        );
        if !filter.labels.is_empty() {
            filters.insert("label".to_string(), filter.labels.clone());
        }
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self.docker.events(Some(options)).filter_map(|message| async move {
            match message {
                Ok(message) => {
                    let id = message.actor.and_then(|a| a.id).unwrap_or_default();
                    match message.action.as_deref() {
                        Some("start") => Some(Ok(EngineEvent::Start { id })),
                        Some("die") => Some(Ok(EngineEvent::Die { id })),
                        Some("destroy") => Some(Ok(EngineEvent::Destroy { id })),
                        _ => None,
                    }
                }
                Err(e) => Some(Err(map_error(e))),
            }
        });
        Ok(Box::pin(stream))
    }
}

/// bollard demultiplexes the engine's framed stream into typed records. The
/// tail works on the wire format so it can be tested against raw bytes, so
/// the header is restored here: TTY output (`Console`) stays raw, everything
/// else gets its 8-byte header back.
fn reframe(output: LogOutput) -> Bytes {
    match output {
        LogOutput::Console { message } => message,
        LogOutput::StdOut { message } => frame(1, message),
        LogOutput::StdErr { message } => frame(2, message),
        LogOutput::StdIn { message } => frame(0, message),
    }
}

fn frame(stream_type: u8, message: Bytes) -> Bytes {
    let mut framed = BytesMut::with_capacity(8 + message.len());
    framed.put_u8(stream_type);
    framed.put_bytes(0, 3);
    framed.put_u32(message.len() as u32);
    framed.put(message);
    framed.freeze()
}

fn map_status(status: bollard::models::ContainerStateStatusEnum) -> super::ContainerStatus {
    use bollard::models::ContainerStateStatusEnum as Status;
    match status {
        Status::CREATED => super::ContainerStatus::Created,
        Status::RUNNING => super::ContainerStatus::Running,
        Status::EXITED => super::ContainerStatus::Exited,
        _ => super::ContainerStatus::Other,
    }
}

fn map_error(error: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error;
    match error {
        Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        other => EngineError::Transport(other.to_string()),
    }
}
