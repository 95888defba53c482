pub mod docker;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio::io::AsyncRead;

/// Raw log bytes exactly as the engine frames them: for containers without a
/// TTY every record carries the 8-byte multiplexing header, for TTY
/// containers the bytes are unframed.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<EngineEvent, EngineError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Other,
}

/// The subset of a container inspection the core consumes.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    /// Name as reported by the engine, usually with a leading `/`.
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub tty: bool,
    pub status: ContainerStatus,
    /// RFC3339 start timestamp.
    pub started_at: String,
    /// RFC3339 finish timestamp, or the zero value while running.
    pub finished_at: String,
}

#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub follow: bool,
    pub timestamps: bool,
    pub since: Option<DateTime<Utc>>,
    /// Number of trailing lines to request, `"-1"` for all.
    pub tail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Start { id: String },
    Die { id: String },
    Destroy { id: String },
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// `key` or `key=value` label filters applied engine-side.
    pub labels: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("container engine request failed: {0}")]
    Transport(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no such container: {0}")]
    NotFound(String),
}

impl EngineError {
    /// True when the container is gone and a retry can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NotFound(_))
    }
}

/// Seam between the core and the container engine. The watcher, the tails,
/// and the tests all talk to this interface; `docker::DockerEngine` is the
/// production implementation.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    /// Lists ids of all containers, including stopped ones, optionally
    /// narrowed by label filters.
    async fn list_containers(&self, labels: &[String]) -> Result<Vec<String>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerRecord, EngineError>;

    async fn container_logs(
        &self,
        id: &str,
        options: &LogStreamOptions,
    ) -> Result<LogStream, EngineError>;

    /// Subscribes to container lifecycle events, filtered server-side to
    /// start/die/destroy.
    async fn events(&self, filter: &EventFilter) -> Result<EventStream, EngineError>;
}
