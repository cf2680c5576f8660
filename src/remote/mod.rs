//! Remote execution backends.
//!
//! Every target is reached through a [`RemoteExec`] that can either run a
//! command to completion and return its combined output, or start a command
//! whose stdout is consumed as a byte stream while the remote process runs.
//!
//! # Backends
//!
//! - **cluster**: pod exec through the Kubernetes API ([`cluster::PodExec`])
//! - **shell**: one authenticated SSH session per command ([`shell::ShellExec`])
//!
//! The backend is picked once per [`Target`] by [`RemoteContext::connect`];
//! the resolver, the space guard and the transfer code only ever see the trait.
//!
//! # Streams
//!
//! A [`RemoteStream`] is the read half of an in-memory pipe. A pump task owned
//! by the backend copies the remote stdout into the write half, so a slow
//! consumer blocks the pump once the pipe buffer is full.

pub mod cluster;
pub mod command;
pub mod shell;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, DuplexStream};
use tokio::task::JoinHandle;

use crate::config::HostGroups;
use crate::model::{BackendKind, LogSpec, Target};

pub use cluster::{ClusterClient, PodExec};
pub use shell::ShellExec;

/// Buffer size of the pipe between a backend pump and its consumer.
pub const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("`{command}` on {target} failed ({status}): {output}")]
    CommandFailed {
        target: String,
        command: String,
        status: String,
        output: String,
    },

    #[error("stream from {target} failed: {reason}")]
    Stream { target: String, reason: String },

    #[error("cannot enumerate targets: {0}")]
    Enumerate(String),

    #[error("no cluster client configured for {0}")]
    NoCluster(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read side of a running remote command.
pub struct RemoteStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    done: JoinHandle<Result<(), RemoteError>>,
}

impl RemoteStream {
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        done: JoinHandle<Result<(), RemoteError>>,
    ) -> Self {
        Self { reader, done }
    }

    pub fn reader_mut(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        self.reader.as_mut()
    }

    /// Close the read half and wait for the remote side to wind down.
    ///
    /// The reader is dropped first so a pump blocked on a full pipe sees a
    /// broken pipe instead of waiting forever.
    pub async fn finish(self) -> Result<(), RemoteError> {
        let Self { reader, done } = self;
        drop(reader);
        match done.await {
            Ok(result) => result,
            Err(e) => Err(RemoteError::Stream {
                target: "pump".to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// In-memory pipe used between a backend pump and a consumer.
pub fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(PIPE_CAPACITY)
}

/// Command execution against one target.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    fn target(&self) -> &Target;

    /// Run `command` to completion. A non-zero exit is an error carrying the
    /// combined output.
    async fn run_command(&self, command: &str) -> Result<String, RemoteError>;

    /// Start `command` and hand back its stdout as a stream.
    async fn open_stream(&self, command: &str) -> Result<RemoteStream, RemoteError>;
}

/// Enumerates the targets of a [`LogSpec`] and connects to them.
#[async_trait]
pub trait TargetProvider: Send + Sync {
    async fn list_targets(&self, spec: &LogSpec) -> Result<Vec<Target>, RemoteError>;

    async fn connect(&self, target: &Target) -> Result<Box<dyn RemoteExec>, RemoteError>;

    /// Last `lines` lines of a pod's container log.
    async fn tail(&self, target: &Target, lines: u32) -> Result<RemoteStream, RemoteError>;
}

/// Connection state for one invocation, owned by the orchestrator.
pub struct RemoteContext {
    hosts: HostGroups,
    cluster: Option<ClusterClient>,
}

impl RemoteContext {
    pub fn new(hosts: HostGroups) -> Self {
        Self {
            hosts,
            cluster: None,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterClient) -> Self {
        self.cluster = Some(cluster);
        self
    }

    fn cluster(&self, what: &str) -> Result<&ClusterClient, RemoteError> {
        self.cluster
            .as_ref()
            .ok_or_else(|| RemoteError::NoCluster(what.to_string()))
    }
}

#[async_trait]
impl TargetProvider for RemoteContext {
    async fn list_targets(&self, spec: &LogSpec) -> Result<Vec<Target>, RemoteError> {
        match spec.backend {
            BackendKind::Shell => {
                let group = spec.host_group.as_deref().unwrap_or_default();
                let hosts = self.hosts.get(group).ok_or_else(|| {
                    RemoteError::Enumerate(format!("host group `{group}` is not configured"))
                })?;
                Ok(hosts.iter().cloned().map(Target::Host).collect())
            }
            BackendKind::Cluster | BackendKind::LogTail => {
                let namespace = spec.namespace_pattern.as_deref().unwrap_or("default");
                let pattern = spec.target_name_pattern.as_deref().unwrap_or_default();
                let pods = self.cluster(&spec.name)?.list_pods(namespace, pattern).await?;
                Ok(pods
                    .into_iter()
                    .map(|pod| Target::Pod {
                        namespace: namespace.to_string(),
                        pod,
                        container: spec.container.clone(),
                    })
                    .collect())
            }
        }
    }

    async fn connect(&self, target: &Target) -> Result<Box<dyn RemoteExec>, RemoteError> {
        match target {
            Target::Pod { .. } => Ok(Box::new(self.cluster(&target.label())?.exec(target)?)),
            Target::Host(host) => Ok(Box::new(ShellExec::new(host.clone()))),
        }
    }

    async fn tail(&self, target: &Target, lines: u32) -> Result<RemoteStream, RemoteError> {
        self.cluster(&target.label())?.tail(target, lines).await
    }
}
