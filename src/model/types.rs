//! Normalized entity structs.

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

/// How the targets of a [`LogSpec`] are reached.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum BackendKind {
    /// Containers reached through the cluster control plane exec API.
    #[serde(rename = "k8s", alias = "cluster")]
    Cluster,
    /// Bare hosts reached through an authenticated remote shell.
    #[serde(rename = "ssh", alias = "shell")]
    Shell,
    /// Container stdout/stderr fetched through the control plane log API.
    #[serde(rename = "k8s-tail", alias = "log-tail")]
    LogTail,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => write!(f, "k8s"),
            Self::Shell => write!(f, "ssh"),
            Self::LogTail => write!(f, "k8s-tail"),
        }
    }
}

impl BackendKind {
    /// Whether targets of this kind are pods and need a cluster client.
    pub fn needs_cluster(self) -> bool {
        matches!(self, Self::Cluster | Self::LogTail)
    }
}

/// One logical log to collect, as declared in the log-spec document.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub backend: BackendKind,
    /// Namespace of the pods (cluster and tail specs).
    #[serde(default, rename = "namespace")]
    pub namespace_pattern: Option<String>,
    /// Pod name prefix regex (cluster and tail specs).
    #[serde(default, rename = "pod")]
    pub target_name_pattern: Option<String>,
    #[serde(default, rename = "dir")]
    pub dir_pattern: String,
    #[serde(default, rename = "file")]
    pub file_pattern: String,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default, rename = "hostgroup")]
    pub host_group: Option<String>,
    #[serde(default, rename = "tail")]
    pub tail_count: Option<u32>,
}

/// Credential material for a remote shell session.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Password(***)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

/// A fully populated host entry. Group defaults are already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCredential {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub secret: Secret,
}

/// One concrete remote endpoint a [`LogSpec`] resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Pod {
        namespace: String,
        pod: String,
        container: Option<String>,
    },
    Host(HostCredential),
}

impl Target {
    /// Collision-free name used for this target's directory in the staging area.
    ///
    /// Hosts are `[user@]address[_port]`; the user is left out for `root` and
    /// the port for 22.
    pub fn label(&self) -> String {
        match self {
            Self::Pod { pod, .. } => pod.clone(),
            Self::Host(host) => {
                let mut label = match host.username.as_str() {
                    "root" => host.address.clone(),
                    user => format!("{}@{}", user.replace('/', "_"), host.address),
                };
                if host.port != 22 {
                    label.push_str(&format!("_{}", host.port));
                }
                label
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod {
                namespace,
                pod,
                container: Some(container),
            } => write!(f, "{namespace}/{pod}[{container}]"),
            Self::Pod { namespace, pod, .. } => write!(f, "{namespace}/{pod}"),
            Self::Host(host) => write!(f, "{}@{}:{}", host.username, host.address, host.port),
        }
    }
}

/// Absolute path of one file on one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: String,
    /// The pattern-resolved path when `path` was reached through a symlink.
    pub followed_from: Option<String>,
}

impl ResolvedPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            followed_from: None,
        }
    }

    /// Containing directory, without a trailing slash (except for `/`).
    pub fn parent(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) => "/",
            Some(idx) => &trimmed[..idx],
            None => ".",
        }
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.followed_from {
            Some(from) => write!(f, "{} (via {from})", self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// How one attempted transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Ok,
    SkippedSpace(String),
    Failed(String),
}

impl TransferOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::SkippedSpace(_) => write!(f, "skipped-space"),
            Self::Failed(_) => write!(f, "failed"),
        }
    }
}

/// One row of the per-run summary.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub target: String,
    pub resolved_path: Option<String>,
    pub local_destination: Option<PathBuf>,
    pub bytes_transferred: u64,
    pub outcome: TransferOutcome,
}

impl TransferRecord {
    /// Record for a target that failed before any path was resolved.
    pub fn failed(target: &Target, reason: impl Into<String>) -> Self {
        Self {
            target: target.label(),
            resolved_path: None,
            local_destination: None,
            bytes_transferred: 0,
            outcome: TransferOutcome::Failed(reason.into()),
        }
    }
}
