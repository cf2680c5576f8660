//! Connection and log-spec documents.
//!
//! Both documents are YAML. The connection document names host groups whose
//! fields act as defaults for every host entry in the group:
//!
//! ```yaml
//! host:
//!   web:
//!     port: 2222
//!     user: deploy
//!     password: secret
//!     ips:
//!       - ip: 10.0.0.1
//!       - ip: 10.0.0.2
//!         port: 22
//! ```
//!
//! Inheritance is applied once, at load time, so everything downstream sees
//! fully populated [`HostCredential`]s.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::model::{BackendKind, HostCredential, LogSpec, Secret};

/// Name of the synthetic group holding every configured host.
pub const ALL_HOSTS_GROUP: &str = "all";

/// Port used when neither the host nor its group sets one.
pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("log spec #{0} has an empty name")]
    MissingName(usize),

    #[error("duplicate log spec name: {0}")]
    DuplicateName(String),

    #[error("log spec {name}: {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("host {address} in group {group}: {reason}")]
    InvalidHost {
        group: String,
        address: String,
        reason: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct HostEntryDoc {
    ip: String,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    keyfile: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct HostGroupDoc {
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    keyfile: Option<PathBuf>,
    #[serde(default)]
    ips: Vec<HostEntryDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionDoc {
    #[serde(default)]
    host: BTreeMap<String, HostGroupDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct LogSpecDoc {
    #[serde(default)]
    logs: Vec<LogSpec>,
}

/// Host groups with credentials already inherited from group defaults.
#[derive(Debug, Clone, Default)]
pub struct HostGroups {
    groups: BTreeMap<String, Vec<HostCredential>>,
}

impl HostGroups {
    /// Load the connection document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let doc: ConnectionDoc = read_yaml(path)?;
        Self::from_doc(doc)
    }

    /// Parse a connection document held in memory.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let doc: ConnectionDoc = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::from_doc(doc)
    }

    fn from_doc(doc: ConnectionDoc) -> Result<Self, ConfigError> {
        let mut groups = BTreeMap::new();
        let mut everyone = Vec::new();

        for (name, group) in doc.host {
            let mut hosts = Vec::with_capacity(group.ips.len());
            for entry in &group.ips {
                let host = inherit(&name, &group, entry)?;
                everyone.push(host.clone());
                hosts.push(host);
            }
            groups.insert(name, hosts);
        }

        if !groups.contains_key(ALL_HOSTS_GROUP) {
            groups.insert(ALL_HOSTS_GROUP.to_string(), everyone);
        }

        Ok(Self { groups })
    }

    /// Hosts of one group, or `None` when the group is not configured.
    pub fn get(&self, name: &str) -> Option<&[HostCredential]> {
        self.groups.get(name).map(Vec::as_slice)
    }
}

fn inherit(
    group_name: &str,
    group: &HostGroupDoc,
    entry: &HostEntryDoc,
) -> Result<HostCredential, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidHost {
        group: group_name.to_string(),
        address: entry.ip.clone(),
        reason: reason.to_string(),
    };

    if entry.ip.trim().is_empty() {
        return Err(invalid("empty ip"));
    }

    let username = entry
        .user
        .clone()
        .or_else(|| group.user.clone())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| invalid("no user on host or group"))?;

    let port = entry.port.or(group.port).unwrap_or(DEFAULT_SSH_PORT);

    let keyfile = entry.keyfile.clone().or_else(|| group.keyfile.clone());
    let password = entry.password.clone().or_else(|| group.password.clone());

    let secret = match (keyfile, password) {
        (Some(path), _) => Secret::KeyFile(expand_home(&path)),
        (None, Some(password)) => Secret::Password(password),
        (None, None) => return Err(invalid("neither password nor keyfile set")),
    };

    Ok(HostCredential {
        address: entry.ip.clone(),
        port,
        username,
        secret,
    })
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Every configured [`LogSpec`], in document order.
#[derive(Debug, Clone, Default)]
pub struct LogCatalog {
    specs: Vec<LogSpec>,
}

impl LogCatalog {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let doc: LogSpecDoc = read_yaml(path)?;
        Self::from_specs(doc.logs)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let doc: LogSpecDoc = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::from_specs(doc.logs)
    }

    fn from_specs(specs: Vec<LogSpec>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for (index, spec) in specs.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::MissingName(index));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateName(spec.name.clone()));
            }
            validate(spec)?;
        }
        Ok(Self { specs })
    }

    pub fn find(&self, name: &str) -> Option<&LogSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|s| s.name.as_str())
    }
}

fn validate(spec: &LogSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSpec {
        name: spec.name.clone(),
        reason: reason.to_string(),
    };
    let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());

    if spec.name.contains('/') || spec.name.contains("..") {
        return Err(invalid("name must be usable as a file name"));
    }

    match spec.backend {
        BackendKind::Cluster | BackendKind::LogTail if blank(&spec.namespace_pattern) => {
            return Err(invalid("namespace is required"));
        }
        BackendKind::Shell if blank(&spec.host_group) => {
            return Err(invalid("hostgroup is required"));
        }
        _ => {}
    }

    match spec.backend {
        BackendKind::LogTail => {
            if spec.tail_count.is_none() {
                return Err(invalid("tail is required"));
            }
        }
        BackendKind::Cluster | BackendKind::Shell => {
            if spec.dir_pattern.trim().is_empty() {
                return Err(invalid("dir is required"));
            }
            if spec.file_pattern.trim().is_empty() {
                return Err(invalid("file is required"));
            }
        }
    }

    Ok(())
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
